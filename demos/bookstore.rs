use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use anyhow::Context;
use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use clap::ValueEnum;
use comfy_table::CellAlignment;
use comfy_table::Table;
use fake::faker::company::en::CatchPhrase;
use fake::faker::lorem::en::Word;
use fake::faker::name::en::Name;
use fake::Fake;
use fieldx::fxstruct;
use indicatif::ProgressBar;
use indicatif::ProgressStyle;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::Rng;
use rand::SeedableRng;
use rand_distr::Distribution;
use rand_distr::Normal;
use rec_cache::catalog::memory::QueryCounts;
use rec_cache::prelude::*;
use tokio::task::JoinSet;
use tracing::info;
use tracing::warn;

const CATEGORIES: [&str; 16] = [
    "Fiction",
    "Non-Fiction",
    "Science Fiction",
    "Fantasy",
    "Mystery",
    "Thriller",
    "Romance",
    "Biography",
    "History",
    "Science",
    "Technology",
    "Business",
    "Self-Help",
    "Poetry",
    "Drama",
    "Horror",
];

// Reviews only ever go to the head of the catalog and come from the most active users.
const REVIEWED_BOOKS: usize = 1_000;
const REVIEWING_USERS: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    /// Needs the `sqlite` feature.
    Sqlite,
}

#[derive(Debug, Clone, Parser)]
#[fxstruct(no_new, get(copy))]
#[clap(about, version, author, name = "bookstore")]
struct Cli {
    /// Where the catalog lives.
    #[clap(long, short, value_enum, env = "REC_BACKEND", default_value_t = Backend::Memory)]
    backend: Backend,

    /// JSON file with the cache configuration. Overrides the cache knobs below.
    #[fieldx(get(clone))]
    #[clap(long, short, env = "REC_CONFIG")]
    config: Option<PathBuf>,

    #[clap(long, env = "REC_BOOKS", default_value_t = 10_000)]
    books: u32,

    #[clap(long, env = "REC_USERS", default_value_t = 1_000)]
    users: u32,

    #[clap(long, env = "REC_REVIEWS", default_value_t = 5_000)]
    reviews: u32,

    /// Total number of recommendation requests.
    #[clap(long, env = "REC_REQUESTS", default_value_t = 5_000)]
    requests: u32,

    /// Number of clients firing requests at the same time.
    #[clap(long, env = "REC_CONCURRENCY", default_value_t = 50)]
    concurrency: u32,

    /// Requests pick their subject among users 1 to this number.
    #[clap(long, env = "REC_SUBJECTS", default_value_t = 100)]
    subjects: u32,

    /// Probability that a request is followed by an invalidation of its subject.
    #[clap(long, env = "REC_INVALIDATE_RATIO", default_value_t = 0.02)]
    invalidate_ratio: f64,

    #[clap(long, env = "REC_CAPACITY", default_value_t = 1_000)]
    capacity: usize,

    /// Entry lifetime, seconds.
    #[clap(long, env = "REC_TTL", default_value_t = 60)]
    ttl: u64,

    /// Use time-bucketed keys with buckets this many seconds wide.
    #[clap(long, env = "REC_BUCKET")]
    bucket: Option<u64>,

    #[clap(long, env = "REC_LIMIT", default_value_t = 10)]
    limit: usize,

    /// Seed for data generation and request patterns.
    #[clap(long, env = "REC_SEED")]
    seed: Option<u64>,

    /// Silence the progress bar.
    #[clap(long, short, env = "REC_QUIET", default_value_t = false)]
    quiet: bool,
}

impl Cli {
    fn cache_config(&self) -> Result<CacheConfig> {
        if let Some(path) = &self.config {
            let json = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            return Ok(CacheConfig::from_json(&json)?);
        }

        let config = CacheConfig {
            capacity: self.capacity,
            ttl_secs: self.ttl,
            key_policy: self
                .bucket
                .map_or(KeyPolicy::Stable, |bucket_secs| KeyPolicy::Bucketed { bucket_secs }),
            limit: self.limit,
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }
}

struct Account {
    id:       i32,
    username: String,
    email:    String,
}

struct Dataset {
    books:    Vec<Item>,
    accounts: Vec<Account>,
    reviews:  Vec<RatingEvent>,
}

impl Dataset {
    fn generate(cli: &Cli, rng: &mut StdRng) -> Result<Self> {
        // Every book has a hidden "quality"; its reviews scatter around it.
        let quality = Normal::new(3.2, 0.8)?;
        let mut qualities = Vec::with_capacity(cli.books() as usize);
        let mut books = Vec::with_capacity(cli.books() as usize);

        for id in 1..=cli.books() as i32 {
            qualities.push(quality.sample(rng));
            let word: String = Word().fake_with_rng(rng);
            let catch_phrase: String = CatchPhrase().fake_with_rng(rng);
            books.push(Item {
                id:             ItemId(id),
                title:          format!("{catch_phrase} {}", capitalize(&word)),
                author:         Name().fake_with_rng(rng),
                // Unique by construction: every ID owns its own range of numbers.
                isbn:           Some(format!("978{:010}", id as u64 * 7919 + rng.random_range(0..7919))),
                price:          (rng.random_range(9.99..99.99) * 100.0f64).round() / 100.0,
                category:       CATEGORIES.choose(rng).map(|c| c.to_string()),
                published_year: Some(rng.random_range(1950..=2024)),
                stock:          rng.random_range(0..=100),
            });
        }

        let accounts = (1..=cli.users() as i32)
            .map(|id| Account {
                id,
                username: format!("user_{id}_{}", rng.random_range(1000..=9999)),
                email: format!("user{id}@example{}.com", rng.random_range(1..=999)),
            })
            .collect::<Vec<_>>();

        let mut reviews = Vec::with_capacity(cli.reviews() as usize);
        let reviewed = books.len().min(REVIEWED_BOOKS);
        let reviewing = accounts.len().min(REVIEWING_USERS);
        if reviewed > 0 && reviewing > 0 {
            let now = Utc::now();
            for _ in 0..cli.reviews() {
                let book = rng.random_range(0..reviewed);
                let rater = &accounts[rng.random_range(0..reviewing)];
                let score = Normal::new(qualities[book], 1.0)?.sample(rng).round().clamp(1.0, 5.0) as i32;
                reviews.push(RatingEvent {
                    item_id:   books[book].id,
                    rater_id:  UserId(rater.id),
                    score:     Score::new(score)?,
                    timestamp: now - chrono::Duration::minutes(rng.random_range(0..525_600)),
                });
            }
        }

        Ok(Self {
            books,
            accounts,
            reviews,
        })
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Default)]
struct LoadOutcome {
    served:        u64,
    failed:        u64,
    invalidations: u64,
    slowest:       Duration,
    elapsed:       Duration,
}

impl LoadOutcome {
    fn merge(&mut self, other: LoadOutcome) {
        self.served += other.served;
        self.failed += other.failed;
        self.invalidations += other.invalidations;
        self.slowest = self.slowest.max(other.slowest);
    }
}

async fn drive<C>(cli: &Cli, svc: &RecommendationService<C, TopRated>, seed: u64) -> Result<LoadOutcome>
where
    C: CatalogReader,
{
    let clients = cli.concurrency().max(1);
    let per_client = cli.requests().div_ceil(clients);
    let subjects = cli.subjects().max(1) as i32;
    let invalidate_ratio = cli.invalidate_ratio().clamp(0.0, 1.0);

    let pb = if cli.quiet() {
        ProgressBar::hidden()
    }
    else {
        ProgressBar::new(cli.requests() as u64).with_style(
            ProgressStyle::default_bar().template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")?,
        )
    };

    let started = Instant::now();
    let mut tasks = JoinSet::new();

    for client in 0..clients {
        let quota = per_client.min(cli.requests().saturating_sub(client * per_client));
        let svc = svc.clone();
        let pb = pb.clone();
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(client as u64 + 1));

        tasks.spawn(async move {
            let mut outcome = LoadOutcome::default();
            for _ in 0..quota {
                let subject = UserId(rng.random_range(1..=subjects));
                let requested = Instant::now();

                match svc.get_recommendations(subject).await {
                    Ok(_) => outcome.served += 1,
                    Err(err) => {
                        outcome.failed += 1;
                        warn!("request for #{subject} failed: {err}");
                    }
                }
                outcome.slowest = outcome.slowest.max(requested.elapsed());

                if rng.random_bool(invalidate_ratio) {
                    svc.invalidate_recommendations(subject);
                    outcome.invalidations += 1;
                }
                pb.inc(1);
            }
            outcome
        });
    }

    let mut total = LoadOutcome::default();
    while let Some(outcome) = tasks.join_next().await {
        total.merge(outcome?);
    }
    total.elapsed = started.elapsed();
    pb.finish_with_message("done");

    Ok(total)
}

async fn sample<C>(svc: &RecommendationService<C, TopRated>, subject: UserId) -> Result<Table>
where
    C: CatalogReader,
{
    let recs = svc.get_recommendations(subject).await?;

    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::ASCII_FULL_CONDENSED)
        .set_header(["#", "Title", "Author", "Avg", "Reviews", "Score"]);
    for (pos, ranked) in recs.items.iter().enumerate() {
        table.add_row([
            (pos + 1).to_string(),
            ranked.item.title.clone(),
            ranked.item.author.clone(),
            format!("{:.2}", ranked.avg_rating),
            ranked.rating_count.to_string(),
            format!("{:.3}", ranked.score),
        ]);
    }
    for col in 3..=5 {
        if let Some(column) = table.column_mut(col) {
            column.set_cell_alignment(CellAlignment::Right);
        }
    }

    Ok(table)
}

fn report(backend: Backend, config: &CacheConfig, run: &Run) -> Table {
    let outcome = &run.outcome;
    let stats = &run.stats;
    let lookups = (stats.hits + stats.misses).max(1);
    let mut table = Table::new();
    table
        .load_preset(comfy_table::presets::ASCII_FULL_CONDENSED)
        .set_header(["", "Value"]);

    table
        .add_row(["Backend".to_string(), format!("{backend:?}")])
        .add_row(["Key policy".to_string(), config.key_policy.to_string()])
        .add_row(["Requests served".to_string(), outcome.served.to_string()])
        .add_row(["Requests failed".to_string(), outcome.failed.to_string()])
        .add_row(["Duration (s)".to_string(), format!("{:.2}", outcome.elapsed.as_secs_f64())])
        .add_row([
            "Throughput (req/s)".to_string(),
            format!("{:.1}", outcome.served as f64 / outcome.elapsed.as_secs_f64().max(1e-9)),
        ])
        .add_row(["Slowest request (ms)".to_string(), outcome.slowest.as_millis().to_string()])
        .add_row(["Cache hits".to_string(), stats.hits.to_string()])
        .add_row(["Cache misses".to_string(), stats.misses.to_string()])
        .add_row([
            "Hit ratio".to_string(),
            format!("{:.1}%", stats.hits as f64 * 100.0 / lookups as f64),
        ])
        .add_row(["Recomputations".to_string(), stats.recomputations.to_string()])
        .add_row(["Failed recomputations".to_string(), stats.failures.to_string()])
        .add_row(["Evictions".to_string(), stats.evictions.to_string()])
        .add_row(["Expirations".to_string(), stats.expirations.to_string()])
        .add_row(["Invalidations".to_string(), outcome.invalidations.to_string()])
        .add_row([
            "Entries / capacity".to_string(),
            format!("{} / {}", stats.entries, config.capacity),
        ]);

    if let Some(queries) = run.queries {
        table.add_row([
            "Catalog queries (pages/events/aggregates)".to_string(),
            format!("{}/{}/{}", queries.pages, queries.events, queries.aggregates),
        ]);
    }

    if let Some(column) = table.column_mut(1) {
        column.set_cell_alignment(CellAlignment::Right);
    }

    table
}

struct Run {
    outcome: LoadOutcome,
    stats:   CacheStats,
    queries: Option<QueryCounts>,
    top:     Table,
}

async fn run_memory(cli: &Cli, config: &CacheConfig, recommender: TopRated, data: Dataset, seed: u64) -> Result<Run> {
    let catalog = Arc::new(MemoryCatalog::new());
    catalog.add_items(data.books);
    catalog.record_ratings(data.reviews);

    let svc = RecommendationService::new(Arc::clone(&catalog), recommender, config)?;
    let outcome = drive(cli, &svc, seed).await?;
    let stats = svc.stats();
    let queries = catalog.query_counts();

    Ok(Run {
        outcome,
        stats,
        queries: Some(queries),
        top: sample(&svc, UserId(1)).await?,
    })
}

#[cfg(feature = "sqlite")]
async fn run_sqlite(cli: &Cli, config: &CacheConfig, recommender: TopRated, data: Dataset, seed: u64) -> Result<Run> {
    use rec_cache::catalog::db::driver::sqlite::Sqlite;
    use rec_cache::catalog::db::driver::DatabaseDriver;
    use rec_cache::catalog::db::entity::user;

    let tempdir = tempfile::Builder::new().prefix("rec-cache-bookstore").tempdir()?;
    let driver = Sqlite::connect(tempdir.path(), "bookstore.db").await?;
    driver.configure().await?;
    driver.reset().await?;

    let catalog = driver.catalog();
    catalog.store_items(data.books).await?;
    catalog
        .store_users(data.accounts.into_iter().map(|a| user::Model {
            id:         a.id,
            username:   a.username,
            email:      a.email,
            created_at: Utc::now(),
        }))
        .await?;
    catalog.store_ratings(data.reviews).await?;
    driver.checkpoint().await?;
    info!("catalog stored in {}", tempdir.path().display());

    let svc = RecommendationService::new(Arc::new(catalog), recommender, config)?;
    let outcome = drive(cli, &svc, seed).await?;
    let stats = svc.stats();

    Ok(Run {
        outcome,
        stats,
        queries: None,
        top: sample(&svc, UserId(1)).await?,
    })
}

#[cfg(not(feature = "sqlite"))]
async fn run_sqlite(_: &Cli, _: &CacheConfig, _: TopRated, _: Dataset, _: u64) -> Result<Run> {
    anyhow::bail!("the sqlite backend needs the `sqlite` feature")
}

fn setup_tracing() -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = tracing_subscriber::EnvFilter::from_default_env();

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    info!("Tracing initialized");

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing()?;

    let config = cli.cache_config()?;
    let seed = cli.seed().unwrap_or_else(|| Utc::now().timestamp_millis() as u64);
    let mut rng = StdRng::seed_from_u64(seed);

    let data = Dataset::generate(&cli, &mut rng)?;
    info!(
        "generated {} books, {} users, {} reviews (seed {seed})",
        data.books.len(),
        data.accounts.len(),
        data.reviews.len()
    );

    let recommender = TopRated::from_config(&config)?;

    let run = match cli.backend() {
        Backend::Memory => run_memory(&cli, &config, recommender, data, seed).await?,
        Backend::Sqlite => run_sqlite(&cli, &config, recommender, data, seed).await?,
    };

    println!("{}", report(cli.backend(), &config, &run));
    println!("Recommendations for user #1:\n{}", run.top);

    Ok(())
}
