use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt::Display;

use crate::error::ScoreError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i32);

impl Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the subject of a recommendation request and the author of a rating.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i32);

impl Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A rating score, always within `Score::MIN..=Score::MAX`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub struct Score(u8);

impl Score {
    pub const MAX: i32 = 5;
    pub const MIN: i32 = 1;

    pub fn new(score: i32) -> Result<Self, ScoreError> {
        if (Self::MIN..=Self::MAX).contains(&score) {
            Ok(Self(score as u8))
        }
        else {
            Err(ScoreError::OutOfRange(score))
        }
    }

    #[inline]
    pub fn get(&self) -> i32 {
        self.0 as i32
    }
}

impl TryFrom<i32> for Score {
    type Error = ScoreError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Score> for i32 {
    fn from(score: Score) -> Self {
        score.get()
    }
}

/// A catalog item (a book).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id:             ItemId,
    pub title:          String,
    pub author:         String,
    pub isbn:           Option<String>,
    pub price:          f64,
    pub category:       Option<String>,
    pub published_year: Option<i32>,
    pub stock:          i32,
}

/// A single recorded rating. Never mutated once recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RatingEvent {
    pub item_id:   ItemId,
    pub rater_id:  UserId,
    pub score:     Score,
    pub timestamp: DateTime<Utc>,
}

/// Which rating events a catalog query covers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RatingScope {
    All,
    Items(BTreeSet<ItemId>),
    Rater(UserId),
}

impl RatingScope {
    pub fn items<I: IntoIterator<Item = ItemId>>(ids: I) -> Self {
        Self::Items(ids.into_iter().collect())
    }

    pub fn covers(&self, event: &RatingEvent) -> bool {
        match self {
            Self::All => true,
            Self::Items(ids) => ids.contains(&event.item_id),
            Self::Rater(rater) => event.rater_id == *rater,
        }
    }
}

impl Display for RatingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Items(ids) => write!(f, "{} item(s)", ids.len()),
            Self::Rater(rater) => write!(f, "rater #{rater}"),
        }
    }
}

/// One row of a grouped rating aggregation: number of events and the exact sum of their scores.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RatingTally {
    pub item_id: ItemId,
    pub count:   u64,
    pub sum:     i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AggregateSummary {
    pub item_id: ItemId,
    pub count:   u64,
    pub mean:    f64,
}

impl AggregateSummary {
    pub fn from_tally(tally: &RatingTally) -> Self {
        let mean = if tally.count == 0 {
            0.0
        }
        else {
            tally.sum as f64 / tally.count as f64
        };

        Self {
            item_id: tally.item_id,
            count: tally.count,
            mean,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RankedItem {
    pub item:         Item,
    pub score:        f64,
    pub avg_rating:   f64,
    pub rating_count: u64,
}

/// A ranked recommendation list for one subject.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recommendations {
    pub subject:      UserId,
    pub items:        Vec<RankedItem>,
    /// Metadata stamp; not part of the ranking itself.
    pub generated_at: DateTime<Utc>,
}

impl Recommendations {
    pub fn item_ids(&self) -> Vec<ItemId> {
        self.items.iter().map(|r| r.item.id).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
