pub mod book;
pub mod review;
pub mod user;

pub use book::Entity as Books;
pub use review::Entity as Reviews;
pub use user::Entity as Users;
