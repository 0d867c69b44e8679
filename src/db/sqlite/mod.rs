mod spend;

pub use spend::SqliteSpendRepo;
