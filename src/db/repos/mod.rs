mod spend;

pub use spend::*;
