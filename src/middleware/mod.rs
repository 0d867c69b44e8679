mod spend_limit;

pub use spend_limit::{CallerIdentity, SpendLimitExceeded, spend_limit_middleware};
