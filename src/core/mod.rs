pub mod fetch_engine;

pub use fetch_engine::{BatchOutcome, FetchEngine, FetchError, FetchLimits, FetchResult};
