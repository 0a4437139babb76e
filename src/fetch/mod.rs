//! Fetching raw bytes for a rule source, independent of their meaning.

pub mod http;
pub mod retry;

pub use http::{AuthMode, FetchConfig, FetchStatistics, HttpFetcher, ResumeState};
pub use retry::RetryPolicy;
