pub mod http_client;
pub mod rate_limiter;

pub use http_client::{HttpFetcher, PageFetcher, StaticPages};
pub use rate_limiter::{Limits, RateLimiter};
