/// Source name stamped on parts extracted from jensonusa.com
pub const JENSON_USA_SOURCE: &str = "JensonUSA";

// Default channel topics
pub const SCRAPE_REQUESTS_TOPIC: &str = "scrape_requests";
pub const SCRAPE_RESULTS_TOPIC: &str = "scrape_results";

/// Consumer group ids are `<prefix>-<topic>`
pub const DEFAULT_GROUP_PREFIX: &str = "bike-parts-finder";

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Cached part entries live for a day
pub const PART_CACHE_TTL_SECS: u64 = 24 * 60 * 60;

pub fn group_id(prefix: &str, topic: &str) -> String {
    format!("{}-{}", prefix, topic)
}

pub fn part_cache_key(id: &str) -> String {
    format!("part:{}", id)
}
