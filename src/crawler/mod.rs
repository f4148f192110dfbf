pub mod frontier;
pub mod links;
pub mod policy;
pub mod rate_limit;

// Re-export common types
pub use frontier::{normalize_url, CrawlFrontier, Exhausted, Link, OfferReport};
pub use links::{extract_content, extract_links, search_results, PageContent, PageLink};
pub use policy::DomainPolicy;
pub use rate_limit::RateLimiter;
