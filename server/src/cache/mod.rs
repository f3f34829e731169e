pub mod body_cache;
pub mod response_cache;

pub use body_cache::{BodyCache, CachedBody, PrefetchOptions};
pub use response_cache::ResponseCache;
