//! Content-addressed prompt cache.
//!
//! Memoizes rendered-prompt -> response with a process-wide single-flight
//! guarantee: concurrent identical requests collapse into one upstream call,
//! even when they come from unrelated workflow instances.

mod key;
mod prompt;

pub use key::CacheKey;
pub use prompt::{CacheConfig, CacheLookup, CacheStats, CachedResponse, PromptCache, PromptCacheEntry};
