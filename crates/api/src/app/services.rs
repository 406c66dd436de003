use std::sync::Arc;

use texforge_core::{Clock, SystemClock};
use texforge_infra::{
    CompilationQueue, QueueConfig, RateLimitPolicy, RateLimiter, RecordStore, Settings,
    StoreError,
};

pub type SharedStore = Arc<dyn RecordStore>;

/// Everything the handlers need, shared behind an `Arc` via `Extension`.
#[derive(Clone)]
pub struct AppServices {
    pub queue: CompilationQueue<SharedStore>,
    pub limiter: RateLimiter<SharedStore>,
    pub rate_limit: RateLimitPolicy,
    pub clock: Arc<dyn Clock>,
}

impl AppServices {
    pub fn new(store: SharedStore, queue: QueueConfig, rate_limit: RateLimitPolicy) -> Self {
        Self::with_clock(store, queue, rate_limit, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: SharedStore,
        queue: QueueConfig,
        rate_limit: RateLimitPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let limiter = RateLimiter::with_clock(Arc::clone(&store), queue.keys.clone(), Arc::clone(&clock));
        Self {
            queue: CompilationQueue::with_clock(store, queue, Arc::clone(&clock)),
            limiter,
            rate_limit,
            clock,
        }
    }

    /// Services backed by Redis at `settings.redis_url`.
    pub async fn connect(settings: &Settings) -> Result<Self, StoreError> {
        let store = texforge_infra::RedisRecordStore::connect(&settings.redis_url).await?;
        tracing::info!(redis = %settings.redis_url, "connected to record store");
        Ok(Self::new(
            Arc::new(store),
            settings.queue.clone(),
            settings.rate_limit,
        ))
    }
}
