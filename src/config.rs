//! Tunables for the cache, arenas and request pool.

use std::time::Duration;

use crate::enums::{AllocationStrategy, ImageQualityStatus, RequestType};

/// Default cache budget: 3 GiB.
pub const DEFAULT_MAX_CACHE_SIZE: usize = 3 * 1024 * 1024 * 1024;

pub const DEFAULT_INTERLEAVE_FACTOR: usize = 4;

pub const DEFAULT_MAX_INTERACTIVE_REQUESTS: usize = 6;
pub const DEFAULT_MAX_THUMBNAIL_REQUESTS: usize = 6;
pub const DEFAULT_MAX_PREFETCH_REQUESTS: usize = 4;

/// How long a permanently failed id is refused before it may be requested again.
pub const DEFAULT_FAILURE_COOLDOWN: Duration = Duration::from_secs(30);

/// Limits for the request pool.
#[derive(Debug, Clone)]
pub struct RequestPoolConfig {
    pub max_interactive: usize,
    pub max_thumbnail: usize,
    pub max_prefetch: usize,
    pub failure_cooldown: Duration,
}

impl Default for RequestPoolConfig {
    fn default() -> Self {
        Self {
            max_interactive: DEFAULT_MAX_INTERACTIVE_REQUESTS,
            max_thumbnail: DEFAULT_MAX_THUMBNAIL_REQUESTS,
            max_prefetch: DEFAULT_MAX_PREFETCH_REQUESTS,
            failure_cooldown: DEFAULT_FAILURE_COOLDOWN,
        }
    }
}

impl RequestPoolConfig {
    /// Maximum number of requests of `request_type` running at once.
    /// A limit of zero is treated as one so queued work can always drain.
    pub fn max_concurrent(&self, request_type: RequestType) -> usize {
        let limit = match request_type {
            RequestType::Interaction => self.max_interactive,
            RequestType::Thumbnail => self.max_thumbnail,
            RequestType::Prefetch => self.max_prefetch,
        };
        limit.max(1)
    }

    pub fn with_max_concurrent(mut self, request_type: RequestType, limit: usize) -> Self {
        match request_type {
            RequestType::Interaction => self.max_interactive = limit,
            RequestType::Thumbnail => self.max_thumbnail = limit,
            RequestType::Prefetch => self.max_prefetch = limit,
        }
        self
    }

    pub fn with_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.failure_cooldown = cooldown;
        self
    }
}

/// Top level configuration for streaming volumes.
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Byte budget of the image/volume cache.
    pub max_cache_size: usize,
    /// Upper bound for a single shared arena. Larger volumes fall back to
    /// private buffers. `None` leaves the decision to the allocator.
    pub shared_memory_limit: Option<usize>,
    pub allocation: AllocationStrategy,
    pub interleave_factor: usize,
    /// Frames at or above this status count as loaded.
    pub loaded_threshold: ImageQualityStatus,
    pub pool: RequestPoolConfig,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            max_cache_size: DEFAULT_MAX_CACHE_SIZE,
            shared_memory_limit: None,
            allocation: AllocationStrategy::Shared,
            interleave_factor: DEFAULT_INTERLEAVE_FACTOR,
            loaded_threshold: ImageQualityStatus::Lossy,
            pool: RequestPoolConfig::default(),
        }
    }
}

impl StreamingConfig {
    pub fn with_max_cache_size(mut self, bytes: usize) -> Self {
        self.max_cache_size = bytes;
        self
    }

    pub fn with_shared_memory_limit(mut self, bytes: usize) -> Self {
        self.shared_memory_limit = Some(bytes);
        self
    }

    pub fn with_allocation(mut self, strategy: AllocationStrategy) -> Self {
        self.allocation = strategy;
        self
    }

    pub fn with_interleave_factor(mut self, factor: usize) -> Self {
        self.interleave_factor = factor.max(1);
        self
    }

    pub fn with_loaded_threshold(mut self, status: ImageQualityStatus) -> Self {
        self.loaded_threshold = status;
        self
    }

    pub fn with_pool(mut self, pool: RequestPoolConfig) -> Self {
        self.pool = pool;
        self
    }
}
