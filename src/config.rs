//! Tunable limits for the execution core.

pub const MIN_MEMORY_LIMIT_BYTES: usize = 32 * 1024 * 1024;
pub const MAX_MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;
pub const DEFAULT_STACK_SIZE_BYTES: usize = 512 * 1024;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_POOL_SIZE: usize = 3;
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// How `globals_json` is exposed to script. Defaults to `Namespaced`,
/// kept as an enum so the choice is visible and test-addressable rather
/// than a silent hardcoded string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GlobalsPolicy {
    /// Globals are exposed under a single `__globals` object.
    #[default]
    Namespaced,
    /// Globals are spread as top-level identifiers. Not used by default;
    /// kept for completeness and for tests that assert namespacing wins.
    Spread,
}

/// Per-engine resource limits.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub memory_limit_bytes: usize,
    pub max_stack_size_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            memory_limit_bytes: MAX_MEMORY_LIMIT_BYTES,
            max_stack_size_bytes: DEFAULT_STACK_SIZE_BYTES,
        }
    }
}

impl Limits {
    pub fn with_memory_limit_bytes(mut self, bytes: usize) -> Self {
        self.memory_limit_bytes = bytes.clamp(MIN_MEMORY_LIMIT_BYTES, MAX_MEMORY_LIMIT_BYTES);
        self
    }

    pub fn with_max_stack_size_bytes(mut self, bytes: usize) -> Self {
        self.max_stack_size_bytes = bytes;
        self
    }
}

/// Top-level configuration for the execution service: pool size, cache
/// capacity, default timeout, per-engine limits, and the globals policy.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionServiceConfig {
    pub limits: Limits,
    pub default_timeout_ms: u64,
    pub pool_size: usize,
    pub cache_capacity: usize,
    pub globals_policy: GlobalsPolicy,
}

impl Default for ExecutionServiceConfig {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            pool_size: DEFAULT_POOL_SIZE,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            globals_policy: GlobalsPolicy::default(),
        }
    }
}

impl ExecutionServiceConfig {
    pub fn builder() -> ExecutionServiceConfigBuilder {
        ExecutionServiceConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct ExecutionServiceConfigBuilder {
    config: ExecutionServiceConfig,
}

impl ExecutionServiceConfigBuilder {
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.config.limits = limits;
        self
    }

    pub fn with_default_timeout_ms(mut self, ms: u64) -> Self {
        self.config.default_timeout_ms = ms;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.config.pool_size = size.max(1);
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity.max(1);
        self
    }

    pub fn with_globals_policy(mut self, policy: GlobalsPolicy) -> Self {
        self.config.globals_policy = policy;
        self
    }

    pub fn build(self) -> ExecutionServiceConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_clamp_memory_to_the_allowed_range() {
        let limits = Limits::default().with_memory_limit_bytes(1);
        assert_eq!(limits.memory_limit_bytes, MIN_MEMORY_LIMIT_BYTES);

        let limits = Limits::default().with_memory_limit_bytes(usize::MAX);
        assert_eq!(limits.memory_limit_bytes, MAX_MEMORY_LIMIT_BYTES);
    }

    #[test]
    fn builder_without_overrides_matches_the_documented_defaults() {
        let config = ExecutionServiceConfig::builder().build();
        assert_eq!(config.pool_size, DEFAULT_POOL_SIZE);
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert_eq!(config.default_timeout_ms, DEFAULT_TIMEOUT_MS);
        assert_eq!(config.globals_policy, GlobalsPolicy::Namespaced);
    }
}
