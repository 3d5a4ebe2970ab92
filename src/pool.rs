//! Fixed-size engine pool. `acquire` never blocks: an empty pool reports
//! exhaustion immediately rather than waiting for a release.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::instrument;

use crate::config::Limits;
use crate::engine::Engine;

/// A mutex-guarded, fixed-size pool of idle [`Engine`]s.
pub struct EnginePool {
    idle: Mutex<VecDeque<Engine>>,
    limits: Limits,
}

impl EnginePool {
    /// Builds a pool with `size` freshly created engines, each configured
    /// with `limits`.
    pub fn new(size: usize, limits: Limits) -> anyhow::Result<Self> {
        let mut idle = VecDeque::with_capacity(size);
        for _ in 0..size {
            idle.push_back(Engine::new(limits)?);
        }
        Ok(Self {
            idle: Mutex::new(idle),
            limits,
        })
    }

    /// Pops one idle engine from the pool, or `None` if the pool is
    /// currently exhausted. Never blocks.
    #[instrument(skip_all, level = "debug")]
    pub fn acquire(&self) -> Option<Engine> {
        self.idle.lock().expect("engine pool poisoned").pop_back()
    }

    /// Resets `engine` and returns it to the pool.
    #[instrument(skip_all, level = "debug")]
    pub fn release(&self, mut engine: Engine) {
        engine.reset();
        self.idle.lock().expect("engine pool poisoned").push_back(engine);
    }

    /// Number of engines currently idle in the pool.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().expect("engine pool poisoned").len()
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_on_empty_pool_returns_none_immediately() {
        let pool = EnginePool::new(1, Limits::default()).unwrap();
        let engine = pool.acquire();
        assert!(engine.is_some());
        assert!(pool.acquire().is_none(), "pool of size 1 should be exhausted after one acquire");
    }

    #[test]
    fn release_returns_a_reset_engine_to_the_pool() {
        let pool = EnginePool::new(1, Limits::default()).unwrap();
        let mut engine = pool.acquire().unwrap();
        engine.begin_execution("test-exec".to_string());
        engine.execute_source("return 1 + 1;").unwrap();
        assert!(!engine.has_error());
        pool.release(engine);

        let reacquired = pool.acquire().unwrap();
        assert_eq!(reacquired.get_result(), "null");
        assert!(!reacquired.has_error());
    }
}
