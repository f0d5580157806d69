use crate::error::Result;
use std::sync::Arc;

/// Provides fork-join dispatch for the builders and the refitter.
///
/// By default work runs on rayon's global pool. When a thread count is configured the dispatcher
/// owns a dedicated pool and every dispatched closure runs inside it, so per-thread allocator
/// slots are sized for that pool.
#[derive(Clone, Default)]
pub struct ThreadDispatcher {
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl std::fmt::Debug for ThreadDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadDispatcher")
            .field("thread_count", &self.thread_count())
            .finish()
    }
}

impl ThreadDispatcher {
    /// Dispatcher using rayon's global pool.
    pub fn global() -> Self {
        Self { pool: None }
    }

    /// Dispatcher owning a pool of exactly `thread_count` workers. `0` means the global pool.
    pub fn with_threads(thread_count: usize) -> Result<Self> {
        if thread_count == 0 {
            return Ok(Self::global());
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(thread_count)
            .thread_name(|index| format!("bvh-worker-{index}"))
            .build()?;
        Ok(Self {
            pool: Some(Arc::new(pool)),
        })
    }

    /// Gets the number of workers available in the thread dispatcher.
    pub fn thread_count(&self) -> usize {
        match &self.pool {
            Some(pool) => pool.current_num_threads(),
            None => rayon::current_num_threads(),
        }
    }

    /// Runs `f` on the dispatcher's pool and waits for it.
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

/// Maps every item with `f`, forking tasks only when `parallel` is set. Results keep input order.
pub fn map_if<T, R, F>(parallel: bool, items: Vec<T>, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync + Send,
{
    use rayon::prelude::*;
    if parallel && items.len() > 1 {
        items.into_par_iter().map(f).collect()
    } else {
        items.into_iter().map(f).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedicated_pool() {
        let dispatcher = ThreadDispatcher::with_threads(2).unwrap();
        assert_eq!(dispatcher.thread_count(), 2);
        let inside = dispatcher.install(rayon::current_num_threads);
        assert_eq!(inside, 2);
    }

    #[test]
    fn test_map_keeps_order() {
        let squares = map_if(true, (0..10).collect(), |x: i32| x * x);
        assert_eq!(squares, (0..10).map(|x| x * x).collect::<Vec<_>>());
        let same = map_if(false, vec![3, 4], |x: i32| x + 1);
        assert_eq!(same, vec![4, 5]);
    }
}
