//! Execution backends for the fork-join phases of a minor cycle.
//!
//! Every phase (mask preparation, per-scale search, cache updates, FFT batches)
//! is expressed as an indexed map or a partitioned in-place update. A backend
//! decides how those run; results are always gathered in index order, so every
//! backend produces bit-identical output.

use rayon::prelude::*;

use crate::error::Result;

/// Multiplier for number of chunks relative to pool threads.
const CHUNKS_PER_THREAD: usize = 2;

/// Scheduling strategy for data-parallel phases.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of worker threads the backend uses.
    fn num_threads(&self) -> usize;

    /// Evaluates `f` for each index in `0..count`; results are in index order.
    fn map<R, F>(&self, count: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Sync + Send;

    /// Applies `f` to every item together with its index.
    fn for_each_mut<T, F>(&self, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync + Send;

    /// Applies `f` to consecutive chunks of `data` of `chunk_len` elements.
    /// The first argument is the chunk index.
    fn for_each_chunk_mut<T, F>(&self, data: &mut [T], chunk_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync + Send;

    /// Rows per chunk for row-partitioned work on an image of `height` rows.
    fn rows_per_chunk(&self, height: usize) -> usize {
        (height / (self.num_threads() * CHUNKS_PER_THREAD)).max(1)
    }
}

/// Runs every phase on the calling thread. Reference implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialBackend;

impl Backend for SerialBackend {
    fn name(&self) -> &'static str {
        "serial"
    }

    fn num_threads(&self) -> usize {
        1
    }

    fn map<R, F>(&self, count: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Sync + Send,
    {
        (0..count).map(f).collect()
    }

    fn for_each_mut<T, F>(&self, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync + Send,
    {
        for (i, item) in items.iter_mut().enumerate() {
            f(i, item);
        }
    }

    fn for_each_chunk_mut<T, F>(&self, data: &mut [T], chunk_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync + Send,
    {
        for (i, chunk) in data.chunks_mut(chunk_len.max(1)).enumerate() {
            f(i, chunk);
        }
    }

    fn rows_per_chunk(&self, height: usize) -> usize {
        height.max(1)
    }
}

/// Runs phases on a dedicated rayon thread pool.
///
/// Each call is a fork-join: it returns only after all workers finish, which is
/// the barrier between phases.
#[derive(Debug)]
pub struct ThreadedBackend {
    pool: rayon::ThreadPool,
}

impl ThreadedBackend {
    /// Builds a pool with `num_threads` workers, or rayon's default when `None`.
    pub fn new(num_threads: Option<usize>) -> Result<Self> {
        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("skyclean-{i}"));
        if let Some(n) = num_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder.build()?;
        tracing::debug!("Threaded backend with {} threads", pool.current_num_threads());
        Ok(Self { pool })
    }
}

impl Backend for ThreadedBackend {
    fn name(&self) -> &'static str {
        "threaded"
    }

    fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    fn map<R, F>(&self, count: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize) -> R + Sync + Send,
    {
        self.pool.install(|| (0..count).into_par_iter().map(&f).collect())
    }

    fn for_each_mut<T, F>(&self, items: &mut [T], f: F)
    where
        T: Send,
        F: Fn(usize, &mut T) + Sync + Send,
    {
        self.pool.install(|| {
            items
                .par_iter_mut()
                .enumerate()
                .for_each(|(i, item)| f(i, item))
        });
    }

    fn for_each_chunk_mut<T, F>(&self, data: &mut [T], chunk_len: usize, f: F)
    where
        T: Send,
        F: Fn(usize, &mut [T]) + Sync + Send,
    {
        self.pool.install(|| {
            data.par_chunks_mut(chunk_len.max(1))
                .enumerate()
                .for_each(|(i, chunk)| f(i, chunk))
        });
    }
}
