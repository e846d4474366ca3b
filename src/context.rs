//! Per-forward-pass scratch context
//!
//! A [`ForwardContext`] is created for a single forward pass and dropped at
//! its end, releasing everything it handed out on every exit path. It owns
//! two byte-budgeted arenas:
//!
//! - **mem**: graph bookkeeping and buffers that must outlive the pass body
//!   (the final hidden slice and the logits)
//! - **scratch**: activations that are dead once the next layer has consumed
//!   them
//!
//! Blocks allocate activation buffers through the context; exceeding an
//! arena budget is a fatal error, so a model must be constructed with sizes
//! adequate for its `max_length` at batch one. Before the final projection
//! the transformer switches scratch accounting off with
//! [`ForwardContext::use_scratch`] so the outputs are charged to `mem` and
//! survive the pass.

use crate::error::{CharlarError, Result};

/// Fixed node capacity of the per-pass compute graph
pub const GRAPH_SIZE: usize = 2048;

/// One byte-budgeted allocation pool
#[derive(Debug)]
struct Arena {
    name: &'static str,
    capacity: usize,
    used: usize,
}

impl Arena {
    fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            used: 0,
        }
    }

    fn alloc(&mut self, len: usize) -> Result<Vec<f32>> {
        let bytes = len * std::mem::size_of::<f32>();
        if self.used + bytes > self.capacity {
            return Err(CharlarError::ArenaExhausted {
                arena: self.name,
                requested: bytes,
                capacity: self.capacity,
            });
        }
        self.used += bytes;
        Ok(vec![0.0; len])
    }
}

/// Scoped scratch and graph state for one forward pass
#[derive(Debug)]
pub struct ForwardContext {
    mem: Arena,
    scratch: Arena,
    scratch_active: bool,
    nodes: usize,
    n_threads: usize,
}

impl ForwardContext {
    /// Create a context with the given arena budgets (bytes) and thread hint
    #[must_use]
    pub fn new(mem_size: usize, scratch_size: usize, n_threads: usize) -> Self {
        Self {
            mem: Arena::new("mem", mem_size),
            scratch: Arena::new("scratch", scratch_size),
            scratch_active: true,
            nodes: 0,
            n_threads: n_threads.max(1),
        }
    }

    /// Allocate an f32 buffer of `len` elements from the active arena
    ///
    /// Each allocation also occupies one graph node slot.
    ///
    /// # Errors
    ///
    /// [`CharlarError::ArenaExhausted`] when the active arena budget is
    /// spent, [`CharlarError::GraphCapacity`] past [`GRAPH_SIZE`] nodes.
    pub fn alloc(&mut self, len: usize) -> Result<Vec<f32>> {
        if self.nodes >= GRAPH_SIZE {
            return Err(CharlarError::GraphCapacity {
                nodes: self.nodes,
                capacity: GRAPH_SIZE,
            });
        }
        self.nodes += 1;
        if self.scratch_active {
            self.scratch.alloc(len)
        } else {
            self.mem.alloc(len)
        }
    }

    /// Route subsequent allocations to scratch (true) or mem (false)
    ///
    /// The transformer turns scratch off before its final projection so the
    /// last hidden slice and the logits outlive scratch reuse.
    pub fn use_scratch(&mut self, active: bool) {
        self.scratch_active = active;
    }

    /// Thread count resolved for this pass
    #[must_use]
    pub fn n_threads(&self) -> usize {
        self.n_threads
    }
}

/// True when a multi-threaded CPU BLAS backend is compiled in
#[must_use]
pub const fn cpu_has_blas() -> bool {
    cfg!(feature = "blas")
}

/// True when the BLAS backend runs on a GPU
#[must_use]
pub const fn cpu_has_gpu_blas() -> bool {
    cfg!(feature = "gpublas")
}

/// Resolve the worker thread count for one forward pass
///
/// A CPU BLAS backend is already multi-threaded internally, so large prompt
/// batches (≥ 32 tokens) run the graph single-threaded to avoid
/// oversubscription; everything else passes the caller's hint through.
#[must_use]
pub fn resolve_thread_count(input_len: usize, requested: usize) -> usize {
    if input_len >= 32 && cpu_has_blas() && !cpu_has_gpu_blas() {
        1
    } else {
        requested.max(1)
    }
}
