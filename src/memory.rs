//! Batch-scoped tensor ownership and working-set accounting
//!
//! Every tensor that belongs to one evaluation step is registered with a
//! [`BatchScope`]. The scope keeps those tensors alive until it is dropped at
//! the end of the step, on success or on error, and reports their bytes to a
//! shared [`WorkingSet`] that remembers the high-water mark of the run.

use std::cell::Cell;
use std::rc::Rc;

use candle_core::Tensor;

#[derive(Debug, Default)]
struct Counters {
    current: Cell<usize>,
    peak: Cell<usize>,
}

/// Bytes held by live batch scopes, plus the largest total ever held.
#[derive(Debug, Clone, Default)]
pub struct WorkingSet {
    counters: Rc<Counters>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held right now.
    pub fn current_bytes(&self) -> usize {
        self.counters.current.get()
    }

    /// Largest value `current_bytes` has reached.
    pub fn peak_bytes(&self) -> usize {
        self.counters.peak.get()
    }

    fn acquire(&self, bytes: usize) {
        let current = self.counters.current.get() + bytes;
        self.counters.current.set(current);
        if current > self.counters.peak.get() {
            self.counters.peak.set(current);
        }
    }

    fn release(&self, bytes: usize) {
        let current = self.counters.current.get().saturating_sub(bytes);
        self.counters.current.set(current);
    }
}

/// Owner of one batch's tensors.
#[derive(Debug)]
pub struct BatchScope {
    working_set: WorkingSet,
    tensors: Vec<Tensor>,
    bytes: usize,
}

impl BatchScope {
    pub fn new(working_set: &WorkingSet) -> Self {
        Self {
            working_set: working_set.clone(),
            tensors: Vec::new(),
            bytes: 0,
        }
    }

    /// Keep `tensor` alive until this scope ends and count its bytes.
    pub fn hold(&mut self, tensor: &Tensor) {
        let bytes = tensor_bytes(tensor);
        self.working_set.acquire(bytes);
        self.bytes += bytes;
        self.tensors.push(tensor.clone());
    }

    /// Bytes registered with this scope.
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        self.tensors.clear();
        self.working_set.release(self.bytes);
    }
}

/// Size of a tensor's elements in bytes
pub fn tensor_bytes(tensor: &Tensor) -> usize {
    tensor.elem_count() * tensor.dtype().size_in_bytes()
}
