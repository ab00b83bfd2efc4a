//! Reusable tensor buffers for hot per-frame loops.

use ndarray::{Array4, ArrayD, IxDyn};

/// Pool of input tensors keyed by slot, sized on first use and reallocated only
/// when a caller asks for a different shape.
#[derive(Debug, Default)]
pub struct BufferPool {
    slots: Vec<Option<Array4<f32>>>,
    allocations: usize,
}

impl BufferPool {
    /// Create an empty pool
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Borrow the NCHW buffer in `slot`, resizing it to `shape` when needed.
    ///
    /// Contents are whatever the previous user left; callers overwrite every element.
    pub fn nchw(&mut self, slot: usize, shape: [usize; 4]) -> &mut Array4<f32> {
        if self.slots.len() <= slot {
            self.slots.resize_with(slot + 1, || None);
        }
        let entry = &mut self.slots[slot];
        let reuse = matches!(entry, Some(buffer) if buffer.shape() == shape);
        if !reuse {
            self.allocations += 1;
            *entry = Some(Array4::zeros(shape));
        }
        entry.get_or_insert_with(|| Array4::zeros(shape))
    }

    /// Number of allocations performed so far
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations
    }

    /// Drop every buffer
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

/// Flat feature buffer reused across calls, e.g. concatenated keypoints
#[derive(Debug)]
pub struct FlatBuffer {
    data: ArrayD<f32>,
}

impl Default for FlatBuffer {
    fn default() -> Self {
        Self {
            data: ArrayD::zeros(IxDyn(&[0])),
        }
    }
}

impl FlatBuffer {
    /// Borrow a buffer of `shape`, reallocating only if the shape changed
    pub fn shaped(&mut self, shape: &[usize]) -> &mut ArrayD<f32> {
        if self.data.shape() != shape {
            self.data = ArrayD::zeros(IxDyn(shape));
        }
        &mut self.data
    }
}
