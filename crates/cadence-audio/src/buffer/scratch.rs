//! Grow-only scratch storage for the conversion chain.

/// Owned, reusable working buffer.
///
/// Capacity only ever grows, so once a stream has seen its largest block the
/// producer path stops allocating.
#[derive(Debug, Default)]
pub struct ScratchBuffer<T> {
    data: Vec<T>,
}

impl<T: Copy + Default> ScratchBuffer<T> {
    /// Create a buffer with `len` zeroed elements already allocated.
    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![T::default(); len],
        }
    }

    /// Make sure at least `len` elements are available and return them.
    pub fn ensure_capacity(&mut self, len: usize) -> &mut [T] {
        if self.data.len() < len {
            self.data.resize(len, T::default());
        }
        &mut self.data[..len]
    }

    /// Elements currently allocated.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Release the allocation.
    pub fn release(&mut self) {
        self.data = Vec::new();
    }
}
