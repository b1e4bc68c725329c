/// Anything the batch planner can pack: it only needs the encoded size.
pub trait Payload {
    fn encoded_size(&self) -> u64;
}

impl Payload for u64 {
    fn encoded_size(&self) -> u64 {
        *self
    }
}

/// A size-bounded group of items submitted in one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch<T> {
    /// Position of this batch in planning order, starting at zero.
    pub index: usize,
    pub items: Vec<T>,
    pub total_bytes: u64,
}

impl<T> Batch<T> {
    pub(crate) fn empty(index: usize) -> Self {
        Self {
            index,
            items: Vec::new(),
            total_bytes: 0,
        }
    }

    pub(crate) fn push(&mut self, item: T, size: u64) {
        self.total_bytes = self.total_bytes.saturating_add(size);
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// A batch that holds a single item larger than the planner threshold.
    pub fn is_oversized(&self, max_bytes: u64) -> bool {
        self.total_bytes > max_bytes
    }
}
