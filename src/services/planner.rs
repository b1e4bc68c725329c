use crate::models::batch::{Batch, Payload};

/// Groups items into request batches with next-fit packing.
///
/// Items are never reordered. A new batch starts whenever the next item would
/// push the current one past `max_bytes`. An item that alone exceeds the
/// threshold ends up in a batch of its own.
#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    max_bytes: u64,
}

impl BatchPlanner {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Lazily split `items` into batches.
    pub fn plan<I>(&self, items: I) -> Batches<I::IntoIter>
    where
        I: IntoIterator,
        I::Item: Payload,
    {
        Batches {
            source: items.into_iter(),
            carry: None,
            max_bytes: self.max_bytes,
            next_index: 0,
        }
    }
}

/// Iterator returned by [`BatchPlanner::plan`].
pub struct Batches<I: Iterator> {
    source: I,
    /// Item that overflowed the previous batch and opens the next one.
    carry: Option<I::Item>,
    max_bytes: u64,
    next_index: usize,
}

impl<I> Iterator for Batches<I>
where
    I: Iterator,
    I::Item: Payload,
{
    type Item = Batch<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut batch = Batch::empty(self.next_index);

        while let Some(item) = self.carry.take().or_else(|| self.source.next()) {
            let size = item.encoded_size();
            if !batch.is_empty() && batch.total_bytes.saturating_add(size) > self.max_bytes {
                self.carry = Some(item);
                break;
            }
            batch.push(item, size);
        }

        if batch.is_empty() {
            return None;
        }
        self.next_index += 1;
        Some(batch)
    }
}

impl<I> std::iter::FusedIterator for Batches<I>
where
    I: std::iter::FusedIterator,
    I::Item: Payload,
{
}
