//! Append-only chunked buffer for replaying a backlog.
//!
//! Items live in a chain of fixed-capacity chunks. `add` writes the next free
//! slot of the tail chunk and links a fresh chunk once the tail is full, so
//! existing slots never move and are written exactly once. A separate seed
//! slot set through [`AppendOnlyBuffer::set_first`] is observed before any
//! appended item.
//!
//! The buffer does no locking of its own: writers need `&mut self`, and a
//! caller sharing it across threads wraps it in a mutex.

use std::fmt;
use std::ptr::NonNull;

use crate::hooks;
use crate::null::{self, Wrapped};
use crate::protocol::{Cancellable, Consumer};
use crate::{FlowError, FlowResult};

struct Chunk<T> {
    slots: Vec<Wrapped<T>>,
    next: Option<Box<Chunk<T>>>,
}

impl<T> Chunk<T> {
    fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            next: None,
        }
    }
}

/// How far a traversal got.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Visit {
    /// Items handed to the consumer or predicate.
    pub visited: usize,
    /// `true` when the traversal ended before the last item.
    pub stopped: bool,
}

pub struct AppendOnlyBuffer<T> {
    first: Option<Wrapped<T>>,
    head: Box<Chunk<T>>,
    // Always points at the last chunk of the chain owned by `head`.
    tail: NonNull<Chunk<T>>,
    capacity: usize,
    appended: usize,
}

// SAFETY: `tail` only aliases memory owned through `head`; the buffer is
// exactly as thread-safe as a `Vec<T>` holding the same items.
unsafe impl<T: Send> Send for AppendOnlyBuffer<T> {}
unsafe impl<T: Sync> Sync for AppendOnlyBuffer<T> {}

impl<T: 'static> AppendOnlyBuffer<T> {
    /// Creates a buffer whose chunks hold `capacity` items each.
    pub fn new(capacity: usize) -> FlowResult<Self> {
        if capacity == 0 {
            return Err(FlowError::InvalidCapacity {
                requested: 0,
                minimum: 1,
            });
        }
        let mut head = Box::new(Chunk::new(capacity));
        let tail = NonNull::from(&mut *head);
        Ok(Self {
            first: None,
            head,
            tail,
            capacity,
            appended: 0,
        })
    }

    /// Creates a buffer sized by [`FlowConfig::buffer_chunk_capacity`](crate::hooks::FlowConfig).
    pub fn from_config() -> FlowResult<Self> {
        Self::new(hooks::config().buffer_chunk_capacity)
    }

    /// Appends one item; `None` is stored as an absent item.
    pub fn add(&mut self, item: Option<T>) {
        let wrapped = null::wrap(item);
        // SAFETY: `tail` points into the chain owned by `head` and `&mut self`
        // rules out any other reference into it.
        let tail = unsafe { self.tail.as_mut() };
        if tail.slots.len() < self.capacity {
            tail.slots.push(wrapped);
        } else {
            let mut chunk = Box::new(Chunk::new(self.capacity));
            chunk.slots.push(wrapped);
            // The box's heap allocation does not move when the box does.
            let next = NonNull::from(&mut *chunk);
            tail.next = Some(chunk);
            self.tail = next;
        }
        self.appended += 1;
    }

    /// Sets the seed item, replacing any previous seed.
    pub fn set_first(&mut self, item: Option<T>) {
        self.first = Some(null::wrap(item));
    }
}

impl<T> AppendOnlyBuffer<T> {
    /// Seed first, then appended items in insertion order.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            first: self.first.as_ref(),
            chunk: Some(&*self.head),
            index: 0,
        }
    }

    /// Number of stored items, seed included.
    pub fn len(&self) -> usize {
        self.appended + usize::from(self.first.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots per chunk.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Replays every item into `consumer`, stopping as soon as `handle`
    /// reports cancellation. No terminal signal is sent.
    pub fn accept<C>(&self, consumer: &mut C, handle: &dyn Cancellable) -> Visit
    where
        T: Clone,
        C: Consumer<T> + ?Sized,
    {
        let mut visit = Visit::default();
        for item in self.iter() {
            if handle.is_cancelled() {
                visit.stopped = true;
                break;
            }
            consumer.on_next(item.cloned());
            visit.visited += 1;
        }
        visit
    }

    /// Visits items while `predicate` returns `true`.
    pub fn for_each_while<F>(&self, mut predicate: F) -> Visit
    where
        F: FnMut(Option<&T>) -> bool,
    {
        let mut visit = Visit::default();
        for item in self.iter() {
            visit.visited += 1;
            if !predicate(item) {
                visit.stopped = true;
                break;
            }
        }
        visit
    }

    /// Like [`for_each_while`](Self::for_each_while), threading `state`
    /// through a fallible predicate. An error ends the traversal.
    pub fn for_each_while_with<S, F>(&self, state: &mut S, mut predicate: F) -> FlowResult<Visit>
    where
        F: FnMut(&mut S, Option<&T>) -> FlowResult<bool>,
    {
        let mut visit = Visit::default();
        for item in self.iter() {
            visit.visited += 1;
            if !predicate(state, item)? {
                visit.stopped = true;
                break;
            }
        }
        Ok(visit)
    }
}

impl<T> Drop for AppendOnlyBuffer<T> {
    fn drop(&mut self) {
        // Unlink chunk by chunk; recursive drops of a long chain would
        // overflow the stack.
        let mut next = self.head.next.take();
        while let Some(mut chunk) = next {
            next = chunk.next.take();
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for AppendOnlyBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Borrowing iterator over an [`AppendOnlyBuffer`].
pub struct Iter<'a, T> {
    first: Option<&'a Wrapped<T>>,
    chunk: Option<&'a Chunk<T>>,
    index: usize,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = Option<&'a T>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(first) = self.first.take() {
            return Some(first.as_option());
        }
        loop {
            let chunk = self.chunk?;
            if let Some(slot) = chunk.slots.get(self.index) {
                self.index += 1;
                return Some(slot.as_option());
            }
            self.chunk = chunk.next.as_deref();
            self.index = 0;
        }
    }
}

impl<'a, T> IntoIterator for &'a AppendOnlyBuffer<T> {
    type Item = Option<&'a T>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    //! Chunk boundaries, the seed slot, stop conditions and cancellation.

    use super::*;
    use crate::handle::BooleanHandle;
    use crate::testing::test_consumer;
    use proptest::prelude::*;

    fn generate(amount: usize) -> Vec<Option<usize>> {
        (0..amount).map(|i| (i % 2 == 0).then_some(i)).collect()
    }

    fn filled_with(values: &[Option<usize>]) -> AppendOnlyBuffer<usize> {
        let mut buffer = AppendOnlyBuffer::new(10).unwrap();
        for value in values {
            buffer.add(*value);
        }
        buffer
    }

    fn accepted(buffer: &AppendOnlyBuffer<usize>) -> Vec<Option<usize>> {
        let (mut consumer, probe) = test_consumer::<usize>();
        let handle = BooleanHandle::new();
        let visit = buffer.accept(&mut consumer, &handle);
        assert!(!visit.stopped);
        assert_eq!(visit.visited, buffer.len());
        probe.assert_not_terminated();
        assert!(probe.errors().is_empty());
        probe.values()
    }

    /// 993 items span a hundred chunks and come back in order, absent ones included.
    #[test]
    fn accept_multi_chunk() {
        let expected = generate(993);
        let buffer = filled_with(&expected);
        assert_eq!(buffer.len(), 993);
        assert_eq!(accepted(&buffer), expected);
    }

    #[test]
    fn accept_single_chunk() {
        let expected = generate(7);
        assert_eq!(accepted(&filled_with(&expected)), expected);
    }

    /// The seed alone is replayed exactly once.
    #[test]
    fn set_first_in_empty() {
        let mut buffer = AppendOnlyBuffer::new(10).unwrap();
        buffer.set_first(Some(42));
        assert_eq!(accepted(&buffer), vec![Some(42)]);

        let mut buffer = AppendOnlyBuffer::<usize>::new(10).unwrap();
        buffer.set_first(None);
        assert_eq!(accepted(&buffer), vec![None]);
    }

    /// The seed precedes appended items and can be replaced.
    #[test]
    fn set_first_precedes_history() {
        let mut buffer = filled_with(&[Some(1), Some(2)]);
        buffer.set_first(Some(0));
        buffer.set_first(Some(9));
        buffer.add(Some(3));
        assert_eq!(accepted(&buffer), vec![Some(9), Some(1), Some(2), Some(3)]);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let err = AppendOnlyBuffer::<u8>::new(0).unwrap_err();
        assert!(matches!(
            err,
            FlowError::InvalidCapacity {
                requested: 0,
                minimum: 1
            }
        ));
    }

    /// Cancelling from inside `on_next` stops the replay at once.
    #[test]
    fn accept_stops_on_cancel() {
        let buffer = filled_with(&generate(30));
        let handle = std::sync::Arc::new(BooleanHandle::new());
        let canceller = handle.clone();
        let (consumer, probe) = test_consumer::<usize>();
        let mut consumer = consumer.with_on_next(move |item| {
            if *item == Some(12) {
                canceller.cancel();
            }
        });
        let visit = buffer.accept(&mut consumer, &*handle);
        assert_eq!(visit, Visit { visited: 13, stopped: true });
        assert_eq!(probe.values(), generate(13));
    }

    /// Traversal stops at the first `false`, in the first or the last chunk.
    #[test]
    fn for_each_while_stops() {
        for (len, stop_at) in [(7, 5), (20, 7)] {
            let buffer = filled_with(&generate(len));
            let mut tested = 0;
            let visit = buffer.for_each_while(|_| {
                tested += 1;
                tested != stop_at
            });
            assert_eq!(tested, stop_at);
            assert_eq!(visit, Visit { visited: stop_at, stopped: true });
        }

        let buffer = filled_with(&generate(20));
        let visit = buffer.for_each_while(|_| true);
        assert_eq!(visit, Visit { visited: 20, stopped: false });
    }

    /// State is threaded through, and predicate errors propagate.
    #[test]
    fn for_each_while_with_state() {
        let buffer = filled_with(&generate(20));
        let mut sum = 0usize;
        let visit = buffer
            .for_each_while_with(&mut sum, |sum, item| {
                *sum += item.copied().unwrap_or(0);
                Ok(*sum < 20)
            })
            .unwrap();
        // 0 + 2 + 4 + 6 + 8 reaches 20 on the ninth item.
        assert_eq!(sum, 20);
        assert_eq!(visit, Visit { visited: 9, stopped: true });

        let mut state = ();
        let err = buffer
            .for_each_while_with(&mut state, |_, item| match item {
                Some(&6) => Err(FlowError::msg("six")),
                _ => Ok(true),
            })
            .unwrap_err();
        assert_eq!(err.to_string(), "six");
    }

    #[test]
    fn from_config_uses_configured_chunk_size() {
        let buffer = AppendOnlyBuffer::<u8>::from_config().unwrap();
        assert!(buffer.capacity() >= 1);
    }

    /// A very long chain drops without recursing.
    #[test]
    fn long_chain_drops() {
        let mut buffer = AppendOnlyBuffer::new(1).unwrap();
        for i in 0..200_000u32 {
            buffer.add(Some(i));
        }
        assert_eq!(buffer.iter().count(), 200_000);
        drop(buffer);
    }

    proptest! {
        #[test]
        fn preserves_insertion_order(
            items in proptest::collection::vec(proptest::option::of(any::<i64>()), 0..200),
            capacity in 1usize..16,
            seed in proptest::option::of(proptest::option::of(any::<i64>())),
        ) {
            let mut buffer = AppendOnlyBuffer::new(capacity).unwrap();
            if let Some(seed) = seed {
                buffer.set_first(seed);
            }
            for item in &items {
                buffer.add(*item);
            }
            let mut expected: Vec<Option<i64>> = seed.into_iter().collect();
            expected.extend(items.iter().copied());
            let seen: Vec<Option<i64>> = buffer.iter().map(|item| item.copied()).collect();
            prop_assert_eq!(seen, expected);
        }
    }
}
