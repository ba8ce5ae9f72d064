//! FIFO queue of byte-buffer fragments.
//!
//! Stages inbound/outbound data without copying: `append`/`add_first` only
//! restructure the fragment list, `drain` detaches everything, and
//! `lease(max)` detaches up to a byte budget, splitting the straddling
//! fragment zero-copy and leaving the remainder at the head.

use std::collections::VecDeque;

use bytes::Bytes;

/// Ordered sequence of fragments; insertion order is send/process order.
#[derive(Default)]
pub struct BufferQueue {
    frags: VecDeque<Bytes>,
    total: usize,
}

impl BufferQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        BufferQueue {
            frags: VecDeque::new(),
            total: 0,
        }
    }

    /// Append a fragment at the tail. Empty fragments are dropped.
    pub fn append(&mut self, frag: Bytes) {
        if frag.is_empty() {
            return;
        }
        self.total += frag.len();
        self.frags.push_back(frag);
    }

    /// Append several fragments at the tail, preserving their order.
    pub fn append_all<I: IntoIterator<Item = Bytes>>(&mut self, frags: I) {
        for frag in frags {
            self.append(frag);
        }
    }

    /// Put a fragment back at the head (an unconsumed remainder).
    pub fn add_first(&mut self, frag: Bytes) {
        if frag.is_empty() {
            return;
        }
        self.total += frag.len();
        self.frags.push_front(frag);
    }

    /// Put several fragments back at the head, preserving their order.
    pub fn add_first_all<I>(&mut self, frags: I)
    where
        I: IntoIterator<Item = Bytes>,
        I::IntoIter: DoubleEndedIterator,
    {
        for frag in frags.into_iter().rev() {
            self.add_first(frag);
        }
    }

    /// Detach all fragments, leaving the queue empty.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.total = 0;
        self.frags.drain(..).collect()
    }

    /// Detach up to `max_bytes`. If the queue holds no more than that, this
    /// is `drain`. Otherwise the fragment straddling the boundary is split
    /// zero-copy and its remainder stays at the head.
    pub fn lease(&mut self, max_bytes: usize) -> Vec<Bytes> {
        if self.total <= max_bytes {
            return self.drain();
        }
        let mut out = Vec::new();
        let mut budget = max_bytes;
        while budget > 0 {
            let mut frag = match self.frags.pop_front() {
                Some(f) => f,
                None => break,
            };
            if frag.len() <= budget {
                budget -= frag.len();
                self.total -= frag.len();
                out.push(frag);
            } else {
                let head = frag.split_to(budget);
                self.total -= head.len();
                budget = 0;
                out.push(head);
                self.frags.push_front(frag);
            }
        }
        out
    }

    /// Total remaining bytes across all fragments.
    pub fn len(&self) -> usize {
        self.total
    }

    /// Whether the queue holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Number of fragments queued.
    pub fn fragment_count(&self) -> usize {
        self.frags.len()
    }

    /// Copy out all queued bytes in order (diagnostics and tests).
    pub fn peek_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for frag in &self.frags {
            out.extend_from_slice(frag);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn append_and_drain_fifo() {
        let mut q = BufferQueue::new();
        q.append(frag("hello "));
        q.append(frag("world"));
        assert_eq!(q.len(), 11);
        assert!(!q.is_empty());

        let frags = q.drain();
        assert_eq!(frags.len(), 2);
        assert_eq!(&frags[0][..], b"hello ");
        assert_eq!(&frags[1][..], b"world");
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn empty_fragment_is_dropped() {
        let mut q = BufferQueue::new();
        q.append(Bytes::new());
        assert!(q.is_empty());
        assert_eq!(q.fragment_count(), 0);
    }

    #[test]
    fn add_first_precedes() {
        let mut q = BufferQueue::new();
        q.append(frag("bc"));
        q.add_first(frag("a"));
        assert_eq!(q.peek_bytes(), b"abc");
    }

    #[test]
    fn lease_below_total_splits() {
        let mut q = BufferQueue::new();
        q.append(frag("abcd"));
        q.append(frag("efgh"));

        let leased = q.lease(6);
        let leased_bytes: Vec<u8> = leased.iter().flat_map(|f| f.to_vec()).collect();
        assert_eq!(leased_bytes, b"abcdef");
        assert_eq!(q.len(), 2);
        assert_eq!(q.peek_bytes(), b"gh");
    }

    #[test]
    fn lease_at_or_above_total_is_drain() {
        let mut q = BufferQueue::new();
        q.append(frag("abcd"));
        let leased = q.lease(100);
        assert_eq!(leased.len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn lease_split_is_zero_copy() {
        let mut q = BufferQueue::new();
        let original = frag("abcdefgh");
        let base = original.as_ptr();
        q.append(original);

        let leased = q.lease(3);
        // The leased head and the retained remainder both point into the
        // original allocation.
        assert_eq!(leased[0].as_ptr(), base);
        let rest = q.drain();
        assert_eq!(rest[0].as_ptr(), unsafe { base.add(3) });
    }

    #[test]
    fn lease_then_add_first_reconstructs() {
        let mut reference = BufferQueue::new();
        let mut q = BufferQueue::new();
        for s in ["one", "twotwo", "three"] {
            reference.append(frag(s));
            q.append(frag(s));
        }
        let before = reference.peek_bytes();

        let leased = q.lease(5);
        q.add_first_all(leased);
        assert_eq!(q.peek_bytes(), before);
        assert_eq!(q.len(), before.len());
    }

    #[test]
    fn byte_accounting_over_mixed_ops() {
        let mut q = BufferQueue::new();
        let mut appended = 0usize;
        let mut removed = 0usize;
        for i in 0..20 {
            let data = vec![i as u8; (i % 7) + 1];
            appended += data.len();
            q.append(Bytes::from(data));
            if i % 3 == 0 {
                let leased = q.lease(4);
                removed += leased.iter().map(|f| f.len()).sum::<usize>();
            }
        }
        assert_eq!(q.len(), appended - removed);
    }
}
