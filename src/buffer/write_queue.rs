//! Write queue with a rewindable write mark.
//!
//! Backed by a [`BufferQueue`] of flushable data plus an optional marked
//! rewrite area. While a mark is set, appends land in the rewrite area at a
//! movable write cursor and are withheld from `drain`/`lease`; resetting the
//! mark rewinds the cursor so already-queued-but-unflushed bytes can be
//! overwritten in place (length-placeholder rewriting). Overwrites splice
//! fragments zero-copy: equal length replaces in place, shorter replaces a
//! prefix and keeps the old tail, longer spans subsequent fragments and
//! extends the area.

use bytes::Bytes;

use super::queue::BufferQueue;

/// Data written after the mark, with a movable overwrite cursor.
struct RewriteArea {
    frags: Vec<Bytes>,
    cursor: usize,
}

impl RewriteArea {
    fn len(&self) -> usize {
        self.frags.iter().map(|f| f.len()).sum()
    }

    /// Write `data` at the cursor, overwriting existing bytes one-for-one
    /// and extending past the end. Fragments are sliced, never copied.
    fn write(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let total = self.len();
        if self.cursor >= total {
            // Plain append at the end.
            self.cursor = total + data.len();
            self.frags.push(data);
            return;
        }

        let mut rebuilt = Vec::with_capacity(self.frags.len() + 2);
        let start = self.cursor;
        let end = self.cursor + data.len();
        let mut offset = 0usize;
        let mut inserted = false;

        for frag in self.frags.drain(..) {
            let frag_start = offset;
            let frag_end = offset + frag.len();
            offset = frag_end;

            // Keep the part of this fragment before the overwrite window.
            if frag_start < start {
                let keep = (start - frag_start).min(frag.len());
                rebuilt.push(frag.slice(..keep));
            }
            if !inserted && frag_end > start {
                rebuilt.push(data.clone());
                inserted = true;
            }
            // Keep the part after the overwrite window.
            if frag_end > end {
                let from = end.saturating_sub(frag_start);
                rebuilt.push(frag.slice(from..));
            }
        }
        if !inserted {
            rebuilt.push(data);
        }
        self.frags = rebuilt;
        self.cursor = end;
    }
}

/// A [`BufferQueue`] augmented with `mark`/`reset`/`remove` write marks.
#[derive(Default)]
pub struct WriteQueue {
    queue: BufferQueue,
    mark: Option<RewriteArea>,
}

impl WriteQueue {
    /// Create an empty write queue.
    pub fn new() -> Self {
        WriteQueue {
            queue: BufferQueue::new(),
            mark: None,
        }
    }

    /// Append a fragment. Diverted into the rewrite area while a mark is set.
    pub fn append(&mut self, frag: Bytes) {
        match &mut self.mark {
            Some(area) => area.write(frag),
            None => self.queue.append(frag),
        }
    }

    /// Append several fragments, preserving their order.
    pub fn append_all<I: IntoIterator<Item = Bytes>>(&mut self, frags: I) {
        for frag in frags {
            self.append(frag);
        }
    }

    /// Set the write mark at the current position. A previous mark is
    /// removed first (its data becomes flushable).
    pub fn mark_write_position(&mut self) {
        self.remove_write_mark();
        self.mark = Some(RewriteArea {
            frags: Vec::new(),
            cursor: 0,
        });
    }

    /// Rewind the write cursor to the mark. Subsequent appends overwrite
    /// previously written bytes. Returns false if no mark is set.
    pub fn reset_to_write_mark(&mut self) -> bool {
        match &mut self.mark {
            Some(area) => {
                area.cursor = 0;
                true
            }
            None => false,
        }
    }

    /// Remove the mark, making the rewrite area flushable.
    pub fn remove_write_mark(&mut self) {
        if let Some(area) = self.mark.take() {
            self.queue.append_all(area.frags);
        }
    }

    /// Whether a write mark is currently set.
    pub fn is_marked(&self) -> bool {
        self.mark.is_some()
    }

    /// Put a fragment back at the head of the flushable queue.
    pub fn add_first(&mut self, frag: Bytes) {
        self.queue.add_first(frag);
    }

    /// Detach all flushable fragments. Marked data is withheld until the
    /// mark is removed.
    pub fn drain(&mut self) -> Vec<Bytes> {
        self.queue.drain()
    }

    /// Detach up to `max_bytes` of flushable data.
    pub fn lease(&mut self, max_bytes: usize) -> Vec<Bytes> {
        self.queue.lease(max_bytes)
    }

    /// Flushable bytes (marked data excluded).
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no flushable bytes are queued.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Flushable plus marked bytes.
    pub fn total_len(&self) -> usize {
        self.queue.len() + self.mark.as_ref().map(|a| a.len()).unwrap_or(0)
    }

    /// Copy out all flushable bytes in order (diagnostics and tests).
    pub fn peek_bytes(&self) -> Vec<u8> {
        self.queue.peek_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn flush(q: &mut WriteQueue) -> Vec<u8> {
        q.remove_write_mark();
        q.drain().iter().flat_map(|f| f.to_vec()).collect()
    }

    #[test]
    fn unmarked_append_is_flushable() {
        let mut q = WriteQueue::new();
        q.append(frag("abc"));
        assert_eq!(q.len(), 3);
        assert_eq!(flush(&mut q), b"abc");
    }

    #[test]
    fn marked_data_withheld_until_mark_removed() {
        let mut q = WriteQueue::new();
        q.append(frag("head"));
        q.mark_write_position();
        q.append(frag("tail"));
        assert_eq!(q.len(), 4);
        assert_eq!(q.total_len(), 8);
        assert_eq!(q.peek_bytes(), b"head");
        q.remove_write_mark();
        assert_eq!(q.len(), 8);
        assert_eq!(q.peek_bytes(), b"headtail");
    }

    #[test]
    fn overwrite_equal_length_replaces_in_place() {
        let mut q = WriteQueue::new();
        q.mark_write_position();
        q.append(frag("AAAA"));
        assert!(q.reset_to_write_mark());
        q.append(frag("BBBB"));
        assert_eq!(flush(&mut q), b"BBBB");
    }

    #[test]
    fn reset_then_equal_write_matches_single_write() {
        let mut q = WriteQueue::new();
        q.mark_write_position();
        q.append(frag("old!"));
        q.reset_to_write_mark();
        q.append(frag("new!"));

        let mut reference = WriteQueue::new();
        reference.mark_write_position();
        reference.append(frag("new!"));

        assert_eq!(flush(&mut q), flush(&mut reference));
    }

    #[test]
    fn overwrite_shorter_consumes_only_its_span() {
        let mut q = WriteQueue::new();
        q.mark_write_position();
        q.append(frag("AAAAAA"));
        q.reset_to_write_mark();
        q.append(frag("BB"));
        // The two overwritten bytes are discarded; the old tail survives so
        // a length placeholder can be rewritten without destroying the body.
        assert_eq!(flush(&mut q), b"BBAAAA");
    }

    #[test]
    fn overwrite_spans_multiple_fragments() {
        let mut q = WriteQueue::new();
        q.mark_write_position();
        q.append(frag("abc"));
        q.append(frag("def"));
        q.append(frag("ghi"));
        q.reset_to_write_mark();
        q.append(frag("WXYZ"));
        assert_eq!(flush(&mut q), b"WXYZefghi");
    }

    #[test]
    fn sequential_writes_after_reset() {
        let mut q = WriteQueue::new();
        q.mark_write_position();
        q.append(frag("123456"));
        q.reset_to_write_mark();
        q.append(frag("ab"));
        q.append(frag("cd"));
        assert_eq!(flush(&mut q), b"abcd56");
    }

    #[test]
    fn overwrite_extends_past_end() {
        let mut q = WriteQueue::new();
        q.mark_write_position();
        q.append(frag("ab"));
        q.reset_to_write_mark();
        q.append(frag("WXYZ"));
        assert_eq!(flush(&mut q), b"WXYZ");
    }

    #[test]
    fn remark_flushes_previous_area() {
        let mut q = WriteQueue::new();
        q.mark_write_position();
        q.append(frag("one"));
        q.mark_write_position();
        q.append(frag("two"));
        assert_eq!(q.peek_bytes(), b"one");
        q.remove_write_mark();
        assert_eq!(q.peek_bytes(), b"onetwo");
    }

    #[test]
    fn reset_without_mark_is_refused() {
        let mut q = WriteQueue::new();
        assert!(!q.reset_to_write_mark());
    }
}
