//! Write-rate throttling stage.
//!
//! Outbound writes are staged in a local queue and released toward the next
//! stage under a token-bucket budget of `rate` bytes per second with a one
//! second burst ceiling. Release happens from `flush`, write readiness, and
//! the dispatcher's periodic tick; `hard_flush` bypasses the budget entirely
//! so connection teardown is never throttled.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;

use crate::buffer::BufferQueue;
use crate::error::Error;
use crate::pipeline::{Stage, StageCtx, WriteTag};

pub(crate) struct ThrottleStage {
    pub(crate) next: Box<Stage>,
    pending: VecDeque<PendingEntry>,
    pending_bytes: usize,
    /// Budget in bytes per second.
    rate: u64,
    last_refill: Instant,
    /// Accumulated budget, capped at one second's worth.
    tokens: u64,
}

struct PendingEntry {
    frags: BufferQueue,
    tag: Option<WriteTag>,
}

impl ThrottleStage {
    pub fn new(next: Box<Stage>, rate: u64) -> Self {
        ThrottleStage {
            next,
            pending: VecDeque::new(),
            pending_bytes: 0,
            rate,
            last_refill: Instant::now(),
            // Start with a full bucket so short-lived connections are not
            // penalized before their first refill.
            tokens: rate,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn write(&mut self, frags: Vec<Bytes>, tag: Option<WriteTag>) -> Result<(), Error> {
        let mut q = BufferQueue::new();
        q.append_all(frags);
        self.pending_bytes += q.len();
        self.pending.push_back(PendingEntry { frags: q, tag });
        Ok(())
    }

    pub fn flush(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        self.release(ctx, false)?;
        self.next.flush(ctx)
    }

    pub fn hard_flush(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        self.release(ctx, true)?;
        self.next.hard_flush(ctx)
    }

    pub fn on_writable(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        self.release(ctx, false)?;
        self.next.on_writable(ctx)
    }

    pub fn on_tick(&mut self, ctx: &mut StageCtx<'_>) -> Result<Vec<WriteTag>, Error> {
        self.release(ctx, false)?;
        let mut acks = self.next.on_tick(ctx)?;
        acks.extend(self.next.flush(ctx)?);
        Ok(acks)
    }

    pub fn close(&mut self, immediate: bool, ctx: &mut StageCtx<'_>) -> Result<(), Error> {
        if !immediate {
            self.release(ctx, true)?;
        } else {
            self.pending.clear();
            self.pending_bytes = 0;
        }
        self.next.close(immediate, ctx)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = (self.rate as f64 * elapsed.as_secs_f64()) as u64;
        if earned > 0 {
            self.tokens = (self.tokens + earned).min(self.rate.max(1));
            self.last_refill = now;
        }
    }

    /// Forward pending entries within the budget. `unlimited` ignores and
    /// drains the bucket (teardown path).
    fn release(&mut self, ctx: &mut StageCtx<'_>, unlimited: bool) -> Result<(), Error> {
        self.refill(ctx.now);
        while let Some(entry) = self.pending.front_mut() {
            // A zero-length entry carries no bytes but may carry a tag;
            // forward it regardless of the budget so it cannot block the
            // entries queued behind it.
            if entry.frags.is_empty() {
                let tag = entry.tag;
                self.pending.pop_front();
                self.next.write(Vec::new(), tag, ctx)?;
                continue;
            }
            let budget = if unlimited {
                entry.frags.len()
            } else {
                self.tokens as usize
            };
            if budget == 0 {
                return Ok(());
            }
            let part = entry.frags.lease(budget);
            let released: usize = part.iter().map(|f| f.len()).sum();
            self.pending_bytes -= released;
            if !unlimited {
                self.tokens -= released as u64;
            }
            let done = entry.frags.is_empty();
            let tag = if done { entry.tag } else { None };
            self.next.write(part, tag, ctx)?;
            if done {
                self.pending.pop_front();
            } else {
                return Ok(());
            }
        }
        Ok(())
    }
}
