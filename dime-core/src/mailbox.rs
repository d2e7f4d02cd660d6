//! Per-client mailbox.
//!
//! FIFO of envelope references awaiting `sync`. Bounded by
//! `MailboxLimits`; on overflow the oldest undelivered envelope is
//! dropped and counted, so a slow receiver degrades alone instead of
//! stalling its senders.

use std::collections::VecDeque;

use tracing::warn;

use crate::config::MailboxLimits;
use crate::envelope::Envelope;

#[derive(Debug)]
pub struct Mailbox {
    queue: VecDeque<Envelope>,
    queued_bytes: usize,
    limits: MailboxLimits,
    dropped: u64,
}

impl Mailbox {
    #[must_use]
    pub fn new(limits: MailboxLimits) -> Self {
        Self {
            queue: VecDeque::new(),
            queued_bytes: 0,
            limits,
            dropped: 0,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Envelopes evicted by overflow since the mailbox was created.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Append an envelope, evicting from the front if a cap is exceeded.
    pub fn push(&mut self, env: Envelope) {
        self.queued_bytes += env.byte_size();
        self.queue.push_back(env);

        while self.queue.len() > self.limits.max_envelopes
            || self.queued_bytes > self.limits.max_bytes
        {
            let Some(oldest) = self.queue.pop_front() else {
                break;
            };
            self.queued_bytes -= oldest.byte_size();
            self.dropped += 1;
            warn!(
                sender = oldest.sender(),
                dropped_total = self.dropped,
                "mailbox overflow, dropping oldest undelivered envelope"
            );
        }
    }

    /// Remove and return up to `n` envelopes in arrival order.
    ///
    /// `n < 0` drains the entire mailbox as of this call.
    pub fn drain(&mut self, n: i64) -> Vec<Envelope> {
        let take = if n < 0 {
            self.queue.len()
        } else {
            (n as usize).min(self.queue.len())
        };

        let mut out = Vec::with_capacity(take);
        for _ in 0..take {
            if let Some(env) = self.queue.pop_front() {
                self.queued_bytes -= env.byte_size();
                out.push(env);
            }
        }
        out
    }
}
