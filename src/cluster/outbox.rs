//! Outbound message queue.
//!
//! Messages are flushed opportunistically in batches; when the bus reports
//! "try again" the flush is re-armed on a timer whose delay scales with the
//! queue depth, capped at one second. Messages are never dropped.

use std::collections::VecDeque;
use std::time::Duration;

use slog::{debug, error, trace, warn, Logger};

use super::{BusError, ClusterBus, Envelope};

/// Maximum messages sent per flush pass.
pub const SEND_MAX: usize = 200;

/// Consecutive transient failures on the same message before we escalate to
/// an error log (the message still stays queued).
const SEND_RETRY_LIMIT: u32 = 5;

/// Outcome of a flush pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Queue drained.
    Idle,
    /// Bus pushed back; retry after the given delay.
    Retry(Duration),
}

pub struct Outbox {
    queue: VecDeque<Envelope>,
    next_id: u64,
    /// Transient-failure count for the message at the head of the queue.
    head_retries: u32,
    log: Logger,
}

impl Outbox {
    pub fn new(log: Logger) -> Self {
        Outbox {
            queue: VecDeque::new(),
            next_id: 1,
            head_retries: 0,
            log,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue an envelope for delivery, stamping its monotonic id.
    pub fn enqueue(&mut self, mut envelope: Envelope) {
        envelope.set_id(self.next_id);
        self.next_id += 1;
        self.queue.push_back(envelope);

        let depth = self.queue.len();
        if depth >= 1000 && depth % 1000 == 0 {
            error!(self.log, "Cluster send queue has grown very large"; "depth" => depth);
        } else if depth == SEND_MAX {
            warn!(self.log, "Cluster send queue has grown large"; "depth" => depth);
        }
        trace!(self.log, "Queued cluster message";
            "id" => self.next_id - 1, "depth" => depth);
    }

    /// Send up to [`SEND_MAX`] queued messages. On transient push-back the
    /// remaining messages stay queued and the caller is told when to retry.
    pub async fn flush(&mut self, bus: &dyn ClusterBus) -> Result<FlushOutcome, BusError> {
        let mut sent = 0usize;
        while sent < SEND_MAX {
            let envelope = match self.queue.front() {
                Some(envelope) => envelope,
                None => break,
            };

            match bus.publish(envelope).await {
                Ok(()) => {
                    self.queue.pop_front();
                    self.head_retries = 0;
                    sent += 1;
                }
                Err(err) if err.is_transient() => {
                    self.head_retries += 1;
                    if self.head_retries >= SEND_RETRY_LIMIT {
                        error!(self.log, "Cluster message send keeps failing";
                            "retries" => self.head_retries,
                            "depth" => self.queue.len());
                    }
                    let delay = self.retry_delay();
                    debug!(self.log, "Bus push-back, re-arming flush";
                        "sent" => sent, "depth" => self.queue.len(),
                        "delay_ms" => delay.as_millis() as u64);
                    return Ok(FlushOutcome::Retry(delay));
                }
                Err(err) => return Err(err),
            }
        }

        if self.queue.is_empty() {
            if sent > 0 {
                trace!(self.log, "Flushed cluster send queue"; "sent" => sent);
            }
            Ok(FlushOutcome::Idle)
        } else {
            // Batch limit reached with messages remaining; come right back.
            Ok(FlushOutcome::Retry(Duration::from_millis(0)))
        }
    }

    /// Retry delay scaled by queue depth, capped at one second.
    fn retry_delay(&self) -> Duration {
        let depth = self.queue.len() as u64;
        Duration::from_millis((SEND_MAX as u64 + 10 * depth).min(1000))
    }
}
