//! Receive-side acknowledgement tracking and aggregation.
//!
//! The buffer tracks which gene serials have arrived and renders them as
//! `(start, end)` inclusive-exclusive ranges. The contiguous-from-zero
//! prefix is always the first pair, so the sender can read its successive
//! received position from the pair starting at 0. Acks are aggregated:
//! one ack frame covers a batch of arrivals instead of one frame per gene.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::gene::AckFrame;

/// Genes received since the last ack that force an immediate ack.
const ACK_BATCH_THRESHOLD: u32 = 8;

/// Longest an arrival waits before an ack is due.
const ACK_DELAY: Duration = Duration::from_millis(20);

/// Tracks received gene serials for one inbound transmission.
#[derive(Debug, Default)]
pub struct AckBuffer {
    /// All serials below this arrived.
    successive: u32,
    /// Arrived serials at or above `successive`.
    others: BTreeSet<u32>,
}

impl AckBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an arrival. Returns `false` for duplicates.
    pub fn record(&mut self, serial: u32) -> bool {
        if serial < self.successive {
            return false;
        }
        if !self.others.insert(serial) {
            return false;
        }
        // fold newly contiguous serials into the prefix
        while self.others.remove(&self.successive) {
            self.successive += 1;
        }
        true
    }

    /// Highest serial below which everything arrived.
    pub fn successive_position(&self) -> u32 {
        self.successive
    }

    /// Whether a serial has arrived.
    pub fn contains(&self, serial: u32) -> bool {
        serial < self.successive || self.others.contains(&serial)
    }

    /// Renders the buffer as ack pairs, the zero-prefix first.
    pub fn pairs(&self) -> Vec<(u32, u32)> {
        let mut pairs = Vec::new();
        if self.successive > 0 {
            pairs.push((0, self.successive));
        }
        let mut run: Option<(u32, u32)> = None;
        for &serial in &self.others {
            match run {
                Some((start, end)) if serial == end => run = Some((start, serial + 1)),
                Some(done) => {
                    pairs.push(done);
                    run = Some((serial, serial + 1));
                }
                None => run = Some((serial, serial + 1)),
            }
        }
        if let Some(done) = run {
            pairs.push(done);
        }
        pairs
    }
}

/// Decides when a batch of arrivals is worth an ack frame.
#[derive(Debug)]
pub struct AckAggregator {
    unacked_arrivals: u32,
    oldest_unacked: Option<Instant>,
}

impl AckAggregator {
    /// Creates an aggregator with nothing pending.
    pub fn new() -> Self {
        Self {
            unacked_arrivals: 0,
            oldest_unacked: None,
        }
    }

    /// Notes one arrival.
    pub fn on_arrival(&mut self, now: Instant) {
        self.unacked_arrivals += 1;
        self.oldest_unacked.get_or_insert(now);
    }

    /// Whether an ack should go out now.
    pub fn ack_due(&self, now: Instant) -> bool {
        if self.unacked_arrivals >= ACK_BATCH_THRESHOLD {
            return true;
        }
        match self.oldest_unacked {
            Some(oldest) => now.duration_since(oldest) >= ACK_DELAY,
            None => false,
        }
    }

    /// Resets after an ack frame was emitted.
    pub fn acked(&mut self) {
        self.unacked_arrivals = 0;
        self.oldest_unacked = None;
    }

    /// Whether arrivals are waiting for an ack.
    pub fn pending(&self) -> bool {
        self.unacked_arrivals > 0
    }
}

impl Default for AckAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the ack frame for one inbound transmission.
pub fn build_ack(transmission_id: u32, buffer: &AckBuffer) -> AckFrame {
    AckFrame {
        transmission_id,
        pairs: buffer.pairs(),
    }
}
