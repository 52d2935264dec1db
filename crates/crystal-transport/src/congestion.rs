//! RTT estimation and CUBIC-derived congestion control.
//!
//! `cwnd` follows the CUBIC curve with a TCP-friendly floor; the effective
//! send budget (`capacity`) ramps smoothly toward `cwnd` at a rate derived
//! from `cwnd / RTT`, with a short boost window after idle, so a freshly
//! unblocked sender never dumps a full window in one burst.
//!
//! Lock ordering: callers hold the congestion lock innermost. Nothing in
//! this module calls back into connection or transmission state.

use std::time::{Duration, Instant};

use tracing::debug;

/// Multiplicative decrease factor.
const BETA: f64 = 0.2;

/// CUBIC aggressiveness constant.
const CUBIC_C: f64 = 0.4;

/// Initial window in genes.
const INITIAL_WINDOW: f64 = 10.0;

/// Smallest window after a loss event.
const MIN_WINDOW: f64 = 2.0;

/// Capacity boost multiplier while below cwnd.
const BOOST_FACTOR: f64 = 1.5;

/// Smoothed round-trip estimator (RFC 6298 weights) plus a running minimum.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    srtt: Duration,
    rttvar: Duration,
    min_rtt: Duration,
    has_sample: bool,
}

impl RttEstimator {
    /// Creates an estimator seeded with a conservative default.
    pub fn new() -> Self {
        Self {
            srtt: Duration::from_millis(200),
            rttvar: Duration::from_millis(100),
            min_rtt: Duration::from_millis(200),
            has_sample: false,
        }
    }

    /// Feeds one sample. Callers only sample genes that were never resent.
    pub fn sample(&mut self, rtt: Duration) {
        if !self.has_sample {
            self.srtt = rtt;
            self.rttvar = rtt / 2;
            self.min_rtt = rtt;
            self.has_sample = true;
            return;
        }
        if rtt < self.min_rtt {
            self.min_rtt = rtt;
        }
        let delta = if self.srtt > rtt {
            self.srtt - rtt
        } else {
            rtt - self.srtt
        };
        self.rttvar = (self.rttvar * 3 + delta) / 4;
        self.srtt = (self.srtt * 7 + rtt) / 8;
    }

    /// Smoothed RTT.
    pub fn smoothed(&self) -> Duration {
        self.srtt
    }

    /// Lowest RTT observed, used for resend suppression.
    pub fn minimum(&self) -> Duration {
        self.min_rtt
    }

    /// Retransmission timeout: `srtt + 4*rttvar`, floored at 200ms.
    pub fn retransmission_timeout(&self) -> Duration {
        (self.srtt + self.rttvar * 4).max(Duration::from_millis(200))
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time congestion controller readings.
#[derive(Debug, Clone, Copy)]
pub struct CongestionStats {
    /// Congestion window in genes.
    pub cwnd: f64,
    /// Effective send budget in genes.
    pub capacity: f64,
    /// Slow-start threshold.
    pub ssthresh: f64,
}

/// CUBIC congestion window plus the smoothed capacity budget.
#[derive(Debug)]
pub struct CubicCongestion {
    cwnd: f64,
    ssthresh: f64,
    /// Window size before the last loss event.
    w_max: f64,
    /// Time the current epoch's cubic origin is reached.
    k: f64,
    epoch_start: Option<Instant>,
    capacity: f64,
    capacity_updated: Instant,
    /// Remaining boosted ramp allowance.
    boost_budget: Duration,
}

impl CubicCongestion {
    /// Creates a controller in slow start with the initial window.
    pub fn new(now: Instant) -> Self {
        Self {
            cwnd: INITIAL_WINDOW,
            ssthresh: f64::MAX,
            w_max: INITIAL_WINDOW,
            k: 0.0,
            epoch_start: None,
            capacity: INITIAL_WINDOW,
            capacity_updated: now,
            boost_budget: Duration::ZERO,
        }
    }

    /// Current congestion window in genes.
    pub fn window(&self) -> f64 {
        self.cwnd
    }

    /// Current effective send budget in genes.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Current controller readings.
    pub fn stats(&self) -> CongestionStats {
        CongestionStats {
            cwnd: self.cwnd,
            capacity: self.capacity,
            ssthresh: self.ssthresh,
        }
    }

    /// Whether the sender must hold off.
    pub fn is_congested(&self, genes_in_flight: usize) -> bool {
        genes_in_flight as f64 >= self.capacity.floor()
    }

    /// How many genes the sender may put in flight right now.
    pub fn send_budget(&self, genes_in_flight: usize) -> usize {
        (self.capacity.floor() as usize).saturating_sub(genes_in_flight)
    }

    /// Grows the window for one newly acked gene.
    pub fn on_ack(&mut self, now: Instant, rtt: &RttEstimator) {
        if self.cwnd < self.ssthresh {
            // slow start
            self.cwnd += 1.0;
            self.advance_capacity(now, rtt);
            return;
        }
        let epoch_start = *self.epoch_start.get_or_insert_with(|| {
            self.k = ((self.w_max * BETA) / CUBIC_C).cbrt();
            now
        });
        let t = now.duration_since(epoch_start).as_secs_f64();
        let cubic = CUBIC_C * (t - self.k).powi(3) + self.w_max;

        // TCP-friendly region keeps the window from stalling on short RTTs
        let rtt_s = rtt.smoothed().as_secs_f64().max(1e-3);
        let wtcp = self.w_max * (1.0 - BETA)
            + (3.0 * BETA / (2.0 - BETA)) * (t / rtt_s);

        self.cwnd = cubic.max(wtcp).max(MIN_WINDOW);
        self.advance_capacity(now, rtt);
    }

    /// Shrinks the window on a loss event and starts a new cubic epoch.
    pub fn on_loss(&mut self, now: Instant) {
        self.w_max = self.cwnd;
        self.cwnd = (self.cwnd * (1.0 - BETA)).max(MIN_WINDOW);
        self.ssthresh = self.cwnd;
        self.k = ((self.w_max * BETA) / CUBIC_C).cbrt();
        self.epoch_start = Some(now);
        if self.capacity > self.cwnd {
            self.capacity = self.cwnd;
        }
        self.capacity_updated = now;
        debug!(cwnd = self.cwnd, "congestion window reduced");
    }

    /// Ramps capacity toward cwnd at `regen = cwnd / srtt` genes per
    /// millisecond, boosted 1.5x for up to `srtt / 1.5` after falling
    /// behind. Called on every ack and every processing tick.
    pub fn advance_capacity(&mut self, now: Instant, rtt: &RttEstimator) {
        let elapsed = now.duration_since(self.capacity_updated);
        self.capacity_updated = now;
        if self.capacity >= self.cwnd {
            self.capacity = self.cwnd;
            // behind-cwnd time earns a fresh boost allowance next time
            self.boost_budget = rtt.smoothed().div_f64(BOOST_FACTOR);
            return;
        }
        let srtt_ms = rtt.smoothed().as_secs_f64() * 1000.0;
        let regen = self.cwnd / srtt_ms.max(1.0);

        let boosted = elapsed.min(self.boost_budget);
        self.boost_budget -= boosted;
        let plain = elapsed - boosted;

        self.capacity += regen * BOOST_FACTOR * boosted.as_secs_f64() * 1000.0;
        self.capacity += regen * plain.as_secs_f64() * 1000.0;
        if self.capacity > self.cwnd {
            self.capacity = self.cwnd;
        }
    }
}
