//! Estimating the offset between a client's clock and the server's.
//!
//! # How the exchange works (for beginners)
//!
//! The client stamps a request with its own time `t0` and sends it.  The
//! server notes when the request arrived (`t1`) and when it sent the reply
//! (`t2`), both on the server clock.  The client notes when the reply arrived
//! (`t3`).  If the network delay is the same in both directions, the server
//! clock is ahead of the client clock by
//!
//! ```text
//! theta = ((t1 - t0) + (t2 - t3)) / 2
//! ```
//!
//! One exchange is noisy, so several rounds are run.  Each theta feeds an
//! exponential average (the *candidate* offset), and the change between
//! successive candidates feeds a second average.  Once enough rounds have run
//! and that smoothed change is below a threshold, the candidate is accepted.
//! A hard cap on rounds guarantees the loop ends even on a jittery link.
//!
//! The server's authoritative state trails its own clock by one broadcast
//! interval, so the accepted offset adds that allowance.
//!
//! [`ClockSynchronizer`] is a pure state machine: the caller supplies the
//! times and sends the requests it returns.

use tracing::{debug, info};

use skirmish_core::protocol::messages::SyncResponse;

/// Tunables for the synchroniser.  All times are seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct ClockSyncConfig {
    /// Rounds required before accepting, for a peer that never synced.
    pub min_rounds_initial: u32,
    /// Rounds required before accepting on a refresh.
    pub min_rounds_refresh: u32,
    /// Rounds after which the current candidate is accepted regardless.
    pub max_rounds: u32,
    /// Smoothed candidate change below which the estimate has converged.
    pub convergence_threshold: f64,
    /// Gap between a response and the next request.
    pub round_interval: f64,
    /// Gap between an accepted estimate and the next refresh.
    pub refresh_interval: f64,
    /// Exponential smoothing factor in `(0, 1]`.
    pub smoothing: f64,
    /// Added to the accepted offset to account for the responder's broadcast lag.
    pub responder_allowance: f64,
}

impl Default for ClockSyncConfig {
    fn default() -> Self {
        Self {
            min_rounds_initial: 5,
            min_rounds_refresh: 3,
            max_rounds: 10,
            convergence_threshold: 0.001,
            round_interval: 0.1,
            refresh_interval: 15.0,
            smoothing: 0.3,
            responder_allowance: 0.05,
        }
    }
}

/// Exponentially weighted moving average.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialAverage {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            value: None,
        }
    }

    /// Folds in a sample and returns the new average.  The first sample is
    /// taken as-is.
    pub fn push(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            None => sample,
            Some(prev) => prev + self.alpha * (sample - prev),
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }
}

/// What a response did to the estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncOutcome {
    /// The response did not match the outstanding request.
    Ignored,
    /// More rounds are needed.
    Continue { rounds: u32 },
    /// A new offset was accepted.
    Converged { offset: f64, rounds: u32 },
}

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Idle { refresh_at: f64 },
    Syncing {
        rounds: u32,
        min_rounds: u32,
        awaiting: Option<f64>,
        next_request_at: f64,
    },
}

/// Client-side clock offset estimator.
#[derive(Debug, Clone)]
pub struct ClockSynchronizer {
    config: ClockSyncConfig,
    phase: Phase,
    offset: f64,
    synced: bool,
    candidate: ExponentialAverage,
    delta: ExponentialAverage,
}

impl ClockSynchronizer {
    pub fn new(config: ClockSyncConfig) -> Self {
        let alpha = config.smoothing;
        Self {
            config,
            phase: Phase::Idle {
                refresh_at: f64::INFINITY,
            },
            offset: 0.0,
            synced: false,
            candidate: ExponentialAverage::new(alpha),
            delta: ExponentialAverage::new(alpha),
        }
    }

    /// Accepted offset to add to the local clock.  0 until the first sync.
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// `true` once any estimate has been accepted.
    pub fn has_synced(&self) -> bool {
        self.synced
    }

    pub fn is_syncing(&self) -> bool {
        matches!(self.phase, Phase::Syncing { .. })
    }

    /// Starts a round of exchanges now.  A no-op while one is in progress.
    pub fn begin(&mut self, now: f64) {
        if self.is_syncing() {
            return;
        }
        let min_rounds = if self.synced {
            self.config.min_rounds_refresh
        } else {
            self.config.min_rounds_initial
        };
        self.candidate.reset();
        self.delta.reset();
        self.phase = Phase::Syncing {
            rounds: 0,
            min_rounds,
            awaiting: None,
            next_request_at: now,
        };
        debug!(min_rounds, refresh = self.synced, "clock sync started");
    }

    /// Server-requested re-estimation, e.g. after it saw messages from the future.
    pub fn request_resync(&mut self, now: f64) {
        self.begin(now);
    }

    /// Returns the `t0` of a request to send now, if one is due.
    ///
    /// Also starts the periodic refresh once it falls due, and re-requests when
    /// a response has been outstanding for three round intervals.
    pub fn poll(&mut self, now: f64) -> Option<f64> {
        if let Phase::Idle { refresh_at } = self.phase {
            if now >= refresh_at {
                self.begin(now);
            }
        }
        let lost_after = self.config.round_interval * 3.0;
        match &mut self.phase {
            Phase::Syncing {
                awaiting,
                next_request_at,
                ..
            } => {
                let lost = awaiting.is_some_and(|t0| now - t0 >= lost_after);
                if (awaiting.is_none() && now >= *next_request_at) || lost {
                    *awaiting = Some(now);
                    Some(now)
                } else {
                    None
                }
            }
            Phase::Idle { .. } => None,
        }
    }

    /// Folds in a response received at local time `t3`.
    pub fn on_response(&mut self, response: &SyncResponse, t3: f64) -> SyncOutcome {
        let Phase::Syncing {
            rounds,
            min_rounds,
            awaiting,
            next_request_at,
        } = &mut self.phase
        else {
            return SyncOutcome::Ignored;
        };
        if *awaiting != Some(response.t0) {
            return SyncOutcome::Ignored;
        }

        let theta = ((response.t1 - response.t0) + (response.t2 - t3)) / 2.0;
        let previous = self.candidate.value();
        let candidate = self.candidate.push(theta);
        let smoothed_delta = previous.map(|prev| self.delta.push(candidate - prev));
        *rounds += 1;
        let rounds = *rounds;

        let threshold = self.config.convergence_threshold;
        let converged =
            rounds >= *min_rounds && smoothed_delta.is_some_and(|d| d.abs() < threshold);
        if converged || rounds >= self.config.max_rounds {
            self.offset = candidate + self.config.responder_allowance;
            self.synced = true;
            self.candidate.reset();
            self.delta.reset();
            self.phase = Phase::Idle {
                refresh_at: t3 + self.config.refresh_interval,
            };
            info!(
                offset = self.offset,
                rounds,
                converged,
                "clock offset accepted"
            );
            return SyncOutcome::Converged {
                offset: self.offset,
                rounds,
            };
        }

        *awaiting = None;
        *next_request_at = t3 + self.config.round_interval;
        debug!(theta, candidate, rounds, "clock sync round");
        SyncOutcome::Continue { rounds }
    }
}

/// Builds the responder's reply to a request with `t0`, received at `t1` and
/// answered at `t2` (both responder-clock seconds).
pub fn respond(t0: f64, t1: f64, t2: f64) -> SyncResponse {
    SyncResponse { t0, t1, t2 }
}
