//! Timing constants from E1.11-2008 and E1.20-2010, and the runtime timing
//! configuration.
//!
//! Two units appear here. Line-level measurements (breaks, marks, turnaround
//! delays, capture arithmetic) are in ticks of 0.1µs, matching the fine
//! timer. Backoff and timeout bookkeeping is in coarse-timer ticks of 100µs.

/// Fine-timer ticks per microsecond.
pub const FINE_TICKS_PER_MICRO: u32 = 10;

// Transmit configuration bounds, in microseconds.
// ----------------------------------------------------------------------------

/// DMX1990 allowed 88µs and later revisions raised it; values down to 44µs
/// are accepted for test setups.
pub const MIN_TX_BREAK_MICROS: u16 = 44;
pub const MAX_TX_BREAK_MICROS: u16 = 800;
/// DMX1986 allowed a 4µs mark-after-break.
pub const MIN_TX_MARK_MICROS: u16 = 4;
pub const MAX_TX_MARK_MICROS: u16 = 800;

// Controller receive tolerances, in 0.1µs ticks (Table 3-1 of E1.20).
// ----------------------------------------------------------------------------

pub const CONTROLLER_RX_BREAK_MIN: u32 = 880;
pub const CONTROLLER_RX_BREAK_MAX: u32 = 3_520;
pub const CONTROLLER_RX_MARK_MAX: u32 = 880;

// Responder receive tolerances, in 0.1µs ticks (Table 3-3 of E1.20).
// ----------------------------------------------------------------------------

pub const RESPONDER_RX_BREAK_MIN: u32 = 880;
/// 1 second.
pub const RESPONDER_RX_BREAK_MAX: u32 = 10_000_000;
pub const RESPONDER_RX_MARK_MIN: u32 = 80;
/// 1 second.
pub const RESPONDER_RX_MARK_MAX: u32 = 10_000_000;

// Responder turnaround bounds, in 0.1µs ticks (Table 3-4 of E1.20).
// ----------------------------------------------------------------------------

pub const MIN_RESPONDER_DELAY: u16 = 1_760;
pub const MAX_RESPONDER_DELAY: u16 = 20_000;

// Backoff and timeout values, in 100µs coarse ticks.
// ----------------------------------------------------------------------------

/// E1.11 Table 6 gives 1.204ms; rounded up to the next coarse tick.
pub const CONTROLLER_MIN_BREAK_TO_BREAK: u32 = 13;
/// Line 2 of Table 3-2, E1.20.
pub const CONTROLLER_DUB_BACKOFF: u32 = 58;
/// Line 6 of Table 3-2; 176µs rounded up.
pub const CONTROLLER_BROADCAST_BACKOFF: u32 = 2;
/// Line 5 of Table 3-2.
pub const CONTROLLER_MISSING_RESPONSE_BACKOFF: u32 = 30;
/// Line 7 of Table 3-2; 176µs rounded up.
pub const CONTROLLER_NON_RDM_BACKOFF: u32 = 2;
/// Line 1 of Table 3-3.
pub const RESPONDER_RDM_INTERSLOT_TIMEOUT: u32 = 21;
/// Table 6 of E1.11-2008: 1 second.
pub const RESPONDER_DMX_INTERSLOT_TIMEOUT: u32 = 10_000;
/// Line 2 of Table 3-1.
pub const CONTROLLER_RDM_INTERSLOT_TIMEOUT: u32 = 21;
/// How long a completed inbound frame waits for the dispatch layer to queue
/// a reply before reception re-arms: the turnaround ceiling of Table 3-4.
pub const RESPONDER_REPLY_GRACE: u32 = 20;

// Defaults.
// ----------------------------------------------------------------------------

pub const DEFAULT_BREAK_TIME_MICROS: u16 = 176;
pub const DEFAULT_MARK_TIME_MICROS: u16 = 12;
/// 2.8ms, in coarse ticks.
pub const DEFAULT_RDM_RESPONSE_TIMEOUT: u16 = 28;
/// Don't listen after broadcasts by default.
pub const DEFAULT_RDM_BROADCAST_TIMEOUT: u16 = 0;
/// 2.9ms, in 0.1µs ticks.
pub const DEFAULT_RDM_DUB_RESPONSE_LIMIT: u16 = 29_000;
pub const DEFAULT_RDM_RESPONDER_DELAY: u16 = MIN_RESPONDER_DELAY;

/// Runtime timing configuration. Every setter validates against the bounds
/// above and leaves the settings untouched on rejection.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimingSettings {
    break_time_micros: u16,
    mark_time_micros: u16,
    /// How long to listen after a broadcast, in coarse ticks. 0 disables.
    rdm_broadcast_timeout: u16,
    /// How long to wait for a unicast response, in coarse ticks.
    rdm_response_timeout: u16,
    /// The longest DUB response window, in 0.1µs ticks.
    rdm_dub_response_limit: u16,
    /// Turnaround delay before a reply, in 0.1µs ticks.
    rdm_responder_delay: u16,
    /// Upper bound of the random addition to the delay, in 0.1µs ticks.
    rdm_responder_jitter: u16,
}

impl TimingSettings {
    pub const fn new() -> Self {
        Self {
            break_time_micros: DEFAULT_BREAK_TIME_MICROS,
            mark_time_micros: DEFAULT_MARK_TIME_MICROS,
            rdm_broadcast_timeout: DEFAULT_RDM_BROADCAST_TIMEOUT,
            rdm_response_timeout: DEFAULT_RDM_RESPONSE_TIMEOUT,
            rdm_dub_response_limit: DEFAULT_RDM_DUB_RESPONSE_LIMIT,
            rdm_responder_delay: DEFAULT_RDM_RESPONDER_DELAY,
            rdm_responder_jitter: 0,
        }
    }

    pub fn set_break_time(&mut self, micros: u16) -> bool {
        if !(MIN_TX_BREAK_MICROS..=MAX_TX_BREAK_MICROS).contains(&micros) {
            return false;
        }
        self.break_time_micros = micros;
        true
    }

    pub fn break_time(&self) -> u16 {
        self.break_time_micros
    }

    pub fn break_ticks(&self) -> u32 {
        self.break_time_micros as u32 * FINE_TICKS_PER_MICRO
    }

    pub fn set_mark_time(&mut self, micros: u16) -> bool {
        if !(MIN_TX_MARK_MICROS..=MAX_TX_MARK_MICROS).contains(&micros) {
            return false;
        }
        self.mark_time_micros = micros;
        true
    }

    pub fn mark_time(&self) -> u16 {
        self.mark_time_micros
    }

    pub fn mark_ticks(&self) -> u32 {
        self.mark_time_micros as u32 * FINE_TICKS_PER_MICRO
    }

    pub fn set_rdm_broadcast_timeout(&mut self, ticks: u16) -> bool {
        if ticks > 50 {
            return false;
        }
        self.rdm_broadcast_timeout = ticks;
        true
    }

    pub fn rdm_broadcast_timeout(&self) -> u16 {
        self.rdm_broadcast_timeout
    }

    pub fn set_rdm_response_timeout(&mut self, ticks: u16) -> bool {
        if !(10..=50).contains(&ticks) {
            return false;
        }
        self.rdm_response_timeout = ticks;
        true
    }

    pub fn rdm_response_timeout(&self) -> u16 {
        self.rdm_response_timeout
    }

    pub fn set_rdm_dub_response_limit(&mut self, ticks: u16) -> bool {
        if !(10_000..=35_000).contains(&ticks) {
            return false;
        }
        self.rdm_dub_response_limit = ticks;
        true
    }

    pub fn rdm_dub_response_limit(&self) -> u16 {
        self.rdm_dub_response_limit
    }

    pub fn set_rdm_responder_delay(&mut self, ticks: u16) -> bool {
        if !(MIN_RESPONDER_DELAY..=MAX_RESPONDER_DELAY).contains(&ticks) {
            return false;
        }
        self.rdm_responder_delay = ticks;
        // Keep delay + jitter within the standard's ceiling.
        let max_jitter = MAX_RESPONDER_DELAY - ticks;
        self.rdm_responder_jitter = self.rdm_responder_jitter.min(max_jitter);
        true
    }

    pub fn rdm_responder_delay(&self) -> u16 {
        self.rdm_responder_delay
    }

    pub fn set_rdm_responder_jitter(&mut self, ticks: u16) -> bool {
        if ticks as u32 + self.rdm_responder_delay as u32 > MAX_RESPONDER_DELAY as u32 {
            return false;
        }
        self.rdm_responder_jitter = ticks;
        true
    }

    pub fn rdm_responder_jitter(&self) -> u16 {
        self.rdm_responder_jitter
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self::new()
    }
}
