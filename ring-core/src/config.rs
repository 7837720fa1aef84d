//! Protocol design constants. All timeouts are counted in host ticks.

/// Retry caps and timeouts shared by peers, head and rendezvous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Attempts per join step (and per rendezvous request) before giving up.
    pub max_attempts: u32,
    /// Ticks to wait for a join-step acknowledgment before resending.
    pub join_step_timeout_ticks: u64,
    /// Ticks a joiner waits for the head's welcome. The head refuses a queued joiner once
    /// both remote steps could no longer finish inside this window.
    pub join_wait_ticks: u64,
    /// Age at which an own head-of-ledger entry triggers a liveness sweep.
    pub checkup_after_ticks: u64,
    /// Ticks after the sweep request before circulation is retried.
    pub resend_after_ticks: u64,
    /// Rendezvous: ticks to wait for `checkup_res` replies.
    pub sweep_timeout_ticks: u64,
    /// Rendezvous: periodic sweep interval; `None` sweeps only on demand.
    pub sweep_interval_ticks: Option<u64>,
}

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_JOIN_STEP_TIMEOUT_TICKS: u64 = 3;

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            join_step_timeout_ticks: DEFAULT_JOIN_STEP_TIMEOUT_TICKS,
            // Two remote steps, each retried to the cap, plus slack.
            join_wait_ticks: DEFAULT_JOIN_STEP_TIMEOUT_TICKS * (2 * DEFAULT_MAX_ATTEMPTS as u64 + 2),
            checkup_after_ticks: 20,
            resend_after_ticks: 10,
            sweep_timeout_ticks: 2,
            sweep_interval_ticks: Some(300),
        }
    }
}
