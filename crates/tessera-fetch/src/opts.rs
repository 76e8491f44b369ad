//! Fetch unit configuration

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Configuration for the fetch unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchOpts {
    /// Master switch; when off, submissions are refused.
    pub enable: bool,

    /// Per-attempt wall clock budget, measured from the attempt's
    /// issuance. Each retry resets the clock; there is no outer timeout
    /// across retries.
    pub timeout: Duration,

    /// Back-pressure bound on concurrent outstanding fetches. Submitters
    /// park on the dock until the set shrinks below this.
    pub requests_max: usize,

    /// Recompute the response's reference hash and compare it to the
    /// requested id; a mismatch rotates to the next peer.
    pub check_event_id: bool,

    /// Run the full structural conformance check on the response.
    pub check_conforms: bool,

    /// Verify the response's origin signature when the key is already
    /// cached. Unknown keys defer verification: fetch workers must never
    /// block on key fetches.
    pub check_signature: bool,
}

impl Default for FetchOpts {
    fn default() -> Self {
        Self {
            enable: true,
            timeout: Duration::from_secs(5),
            requests_max: 256,
            check_event_id: true,
            check_conforms: false,
            check_signature: true,
        }
    }
}

impl FetchOpts {
    /// Shrunk timings and bounds for tests.
    pub fn for_testing() -> Self {
        Self {
            timeout: Duration::from_millis(250),
            requests_max: 8,
            ..Self::default()
        }
    }

    /// Load overrides from `TESSERA_FETCH_*` environment variables.
    pub fn from_env() -> Self {
        let mut opts = Self::default();
        opts.enable = parse_bool("TESSERA_FETCH_ENABLE", opts.enable);
        opts.timeout = duration_secs("TESSERA_FETCH_TIMEOUT_SECS", opts.timeout);
        opts.requests_max = parse_usize("TESSERA_FETCH_REQUESTS_MAX", opts.requests_max);
        opts.check_event_id = parse_bool("TESSERA_FETCH_CHECK_EVENT_ID", opts.check_event_id);
        opts.check_conforms = parse_bool("TESSERA_FETCH_CHECK_CONFORMS", opts.check_conforms);
        opts.check_signature = parse_bool("TESSERA_FETCH_CHECK_SIGNATURE", opts.check_signature);
        opts
    }

    /// Validate bounds.
    pub fn validate(&self) -> Result<(), String> {
        if self.timeout.is_zero() {
            return Err("timeout must be > 0".to_string());
        }
        if self.requests_max == 0 {
            return Err("requests_max must be > 0".to_string());
        }
        Ok(())
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .as_deref()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn duration_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
