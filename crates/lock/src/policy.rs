//! Lock timeouts and administrative switches.

use cellstore_config::{CoauthConfig, LockConfig};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct LockPolicy {
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    /// Exclusive locks require the caller to have the file checked out.
    pub checkout_required: bool,
    pub coauth_enabled: bool,
    /// Maximum members of one shared lock; 0 means unlimited.
    pub max_coauthors: usize,
}

impl LockPolicy {
    pub fn from_config(locks: &LockConfig, coauth: &CoauthConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(locks.default_timeout_secs),
            max_timeout: Duration::from_secs(locks.max_timeout_secs),
            checkout_required: locks.checkout_required,
            coauth_enabled: coauth.enabled,
            max_coauthors: coauth.max_coauthors,
        }
    }

    /// Lease length for a requested timeout. A missing or zero timeout
    /// gets the default; everything is clamped to the maximum.
    pub fn lease(&self, timeout_secs: Option<u64>) -> Duration {
        let requested = match timeout_secs {
            Some(0) | None => self.default_timeout,
            Some(secs) => Duration::from_secs(secs),
        };
        requested.min(self.max_timeout)
    }

    pub fn admits_member(&self, current_members: usize) -> bool {
        self.max_coauthors == 0 || current_members < self.max_coauthors
    }
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self::from_config(&LockConfig::default(), &CoauthConfig::default())
    }
}
