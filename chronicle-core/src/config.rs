//! Repository configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for a [`Repository`](crate::repository::Repository).
///
/// Deserializes from any serde format; missing fields take their defaults.
///
/// ```
/// use std::time::Duration;
///
/// use chronicle_core::config::RepositoryConfig;
///
/// let config: RepositoryConfig = serde_json::from_str(r#"{"lock_timeout_ms": 250}"#).unwrap();
/// assert_eq!(config.lock_timeout(), Some(Duration::from_millis(250)));
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepositoryConfig {
    /// Longest a load or save waits for the per-aggregate lock, in
    /// milliseconds. `None` waits indefinitely.
    pub lock_timeout_ms: Option<u64>,
}

impl RepositoryConfig {
    /// The lock timeout as a [`Duration`].
    #[must_use]
    pub fn lock_timeout(&self) -> Option<Duration> {
        self.lock_timeout_ms.map(Duration::from_millis)
    }

    /// Set the lock timeout, saturating at `u64::MAX` milliseconds.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_waits_forever() {
        let config = RepositoryConfig::default();
        assert_eq!(config.lock_timeout(), None);
        assert_eq!(serde_json::from_str::<RepositoryConfig>("{}").unwrap(), config);
    }

    #[test]
    fn builder_sets_timeout() {
        let config = RepositoryConfig::default().with_lock_timeout(Duration::from_secs(2));
        assert_eq!(config.lock_timeout_ms, Some(2000));
        assert_eq!(config.lock_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<RepositoryConfig>(r#"{"lock_timeout": 1}"#).is_err());
    }
}
