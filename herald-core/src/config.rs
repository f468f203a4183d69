use crate::{ElectionError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and quorum configuration for an election node.
///
/// The four timeouts must satisfy
/// `network_timeout <= heartbeat_timeout < leader_quorum_timeout <= election_timeout`.
/// A leader has to be able to finish a heartbeat round within one heartbeat
/// period, must get a chance at more than one round before it demotes itself,
/// and must demote itself before followers give up on it and start an
/// election.
///
/// Durations are (de)serialized as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// Hard cap on a single transport call
    #[serde(with = "duration_ms")]
    pub network_timeout: Duration,

    /// Period of the leader's heartbeat broadcast
    #[serde(with = "duration_ms")]
    pub heartbeat_timeout: Duration,

    /// How long a leader may go without quorum contact before demoting itself
    #[serde(with = "duration_ms")]
    pub leader_quorum_timeout: Duration,

    /// Base follower timeout; the actual timer is drawn from `[base, 2 * base)`
    #[serde(with = "duration_ms")]
    pub election_timeout: Duration,

    /// Lower bound on the quorum size. Zero means a plain majority.
    pub minimum_quorum: usize,

    /// Seed for the election timer jitter, for reproducible runs
    pub randomization_seed: Option<u64>,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            network_timeout: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(1),
            leader_quorum_timeout: Duration::from_secs(2),
            election_timeout: Duration::from_secs(2),
            minimum_quorum: 0,
            randomization_seed: None,
        }
    }
}

impl ElectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout = timeout;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_leader_quorum_timeout(mut self, timeout: Duration) -> Self {
        self.leader_quorum_timeout = timeout;
        self
    }

    pub fn with_election_timeout(mut self, timeout: Duration) -> Self {
        self.election_timeout = timeout;
        self
    }

    pub fn with_minimum_quorum(mut self, minimum: usize) -> Self {
        self.minimum_quorum = minimum;
        self
    }

    pub fn with_randomization_seed(mut self, seed: u64) -> Self {
        self.randomization_seed = Some(seed);
        self
    }

    /// Parses a configuration from JSON. Missing fields take their defaults.
    ///
    /// ```rust
    /// use herald_core::ElectionConfig;
    /// use std::time::Duration;
    ///
    /// let config = ElectionConfig::from_json(r#"{"heartbeat_timeout": 500, "network_timeout": 250}"#).unwrap();
    /// assert_eq!(config.heartbeat_timeout, Duration::from_millis(500));
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ElectionError::invalid_config(format!("malformed JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the timeout ordering invariant.
    pub fn validate(&self) -> Result<()> {
        let named = [
            ("network_timeout", self.network_timeout),
            ("heartbeat_timeout", self.heartbeat_timeout),
            ("leader_quorum_timeout", self.leader_quorum_timeout),
            ("election_timeout", self.election_timeout),
        ];
        for (name, value) in named {
            if value.is_zero() {
                return Err(ElectionError::invalid_config(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if self.network_timeout > self.heartbeat_timeout {
            return Err(ElectionError::invalid_config(format!(
                "network_timeout ({:?}) must not exceed heartbeat_timeout ({:?})",
                self.network_timeout, self.heartbeat_timeout
            )));
        }
        if self.heartbeat_timeout >= self.leader_quorum_timeout {
            return Err(ElectionError::invalid_config(format!(
                "heartbeat_timeout ({:?}) must be less than leader_quorum_timeout ({:?})",
                self.heartbeat_timeout, self.leader_quorum_timeout
            )));
        }
        if self.leader_quorum_timeout > self.election_timeout {
            return Err(ElectionError::invalid_config(format!(
                "leader_quorum_timeout ({:?}) must not exceed election_timeout ({:?})",
                self.leader_quorum_timeout, self.election_timeout
            )));
        }
        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
