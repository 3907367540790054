use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftConfig {
    /// Minimum election timeout in milliseconds (e.g., 150)
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds (e.g., 300); the actual
    /// timeout is drawn uniformly from [min, max) on every timer start
    pub election_timeout_max_ms: u64,

    /// Heartbeat interval in milliseconds (e.g., 50)
    /// Must be much less than election timeout
    pub heartbeat_interval_ms: u64,

    /// How long a submitted command may wait for commit before the caller
    /// is told to retry (e.g., 650)
    pub submit_timeout_ms: u64,
}

impl RaftConfig {
    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_min_ms >= self.election_timeout_max_ms {
            return Err("election_timeout_min must be less than election_timeout_max".to_string());
        }

        if self.heartbeat_interval_ms >= self.election_timeout_min_ms {
            return Err("heartbeat_interval must be less than election_timeout_min".to_string());
        }

        if self.election_timeout_min_ms >= self.submit_timeout_ms {
            return Err("election_timeout_min must be less than submit_timeout".to_string());
        }

        Ok(())
    }
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
            submit_timeout_ms: 650,
        }
    }
}
