//! Registration and execution-context configuration

use std::time::Duration;

use crate::constants::*;
use crate::error::{AvctError, AvctResult};
use crate::types::LocalRole;

/// Parameters given to `Register`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvctConfig {
    /// MTU advertised for the control channel
    pub control_mtu: u16,
    /// MTU advertised for the browsing channel
    pub browsing_mtu: u16,
    /// AVRCP role, selects the security service ids
    pub role: LocalRole,
}

impl Default for AvctConfig {
    fn default() -> Self {
        Self {
            control_mtu: DEFAULT_CONTROL_MTU,
            browsing_mtu: DEFAULT_BROWSING_MTU,
            role: LocalRole::Controller,
        }
    }
}

impl AvctConfig {
    pub fn new(control_mtu: u16, browsing_mtu: u16, role: LocalRole) -> Self {
        Self {
            control_mtu,
            browsing_mtu,
            role,
        }
    }

    pub fn validate(&self) -> AvctResult<()> {
        if self.control_mtu < L2CAP_MIN_MTU {
            return Err(AvctError::InvalidParameter(format!(
                "control MTU {} is below the L2CAP minimum of {}",
                self.control_mtu, L2CAP_MIN_MTU
            )));
        }
        if self.browsing_mtu < BROWSING_MIN_MTU {
            return Err(AvctError::InvalidParameter(format!(
                "browsing MTU {} is below the minimum of {}",
                self.browsing_mtu, BROWSING_MIN_MTU
            )));
        }
        Ok(())
    }
}

/// Options for the serial execution context
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// How long a blocking API call waits for its task to finish
    pub call_timeout: Duration,
    /// Depth of the task queue
    pub queue_capacity: usize,
    /// Name of the worker thread
    pub thread_name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(2),
            queue_capacity: 64,
            thread_name: "avctp".to_string(),
        }
    }
}

impl DispatcherConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn validate(&self) -> AvctResult<()> {
        if self.queue_capacity == 0 {
            return Err(AvctError::InvalidParameter(
                "task queue capacity must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AvctConfig::default().validate().is_ok());
        assert!(DispatcherConfig::default().validate().is_ok());
    }

    #[test]
    fn test_mtu_minimums() {
        let config = AvctConfig::new(47, 1008, LocalRole::Target);
        assert!(matches!(config.validate(), Err(AvctError::InvalidParameter(_))));

        let config = AvctConfig::new(48, 334, LocalRole::Target);
        assert!(matches!(config.validate(), Err(AvctError::InvalidParameter(_))));

        let config = AvctConfig::new(48, 335, LocalRole::Target);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_queue_rejected() {
        let config = DispatcherConfig::default().with_queue_capacity(0);
        assert!(config.validate().is_err());
    }
}
