//! Fleet engine error types.

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;

/// Errors raised by supervisors and the fleet manager.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Invalid provider config, or an id that is already taken.
    #[error("configuration error: {reason}")]
    ConfigurationError { reason: String },

    /// The provider id is unknown.
    #[error("provider '{id}' not found")]
    NotFound { id: String },

    /// The call needs an active channel and there is none.
    #[error("provider '{id}' is not connected")]
    NotConnected { id: String },

    /// Spawning, opening, or closing the channel failed.
    #[error("transport failure for provider '{id}': {reason}")]
    TransportFailure { id: String, reason: String },

    /// The provider answered with an error or an unusable payload.
    #[error("protocol failure for provider '{id}': {reason}")]
    ProtocolFailure { id: String, reason: String },
}

impl FleetError {
    /// Duplicate id on add.
    pub fn already_exists(id: &str) -> Self {
        FleetError::ConfigurationError {
            reason: format!("provider '{id}' already exists"),
        }
    }

    /// Map a protocol client error onto the engine taxonomy.
    pub fn from_protocol(id: &str, err: ProtocolError) -> Self {
        let id = id.to_string();
        match err {
            ProtocolError::NotConnected { .. } => FleetError::NotConnected { id },
            ProtocolError::ServerError { .. } | ProtocolError::InvalidResponse { .. } => {
                FleetError::ProtocolFailure {
                    id,
                    reason: err.to_string(),
                }
            }
            ProtocolError::SpawnFailed { .. }
            | ProtocolError::InitFailed { .. }
            | ProtocolError::TransportError { .. }
            | ProtocolError::Timeout { .. } => FleetError::TransportFailure {
                id,
                reason: err.to_string(),
            },
        }
    }
}

impl From<ConfigError> for FleetError {
    fn from(err: ConfigError) -> Self {
        FleetError::ConfigurationError {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_errors_map_onto_fleet_taxonomy() {
        let spawn = ProtocolError::SpawnFailed {
            provider: "fs".into(),
            reason: "No such file".into(),
        };
        assert!(matches!(
            FleetError::from_protocol("fs", spawn),
            FleetError::TransportFailure { .. }
        ));

        let remote = ProtocolError::ServerError {
            code: -32601,
            message: "Method not found".into(),
            data: None,
        };
        let mapped = FleetError::from_protocol("fs", remote);
        assert!(matches!(mapped, FleetError::ProtocolFailure { .. }));
        assert!(mapped.to_string().contains("Method not found"));

        let idle = ProtocolError::NotConnected {
            provider: "fs".into(),
        };
        assert!(matches!(
            FleetError::from_protocol("fs", idle),
            FleetError::NotConnected { .. }
        ));
    }

    #[test]
    fn test_already_exists_is_configuration_error() {
        let err = FleetError::already_exists("git");
        assert!(matches!(err, FleetError::ConfigurationError { .. }));
        assert_eq!(err.to_string(), "configuration error: provider 'git' already exists");
    }
}
