use serde::{Deserialize, Serialize};

/// Lifecycle of one named shadow. There is no terminal phase; the engine
/// runs for the lifetime of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ShadowPhase {
    /// No broker session
    Disconnected,
    /// Establishing the MQTT session and subscriptions
    Connecting,
    /// Session up, no operation in flight
    Connected,
    /// A reported-state update awaits accepted/rejected
    Updating,
    /// A received delta is being dispatched to handlers
    DeltaHandling,
    /// Broker migration in progress
    Migrating,
    /// Last migration failed; reported as `mqtt.status = "error"`
    Error,
}

impl ShadowPhase {
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Updating | Self::DeltaHandling
        )
    }

    /// Whether a new reported-state update may be issued. At most one
    /// update is in flight per shadow.
    pub fn can_update(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn to_connecting(&self) -> Result<Self, &'static str> {
        match self {
            Self::Disconnected | Self::Error => Ok(Self::Connecting),
            _ => Err("Can only start connecting from Disconnected or Error"),
        }
    }

    pub fn to_connected(&self) -> Result<Self, &'static str> {
        match self {
            Self::Connecting | Self::Updating | Self::DeltaHandling | Self::Migrating => {
                Ok(Self::Connected)
            }
            _ => Err("Can only settle Connected from a transitional phase"),
        }
    }

    pub fn to_updating(&self) -> Result<Self, &'static str> {
        match self {
            Self::Connected => Ok(Self::Updating),
            _ => Err("An update may only start while Connected and idle"),
        }
    }

    pub fn to_delta_handling(&self) -> Result<Self, &'static str> {
        match self {
            Self::Connected | Self::Updating => Ok(Self::DeltaHandling),
            _ => Err("A delta may only be handled while the session is up"),
        }
    }

    pub fn to_migrating(&self) -> Result<Self, &'static str> {
        match self {
            Self::Connected | Self::DeltaHandling => Ok(Self::Migrating),
            _ => Err("Migration starts from Connected or DeltaHandling"),
        }
    }

    pub fn to_disconnected(&self) -> Self {
        Self::Disconnected
    }

    pub fn to_error(&self) -> Self {
        Self::Error
    }
}

impl Default for ShadowPhase {
    fn default() -> Self {
        Self::Disconnected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_phase_is_disconnected() {
        let phase = ShadowPhase::default();
        assert_eq!(phase, ShadowPhase::Disconnected);
        assert!(!phase.is_connected());
    }

    #[test]
    fn test_happy_path_update_cycle() {
        let phase = ShadowPhase::Disconnected.to_connecting().unwrap();
        let phase = phase.to_connected().unwrap();
        let phase = phase.to_updating().unwrap();
        assert!(!phase.can_update());
        let phase = phase.to_connected().unwrap();
        assert!(phase.can_update());
    }

    #[test]
    fn test_delta_cycle() {
        let phase = ShadowPhase::Connected.to_delta_handling().unwrap();
        assert_eq!(phase, ShadowPhase::DeltaHandling);
        assert_eq!(phase.to_connected().unwrap(), ShadowPhase::Connected);
    }

    #[test]
    fn test_migration_outcomes() {
        let phase = ShadowPhase::DeltaHandling.to_migrating().unwrap();
        assert_eq!(phase.to_connected().unwrap(), ShadowPhase::Connected);

        let phase = ShadowPhase::Connected.to_migrating().unwrap();
        assert_eq!(phase.to_error(), ShadowPhase::Error);
        // An errored shadow may attempt a fresh connection
        assert!(ShadowPhase::Error.to_connecting().is_ok());
    }

    #[test]
    fn test_no_update_while_one_in_flight() {
        assert!(ShadowPhase::Updating.to_updating().is_err());
        assert!(ShadowPhase::Migrating.to_updating().is_err());
    }

    #[test]
    fn test_cannot_connect_while_connected() {
        assert!(ShadowPhase::Connected.to_connecting().is_err());
    }
}
