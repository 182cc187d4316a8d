// ABOUTME: Bridge error taxonomy shared by every component.
// ABOUTME: Classifies failures as configuration, transport, agent or persistence errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Missing or invalid settings. Fatal; no room exists yet to report into.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl BridgeError {
    pub fn configuration(e: impl std::fmt::Display) -> Self {
        Self::Configuration(format!("{:#}", e))
    }

    pub fn transport(e: impl std::fmt::Display) -> Self {
        Self::Transport(format!("{:#}", e))
    }

    pub fn agent(e: impl std::fmt::Display) -> Self {
        Self::Agent(format!("{:#}", e))
    }

    pub fn persistence(e: impl std::fmt::Display) -> Self {
        Self::Persistence(format!("{:#}", e))
    }

    /// Whether hitting this error before Running should move the bridge to Failed.
    ///
    /// Persistence failures during startup degrade to "no prior state" instead.
    pub fn is_fatal_at_startup(&self) -> bool {
        !matches!(self, Self::Persistence(_))
    }

    /// Short label used in logs and the exit diagnostics
    pub fn category(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Transport(_) => "transport",
            Self::Agent(_) => "agent",
            Self::Persistence(_) => "persistence",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_is_not_fatal_at_startup() {
        assert!(!BridgeError::Persistence("disk".into()).is_fatal_at_startup());
        assert!(BridgeError::Transport("down".into()).is_fatal_at_startup());
        assert!(BridgeError::Configuration("missing".into()).is_fatal_at_startup());
    }

    #[test]
    fn test_constructor_keeps_anyhow_context_chain() {
        let err = anyhow::anyhow!("connection refused").context("Failed to create room");
        let bridge = BridgeError::transport(err);
        assert_eq!(
            bridge.to_string(),
            "Transport error: Failed to create room: connection refused"
        );
        assert_eq!(bridge.category(), "transport");
    }
}
