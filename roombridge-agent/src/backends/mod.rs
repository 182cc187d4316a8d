// ABOUTME: Backend implementations (direct CLI, mock).
// ABOUTME: Each backend implements AgentBackend and is driven by AgentHandle's worker.

pub mod direct_cli;
pub mod mock;
