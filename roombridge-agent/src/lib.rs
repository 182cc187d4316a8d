// ABOUTME: Agent runtime abstraction for roombridge.
// ABOUTME: Session-scoped Send+Sync handles over pluggable backends (direct CLI, mock).

pub mod backends;
pub mod event;
pub mod handle;
pub mod registry;
pub mod traits;

pub use event::{AgentEvent, ErrorCode, ToolResultKind, Usage};
pub use handle::{AgentHandle, EventReceiver};
pub use registry::{AgentRegistry, BackendFactory};
pub use traits::{AgentBackend, ResumeOutcome};
