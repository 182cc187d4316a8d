// ABOUTME: Transport-agnostic bridge between one chat room and one coding-agent session
// ABOUTME: Room directory, session store, event formatting, relays and the supervisor state machine

pub mod backoff;
pub mod config;
pub mod dedup;
pub mod error;
pub mod format;
pub mod markup;
pub mod paths;
pub mod relay;
pub mod room_directory;
pub mod session;
pub mod supervisor;
pub mod testing;
pub mod traits;
pub mod workdir;

pub use config::Config;
pub use error::BridgeError;
pub use format::EventFormatter;
pub use relay::{InboundRelay, OutboundRelay};
pub use room_directory::{RoomDirectory, RoomStore};
pub use session::SessionStore;
pub use supervisor::{BridgeOutcome, BridgeSession, BridgeState, BridgeSupervisor, SharedSession};
pub use traits::{ChatEvent, ChatTransport, ChatUser, EventStream, MessageContent, RoomSpec, RoomVisibility};
pub use workdir::WorkingDirectory;

// Re-export agent types the bridge is built around
pub use roombridge_agent::{AgentEvent, AgentHandle, AgentRegistry};
