// ABOUTME: The two relays between the room and the agent session.
// ABOUTME: Inbound turns chat messages into agent turns; outbound posts agent events.

pub mod inbound;
pub mod outbound;

pub use inbound::{InboundRelay, Skip};
pub use outbound::{OutboundRelay, OutboundSummary};
