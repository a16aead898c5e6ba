//! Inbound event handling: decode, correlate, start or resume.

pub mod channel;
pub mod dispatcher;

pub use channel::InboundChannel;
pub use dispatcher::{DispatchError, DispatchResult, EventDispatcher, MatchOutcome, MatchReport};
