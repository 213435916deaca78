//! Protocol-client abstractions and chat-capability decorators.

pub mod port;
pub mod throttled;
pub mod timeout;
