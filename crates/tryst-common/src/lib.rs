//! Wire protocol types for the tryst rendezvous service.
//!
//! This crate provides:
//! - Client → server and server → client message definitions ([`message`])
//! - Interaction mode and pair identity types ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod message;
pub mod types;

pub use message::{ClientMessage, ServerMessage};
pub use types::Mode;
