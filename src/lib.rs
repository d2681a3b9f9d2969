//! A BEEP (RFC 3080/3081) protocol engine: the multiplexed,
//! frame-oriented session layer that carries application messages over a
//! single reliable byte stream.
//!
//! The engine establishes a session, opens and closes independent
//! channels over it, sequences messages into frames, enforces
//! per-channel flow control with SEQ advertisements, multiplexes
//! outbound frames fairly across channels, and dispatches inbound frames
//! to application handlers with the protocol's ordering guarantees.
//!
//! Transports are abstract: anything `AsyncRead + AsyncWrite` carries a
//! session, so TCP, TLS wrappers and in-memory pipes all work the same
//! way. Security and application profiles are not built in; they are
//! registered as [`Profile`] implementations on a [`Context`].
//!
//! # Example
//!
//! An initiator opening an echo channel:
//!
//! ```rust,no_run
//! use beep::{Context, Session, SessionRole};
//! use std::sync::Arc;
//! use tokio::net::TcpStream;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let ctx = Arc::new(Context::new());
//!     let stream = TcpStream::connect("localhost:10288").await?;
//!     let session = Session::connect(stream, SessionRole::Initiator, ctx).await?;
//!
//!     let channel = session.start_channel("urn:example:echo").await?;
//!     let reply = channel.send_msg_wait("hello").await?;
//!     println!("echoed: {:?}", reply.payload);
//!
//!     channel.close().await?;
//!     session.close().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod connection;
pub mod error;
pub mod feeder;
pub mod frame;
pub mod mgmt;
pub mod profile;
pub mod session;

#[cfg(test)]
mod tests;

// Re-export the frame codec types for direct access
pub use frame::{Frame, FrameError, FrameType, SeqFrame, WireFrame};

// Re-export the main engine API for easy access
pub use channel::{
    Channel, ChannelState, FrameSizeContext, FrameSizeHook, LimitMode, WaitReply,
};
pub use error::{BeepError, BeepResult};
pub use feeder::{BytesFeeder, FeederChunk, PayloadFeeder};
pub use mgmt::{Greeting, GreetingProfile, ReplyCode};
pub use profile::{
    BoxFuture, CloseDecision, CloseEvent, FrameHandler, MimeHandling, Profile, StartDecision,
    StartEvent, frame_handler,
};
pub use session::{Context, ContextOptions, Session, SessionRole};

/// A specialized `Result` type for engine operations.
///
/// This is defined as a convenience; it is the same type as
/// [`BeepResult`].
pub type Result<T> = std::result::Result<T, BeepError>;
