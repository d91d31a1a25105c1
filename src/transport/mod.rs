//! Channel transport
//!
//! A [`Transport`] moves [`Envelope`]s between the runtime and the agent
//! backend. [`ChannelTransport`] multiplexes request/response calls and
//! per-channel ordered event streams on top of any transport.
//!
//! Implementations:
//! - [`FramedTransport`]: length-prefixed JSON frames over an async byte
//!   stream (Unix socket, pipe, in-memory duplex)
//! - [`MemoryTransport`]: in-process pair, used by embedders and tests

mod bus;
mod frame;
mod framed;
mod memory;

pub use bus::{ChannelTransport, EventStream, InboundMessage, MessageHandler, PendingCall};
pub use frame::{Frame, FrameType, MAX_PAYLOAD_SIZE};
#[cfg(unix)]
pub use framed::FramedListener;
pub use framed::{FrameReader, FrameWriter, FramedTransport};
pub use memory::MemoryTransport;

use crate::error::Result;
use crate::types::Envelope;
use async_trait::async_trait;

/// Duplex envelope transport
///
/// `recv` is called from a single reader task; `send` may be called
/// concurrently from many tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one envelope
    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Receive the next envelope; `None` once the peer has closed
    async fn recv(&self) -> Result<Option<Envelope>>;

    /// Close the transport
    async fn close(&self) -> Result<()>;

    /// Whether the transport can still send
    fn is_connected(&self) -> bool;
}
