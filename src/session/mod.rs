//! Session lifecycle
//!
//! A [`SessionController`] drives one conversation through
//! `idle → launching → streaming ⇄ awaiting-permission → (streaming |
//! compacting) → idle`, with `error` on transport loss and `idle` on
//! interrupt.

mod controller;
mod stall;
mod state;
mod transcript;

pub use controller::{ChannelInfo, SessionController, SessionEvent};
pub use stall::StallDetector;
pub use state::{SessionState, StateChange, StateMachine, Transition};
pub use transcript::{Transcript, TranscriptEntry};
