//! Permission arbitration
//!
//! [`PermissionArbiter`] holds the requests awaiting the user;
//! [`ConfirmationPolicy`] decides which of them the runtime may answer itself.

mod arbiter;
mod policy;

pub use arbiter::{
    ArbiterEvent, PermissionArbiter, PermissionDecision, PermissionRequest, PermissionResult,
    Registration, Resolution,
};
pub use policy::{ConfirmationPolicy, TimeoutAction, ToolCategory};
