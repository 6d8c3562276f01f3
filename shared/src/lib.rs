//! Wormhole Shared Library
//!
//! Wire protocol types and framing shared by the tunnel client and tooling.

pub mod error;
pub mod frame;
pub mod protocol;

pub use error::{FrameError, WireError};
