//! Snapshot broadcasting to viewers.
//!
//! - `hub`: subscriber registry with per-subscriber delivery
//! - `pacer`: per-canvas render loop feeding a hub

pub mod hub;
pub mod pacer;

pub use hub::{BroadcastHub, Feed, HubConfig};
pub use pacer::{Pacer, PacerConfig};

/// Boundary separating frames of a `multipart/x-mixed-replace` stream.
pub const FRAME_BOUNDARY: &str = "flutgridframe";
