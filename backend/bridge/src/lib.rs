//! Cross-process action bridge.
//!
//! Every locally dispatched action is serialized and sent to the peer
//! process; every received action is dispatched locally with
//! `meta.from_bridge` set, so it is never sent back.

pub mod bridge;
pub mod channel;

pub use bridge::ActionBridge;
pub use channel::{BridgeChannel, BridgeError, FrameHandler, MemoryChannel, StreamChannel};
