//! Host/worker channel: wire vocabulary and frame codec.

pub mod codec;
pub mod protocol;
