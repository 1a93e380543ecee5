//! Version information for jailbox.

/// Crate version from Cargo.toml.
pub const JAILBOX_VERSION: &str = env!("CARGO_PKG_VERSION");
