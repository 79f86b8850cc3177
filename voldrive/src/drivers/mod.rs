//! Backends linked into this build, one module per cargo feature.

#[cfg(feature = "driver-vfs")]
pub mod vfs;
