//! # Reusable Layers

pub mod init;
pub mod patching;
