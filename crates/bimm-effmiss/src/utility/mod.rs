//! # Utility Support Functions

pub mod results;
