//! # Models

pub mod missformer;
