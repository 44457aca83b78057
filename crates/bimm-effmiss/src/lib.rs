#![warn(missing_docs)]
//!# bimm-effmiss - Efficient MISSFormer for Burn
//!
//! A hierarchical efficient-attention encoder paired with a symmetric
//! patch-expansion decoder for semantic segmentation.
//!
//! The top-level entry point is [`models::missformer::model::EffMissFormerConfig`].

/// Test-only macro import.
#[cfg(test)]
#[allow(unused_imports)]
#[macro_use]
extern crate hamcrest;

#[cfg(test)]
#[allow(dead_code)]
pub(crate) mod testing;

pub mod layers;
pub mod models;
pub mod utility;
