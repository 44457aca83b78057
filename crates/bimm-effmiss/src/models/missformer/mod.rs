//! # Efficient MISSFormer
//!
//! See: <https://arxiv.org/abs/2109.07162> (MISSFormer) and
//! <https://arxiv.org/abs/1812.01243> (Efficient Attention).

pub mod attention;
pub mod block;
pub mod decoder;
pub mod encoder;
pub mod model;
pub mod token_mlp;
