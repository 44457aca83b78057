//! # Patch Embedding and Expansion

pub mod overlap_patch_embed;
pub mod patch_expand;
pub mod rearrange;
