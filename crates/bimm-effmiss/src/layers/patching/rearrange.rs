use bimm_contracts::{ShapeContract, shape_contract};
use burn::prelude::{Backend, Tensor};
use burn::tensor::BasicOps;

/// Channel-to-space rearrangement.
///
/// Equivalent to the einops pattern
/// ``b h w (p1 p2 c) -> b (h p1) (w p2) c`` with ``p1 = p2 = scale``.
///
/// ## Parameters
///
/// - `tensor`: Input tensor of shape (B, H, W, scale * scale * C).
/// - `scale`: The spatial expansion factor.
///
/// ## Returns
///
/// - Output tensor of shape (B, H * scale, W * scale, C).
#[inline]
#[must_use]
pub fn channels_to_space<B: Backend, K>(
    tensor: Tensor<B, 4, K>,
    scale: usize,
) -> Tensor<B, 4, K>
where
    K: BasicOps<B>,
{
    static CONTRACT: ShapeContract =
        shape_contract!("batch", "height", "width", "patch_area" * "channels");
    let [b, h, w, c] = CONTRACT.unpack_shape(
        &tensor.dims(),
        &["batch", "height", "width", "channels"],
        &[("patch_area", scale * scale)],
    );

    tensor
        .reshape([b, h, w, scale, scale, c])
        .swap_dims(2, 3)
        .reshape([b, h * scale, w * scale, c])
}

/// Space-to-channel rearrangement; the inverse of [`channels_to_space`].
///
/// Equivalent to the einops pattern
/// ``b (h p1) (w p2) c -> b h w (p1 p2 c)`` with ``p1 = p2 = scale``.
///
/// ## Parameters
///
/// - `tensor`: Input tensor of shape (B, H * scale, W * scale, C).
/// - `scale`: The spatial reduction factor.
///
/// ## Returns
///
/// - Output tensor of shape (B, H, W, scale * scale * C).
#[inline]
#[must_use]
pub fn space_to_channels<B: Backend, K>(
    tensor: Tensor<B, 4, K>,
    scale: usize,
) -> Tensor<B, 4, K>
where
    K: BasicOps<B>,
{
    static CONTRACT: ShapeContract = shape_contract!(
        "batch",
        "height" * "scale",
        "width" * "scale",
        "channels"
    );
    let [b, h, w, c] = CONTRACT.unpack_shape(
        &tensor.dims(),
        &["batch", "height", "width", "channels"],
        &[("scale", scale)],
    );

    tensor
        .reshape([b, h, scale, w, scale, c])
        .swap_dims(2, 3)
        .reshape([b, h, w, scale * scale * c])
}
