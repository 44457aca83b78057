//! # Efficient (Linear-Complexity) Attention
//!
//! Keys are softmax-normalized over the token axis and queries over the
//! channel axis, so the ``keys · valuesᵀ`` context is formed first, in
//! ``O(N)`` rather than ``O(N²)``.

use crate::layers::init::ReinitParams;
use crate::utility::results::expect_unwrap;
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::{Backend, Tensor};
use burn::tensor::activation::softmax;

/// Common introspection interface for `EfficientAttention`.
pub trait EfficientAttentionMeta {
    /// Input (and output) channel dimension size.
    fn d_input(&self) -> usize;

    /// Key (and query) channel dimension size.
    fn d_key(&self) -> usize;

    /// Value channel dimension size.
    fn d_value(&self) -> usize;

    /// Number of attention heads.
    fn head_count(&self) -> usize;

    /// Key channels per head.
    fn d_head_key(&self) -> usize {
        self.d_key() / self.head_count()
    }

    /// Value channels per head.
    fn d_head_value(&self) -> usize {
        self.d_value() / self.head_count()
    }
}

/// Configuration for `EfficientAttention`.
#[derive(Config, Debug)]
pub struct EfficientAttentionConfig {
    /// Input (and output) channel dimension size.
    pub d_input: usize,

    /// Key (and query) channel dimension size.
    pub d_key: usize,

    /// Value channel dimension size.
    pub d_value: usize,

    /// Number of attention heads.
    #[config(default = 1)]
    pub head_count: usize,
}

impl EfficientAttentionMeta for EfficientAttentionConfig {
    fn d_input(&self) -> usize {
        self.d_input
    }

    fn d_key(&self) -> usize {
        self.d_key
    }

    fn d_value(&self) -> usize {
        self.d_value
    }

    fn head_count(&self) -> usize {
        self.head_count
    }
}

impl EfficientAttentionConfig {
    /// Check the config, without allocating a module.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.d_input == 0 || self.d_key == 0 || self.d_value == 0 {
            anyhow::bail!("attention dimensions must be non-zero: {self:?}");
        }
        if self.head_count == 0 {
            anyhow::bail!("head_count must be greater than zero: {self:?}");
        }
        if self.d_key % self.head_count != 0 || self.d_value % self.head_count != 0 {
            anyhow::bail!("d_key and d_value must be divisible by head_count: {self:?}");
        }
        Ok(())
    }

    /// Initialize an `EfficientAttention` module.
    ///
    /// ## Panics
    ///
    /// If [`Self::validate`] fails.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> EfficientAttention<B> {
        expect_unwrap(self.validate());

        let pointwise = |d_in: usize, d_out: usize| Conv2dConfig::new([d_in, d_out], [1, 1]).init(device);

        EfficientAttention {
            head_count: self.head_count,
            keys: pointwise(self.d_input, self.d_key),
            queries: pointwise(self.d_input, self.d_key),
            values: pointwise(self.d_input, self.d_value),
            reprojection: pointwise(self.d_value, self.d_input),
        }
    }
}

/// Multi-head efficient attention over a ``(B, C, H, W)`` feature map.
///
/// See: <https://arxiv.org/abs/1812.01243>
#[derive(Module, Debug)]
pub struct EfficientAttention<B: Backend> {
    /// Number of attention heads.
    pub head_count: usize,

    /// ``1x1`` key projection.
    pub keys: Conv2d<B>,

    /// ``1x1`` query projection.
    pub queries: Conv2d<B>,

    /// ``1x1`` value projection.
    pub values: Conv2d<B>,

    /// ``1x1`` projection from values back to the input width.
    pub reprojection: Conv2d<B>,
}

impl<B: Backend> EfficientAttentionMeta for EfficientAttention<B> {
    fn d_input(&self) -> usize {
        self.keys.weight.dims()[1]
    }

    fn d_key(&self) -> usize {
        self.keys.weight.dims()[0]
    }

    fn d_value(&self) -> usize {
        self.values.weight.dims()[0]
    }

    fn head_count(&self) -> usize {
        self.head_count
    }
}

impl<B: Backend> ReinitParams for EfficientAttention<B> {
    fn reinit_params(self) -> Self {
        Self {
            head_count: self.head_count,
            keys: self.keys.reinit_params(),
            queries: self.queries.reinit_params(),
            values: self.values.reinit_params(),
            reprojection: self.reprojection.reinit_params(),
        }
    }
}

impl<B: Backend> EfficientAttention<B> {
    /// Forward pass.
    ///
    /// ## Arguments
    ///
    /// - `x`: Input tensor of shape (B, `d_input`, H, W).
    ///
    /// ## Returns
    ///
    /// - Output tensor of shape (B, `d_input`, H, W).
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        static CONTRACT: ShapeContract = shape_contract!("batch", "d_input", "height", "width");
        let [b, h, w] = CONTRACT.unpack_shape(
            &x.dims(),
            &["batch", "height", "width"],
            &[("d_input", self.d_input())],
        );
        let n = h * w;

        let keys = self.keys.forward(x.clone()).reshape([b, self.d_key(), n]);
        let queries = self.queries.forward(x.clone()).reshape([b, self.d_key(), n]);
        let values = self.values.forward(x).reshape([b, self.d_value(), n]);

        let attended = linear_attention(keys, queries, values, self.head_count);
        // b, d_value, h * w

        let x = self
            .reprojection
            .forward(attended.reshape([b, self.d_value(), h, w]));

        run_every_nth!(CONTRACT.assert_shape(
            &x.dims(),
            &[
                ("batch", b),
                ("d_input", self.d_input()),
                ("height", h),
                ("width", w)
            ],
        ));

        x
    }
}

/// The efficient attention kernel, over projected keys, queries and values.
///
/// Channels are split into `head_count` equal contiguous groups; per head:
///
/// ```text
/// context  = softmax(keys, tokens) · valuesᵀ         (d_head_key, d_head_value)
/// attended = contextᵀ · softmax(queries, channels)   (d_head_value, tokens)
/// ```
///
/// and the heads are concatenated back along the channel axis.
///
/// ## Arguments
///
/// - `keys`: Tensor of shape (B, `d_key`, N).
/// - `queries`: Tensor of shape (B, `d_key`, N).
/// - `values`: Tensor of shape (B, `d_value`, N).
/// - `head_count`: Number of heads; must divide `d_key` and `d_value`.
///
/// ## Returns
///
/// - Tensor of shape (B, `d_value`, N).
#[must_use]
pub fn linear_attention<B: Backend>(
    keys: Tensor<B, 3>,
    queries: Tensor<B, 3>,
    values: Tensor<B, 3>,
    head_count: usize,
) -> Tensor<B, 3> {
    static KEY_CONTRACT: ShapeContract =
        shape_contract!("batch", "head_count" * "d_head_key", "tokens");
    static VALUE_CONTRACT: ShapeContract =
        shape_contract!("batch", "head_count" * "d_head_value", "tokens");

    let [b, dk, n] = KEY_CONTRACT.unpack_shape(
        &keys.dims(),
        &["batch", "d_head_key", "tokens"],
        &[("head_count", head_count)],
    );
    KEY_CONTRACT.assert_shape(
        &queries.dims(),
        &[
            ("batch", b),
            ("head_count", head_count),
            ("d_head_key", dk),
            ("tokens", n),
        ],
    );
    let [dv] = VALUE_CONTRACT.unpack_shape(
        &values.dims(),
        &["d_head_value"],
        &[("batch", b), ("head_count", head_count), ("tokens", n)],
    );

    let key = softmax(keys.reshape([b, head_count, dk, n]), 3);
    let query = softmax(queries.reshape([b, head_count, dk, n]), 2);
    let value = values.reshape([b, head_count, dv, n]);

    let context = key.matmul(value.swap_dims(2, 3));
    // b, heads, dk, dv

    let attended = context.swap_dims(2, 3).matmul(query);
    // b, heads, dv, n

    attended.reshape([b, head_count * dv, n])
}
