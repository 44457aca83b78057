use crate::layers::init::ReinitParams;
use crate::models::missformer::attention::{
    EfficientAttention, EfficientAttentionConfig, EfficientAttentionMeta,
};
use crate::models::missformer::token_mlp::{TokenMlp, TokenMlpConfig, TokenMlpMeta, TokenMlpMode};
use crate::utility::results::expect_unwrap;
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig};
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for `EfficientTransformerBlock`.
pub trait EfficientTransformerBlockMeta {
    /// Input (and output) feature dimension size.
    fn d_input(&self) -> usize;

    /// Attention key dimension size.
    fn d_key(&self) -> usize;

    /// Attention value dimension size.
    fn d_value(&self) -> usize;

    /// Number of attention heads.
    fn head_count(&self) -> usize;

    /// The feed-forward sublayer variant.
    fn token_mlp_mode(&self) -> TokenMlpMode;

    /// Hidden feature dimension size of the feed-forward sublayer.
    fn d_hidden(&self) -> usize;
}

/// Configuration for `EfficientTransformerBlock`.
#[derive(Config, Debug)]
pub struct EfficientTransformerBlockConfig {
    /// Input (and output) feature dimension size.
    pub d_input: usize,

    /// Attention key dimension size.
    pub d_key: usize,

    /// Attention value dimension size.
    pub d_value: usize,

    /// Number of attention heads.
    #[config(default = 1)]
    pub head_count: usize,

    /// The feed-forward sublayer variant.
    #[config(default = "TokenMlpMode::MixSkip")]
    pub token_mlp_mode: TokenMlpMode,

    /// Ratio of hidden to input width in the feed-forward sublayer.
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
}

impl EfficientTransformerBlockMeta for EfficientTransformerBlockConfig {
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

    fn token_mlp_mode(&self) -> TokenMlpMode {
        self.token_mlp_mode
    }

    fn d_hidden(&self) -> usize {
        (self.d_input as f64 * self.mlp_ratio) as usize
    }
}

impl EfficientTransformerBlockConfig {
    /// The attention sublayer config.
    #[must_use]
    pub fn attention_config(&self) -> EfficientAttentionConfig {
        EfficientAttentionConfig::new(self.d_input, self.d_key, self.d_value)
            .with_head_count(self.head_count)
    }

    /// The feed-forward sublayer config.
    #[must_use]
    pub fn token_mlp_config(&self) -> TokenMlpConfig {
        TokenMlpConfig::new(self.d_input, self.d_hidden()).with_mode(self.token_mlp_mode)
    }

    /// Check the config, without allocating a module.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.mlp_ratio.is_finite() && self.mlp_ratio > 0.0) {
            anyhow::bail!("mlp_ratio must be positive: {self:?}");
        }
        if self.d_hidden() == 0 {
            anyhow::bail!("feed-forward hidden width rounds to zero: {self:?}");
        }
        self.attention_config().validate()
    }

    /// Initialize an `EfficientTransformerBlock`.
    ///
    /// ## Panics
    ///
    /// If [`Self::validate`] fails.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> EfficientTransformerBlock<B> {
        expect_unwrap(self.validate());

        EfficientTransformerBlock {
            norm1: LayerNormConfig::new(self.d_input).init(device),
            attn: self.attention_config().init(device),
            norm2: LayerNormConfig::new(self.d_input).init(device),
            mlp: self.token_mlp_config().init(device),
        }
    }
}

/// Pre-norm transformer block over tokens, with efficient attention.
///
/// ```text
/// t = x + attn(norm1(x))
/// y = t + mlp(norm2(t))
/// ```
#[derive(Module, Debug)]
pub struct EfficientTransformerBlock<B: Backend> {
    /// Attention normalization.
    pub norm1: LayerNorm<B>,

    /// Attention sublayer.
    pub attn: EfficientAttention<B>,

    /// Feed-forward normalization.
    pub norm2: LayerNorm<B>,

    /// Feed-forward sublayer.
    pub mlp: TokenMlp<B>,
}

impl<B: Backend> EfficientTransformerBlockMeta for EfficientTransformerBlock<B> {
    fn d_input(&self) -> usize {
        self.attn.d_input()
    }

    fn d_key(&self) -> usize {
        self.attn.d_key()
    }

    fn d_value(&self) -> usize {
        self.attn.d_value()
    }

    fn head_count(&self) -> usize {
        self.attn.head_count()
    }

    fn token_mlp_mode(&self) -> TokenMlpMode {
        self.mlp.mode()
    }

    fn d_hidden(&self) -> usize {
        self.mlp.d_hidden()
    }
}

impl<B: Backend> ReinitParams for EfficientTransformerBlock<B> {
    fn reinit_params(self) -> Self {
        Self {
            norm1: self.norm1.reinit_params(),
            attn: self.attn.reinit_params(),
            norm2: self.norm2.reinit_params(),
            mlp: self.mlp.reinit_params(),
        }
    }
}

impl<B: Backend> EfficientTransformerBlock<B> {
    /// Forward pass.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape ``(B, H * W, d_input)``.
    /// * `resolution` - ``[H, W]``.
    ///
    /// ## Returns
    ///
    /// * Output tensor of shape ``(B, H * W, d_input)``.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        resolution: [usize; 2],
    ) -> Tensor<B, 3> {
        let [h, w] = resolution;
        static CONTRACT: ShapeContract = shape_contract!("batch", "height" * "width", "d_input");
        let [b] = CONTRACT.unpack_shape(
            &x.dims(),
            &["batch"],
            &[("height", h), ("width", w), ("d_input", self.d_input())],
        );
        let d = self.d_input();

        let y = self.norm1.forward(x.clone());
        let y = y.swap_dims(1, 2).reshape([b, d, h, w]);
        let y = self.attn.forward(y);
        let y = y.flatten(2, 3).swap_dims(1, 2);
        let x = x + y;

        let y = self.mlp.forward(self.norm2.forward(x.clone()), resolution);
        let x = x + y;

        run_every_nth!(CONTRACT.assert_shape(
            &x.dims(),
            &[("batch", b), ("height", h), ("width", w), ("d_input", d)],
        ));

        x
    }
}
