//! # Hierarchical Efficient-Attention Encoder
//!
//! A four-stage "Mix Transformer" pyramid; each stage is an overlapping patch
//! embedding, a stack of [`EfficientTransformerBlock`]s, and a closing layer norm.

use crate::layers::patching::overlap_patch_embed::{
    OverlapPatchEmbed, OverlapPatchEmbedConfig, OverlapPatchEmbedMeta,
};
use crate::models::missformer::block::{EfficientTransformerBlock, EfficientTransformerBlockConfig};
use crate::models::missformer::token_mlp::TokenMlpMode;
use crate::utility::results::expect_unwrap;
use bimm_contracts::{ShapeContract, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig};
use burn::prelude::{Backend, Tensor};

/// Per-stage encoder configuration.
#[derive(Config, Debug, Copy)]
pub struct EncoderStageConfig {
    /// Stage embedding dimension size.
    pub d_embed: usize,

    /// Attention key dimension size.
    pub d_key: usize,

    /// Attention value dimension size.
    pub d_value: usize,

    /// Number of transformer blocks.
    pub depth: usize,

    /// Patch embedding kernel size.
    #[config(default = 3)]
    pub patch_size: usize,

    /// Patch embedding stride.
    #[config(default = 2)]
    pub stride: usize,

    /// Patch embedding zero padding, per side.
    #[config(default = 1)]
    pub padding: usize,
}

impl EncoderStageConfig {
    /// The reference four-stage pyramid.
    ///
    /// | stage | kernel | stride | pad | dims | depth |
    /// |-------|--------|--------|-----|------|-------|
    /// | 0     | 7      | 4      | 3   | 64   | 2     |
    /// | 1     | 3      | 2      | 1   | 128  | 2     |
    /// | 2     | 3      | 2      | 1   | 320  | 2     |
    /// | 3     | 3      | 2      | 1   | 512  | 2     |
    ///
    /// Key and value dims equal the embedding dims.
    #[must_use]
    pub fn reference_stages() -> Vec<Self> {
        [64, 128, 320, 512]
            .into_iter()
            .enumerate()
            .map(|(i, d)| {
                let stage = Self::new(d, d, d, 2);
                if i == 0 {
                    stage.with_patch_size(7).with_stride(4).with_padding(3)
                } else {
                    stage
                }
            })
            .collect()
    }
}

/// Common introspection interface for `MixTransformerEncoder`.
pub trait MixTransformerEncoderMeta {
    /// Input resolution (height, width).
    fn input_resolution(&self) -> [usize; 2];

    /// Input channel dimension size.
    fn d_input(&self) -> usize;

    /// Number of stages.
    fn num_stages(&self) -> usize;

    /// Embedding dimension size of each stage.
    fn stage_dims(&self) -> Vec<usize>;

    /// Output resolution of each stage.
    fn stage_resolutions(&self) -> Vec<[usize; 2]>;
}

/// Configuration for `MixTransformerEncoder`.
#[derive(Config, Debug)]
pub struct MixTransformerEncoderConfig {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Input channel dimension size.
    #[config(default = 3)]
    pub d_input: usize,

    /// Stage configurations, outermost first.
    #[config(default = "EncoderStageConfig::reference_stages()")]
    pub stages: Vec<EncoderStageConfig>,

    /// Number of attention heads, in every block.
    #[config(default = 1)]
    pub head_count: usize,

    /// The feed-forward sublayer variant, in every block.
    #[config(default = "TokenMlpMode::MixSkip")]
    pub token_mlp_mode: TokenMlpMode,

    /// Ratio of hidden to input width in the feed-forward sublayers.
    #[config(default = 4.0)]
    pub mlp_ratio: f64,
}

/// Validated construction plan for `MixTransformerEncoder`.
#[derive(Debug)]
pub struct MixTransformerEncoderPlan {
    /// The patch embedding configuration of each stage.
    pub patch_configs: Vec<OverlapPatchEmbedConfig>,

    /// The output resolution of each stage.
    pub stage_resolutions: Vec<[usize; 2]>,

    /// The block configuration of each stage.
    pub block_configs: Vec<EfficientTransformerBlockConfig>,

    /// The number of blocks in each stage.
    pub depths: Vec<usize>,
}

impl MixTransformerEncoderMeta for MixTransformerEncoderConfig {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn d_input(&self) -> usize {
        self.d_input
    }

    fn num_stages(&self) -> usize {
        self.stages.len()
    }

    fn stage_dims(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.d_embed).collect()
    }

    /// ## Panics
    ///
    /// If a stage's padded input is smaller than its kernel;
    /// see [`MixTransformerEncoderConfig::validate`].
    fn stage_resolutions(&self) -> Vec<[usize; 2]> {
        expect_unwrap(self.stage_patch_configs())
            .iter()
            .map(|c| c.patches_resolution())
            .collect()
    }
}

impl MixTransformerEncoderConfig {
    fn stage_patch_configs(&self) -> anyhow::Result<Vec<OverlapPatchEmbedConfig>> {
        let mut resolution = self.input_resolution;
        let mut d_input = self.d_input;
        let mut configs = Vec::with_capacity(self.stages.len());
        for (i, stage) in self.stages.iter().enumerate() {
            let config = OverlapPatchEmbedConfig::new(
                resolution,
                stage.patch_size,
                stage.stride,
                stage.padding,
                d_input,
                stage.d_embed,
            );
            if let Err(err) = config.validate() {
                anyhow::bail!("encoder stage {i}: {err}");
            }
            resolution = config.patches_resolution();
            d_input = stage.d_embed;
            configs.push(config);
        }
        Ok(configs)
    }

    /// Check config validity and return a plan for the encoder.
    pub fn validate(&self) -> anyhow::Result<MixTransformerEncoderPlan> {
        if self.stages.is_empty() {
            anyhow::bail!("At least one encoder stage is required");
        }
        if self.d_input == 0 {
            anyhow::bail!("d_input must be non-zero: {self:?}");
        }

        let patch_configs = self.stage_patch_configs()?;

        let block_configs: Vec<EfficientTransformerBlockConfig> = self
            .stages
            .iter()
            .map(|stage| {
                EfficientTransformerBlockConfig::new(stage.d_embed, stage.d_key, stage.d_value)
                    .with_head_count(self.head_count)
                    .with_token_mlp_mode(self.token_mlp_mode)
                    .with_mlp_ratio(self.mlp_ratio)
            })
            .collect();
        for (i, config) in block_configs.iter().enumerate() {
            if let Err(err) = config.validate() {
                anyhow::bail!("encoder stage {i}: {err}");
            }
        }

        Ok(MixTransformerEncoderPlan {
            stage_resolutions: patch_configs
                .iter()
                .map(|c| c.patches_resolution())
                .collect(),
            patch_configs,
            block_configs,
            depths: self.stages.iter().map(|s| s.depth).collect(),
        })
    }

    /// Initialize a `MixTransformerEncoder` from a validated plan.
    #[must_use]
    pub fn init_plan<B: Backend>(
        plan: &MixTransformerEncoderPlan,
        device: &B::Device,
    ) -> MixTransformerEncoder<B> {
        let stages = plan
            .patch_configs
            .iter()
            .zip(plan.block_configs.iter())
            .zip(plan.depths.iter())
            .map(|((patch_config, block_config), &depth)| EncoderStage {
                patch_embed: patch_config.init(device),
                blocks: (0..depth).map(|_| block_config.init(device)).collect(),
                norm: LayerNormConfig::new(patch_config.d_output).init(device),
            })
            .collect();

        MixTransformerEncoder { stages }
    }

    /// Initialize a `MixTransformerEncoder`.
    ///
    /// ## Panics
    ///
    /// If [`Self::validate`] fails.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> MixTransformerEncoder<B> {
        Self::init_plan(&expect_unwrap(self.validate()), device)
    }
}

/// One encoder stage.
#[derive(Module, Debug)]
pub struct EncoderStage<B: Backend> {
    /// Downsampling patch embedding.
    pub patch_embed: OverlapPatchEmbed<B>,

    /// Transformer blocks.
    pub blocks: Vec<EfficientTransformerBlock<B>>,

    /// Output normalization.
    pub norm: LayerNorm<B>,
}

impl<B: Backend> EncoderStage<B> {
    /// Stage embedding dimension size.
    #[must_use]
    pub fn d_embed(&self) -> usize {
        self.patch_embed.d_output()
    }

    /// Number of transformer blocks.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.blocks.len()
    }

    /// Apply the stage.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input feature map, ``(B, C, H, W)``.
    ///
    /// ## Returns
    ///
    /// * Output feature map, ``(B, d_embed, H', W')``.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let [b, _, _, _] = x.dims();
        let (mut x, [h, w]) = self.patch_embed.forward(x);

        for block in &self.blocks {
            x = block.forward(x, [h, w]);
        }
        let x = self.norm.forward(x);

        x.swap_dims(1, 2).reshape([b, self.d_embed(), h, w])
    }
}

/// Hierarchical efficient-attention encoder.
#[derive(Module, Debug)]
pub struct MixTransformerEncoder<B: Backend> {
    /// The stages, outermost first.
    pub stages: Vec<EncoderStage<B>>,
}

impl<B: Backend> MixTransformerEncoderMeta for MixTransformerEncoder<B> {
    fn input_resolution(&self) -> [usize; 2] {
        self.stages[0].patch_embed.input_resolution()
    }

    fn d_input(&self) -> usize {
        self.stages[0].patch_embed.d_input()
    }

    fn num_stages(&self) -> usize {
        self.stages.len()
    }

    fn stage_dims(&self) -> Vec<usize> {
        self.stages.iter().map(|s| s.d_embed()).collect()
    }

    fn stage_resolutions(&self) -> Vec<[usize; 2]> {
        self.stages
            .iter()
            .map(|s| s.patch_embed.patches_resolution())
            .collect()
    }
}

impl<B: Backend> MixTransformerEncoder<B> {
    /// Encode an image into a feature pyramid.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input image, ``(B, d_input, H, W)``.
    ///
    /// ## Returns
    ///
    /// * One feature map per stage, ``(B, d_embed_i, H_i, W_i)``, outermost first.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> Vec<Tensor<B, 4>> {
        static CONTRACT: ShapeContract = shape_contract!("batch", "d_input", "height", "width");
        let [h, w] = self.input_resolution();
        let [batch] = CONTRACT.unpack_shape(
            &x.dims(),
            &["batch"],
            &[("d_input", self.d_input()), ("height", h), ("width", w)],
        );

        let mut features = Vec::with_capacity(self.stages.len());
        let mut x = x;
        for (i, stage) in self.stages.iter().enumerate() {
            x = stage.forward(x);
            tracing::trace!(stage = i, batch, shape = ?x.dims(), "encoder stage");
            features.push(x.clone());
        }
        features
    }
}
