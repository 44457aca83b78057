//! # Efficient MISSFormer Segmentation Model
//!
//! Image ``(B, C, H, W)`` with ``C ∈ {1, 3}`` to per-pixel class logits
//! ``(B, num_classes, H, W)``.

use crate::models::missformer::decoder::{
    DecoderLayer, DecoderLayerConfig, DecoderLayerMeta, DecoderStageChannels,
};
use crate::models::missformer::encoder::{
    EncoderStageConfig, MixTransformerEncoder, MixTransformerEncoderConfig,
    MixTransformerEncoderMeta, MixTransformerEncoderPlan,
};
use crate::models::missformer::token_mlp::TokenMlpMode;
use crate::utility::results::expect_unwrap;
use burn::config::Config;
use burn::module::Module;
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for `EffMissFormer`.
pub trait EffMissFormerMeta {
    /// Number of segmentation classes.
    fn num_classes(&self) -> usize;

    /// Input resolution (height, width).
    fn input_resolution(&self) -> [usize; 2];

    /// Number of encoder (and decoder) stages.
    fn num_stages(&self) -> usize;
}

/// Configuration for `EffMissFormer`.
#[derive(Config, Debug)]
pub struct EffMissFormerConfig {
    /// Number of segmentation classes.
    pub num_classes: usize,

    /// Number of attention heads, in every encoder and decoder block.
    ///
    /// Values above ``1`` split the key and value channels into independent
    /// heads; the reference network always uses a single head, so only the
    /// default reproduces its behavior.
    #[config(default = 1)]
    pub head_count: usize,

    /// The feed-forward sublayer variant, in every block.
    #[config(default = "TokenMlpMode::MixSkip")]
    pub token_mlp_mode: TokenMlpMode,

    /// Square input image size.
    #[config(default = 224)]
    pub image_size: usize,

    /// Encoder stages, outermost first.
    #[config(default = "EncoderStageConfig::reference_stages()")]
    pub encoder_stages: Vec<EncoderStageConfig>,

    /// Decoder channel rows; row ``i`` pairs with encoder stage ``i``.
    #[config(default = "DecoderStageChannels::reference_table()")]
    pub decoder_channels: Vec<DecoderStageChannels>,
}

/// Validated construction plan for `EffMissFormer`.
#[derive(Debug)]
pub struct EffMissFormerPlan {
    /// The encoder plan.
    pub encoder: MixTransformerEncoderPlan,

    /// The decoder stage configs; ``decoders[0]`` is terminal.
    pub decoders: Vec<DecoderLayerConfig>,
}

impl EffMissFormerMeta for EffMissFormerConfig {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn input_resolution(&self) -> [usize; 2] {
        [self.image_size, self.image_size]
    }

    fn num_stages(&self) -> usize {
        self.encoder_stages.len()
    }
}

impl EffMissFormerConfig {
    /// The encoder config.
    #[must_use]
    pub fn encoder_config(&self) -> MixTransformerEncoderConfig {
        MixTransformerEncoderConfig::new(self.input_resolution())
            .with_stages(self.encoder_stages.clone())
            .with_head_count(self.head_count)
            .with_token_mlp_mode(self.token_mlp_mode)
    }

    /// Check config validity and return a plan for the model.
    ///
    /// Checks that the encoder pyramid, the decoder upsampling chain, and the
    /// skip concat widths all line up; without allocating any tensors.
    pub fn validate(&self) -> anyhow::Result<EffMissFormerPlan> {
        if self.num_classes == 0 {
            anyhow::bail!("num_classes must be non-zero");
        }
        let n = self.encoder_stages.len();
        if n < 2 {
            anyhow::bail!("At least two stages are required, found {n}");
        }
        if self.decoder_channels.len() != n {
            anyhow::bail!(
                "decoder_channels has {} rows, expected one per encoder stage ({n})",
                self.decoder_channels.len()
            );
        }

        let encoder_config = self.encoder_config();
        let encoder = encoder_config.validate()?;
        let dims = encoder_config.stage_dims();
        let resolutions = &encoder.stage_resolutions;

        let decoders: Vec<DecoderLayerConfig> = (0..n)
            .map(|i| {
                DecoderLayerConfig::new(resolutions[i], self.decoder_channels[i], self.num_classes)
                    .with_head_count(self.head_count)
                    .with_token_mlp_mode(self.token_mlp_mode)
                    .with_is_last(i == 0)
            })
            .collect();
        for (i, decoder) in decoders.iter().enumerate() {
            if let Err(err) = decoder.validate() {
                anyhow::bail!("decoder stage {i}: {err}");
            }
        }

        // The deepest stage only upsamples the encoder tokens.
        if decoders[n - 1].d_model() != dims[n - 1] {
            anyhow::bail!(
                "decoder stage {} expands {} channels, but encoder stage {} yields {}",
                n - 1,
                decoders[n - 1].d_model(),
                n - 1,
                dims[n - 1],
            );
        }

        for i in 0..n - 1 {
            let upper = &decoders[i + 1];
            if upper.output_resolution() != resolutions[i] {
                anyhow::bail!(
                    "decoder stage {} yields {:?}, but encoder stage {i} is {:?}",
                    i + 1,
                    upper.output_resolution(),
                    resolutions[i],
                );
            }
            let fused = upper.d_output() + dims[i];
            if fused != decoders[i].d_concat() {
                anyhow::bail!(
                    "decoder stage {i} concats {} + {} = {fused} channels, expected {}",
                    upper.d_output(),
                    dims[i],
                    decoders[i].d_concat(),
                );
            }
        }

        if decoders[0].output_resolution() != self.input_resolution() {
            anyhow::bail!(
                "decoder output {:?} does not match the input resolution {:?}",
                decoders[0].output_resolution(),
                self.input_resolution(),
            );
        }

        Ok(EffMissFormerPlan { encoder, decoders })
    }

    /// Initialize an `EffMissFormer`, or report why the config is invalid.
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> anyhow::Result<EffMissFormer<B>> {
        let plan = self.validate()?;
        tracing::debug!(?plan, "EffMissFormer plan");

        Ok(EffMissFormer {
            encoder: MixTransformerEncoderConfig::init_plan(&plan.encoder, device),
            decoders: plan
                .decoders
                .iter()
                .map(|config| config.init(device))
                .collect(),
        })
    }

    /// Initialize an `EffMissFormer`.
    ///
    /// ## Panics
    ///
    /// If [`Self::validate`] fails.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> EffMissFormer<B> {
        expect_unwrap(self.try_init(device))
    }
}

/// Efficient MISSFormer.
///
/// A hierarchical efficient-attention encoder, and a patch-expanding decoder
/// fusing each encoder stage as a skip connection.
#[derive(Module, Debug)]
pub struct EffMissFormer<B: Backend> {
    /// The feature pyramid encoder.
    pub encoder: MixTransformerEncoder<B>,

    /// The decoder stages; ``decoders[i]`` consumes encoder stage ``i``.
    pub decoders: Vec<DecoderLayer<B>>,
}

impl<B: Backend> EffMissFormerMeta for EffMissFormer<B> {
    fn num_classes(&self) -> usize {
        self.decoders[0].d_output()
    }

    fn input_resolution(&self) -> [usize; 2] {
        self.encoder.input_resolution()
    }

    fn num_stages(&self) -> usize {
        self.encoder.num_stages()
    }
}

impl<B: Backend> EffMissFormer<B> {
    /// Segment an image batch.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input image of shape ``(B, C, H, W)``, ``C ∈ {1, 3}``.
    ///
    /// ## Returns
    ///
    /// * Logits of shape ``(B, num_classes, H, W)``.
    ///
    /// ## Panics
    ///
    /// On shape mismatch; see [`Self::try_forward`].
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let x = if x.dims()[1] == 1 {
            x.repeat_dim(1, 3)
        } else {
            x
        };

        let features = self.encoder.forward(x);
        let n = features.len();

        let deepest = features[n - 1].clone().flatten(2, 3).swap_dims(1, 2);
        let mut x = self.decoders[n - 1].forward(deepest, None).into_tokens();
        tracing::trace!(stage = n - 1, shape = ?x.dims(), "decoder stage");

        for i in (1..n - 1).rev() {
            let skip = features[i].clone().permute([0, 2, 3, 1]);
            x = self.decoders[i].forward(x, Some(skip)).into_tokens();
            tracing::trace!(stage = i, shape = ?x.dims(), "decoder stage");
        }

        let skip = features[0].clone().permute([0, 2, 3, 1]);
        self.decoders[0].forward(x, Some(skip)).into_logits()
    }

    /// Segment an image batch, reporting shape errors as values.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input image of shape ``(B, C, H, W)``, ``C ∈ {1, 3}``.
    ///
    /// ## Returns
    ///
    /// * Logits of shape ``(B, num_classes, H, W)``, or an error if the
    ///   channel count or resolution is not supported.
    pub fn try_forward(
        &self,
        x: Tensor<B, 4>,
    ) -> anyhow::Result<Tensor<B, 4>> {
        let [_, c, h, w] = x.dims();
        if c != 1 && c != 3 {
            anyhow::bail!("expected 1 or 3 input channels, found {c}");
        }
        if [h, w] != self.input_resolution() {
            anyhow::bail!(
                "expected input resolution {:?}, found {:?}",
                self.input_resolution(),
                [h, w]
            );
        }
        Ok(self.forward(x))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::assert_all_finite;
    use burn::backend::NdArray;
    use burn::tensor::Distribution;

    /// A three-stage model over ``32x32`` images; pyramid ``8, 4, 2``.
    fn tiny_config(num_classes: usize) -> EffMissFormerConfig {
        EffMissFormerConfig::new(num_classes)
            .with_image_size(32)
            .with_head_count(2)
            .with_encoder_stages(vec![
                EncoderStageConfig::new(8, 8, 8, 1)
                    .with_patch_size(7)
                    .with_stride(4)
                    .with_padding(3),
                EncoderStageConfig::new(16, 16, 16, 1),
                EncoderStageConfig::new(24, 24, 24, 1),
            ])
            .with_decoder_channels(vec![
                DecoderStageChannels::new(4, 8, 8, 8),
                DecoderStageChannels::new(14, 16, 16, 16),
                DecoderStageChannels::new(24, 24, 24, 24),
            ])
    }

    #[test]
    fn test_reference_plan() {
        let config = EffMissFormerConfig::new(9);
        assert_eq!(config.num_classes(), 9);
        assert_eq!(config.input_resolution(), [224, 224]);
        assert_eq!(config.num_stages(), 4);
        assert_eq!(config.head_count, 1);
        assert_eq!(config.token_mlp_mode, TokenMlpMode::MixSkip);

        let plan = config.validate().unwrap();
        assert_eq!(
            plan.encoder.stage_resolutions,
            vec![[56, 56], [28, 28], [14, 14], [7, 7]]
        );
        assert_eq!(
            plan.decoders
                .iter()
                .map(|d| d.input_resolution())
                .collect::<Vec<_>>(),
            vec![[56, 56], [28, 28], [14, 14], [7, 7]]
        );
        assert_eq!(
            plan.decoders.iter().map(|d| d.d_concat()).collect::<Vec<_>>(),
            vec![128, 288, 576, 1024]
        );
        assert_eq!(
            plan.decoders.iter().map(|d| d.d_output()).collect::<Vec<_>>(),
            vec![9, 64, 160, 256]
        );
        assert!(plan.decoders[0].is_last());
        assert!(plan.decoders[1..].iter().all(|d| !d.is_last()));
    }

    #[test]
    fn test_head_count_reaches_every_block() {
        use crate::models::missformer::block::EfficientTransformerBlockMeta;

        let model = tiny_config(3).init::<NdArray>(&Default::default());
        for stage in &model.encoder.stages {
            assert!(stage.blocks.iter().all(|block| block.head_count() == 2));
        }
        for decoder in &model.decoders {
            assert_eq!(decoder.former_1.head_count(), 2);
            assert_eq!(decoder.former_2.head_count(), 2);
        }
    }

    #[test]
    fn test_validate_rejects() {
        assert!(EffMissFormerConfig::new(0).validate().is_err());

        // 48 -> 12 -> 6 -> 3 -> 2; the decoder cannot climb back.
        assert!(
            EffMissFormerConfig::new(9)
                .with_image_size(48)
                .validate()
                .is_err()
        );

        // Reference decoder table against a narrower encoder.
        assert!(
            tiny_config(3)
                .with_decoder_channels(DecoderStageChannels::reference_table()[..3].to_vec())
                .validate()
                .is_err()
        );

        let mut channels = tiny_config(3).decoder_channels;
        channels[1] = DecoderStageChannels::new(16, 16, 16, 16);
        assert!(
            tiny_config(3)
                .with_decoder_channels(channels)
                .validate()
                .is_err()
        );

        let stages = tiny_config(3).encoder_stages[..1].to_vec();
        let channels = tiny_config(3).decoder_channels[..1].to_vec();
        assert!(
            tiny_config(3)
                .with_encoder_stages(stages)
                .with_decoder_channels(channels)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_try_init_reports_errors() {
        let device = Default::default();
        let result = EffMissFormerConfig::new(9)
            .with_image_size(48)
            .try_init::<NdArray>(&device);
        assert!(result.is_err());
    }

    #[test]
    fn test_tiny_forward() {
        let device = Default::default();
        let model = tiny_config(5).init::<NdArray>(&device);
        assert_eq!(model.num_classes(), 5);
        assert_eq!(model.input_resolution(), [32, 32]);
        assert_eq!(model.num_stages(), 3);

        let x = Tensor::random([2, 3, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        let y = model.forward(x);
        assert_eq!(y.dims(), [2, 5, 32, 32]);
        assert_all_finite(&y);
    }

    #[test]
    fn test_tiny_forward_grayscale() {
        let device = Default::default();
        let model = tiny_config(2)
            .with_token_mlp_mode(TokenMlpMode::Mlp)
            .init::<NdArray>(&device);

        let gray = Tensor::random([1, 1, 32, 32], Distribution::Normal(0.0, 1.0), &device);
        let y = model.forward(gray.clone());
        assert_eq!(y.dims(), [1, 2, 32, 32]);

        // Grayscale is replicated across channels before encoding.
        let rgb = gray.repeat_dim(1, 3);
        model
            .forward(rgb)
            .into_data()
            .assert_eq(&y.into_data(), true);
    }

    #[test]
    fn test_try_forward() {
        let device = Default::default();
        let model = tiny_config(3).init::<NdArray>(&device);

        let err = model
            .try_forward(Tensor::zeros([1, 2, 32, 32], &device))
            .unwrap_err();
        assert!(err.to_string().contains("1 or 3 input channels"));

        let err = model
            .try_forward(Tensor::zeros([1, 3, 16, 32], &device))
            .unwrap_err();
        assert!(err.to_string().contains("input resolution"));

        let y = model
            .try_forward(Tensor::zeros([1, 3, 32, 32], &device))
            .unwrap();
        assert_eq!(y.dims(), [1, 3, 32, 32]);
    }

    #[should_panic]
    #[test]
    fn test_forward_bad_channels_panics() {
        let device = Default::default();
        let model = tiny_config(3).init::<NdArray>(&device);
        let _ = model.forward(Tensor::zeros([1, 2, 32, 32], &device));
    }
}
