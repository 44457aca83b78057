//! # Patch-Expanding Decoder Stages
//!
//! Each stage fuses the running decoder tokens with an encoder skip feature
//! map, refines them with two transformer blocks, and upsamples. The terminal
//! stage upsamples ×4 and classifies each pixel.

use crate::layers::init::ReinitParams;
use crate::layers::patching::patch_expand::{
    FinalPatchExpand, FinalPatchExpandConfig, PatchExpand, PatchExpandConfig, PatchExpandMeta,
};
use crate::models::missformer::block::{EfficientTransformerBlock, EfficientTransformerBlockConfig};
use crate::models::missformer::token_mlp::TokenMlpMode;
use crate::utility::results::expect_unwrap;
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};

/// The channel row of one decoder stage.
#[derive(Config, Debug, Copy, PartialEq, Eq)]
pub struct DecoderStageChannels {
    /// Concat unit; the fused width is ``2 * dims``, or ``4 * dims`` when terminal.
    pub dims: usize,

    /// Width of the fused, refined tokens.
    pub d_output: usize,

    /// Attention key dimension size.
    pub d_key: usize,

    /// Attention value dimension size.
    pub d_value: usize,
}

impl DecoderStageChannels {
    /// The reference decoder table; row ``i`` pairs with encoder stage ``i``.
    ///
    /// ```text
    /// [dims, d_output, d_key, d_value]
    /// [ 32,   64,  64,  64]
    /// [144,  128, 128, 128]
    /// [288,  320, 320, 320]
    /// [512,  512, 512, 512]
    /// ```
    #[must_use]
    pub fn reference_table() -> Vec<Self> {
        [
            [32, 64, 64, 64],
            [144, 128, 128, 128],
            [288, 320, 320, 320],
            [512, 512, 512, 512],
        ]
        .into_iter()
        .map(|[dims, d_output, d_key, d_value]| Self::new(dims, d_output, d_key, d_value))
        .collect()
    }

    /// The width of the concatenated ``[tokens, skip]`` features.
    #[must_use]
    pub fn d_concat(
        &self,
        is_last: bool,
    ) -> usize {
        if is_last { 4 * self.dims } else { 2 * self.dims }
    }
}

/// Common introspection interface for `DecoderLayer`.
pub trait DecoderLayerMeta {
    /// Input resolution (height, width).
    fn input_resolution(&self) -> [usize; 2];

    /// Is this the terminal (classifying) stage?
    fn is_last(&self) -> bool;

    /// Width of the concatenated ``[tokens, skip]`` features.
    fn d_concat(&self) -> usize;

    /// Width of the fused, refined tokens.
    fn d_model(&self) -> usize;

    /// Output resolution (height, width).
    fn output_resolution(&self) -> [usize; 2] {
        let [h, w] = self.input_resolution();
        let s = if self.is_last() { 4 } else { 2 };
        [h * s, w * s]
    }

    /// Output channel count; the class count when terminal.
    fn d_output(&self) -> usize;
}

/// Configuration for `DecoderLayer`.
#[derive(Config, Debug)]
pub struct DecoderLayerConfig {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// The channel row.
    pub channels: DecoderStageChannels,

    /// Number of segmentation classes; used when terminal.
    pub num_classes: usize,

    /// Number of attention heads.
    #[config(default = 1)]
    pub head_count: usize,

    /// The feed-forward sublayer variant.
    #[config(default = "TokenMlpMode::MixSkip")]
    pub token_mlp_mode: TokenMlpMode,

    /// Is this the terminal (classifying) stage?
    #[config(default = false)]
    pub is_last: bool,
}

impl DecoderLayerMeta for DecoderLayerConfig {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn is_last(&self) -> bool {
        self.is_last
    }

    fn d_concat(&self) -> usize {
        self.channels.d_concat(self.is_last)
    }

    fn d_model(&self) -> usize {
        self.channels.d_output
    }

    fn d_output(&self) -> usize {
        if self.is_last {
            self.num_classes
        } else {
            self.patch_expand_config().d_output()
        }
    }
}

impl DecoderLayerConfig {
    /// The transformer block config, shared by both blocks.
    #[must_use]
    pub fn block_config(&self) -> EfficientTransformerBlockConfig {
        EfficientTransformerBlockConfig::new(
            self.channels.d_output,
            self.channels.d_key,
            self.channels.d_value,
        )
        .with_head_count(self.head_count)
        .with_token_mlp_mode(self.token_mlp_mode)
    }

    fn patch_expand_config(&self) -> PatchExpandConfig {
        PatchExpandConfig::new(self.input_resolution, self.channels.d_output)
    }

    /// Check the config, without allocating a module.
    pub fn validate(&self) -> anyhow::Result<()> {
        let [h, w] = self.input_resolution;
        if h == 0 || w == 0 {
            anyhow::bail!("input_resolution must be non-zero: {self:?}");
        }
        if self.channels.dims == 0 || self.channels.d_output == 0 {
            anyhow::bail!("decoder channels must be non-zero: {self:?}");
        }
        if self.is_last {
            if self.num_classes == 0 {
                anyhow::bail!("num_classes must be non-zero: {self:?}");
            }
        } else if self.channels.d_output % 2 != 0 {
            anyhow::bail!("d_output must be even to expand ×2: {self:?}");
        }
        self.block_config().validate()
    }

    /// Initialize a `DecoderLayer`.
    ///
    /// Parameters follow the [`crate::layers::init::ParamKind`] policy.
    ///
    /// ## Panics
    ///
    /// If [`Self::validate`] fails.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> DecoderLayer<B> {
        expect_unwrap(self.validate());

        let d_model = self.channels.d_output;
        let block_config = self.block_config();

        let layer_up = if self.is_last {
            DecoderUpsample::Segment(SegmentationHead {
                expand: FinalPatchExpandConfig::new(self.input_resolution, d_model).init(device),
                classifier: Conv2dConfig::new([d_model, self.num_classes], [1, 1]).init(device),
            })
        } else {
            DecoderUpsample::Expand(self.patch_expand_config().init(device))
        };

        DecoderLayer {
            input_resolution: self.input_resolution,
            concat_linear: LinearConfig::new(self.d_concat(), d_model).init(device),
            former_1: block_config.init(device),
            former_2: block_config.init(device),
            layer_up,
        }
        .reinit_params()
    }
}

/// Terminal upsampling: ×4 expansion then a per-pixel ``1x1`` classifier.
#[derive(Module, Debug)]
pub struct SegmentationHead<B: Backend> {
    /// ×4 patch expansion.
    pub expand: FinalPatchExpand<B>,

    /// ``1x1`` classifier.
    pub classifier: Conv2d<B>,
}

impl<B: Backend> SegmentationHead<B> {
    /// Number of classes.
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classifier.weight.dims()[0]
    }

    /// Upsample and classify.
    ///
    /// ## Arguments
    ///
    /// * `x` - Tokens of shape ``(B, H * W, C)``.
    ///
    /// ## Returns
    ///
    /// * Logits of shape ``(B, num_classes, 4H, 4W)``.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
    ) -> Tensor<B, 4> {
        let [b, _, _] = x.dims();
        let [h, w] = self.expand.output_resolution();
        let d = self.expand.d_output();

        let x = self.expand.forward(x);
        let x = x.reshape([b, h, w, d]).permute([0, 3, 1, 2]);

        self.classifier.forward(x)
    }
}

impl<B: Backend> ReinitParams for SegmentationHead<B> {
    fn reinit_params(self) -> Self {
        Self {
            expand: self.expand.reinit_params(),
            classifier: self.classifier.reinit_params(),
        }
    }
}

/// The upsampling tail of a decoder stage.
#[derive(Module, Debug)]
pub enum DecoderUpsample<B: Backend> {
    /// ×2 expansion; non-terminal stages.
    Expand(PatchExpand<B>),

    /// ×4 expansion and classifier; the terminal stage.
    Segment(SegmentationHead<B>),
}

impl<B: Backend> ReinitParams for DecoderUpsample<B> {
    fn reinit_params(self) -> Self {
        match self {
            DecoderUpsample::Expand(layer) => DecoderUpsample::Expand(layer.reinit_params()),
            DecoderUpsample::Segment(layer) => DecoderUpsample::Segment(layer.reinit_params()),
        }
    }
}

/// The result of a decoder stage.
#[derive(Debug, Clone)]
pub enum DecoderOutput<B: Backend> {
    /// Upsampled tokens, ``(B, H' * W', C')``.
    Tokens(Tensor<B, 3>),

    /// Segmentation logits, ``(B, num_classes, H', W')``.
    Logits(Tensor<B, 4>),
}

impl<B: Backend> DecoderOutput<B> {
    /// Unwrap token output.
    ///
    /// ## Panics
    ///
    /// If this is [`DecoderOutput::Logits`].
    #[must_use]
    pub fn into_tokens(self) -> Tensor<B, 3> {
        match self {
            DecoderOutput::Tokens(x) => x,
            DecoderOutput::Logits(x) => {
                panic!("expected decoder tokens, found logits: {:?}", x.dims())
            }
        }
    }

    /// Unwrap logit output.
    ///
    /// ## Panics
    ///
    /// If this is [`DecoderOutput::Tokens`].
    #[must_use]
    pub fn into_logits(self) -> Tensor<B, 4> {
        match self {
            DecoderOutput::Logits(x) => x,
            DecoderOutput::Tokens(x) => {
                panic!("expected decoder logits, found tokens: {:?}", x.dims())
            }
        }
    }
}

/// One decoder stage.
#[derive(Module, Debug)]
pub struct DecoderLayer<B: Backend> {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Fusion projection, ``d_concat -> d_model``.
    pub concat_linear: Linear<B>,

    /// First refinement block.
    pub former_1: EfficientTransformerBlock<B>,

    /// Second refinement block.
    pub former_2: EfficientTransformerBlock<B>,

    /// Upsampling tail.
    pub layer_up: DecoderUpsample<B>,
}

impl<B: Backend> DecoderLayerMeta for DecoderLayer<B> {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn is_last(&self) -> bool {
        matches!(self.layer_up, DecoderUpsample::Segment(_))
    }

    fn d_concat(&self) -> usize {
        self.concat_linear.weight.dims()[0]
    }

    fn d_model(&self) -> usize {
        self.concat_linear.weight.dims()[1]
    }

    fn d_output(&self) -> usize {
        match &self.layer_up {
            DecoderUpsample::Expand(layer) => layer.d_output(),
            DecoderUpsample::Segment(head) => head.num_classes(),
        }
    }
}

impl<B: Backend> ReinitParams for DecoderLayer<B> {
    fn reinit_params(self) -> Self {
        Self {
            input_resolution: self.input_resolution,
            concat_linear: self.concat_linear.reinit_params(),
            former_1: self.former_1.reinit_params(),
            former_2: self.former_2.reinit_params(),
            layer_up: self.layer_up.reinit_params(),
        }
    }
}

impl<B: Backend> DecoderLayer<B> {
    /// Apply the decoder stage.
    ///
    /// Without a skip input, only the upsampling tail runs (the terminal
    /// classifier is skipped), yielding tokens.
    ///
    /// ## Arguments
    ///
    /// * `x` - Tokens of shape ``(B, H * W, C)``.
    /// * `skip` - Optional encoder features of shape ``(B, H, W, C_skip)``;
    ///   ``C + C_skip`` must equal `d_concat`.
    ///
    /// ## Returns
    ///
    /// * [`DecoderOutput::Logits`] for the terminal stage with a skip input,
    ///   [`DecoderOutput::Tokens`] otherwise.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        skip: Option<Tensor<B, 4>>,
    ) -> DecoderOutput<B> {
        let skip = match skip {
            Some(skip) => skip,
            None => {
                return DecoderOutput::Tokens(match &self.layer_up {
                    DecoderUpsample::Expand(layer) => layer.forward(x),
                    DecoderUpsample::Segment(head) => head.expand.forward(x),
                });
            }
        };

        let [h, w] = self.input_resolution;

        static SKIP_CONTRACT: ShapeContract =
            shape_contract!("batch", "height", "width", "d_skip");
        let [b, d_skip] = SKIP_CONTRACT.unpack_shape(
            &skip.dims(),
            &["batch", "d_skip"],
            &[("height", h), ("width", w)],
        );

        static TOKEN_CONTRACT: ShapeContract =
            shape_contract!("batch", "height" * "width", "channels");
        let [d_x] = TOKEN_CONTRACT.unpack_shape(
            &x.dims(),
            &["channels"],
            &[("batch", b), ("height", h), ("width", w)],
        );

        let x = Tensor::cat(vec![x, skip.reshape([b, h * w, d_skip])], 2);
        TOKEN_CONTRACT.assert_shape(
            &[b, h * w, d_x + d_skip],
            &[
                ("batch", b),
                ("height", h),
                ("width", w),
                ("channels", self.d_concat()),
            ],
        );

        let x = self.concat_linear.forward(x);
        let x = self.former_1.forward(x, [h, w]);
        let x = self.former_2.forward(x, [h, w]);

        let out = match &self.layer_up {
            DecoderUpsample::Expand(layer) => DecoderOutput::Tokens(layer.forward(x)),
            DecoderUpsample::Segment(head) => DecoderOutput::Logits(head.forward(x)),
        };

        run_every_nth!({
            let [out_h, out_w] = self.output_resolution();
            match &out {
                DecoderOutput::Tokens(x) => TOKEN_CONTRACT.assert_shape(
                    &x.dims(),
                    &[
                        ("batch", b),
                        ("height", out_h),
                        ("width", out_w),
                        ("channels", self.d_output()),
                    ],
                ),
                DecoderOutput::Logits(x) => {
                    static LOGIT_CONTRACT: ShapeContract =
                        shape_contract!("batch", "classes", "height", "width");
                    LOGIT_CONTRACT.assert_shape(
                        &x.dims(),
                        &[
                            ("batch", b),
                            ("classes", self.d_output()),
                            ("height", out_h),
                            ("width", out_w),
                        ],
                    )
                }
            }
        });

        out
    }
}
