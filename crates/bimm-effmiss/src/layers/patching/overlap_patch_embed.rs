use crate::utility::results::expect_unwrap;
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{LayerNorm, LayerNormConfig, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for `OverlapPatchEmbed` modules.
pub trait OverlapPatchEmbedMeta {
    /// Input resolution (height, width).
    fn input_resolution(&self) -> [usize; 2];

    /// Input height.
    fn input_height(&self) -> usize {
        self.input_resolution()[0]
    }

    /// Input width.
    fn input_width(&self) -> usize {
        self.input_resolution()[1]
    }

    /// Input feature dimension size.
    fn d_input(&self) -> usize;

    /// Output feature dimension size.
    fn d_output(&self) -> usize;

    /// Convolution kernel size.
    fn patch_size(&self) -> usize;

    /// Convolution stride.
    fn stride(&self) -> usize;

    /// Convolution zero padding, per side.
    fn padding(&self) -> usize;

    /// Image resolution, measured in patches.
    ///
    /// ``(size + 2 * padding - patch_size) / stride + 1`` per axis.
    ///
    /// ## Panics
    ///
    /// If the padded input is smaller than `patch_size`.
    fn patches_resolution(&self) -> [usize; 2] {
        let k = self.patch_size();
        let s = self.stride();
        let p = self.padding();
        self.input_resolution().map(|size| match (size + 2 * p).checked_sub(k) {
            Some(span) => span / s + 1,
            None => panic!(
                "padded input size {} is smaller than patch_size {k}",
                size + 2 * p
            ),
        })
    }

    /// Total number of patches.
    fn num_patches(&self) -> usize {
        let [h, w] = self.patches_resolution();
        h * w
    }
}

/// Configuration for `OverlapPatchEmbed`.
#[derive(Config, Debug, Copy)]
pub struct OverlapPatchEmbedConfig {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Convolution kernel size.
    pub patch_size: usize,

    /// Convolution stride.
    pub stride: usize,

    /// Convolution zero padding, per side.
    pub padding: usize,

    /// Input feature dimension size.
    pub d_input: usize,

    /// Output feature dimension size.
    pub d_output: usize,
}

impl OverlapPatchEmbedMeta for OverlapPatchEmbedConfig {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn d_input(&self) -> usize {
        self.d_input
    }

    fn d_output(&self) -> usize {
        self.d_output
    }

    fn patch_size(&self) -> usize {
        self.patch_size
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn padding(&self) -> usize {
        self.padding
    }
}

impl OverlapPatchEmbedConfig {
    /// Check the config, without allocating a module.
    pub fn validate(&self) -> anyhow::Result<()> {
        let [h, w] = self.input_resolution;
        if self.patch_size == 0 || self.stride == 0 {
            anyhow::bail!("patch_size and stride must be non-zero: {self:?}");
        }
        if self.d_input == 0 || self.d_output == 0 {
            anyhow::bail!("feature dimensions must be non-zero: {self:?}");
        }
        if h + 2 * self.padding < self.patch_size || w + 2 * self.padding < self.patch_size {
            anyhow::bail!("padded input resolution is smaller than patch_size: {self:?}");
        }
        Ok(())
    }

    /// Initialize an `OverlapPatchEmbed` module.
    ///
    /// ## Panics
    ///
    /// If [`Self::validate`] fails.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> OverlapPatchEmbed<B> {
        expect_unwrap(self.validate());

        let kernel = [self.patch_size, self.patch_size];

        OverlapPatchEmbed {
            input_resolution: self.input_resolution,
            stride: self.stride,
            padding: self.padding,
            projection: Conv2dConfig::new([self.d_input, self.d_output], kernel)
                .with_stride([self.stride, self.stride])
                .with_padding(PaddingConfig2d::Explicit(self.padding, self.padding))
                .init(device),
            norm: LayerNormConfig::new(self.d_output).init(device),
        }
    }
}

/// Overlapping patch embedding.
///
/// A strided convolution whose kernel is larger than its stride, so that
/// neighboring patches share pixels; followed by a flatten to tokens and a
/// layer normalization.
#[derive(Module, Debug)]
pub struct OverlapPatchEmbed<B: Backend> {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Convolution stride.
    pub stride: usize,

    /// Convolution zero padding, per side.
    pub padding: usize,

    /// Convolutional layer for patch projection.
    pub projection: Conv2d<B>,

    /// Patch normalization layer.
    pub norm: LayerNorm<B>,
}

impl<B: Backend> OverlapPatchEmbedMeta for OverlapPatchEmbed<B> {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn d_input(&self) -> usize {
        self.projection.weight.dims()[1]
    }

    fn d_output(&self) -> usize {
        self.projection.weight.dims()[0]
    }

    fn patch_size(&self) -> usize {
        self.projection.weight.dims()[2]
    }

    fn stride(&self) -> usize {
        self.stride
    }

    fn padding(&self) -> usize {
        self.padding
    }
}

impl<B: Backend> OverlapPatchEmbed<B> {
    /// Apply the `OverlapPatchEmbed` module to an input tensor.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape ``(B, d_input, H, W)``.
    ///
    /// ## Returns
    ///
    /// * Tokens of shape ``(B, H' * W', d_output)``, and ``[H', W']``.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 4>,
    ) -> (Tensor<B, 3>, [usize; 2]) {
        static INPUT_CONTRACT: ShapeContract =
            shape_contract!("batch", "d_input", "height", "width");
        let [batch] = INPUT_CONTRACT.unpack_shape(
            &x.dims(),
            &["batch"],
            &[
                ("d_input", self.d_input()),
                ("height", self.input_height()),
                ("width", self.input_width()),
            ],
        );

        let x = self.projection.forward(x);
        let [_, _, h, w] = x.dims();

        let x = x.flatten(2, 3).swap_dims(1, 2);
        let x = self.norm.forward(x);
        run_every_nth!({
            static OUTPUT_CONTRACT: ShapeContract =
                shape_contract!("batch", "num_patches", "d_output");
            OUTPUT_CONTRACT.assert_shape(
                &x.dims(),
                &[
                    ("batch", batch),
                    ("num_patches", self.num_patches()),
                    ("d_output", self.d_output()),
                ],
            );
        });

        (x, [h, w])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData};

    #[test]
    fn test_overlap_patch_embed_meta() {
        let config = OverlapPatchEmbedConfig::new([224, 224], 7, 4, 3, 3, 64);

        assert_eq!(config.input_resolution(), [224, 224]);
        assert_eq!(config.input_height(), 224);
        assert_eq!(config.input_width(), 224);
        assert_eq!(config.patch_size(), 7);
        assert_eq!(config.stride(), 4);
        assert_eq!(config.padding(), 3);
        assert_eq!(config.d_input(), 3);
        assert_eq!(config.d_output(), 64);
        assert_eq!(config.patches_resolution(), [56, 56]);
        assert_eq!(config.num_patches(), 56 * 56);

        let device = Default::default();
        let module = config.init::<NdArray>(&device);

        assert_eq!(module.input_resolution(), [224, 224]);
        assert_eq!(module.patch_size(), 7);
        assert_eq!(module.stride(), 4);
        assert_eq!(module.padding(), 3);
        assert_eq!(module.d_input(), 3);
        assert_eq!(module.d_output(), 64);
        assert_eq!(module.patches_resolution(), [56, 56]);
    }

    #[test]
    fn test_stage_resolutions() {
        // The encoder's later stages: kernel 3, stride 2, padding 1.
        for (input, expected) in [(56, 28), (28, 14), (14, 7), (7, 4)] {
            let config = OverlapPatchEmbedConfig::new([input, input], 3, 2, 1, 8, 16);
            assert_eq!(config.patches_resolution(), [expected, expected]);
        }
    }

    #[should_panic(expected = "patch_size and stride must be non-zero")]
    #[test]
    fn test_overlap_patch_embed_zero_stride() {
        let config = OverlapPatchEmbedConfig::new([32, 32], 3, 0, 1, 3, 8);
        let _m = config.init::<NdArray>(&Default::default());
    }

    #[test]
    fn test_overlap_patch_embed_validate_small_input() {
        let config = OverlapPatchEmbedConfig::new([2, 8], 7, 4, 1, 3, 8);
        assert!(config.validate().is_err());
    }

    #[should_panic(expected = "padded input size 4 is smaller than patch_size 7")]
    #[test]
    fn test_patches_resolution_small_input() {
        let config = OverlapPatchEmbedConfig::new([2, 8], 7, 4, 1, 3, 8);
        let _ = config.patches_resolution();
    }

    #[test]
    fn test_overlap_patch_embed_forward() {
        let device = Default::default();
        let config = OverlapPatchEmbedConfig::new([32, 24], 7, 4, 3, 3, 16);
        let module = config.init::<NdArray>(&device);

        let input = Tensor::<NdArray, 4>::random(
            [2, 3, 32, 24],
            Distribution::Normal(0.0, 1.0),
            &device,
        );

        let (tokens, [h, w]) = module.forward(input);
        assert_eq!([h, w], [8, 6]);
        assert_eq!([h, w], config.patches_resolution());
        assert_eq!(tokens.dims(), [2, 8 * 6, 16]);
    }

    #[test]
    fn test_overlap_patch_embed_constant_input() {
        let device = Default::default();
        let config = OverlapPatchEmbedConfig::new([16, 16], 3, 2, 1, 4, 8);
        let module = config.init::<NdArray>(&device);

        let input = Tensor::<NdArray, 4>::from_data(
            TensorData::new(vec![1.0f32; 4 * 16 * 16], [1, 4, 16, 16]),
            &device,
        );

        let (tokens, hw) = module.forward(input);
        assert_eq!(hw, [8, 8]);
        assert_eq!(tokens.dims(), [1, 64, 8]);
    }

    #[should_panic]
    #[test]
    fn test_overlap_patch_embed_wrong_channels() {
        let device = Default::default();
        let module = OverlapPatchEmbedConfig::new([16, 16], 3, 2, 1, 4, 8).init::<NdArray>(&device);

        let input = Tensor::<NdArray, 4>::zeros([1, 3, 16, 16], &device);
        let _ = module.forward(input);
    }
}
