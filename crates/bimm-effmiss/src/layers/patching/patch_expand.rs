use crate::layers::init::ReinitParams;
use crate::layers::patching::rearrange::channels_to_space;
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};

/// Common introspection interface for patch expansion modules.
pub trait PatchExpandMeta {
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

    /// Spatial expansion factor, per axis.
    fn patch_scale(&self) -> usize;

    /// Output resolution (height, width).
    fn output_resolution(&self) -> [usize; 2] {
        let [h, w] = self.input_resolution();
        [h * self.patch_scale(), w * self.patch_scale()]
    }

    /// Output feature dimension size.
    fn d_output(&self) -> usize;
}

/// Configuration for [`PatchExpand`].
#[derive(Config, Debug, Copy)]
pub struct PatchExpandConfig {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Input feature dimension size.
    pub d_input: usize,

    /// Channel expansion applied before rearrangement; ``2`` or ``1`` (no projection).
    #[config(default = 2)]
    pub dim_scale: usize,
}

impl PatchExpandMeta for PatchExpandConfig {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn d_input(&self) -> usize {
        self.d_input
    }

    fn patch_scale(&self) -> usize {
        2
    }

    fn d_output(&self) -> usize {
        self.d_input * self.dim_scale / 4
    }
}

impl PatchExpandConfig {
    /// Initialize a [`PatchExpand`] module.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> PatchExpand<B> {
        assert!(
            self.dim_scale == 1 || self.dim_scale == 2,
            "dim_scale must be 1 or 2: {self:?}"
        );
        assert!(
            (self.d_input * self.dim_scale) % 4 == 0 && self.d_output() > 0,
            "expanded feature dimension must be divisible by 4: {self:?}"
        );

        PatchExpand {
            input_resolution: self.input_resolution,
            d_input: self.d_input,
            expand: match self.dim_scale {
                2 => Some(
                    LinearConfig::new(self.d_input, 2 * self.d_input)
                        .with_bias(false)
                        .init(device),
                ),
                _ => None,
            },
            norm: LayerNormConfig::new(self.d_output()).init(device),
        }
    }
}

/// ×2 patch expansion.
///
/// Accepts ``(B, H * W, C)`` inputs, and then:
/// - Projects ``C -> 2 * C`` with a bias-free linear layer (if enabled).
/// - Redistributes each group of 4 channels into a ``2x2`` spatial block.
/// - Applies layer normalization.
/// - Yields output of shape ``(B, 2H * 2W, C / 2)``.
#[derive(Module, Debug)]
pub struct PatchExpand<B: Backend> {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Input feature dimension size.
    pub d_input: usize,

    /// Channel expansion; absent when ``dim_scale == 1``.
    pub expand: Option<Linear<B>>,

    /// Output normalization.
    pub norm: LayerNorm<B>,
}

impl<B: Backend> PatchExpandMeta for PatchExpand<B> {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn d_input(&self) -> usize {
        self.d_input
    }

    fn patch_scale(&self) -> usize {
        2
    }

    fn d_output(&self) -> usize {
        self.norm.gamma.dims()[0]
    }
}

impl<B: Backend> ReinitParams for PatchExpand<B> {
    fn reinit_params(self) -> Self {
        Self {
            expand: self.expand.reinit_params(),
            norm: self.norm.reinit_params(),
            ..self
        }
    }
}

impl<B: Backend> PatchExpand<B> {
    /// Apply the expansion.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape ``(B, H * W, d_input)``.
    ///
    /// ## Returns
    ///
    /// * Output tensor of shape ``(B, 2H * 2W, d_output)``.
    ///
    /// ## Panics
    ///
    /// If the token count is not ``H * W``.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let [h, w] = self.input_resolution;
        static INPUT_CONTRACT: ShapeContract =
            shape_contract!("batch", "height" * "width", "d_input");
        let [b] = INPUT_CONTRACT.unpack_shape(
            &x.dims(),
            &["batch"],
            &[("height", h), ("width", w), ("d_input", self.d_input)],
        );

        let x = match self.expand {
            Some(ref expand) => expand.forward(x),
            None => x,
        };
        let c = x.dims()[2];

        let x = channels_to_space(x.reshape([b, h, w, c]), 2);
        let x = x.reshape([b, 4 * h * w, c / 4]);

        let x = self.norm.forward(x);
        run_every_nth!({
            static OUTPUT_CONTRACT: ShapeContract =
                shape_contract!("batch", "height" * "width", "d_output");
            let [out_h, out_w] = self.output_resolution();
            OUTPUT_CONTRACT.assert_shape(
                &x.dims(),
                &[
                    ("batch", b),
                    ("height", out_h),
                    ("width", out_w),
                    ("d_output", self.d_output()),
                ],
            );
        });

        x
    }
}

/// Configuration for [`FinalPatchExpand`].
#[derive(Config, Debug, Copy)]
pub struct FinalPatchExpandConfig {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Input feature dimension size.
    pub d_input: usize,

    /// Spatial expansion factor, per axis.
    #[config(default = 4)]
    pub dim_scale: usize,
}

impl PatchExpandMeta for FinalPatchExpandConfig {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn d_input(&self) -> usize {
        self.d_input
    }

    fn patch_scale(&self) -> usize {
        self.dim_scale
    }

    fn d_output(&self) -> usize {
        self.d_input
    }
}

impl FinalPatchExpandConfig {
    /// Initialize a [`FinalPatchExpand`] module.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> FinalPatchExpand<B> {
        assert!(self.dim_scale > 0, "dim_scale must be non-zero: {self:?}");
        let area = self.dim_scale * self.dim_scale;

        FinalPatchExpand {
            input_resolution: self.input_resolution,
            dim_scale: self.dim_scale,
            expand: LinearConfig::new(self.d_input, area * self.d_input)
                .with_bias(false)
                .init(device),
            norm: LayerNormConfig::new(self.d_input).init(device),
        }
    }
}

/// Final ×``dim_scale`` patch expansion.
///
/// Accepts ``(B, H * W, C)`` inputs, projects ``C -> dim_scale² * C``, spreads
/// the channels over a ``dim_scale x dim_scale`` block, and normalizes;
/// yielding ``(B, (dim_scale * H) * (dim_scale * W), C)``.
#[derive(Module, Debug)]
pub struct FinalPatchExpand<B: Backend> {
    /// Input resolution (height, width).
    pub input_resolution: [usize; 2],

    /// Spatial expansion factor, per axis.
    pub dim_scale: usize,

    /// Channel expansion.
    pub expand: Linear<B>,

    /// Output normalization.
    pub norm: LayerNorm<B>,
}

impl<B: Backend> PatchExpandMeta for FinalPatchExpand<B> {
    fn input_resolution(&self) -> [usize; 2] {
        self.input_resolution
    }

    fn d_input(&self) -> usize {
        self.expand.weight.dims()[0]
    }

    fn patch_scale(&self) -> usize {
        self.dim_scale
    }

    fn d_output(&self) -> usize {
        self.d_input()
    }
}

impl<B: Backend> ReinitParams for FinalPatchExpand<B> {
    fn reinit_params(self) -> Self {
        Self {
            expand: self.expand.reinit_params(),
            norm: self.norm.reinit_params(),
            ..self
        }
    }
}

impl<B: Backend> FinalPatchExpand<B> {
    /// Apply the expansion.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape ``(B, H * W, d_input)``.
    ///
    /// ## Returns
    ///
    /// * Output tensor of shape ``(B, (s * H) * (s * W), d_input)``.
    ///
    /// ## Panics
    ///
    /// If the token count is not ``H * W``.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let [h, w] = self.input_resolution;
        let d = self.d_input();
        let s = self.dim_scale;

        static INPUT_CONTRACT: ShapeContract =
            shape_contract!("batch", "height" * "width", "d_input");
        let [b] = INPUT_CONTRACT.unpack_shape(
            &x.dims(),
            &["batch"],
            &[("height", h), ("width", w), ("d_input", d)],
        );

        let x = self.expand.forward(x);
        // b, h * w, s * s * d

        let x = channels_to_space(x.reshape([b, h, w, s * s * d]), s);
        let x = x.reshape([b, s * s * h * w, d]);

        self.norm.forward(x)
    }
}
