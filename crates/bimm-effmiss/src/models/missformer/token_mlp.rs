//! # Token Mixing Feed-Forward Sublayers

use crate::layers::init::ReinitParams;
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{Gelu, LayerNorm, LayerNormConfig, Linear, LinearConfig, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};
use serde::{Deserialize, Serialize};

/// Selects the feed-forward sublayer of a transformer block.
///
/// Parses from, and displays as, ``"mix"``, ``"mix_skip"`` and ``"mlp"``.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TokenMlpMode {
    /// ``fc2(gelu(dwconv(fc1(x))))``.
    Mix,

    /// ``fc2(gelu(norm(dwconv(fc1(x)) + fc1(x))))``.
    #[default]
    MixSkip,

    /// ``fc2(gelu(fc1(x)))``; no spatial mixing.
    Mlp,
}

/// Common introspection interface for `TokenMlp`.
pub trait TokenMlpMeta {
    /// Input (and output) feature dimension size.
    fn d_input(&self) -> usize;

    /// Hidden feature dimension size.
    fn d_hidden(&self) -> usize;

    /// The sublayer variant.
    fn mode(&self) -> TokenMlpMode;
}

/// Configuration for `TokenMlp`.
#[derive(Config, Debug)]
pub struct TokenMlpConfig {
    /// Input (and output) feature dimension size.
    pub d_input: usize,

    /// Hidden feature dimension size.
    pub d_hidden: usize,

    /// The sublayer variant.
    #[config(default = "TokenMlpMode::MixSkip")]
    pub mode: TokenMlpMode,
}

impl TokenMlpMeta for TokenMlpConfig {
    fn d_input(&self) -> usize {
        self.d_input
    }

    fn d_hidden(&self) -> usize {
        self.d_hidden
    }

    fn mode(&self) -> TokenMlpMode {
        self.mode
    }
}

impl TokenMlpConfig {
    /// Initialize a `TokenMlp`.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> TokenMlp<B> {
        assert!(
            self.d_input > 0 && self.d_hidden > 0,
            "TokenMlp dimensions must be non-zero: {self:?}"
        );

        let dwconv = match self.mode {
            TokenMlpMode::Mix | TokenMlpMode::MixSkip => {
                Some(DepthwiseConvConfig::new(self.d_hidden).init(device))
            }
            TokenMlpMode::Mlp => None,
        };
        let skip_norm = match self.mode {
            TokenMlpMode::MixSkip => Some(LayerNormConfig::new(self.d_hidden).init(device)),
            _ => None,
        };

        TokenMlp {
            fc1: LinearConfig::new(self.d_input, self.d_hidden).init(device),
            dwconv,
            skip_norm,
            act: Gelu::new(),
            fc2: LinearConfig::new(self.d_hidden, self.d_input).init(device),
        }
    }
}

/// Token feed-forward sublayer.
///
/// The variant is fixed at construction; see [`TokenMlpMode`].
#[derive(Module, Debug)]
pub struct TokenMlp<B: Backend> {
    /// Input projection.
    pub fc1: Linear<B>,

    /// Spatial mixing; absent for [`TokenMlpMode::Mlp`].
    pub dwconv: Option<DepthwiseConv<B>>,

    /// Residual normalization; present only for [`TokenMlpMode::MixSkip`].
    pub skip_norm: Option<LayerNorm<B>>,

    /// Activation.
    pub act: Gelu,

    /// Output projection.
    pub fc2: Linear<B>,
}

impl<B: Backend> TokenMlpMeta for TokenMlp<B> {
    fn d_input(&self) -> usize {
        self.fc1.weight.dims()[0]
    }

    fn d_hidden(&self) -> usize {
        self.fc1.weight.dims()[1]
    }

    fn mode(&self) -> TokenMlpMode {
        match (&self.dwconv, &self.skip_norm) {
            (None, _) => TokenMlpMode::Mlp,
            (Some(_), None) => TokenMlpMode::Mix,
            (Some(_), Some(_)) => TokenMlpMode::MixSkip,
        }
    }
}

impl<B: Backend> ReinitParams for TokenMlp<B> {
    fn reinit_params(self) -> Self {
        Self {
            fc1: self.fc1.reinit_params(),
            dwconv: self.dwconv.reinit_params(),
            skip_norm: self.skip_norm.reinit_params(),
            act: self.act,
            fc2: self.fc2.reinit_params(),
        }
    }
}

impl<B: Backend> TokenMlp<B> {
    /// Apply the sublayer.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape ``(B, H * W, d_input)``.
    /// * `resolution` - ``[H, W]``; used by the spatial mixing variants.
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
        let env = [("height", h), ("width", w), ("d_input", self.d_input())];
        run_every_nth!(CONTRACT.assert_shape(&x.dims(), &env));

        let x = self.fc1.forward(x);

        let x = match (&self.dwconv, &self.skip_norm) {
            (None, _) => x,
            (Some(dwconv), None) => dwconv.forward(x, resolution),
            (Some(dwconv), Some(norm)) => norm.forward(dwconv.forward(x.clone(), resolution) + x),
        };

        let x = self.act.forward(x);
        let x = self.fc2.forward(x);

        run_every_nth!(CONTRACT.assert_shape(&x.dims(), &env));
        x
    }
}

/// Configuration for `DepthwiseConv`.
#[derive(Config, Debug)]
pub struct DepthwiseConvConfig {
    /// Feature dimension size.
    pub d_input: usize,

    /// Kernel size; padding keeps the resolution.
    #[config(default = 3)]
    pub kernel_size: usize,
}

impl DepthwiseConvConfig {
    /// Initialize a `DepthwiseConv`.
    #[must_use]
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> DepthwiseConv<B> {
        assert!(
            self.kernel_size % 2 == 1,
            "kernel_size must be odd: {self:?}"
        );
        let pad = self.kernel_size / 2;

        DepthwiseConv {
            conv: Conv2dConfig::new(
                [self.d_input, self.d_input],
                [self.kernel_size, self.kernel_size],
            )
            .with_padding(PaddingConfig2d::Explicit(pad, pad))
            .with_groups(self.d_input)
            .init(device),
        }
    }
}

/// Depthwise convolution over a token sequence.
#[derive(Module, Debug)]
pub struct DepthwiseConv<B: Backend> {
    /// Per-channel spatial convolution.
    pub conv: Conv2d<B>,
}

impl<B: Backend> ReinitParams for DepthwiseConv<B> {
    fn reinit_params(self) -> Self {
        Self {
            conv: self.conv.reinit_params(),
        }
    }
}

impl<B: Backend> DepthwiseConv<B> {
    /// Apply the convolution.
    ///
    /// ## Arguments
    ///
    /// * `x` - Input tensor of shape ``(B, H * W, C)``.
    /// * `resolution` - ``[H, W]``.
    ///
    /// ## Returns
    ///
    /// * Output tensor of shape ``(B, H * W, C)``.
    #[must_use]
    pub fn forward(
        &self,
        x: Tensor<B, 3>,
        resolution: [usize; 2],
    ) -> Tensor<B, 3> {
        let [h, w] = resolution;
        static CONTRACT: ShapeContract = shape_contract!("batch", "height" * "width", "channels");
        let [b, c] = CONTRACT.unpack_shape(
            &x.dims(),
            &["batch", "channels"],
            &[("height", h), ("width", w)],
        );

        let x = x.swap_dims(1, 2).reshape([b, c, h, w]);
        let x = self.conv.forward(x);
        x.flatten(2, 3).swap_dims(1, 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;
    use burn::tensor::{Distribution, TensorData, Tolerance};
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_token_mlp_mode_names() {
        assert_eq!(TokenMlpMode::default(), TokenMlpMode::MixSkip);

        assert_eq!(TokenMlpMode::Mix.to_string(), "mix");
        assert_eq!(TokenMlpMode::MixSkip.to_string(), "mix_skip");
        assert_eq!(TokenMlpMode::Mlp.to_string(), "mlp");

        for mode in TokenMlpMode::iter() {
            assert_eq!(TokenMlpMode::from_str(&mode.to_string()).unwrap(), mode);
        }
        assert!(TokenMlpMode::from_str("swiglu").is_err());
    }

    #[test]
    fn test_token_mlp_mode_serde() {
        assert_eq!(
            serde_json::to_string(&TokenMlpMode::MixSkip).unwrap(),
            "\"mix_skip\""
        );
        assert_eq!(
            serde_json::from_str::<TokenMlpMode>("\"mlp\"").unwrap(),
            TokenMlpMode::Mlp
        );
    }

    #[test]
    fn test_token_mlp_meta() {
        let device = Default::default();

        for mode in TokenMlpMode::iter() {
            let config = TokenMlpConfig::new(8, 32).with_mode(mode);
            assert_eq!(config.d_input(), 8);
            assert_eq!(config.d_hidden(), 32);
            assert_eq!(config.mode(), mode);

            let mlp: TokenMlp<NdArray> = config.init(&device);
            assert_eq!(mlp.d_input(), 8);
            assert_eq!(mlp.d_hidden(), 32);
            assert_eq!(mlp.mode(), mode);
        }
    }

    #[test]
    fn test_token_mlp_forward() {
        let device = Default::default();

        let b = 2;
        let h = 3;
        let w = 4;
        let d = 6;

        for mode in TokenMlpMode::iter() {
            let mlp: TokenMlp<NdArray> = TokenMlpConfig::new(d, 4 * d)
                .with_mode(mode)
                .init(&device);

            let x = Tensor::random([b, h * w, d], Distribution::Normal(0., 1.), &device);
            let y = mlp.forward(x, [h, w]);
            assert_eq!(y.dims(), [b, h * w, d]);
        }
    }

    #[test]
    fn test_mlp_mode_ignores_layout() {
        let device = Default::default();
        let mlp: TokenMlp<NdArray> = TokenMlpConfig::new(4, 8)
            .with_mode(TokenMlpMode::Mlp)
            .init(&device);

        let x = Tensor::random([1, 12, 4], Distribution::Normal(0., 1.), &device);
        let a = mlp.forward(x.clone(), [3, 4]);
        let b = mlp.forward(x, [2, 6]);

        a.to_data()
            .assert_approx_eq(&b.to_data(), Tolerance::<f64>::default());
    }

    #[test]
    fn test_depthwise_conv_identity_kernel() {
        let device = Default::default();

        let c = 3;
        let h = 4;
        let w = 5;

        let mut dw: DepthwiseConv<NdArray> = DepthwiseConvConfig::new(c).init(&device);

        // Centered delta kernel, zero bias: identity.
        let mut kernel = vec![0.0f32; c * 9];
        for ch in 0..c {
            kernel[ch * 9 + 4] = 1.0;
        }
        dw.conv.weight = burn::module::Param::from_tensor(Tensor::from_data(
            TensorData::new(kernel, [c, 1, 3, 3]),
            &device,
        ));
        dw.conv.bias = Some(burn::module::Param::from_tensor(Tensor::zeros([c], &device)));

        let x = Tensor::<NdArray, 3>::random([2, h * w, c], Distribution::Normal(0., 1.), &device);
        let y = dw.forward(x.clone(), [h, w]);

        y.to_data()
            .assert_approx_eq(&x.to_data(), Tolerance::<f64>::absolute(1e-5));
    }

    #[should_panic]
    #[test]
    fn test_depthwise_conv_wrong_layout() {
        let device = Default::default();
        let dw: DepthwiseConv<NdArray> = DepthwiseConvConfig::new(2).init(&device);
        let x = Tensor::zeros([1, 10, 2], &device);
        let _ = dw.forward(x, [3, 3]);
    }
}
