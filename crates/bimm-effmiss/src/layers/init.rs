//! # Parameter (Re-)Initialization Policy
//!
//! The decoder stages are initialized by kind rather than by burn's per-layer
//! defaults:
//!
//! | [`ParamKind`]                | Rule                               |
//! |------------------------------|------------------------------------|
//! | [`ParamKind::LinearWeight`]  | Xavier/Glorot uniform, ``gain=1``  |
//! | [`ParamKind::ConvWeight`]    | Xavier/Glorot uniform, ``gain=1``  |
//! | [`ParamKind::Bias`]          | zeros                              |
//! | [`ParamKind::NormScale`]     | ones                               |
//! | [`ParamKind::NormBias`]      | zeros                              |
//!
//! [`ReinitParams`] walks a module and replaces every parameter with a fresh
//! one drawn from the rule for its kind.

use burn::module::Param;
use burn::nn::conv::Conv2d;
use burn::nn::{Initializer, LayerNorm, Linear};
use burn::prelude::{Backend, Tensor};

/// The role of a parameter tensor; selects its initialization rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamKind {
    /// ``Linear`` weight, shape ``[d_input, d_output]``.
    LinearWeight,

    /// ``Conv2d`` weight, shape ``[c_out, c_in / groups, k_h, k_w]``.
    ConvWeight,

    /// ``Linear`` or ``Conv2d`` bias.
    Bias,

    /// Normalization scale (``gamma``).
    NormScale,

    /// Normalization shift (``beta``).
    NormBias,
}

impl ParamKind {
    /// The initializer for this kind.
    #[must_use]
    pub fn initializer(&self) -> Initializer {
        match self {
            ParamKind::LinearWeight | ParamKind::ConvWeight => {
                Initializer::XavierUniform { gain: 1.0 }
            }
            ParamKind::Bias | ParamKind::NormBias => Initializer::Zeros,
            ParamKind::NormScale => Initializer::Ones,
        }
    }

    /// Build a fresh parameter of this kind.
    ///
    /// ## Arguments
    ///
    /// * `shape` - The parameter shape.
    /// * `fans` - ``(fan_in, fan_out)``; required by the weight kinds.
    /// * `device` - The target device.
    #[must_use]
    pub fn init<B: Backend, const D: usize>(
        &self,
        shape: [usize; D],
        fans: Option<(usize, usize)>,
        device: &B::Device,
    ) -> Param<Tensor<B, D>> {
        let (fan_in, fan_out) = match fans {
            Some((fan_in, fan_out)) => (Some(fan_in), Some(fan_out)),
            None => (None, None),
        };
        self.initializer()
            .init_with(shape, fan_in, fan_out, device)
    }
}

/// Re-initialize every parameter of a module according to its [`ParamKind`].
pub trait ReinitParams: Sized {
    /// Consume the module, returning it with freshly initialized parameters.
    #[must_use]
    fn reinit_params(self) -> Self;
}

impl<T: ReinitParams> ReinitParams for Option<T> {
    fn reinit_params(self) -> Self {
        self.map(ReinitParams::reinit_params)
    }
}

impl<T: ReinitParams> ReinitParams for Vec<T> {
    fn reinit_params(self) -> Self {
        self.into_iter().map(ReinitParams::reinit_params).collect()
    }
}

impl<B: Backend> ReinitParams for Linear<B> {
    fn reinit_params(self) -> Self {
        let mut linear = self;
        let device = linear.weight.device();
        let [d_input, d_output] = linear.weight.dims();

        linear.weight =
            ParamKind::LinearWeight.init([d_input, d_output], Some((d_input, d_output)), &device);
        linear.bias = linear
            .bias
            .map(|_| ParamKind::Bias.init([d_output], None, &device));

        linear
    }
}

impl<B: Backend> ReinitParams for Conv2d<B> {
    fn reinit_params(self) -> Self {
        let mut conv = self;
        let device = conv.weight.device();
        let shape = conv.weight.dims();
        let [c_out, c_in_per_group, k_h, k_w] = shape;

        // Matches torch's ``_calculate_fan_in_and_fan_out``; groups are not factored in.
        let receptive = k_h * k_w;
        let fans = (c_in_per_group * receptive, c_out * receptive);

        conv.weight = ParamKind::ConvWeight.init(shape, Some(fans), &device);
        conv.bias = conv
            .bias
            .map(|_| ParamKind::Bias.init([c_out], None, &device));

        conv
    }
}

impl<B: Backend> ReinitParams for LayerNorm<B> {
    fn reinit_params(self) -> Self {
        let mut norm = self;
        let device = norm.gamma.device();
        let [d] = norm.gamma.dims();

        norm.gamma = ParamKind::NormScale.init([d], None, &device);
        norm.beta = ParamKind::NormBias.init([d], None, &device);

        norm
    }
}
