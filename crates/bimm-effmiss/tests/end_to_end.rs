use bimm_effmiss::models::missformer::decoder::DecoderStageChannels;
use bimm_effmiss::models::missformer::encoder::EncoderStageConfig;
use bimm_effmiss::models::missformer::model::{EffMissFormerConfig, EffMissFormerMeta};
use bimm_effmiss::models::missformer::token_mlp::TokenMlpMode;
use burn::backend::{Autodiff, NdArray};
use burn::prelude::{Backend, Tensor};
use burn::tensor::Distribution;

fn assert_finite<B: Backend>(tensor: &Tensor<B, 4>) {
    let values = tensor.to_data().to_vec::<f32>().unwrap();
    assert!(
        values.iter().all(|v| v.is_finite()),
        "non-finite logits in {:?}",
        tensor.dims()
    );
}

fn small_config(num_classes: usize) -> EffMissFormerConfig {
    EffMissFormerConfig::new(num_classes)
        .with_image_size(64)
        .with_encoder_stages(vec![
            EncoderStageConfig::new(8, 8, 8, 1)
                .with_patch_size(7)
                .with_stride(4)
                .with_padding(3),
            EncoderStageConfig::new(16, 16, 16, 1),
            EncoderStageConfig::new(32, 32, 32, 1),
            EncoderStageConfig::new(32, 32, 32, 1),
        ])
        .with_decoder_channels(vec![
            DecoderStageChannels::new(4, 8, 8, 8),
            DecoderStageChannels::new(16, 16, 16, 16),
            DecoderStageChannels::new(24, 32, 32, 32),
            DecoderStageChannels::new(32, 32, 32, 32),
        ])
}

#[test]
fn reference_model_segments_rgb_and_grayscale() {
    let device = Default::default();
    let model = EffMissFormerConfig::new(9)
        .with_head_count(1)
        .with_token_mlp_mode(TokenMlpMode::MixSkip)
        .init::<NdArray>(&device);
    assert_eq!(model.num_classes(), 9);
    assert_eq!(model.input_resolution(), [224, 224]);

    let distribution = Distribution::Normal(0.0, 1.0);

    let rgb = Tensor::random([1, 3, 224, 224], distribution, &device);
    let logits = model.forward(rgb);
    assert_eq!(logits.dims(), [1, 9, 224, 224]);
    assert_finite(&logits);

    let gray = Tensor::random([1, 1, 224, 224], distribution, &device);
    let logits = model.forward(gray);
    assert_eq!(logits.dims(), [1, 9, 224, 224]);
    assert_finite(&logits);
}

#[test]
fn batch_size_is_preserved() {
    let device = Default::default();
    let distribution = Distribution::Normal(0.0, 1.0);

    for mode in [TokenMlpMode::Mix, TokenMlpMode::MixSkip, TokenMlpMode::Mlp] {
        let model = small_config(4)
            .with_token_mlp_mode(mode)
            .init::<NdArray>(&device);

        for batch in [1, 3] {
            let x = Tensor::random([batch, 3, 64, 64], distribution, &device);
            let logits = model.try_forward(x).unwrap();
            assert_eq!(logits.dims(), [batch, 4, 64, 64]);
            assert_finite(&logits);
        }
    }
}

#[test]
fn config_round_trips_through_json() {
    let config = small_config(6)
        .with_head_count(2)
        .with_token_mlp_mode(TokenMlpMode::Mix);

    let json = serde_json::to_string(&config).unwrap();
    assert!(json.contains("\"mix\""));

    let restored: EffMissFormerConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(restored.num_classes, 6);
    assert_eq!(restored.head_count, 2);
    assert_eq!(restored.token_mlp_mode, TokenMlpMode::Mix);
    assert_eq!(restored.image_size, 64);
    assert_eq!(restored.decoder_channels, config.decoder_channels);
    assert_eq!(restored.encoder_stages.len(), 4);
    assert!(restored.validate().is_ok());
}

#[test]
fn gradients_reach_both_ends() {
    type B = Autodiff<NdArray>;
    let device = Default::default();
    let model = small_config(2).init::<B>(&device);

    let x = Tensor::<B, 4>::random([1, 3, 64, 64], Distribution::Normal(0.0, 1.0), &device);
    let grads = model.forward(x).sum().backward();

    let encoder_grad = model.encoder.stages[0]
        .patch_embed
        .projection
        .weight
        .grad(&grads);
    assert!(encoder_grad.is_some());

    let decoder_grad = model.decoders[0].concat_linear.weight.grad(&grads);
    assert!(decoder_grad.is_some());
}
