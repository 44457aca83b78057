//! Smoke test: build an Efficient MISSFormer and segment one random image.
//!
//! ```text
//! effmiss_smoke [CONFIG.json]
//! ```
//!
//! Set `RUST_LOG=bimm_effmiss=trace` to see per-stage shapes.

use bimm_effmiss::models::missformer::model::{EffMissFormerConfig, EffMissFormerMeta};
use burn::backend::NdArray;
use burn::config::Config;
use burn::prelude::Tensor;
use burn::tensor::Distribution;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type B = NdArray;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "effmiss_smoke=info,bimm_effmiss=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading config from {path}");
            EffMissFormerConfig::load(&path)
                .map_err(|err| anyhow::anyhow!("failed to load {path}: {err:?}"))?
        }
        None => EffMissFormerConfig::new(9),
    };

    let device = Default::default();
    let model = config.try_init::<B>(&device)?;

    let [h, w] = model.input_resolution();
    info!(
        num_classes = model.num_classes(),
        stages = model.num_stages(),
        "Model initialized for {h}x{w} inputs"
    );

    let image = Tensor::<B, 4>::random([1, 3, h, w], Distribution::Normal(0.0, 1.0), &device);
    let logits = model.try_forward(image)?;

    let finite = logits
        .to_data()
        .to_vec::<f32>()
        .map_err(|err| anyhow::anyhow!("{err:?}"))?
        .iter()
        .all(|v| v.is_finite());

    info!(shape = ?logits.dims(), finite, "Forward pass complete");
    if !finite {
        anyhow::bail!("forward pass produced non-finite logits");
    }

    Ok(())
}
