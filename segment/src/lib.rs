mod common;
pub mod config;

use crate::{common::*, config::Config};
use atlas::Atlas;
use histoseg::{
    gradcam::{torch::TorchClassifier, Thresholds},
    pipeline::Pipeline,
};
use std::time::Instant;

pub fn start(config: Arc<Config>) -> Result<()> {
    let since = Instant::now();

    // load atlas
    let atlas_file = &config.input.atlas_file;
    let atlas = Atlas::open(atlas_file)
        .with_context(|| format!("failed to load atlas file '{}'", atlas_file.display()))?;
    let num_classes = atlas.classifier_classes.len();

    // load thresholds
    let thresholds = match &config.input.thresholds_file {
        Some(path) => Thresholds::open(path, &atlas.classifier_classes)
            .with_context(|| format!("failed to load thresholds file '{}'", path.display()))?,
        None => {
            warn!(
                "no thresholds file given, accept scores above {}",
                Thresholds::DEFAULT
            );
            Thresholds::uniform(num_classes, Thresholds::DEFAULT)
        }
    };

    // load model
    let model = &config.model;
    let classifier = TorchClassifier::open(
        &model.model_file,
        model.device,
        num_classes,
        model.final_layer.clone(),
        model.mean(),
        model.std(),
    )
    .with_context(|| format!("failed to load model file '{}'", model.model_file.display()))?;

    // segment
    let options = config.pipeline_options()?;
    let mut pipeline = Pipeline::new(options, &atlas, classifier, thresholds)?;
    let summary = pipeline.run()?;

    info!(
        "segmented {} images in {:?}",
        summary.num_images,
        since.elapsed()
    );
    Ok(())
}
