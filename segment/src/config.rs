use crate::common::*;
use atlas::HttMode;
use histoseg::{
    pipeline::{InputMode, OverlapOptions, PipelineOptions, RunLevel, SaveOptions},
    stitch::AbsentClassPolicy,
};

pub use input::*;
pub use model::*;
pub use output::*;
pub use overlap::*;
pub use pipeline::*;

pub static CONFIG_VERSION: Lazy<VersionReq> = Lazy::new(|| VersionReq::parse("0.1.0").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(deserialize_with = "deserialize_version")]
    pub version: Version,
    pub input: InputConfig,
    pub model: ModelConfig,
    pub pipeline: PipelineConfig,
    pub output: OutputConfig,
    /// Whole-slide overlap stitching, disabled when absent.
    #[serde(default)]
    pub overlap: Option<OverlapConfig>,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let pipeline = &self.pipeline;
        RunLevel::try_from(pipeline.run_level)?;
        ensure!(pipeline.down_fac > 0.0, "down_fac must be positive");
        ensure!(
            pipeline.prob_clip > 0.0 && pipeline.prob_clip < 1.0,
            "prob_clip must lie in (0, 1)"
        );
        ensure!(
            self.model.std.iter().all(|&std| std > 0.0),
            "model normalization std must be positive"
        );

        if let Some(overlap) = &self.overlap {
            ensure!(
                self.input.mode == InputMode::Wsi,
                "overlap stitching requires the 'wsi' input mode"
            );
            ensure!(
                self.output.save.activation_maps,
                "overlap stitching reads saved activation maps, enable output.save.activation_maps"
            );
            ensure!(
                overlap.overlap_ratio >= 0.0 && overlap.overlap_ratio < 1.0,
                "overlap_ratio must lie in [0, 1)"
            );
        }
        Ok(())
    }

    /// The options of the segmentation pipeline.
    pub fn pipeline_options(&self) -> Result<PipelineOptions> {
        let Self {
            input,
            pipeline,
            output,
            overlap,
            ..
        } = self;

        Ok(PipelineOptions {
            input_dir: input.input_dir.clone(),
            input_mode: input.mode,
            gt_dir: input.gt_dir.clone(),
            out_dir: output.out_dir.clone(),
            tmp_dir: output.tmp_dir.clone(),
            crf_dir: pipeline.crf_dir.clone(),
            patch_size: [pipeline.patch_size[0].get(), pipeline.patch_size[1].get()],
            down_fac: pipeline.down_fac.raw(),
            batch_size: pipeline.batch_size,
            htt_mode: pipeline.htt_mode,
            run_level: RunLevel::try_from(pipeline.run_level)?,
            save: output.save,
            prob_clip: pipeline.prob_clip.raw() as f32,
            overlap: overlap.as_ref().map(|overlap| OverlapOptions {
                tile_size: [overlap.tile_size[0].get(), overlap.tile_size[1].get()],
                overlap_ratio: overlap.overlap_ratio.raw(),
                policy: overlap.absent_class_policy,
            }),
        })
    }
}

mod input {
    use super::*;

    /// Input images and annotations.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct InputConfig {
        /// The directory of png images to segment.
        pub input_dir: PathBuf,
        #[serde(default = "default_input_mode")]
        pub mode: InputMode,
        /// Ground-truth root, laid out as `<gt_dir>/<htt>/<file name>`.
        /// Evaluation is skipped when absent.
        #[serde(default)]
        pub gt_dir: Option<PathBuf>,
        /// The tissue atlas file.
        pub atlas_file: PathBuf,
        /// Optional per-class acceptance thresholds.
        #[serde(default)]
        pub thresholds_file: Option<PathBuf>,
    }

    fn default_input_mode() -> InputMode {
        InputMode::Patch
    }
}

mod model {
    use super::*;

    /// Patch classifier options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        /// TorchScript module returning `(features, logits)`.
        pub model_file: PathBuf,
        /// The device where the classifier runs on.
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
        /// The name of the final convolutional layer.
        pub final_layer: String,
        /// Per-channel normalization applied to `[0, 1]` scaled pixels.
        pub mean: [R64; 3],
        pub std: [R64; 3],
    }

    impl ModelConfig {
        pub fn mean(&self) -> [f32; 3] {
            self.mean.map(|value| value.raw() as f32)
        }

        pub fn std(&self) -> [f32; 3] {
            self.std.map(|value| value.raw() as f32)
        }
    }
}

mod pipeline {
    use super::*;

    /// Segmentation options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PipelineConfig {
        pub htt_mode: HttMode,
        /// 1: classification only, 2: up to class-specific activations,
        /// 3: full segmentation and evaluation.
        #[serde(default = "default_run_level")]
        pub run_level: u8,
        /// `[height, width]` of classifier patches.
        pub patch_size: [NonZeroUsize; 2],
        /// Images are downsampled by this factor before cropping.
        pub down_fac: R64,
        pub batch_size: NonZeroUsize,
        #[serde(default = "default_prob_clip")]
        pub prob_clip: R64,
        /// The directory of `<htt>_crf.json5` parameter files.
        pub crf_dir: PathBuf,
    }

    fn default_run_level() -> u8 {
        3
    }

    fn default_prob_clip() -> R64 {
        r64(1e-5)
    }
}

mod output {
    use super::*;

    /// Output locations and artifacts.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OutputConfig {
        pub out_dir: PathBuf,
        /// The cache directory of class weights.
        pub tmp_dir: PathBuf,
        #[serde(default)]
        pub save: SaveOptions,
    }
}

mod overlap {
    use super::*;

    /// Whole-slide overlap stitching options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OverlapConfig {
        /// `[height, width]` of slide tiles in slide pixels.
        pub tile_size: [NonZeroUsize; 2],
        pub overlap_ratio: R64,
        #[serde(default)]
        pub absent_class_policy: AbsentClassPolicy,
    }
}

pub fn deserialize_version<'de, D>(deserializer: D) -> Result<Version, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    let version = Version::parse(&text).map_err(|err| {
        D::Error::custom(format!(
            "failed to parse version number '{}': {:?}",
            text, err
        ))
    })?;

    if !CONFIG_VERSION.matches(&version) {
        return Err(D::Error::custom(format!(
            "incompatible version: get '{}', but it is incompatible with requirement '{}'",
            version, &*CONFIG_VERSION,
        )));
    }

    Ok(version)
}
