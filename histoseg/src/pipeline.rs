//! The batch-sequential segmentation pipeline.

use crate::{
    adjust::{ExternalVolumes, HierarchicalAdjuster},
    common::*,
    compose::ClassSpecificComposer,
    crf::{Configured, DenseCrf},
    eval::{ClassWeights, EvaluationRun, Stage, StageReport},
    gradcam::{split_by_htt, ActivationMapEngine, Classifier, HttPrediction, Thresholds},
    io,
    patch::{crop_into_patches, resize_pixels, CroppedImage, Patch},
    stitch::{
        AbsentClassPolicy, ActivationFileName, StitchGeometry, StitchOverlapMerger, TileKey,
        TileMaps,
    },
    volume::{ActivationVolume, GroundTruthMask, LabelMask, SUPPRESSED},
};
use atlas::{ClassSet, HttMode};
use strum::IntoEnumIterator as _;

/// How far a run proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RunLevel {
    /// Patch classification and confidence tables only.
    Classify = 1,
    /// Up to class-specific activations.
    Compose = 2,
    /// Up to refined label masks and evaluation.
    Full = 3,
}

impl TryFrom<u8> for RunLevel {
    type Error = Error;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        Ok(match level {
            1 => Self::Classify,
            2 => Self::Compose,
            3 => Self::Full,
            _ => {
                return Err(Error::config(format!(
                    "run level {} is not one of 1, 2, 3",
                    level
                )))
            }
        })
    }
}

/// The source images of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// Every png file is an independent image.
    Patch,
    /// Whole-slide tiles named `<slide>_i<row>_j<col>_f<level>.png`; only
    /// level 1 tiles are read.
    Wsi,
}

/// The artifacts written besides metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SaveOptions {
    #[serde(default)]
    pub patch_confidence: bool,
    #[serde(default)]
    pub activation_maps: bool,
    #[serde(default)]
    pub label_masks: bool,
    #[serde(default)]
    pub overlays: bool,
}

/// Whole-slide overlap stitching options.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OverlapOptions {
    /// Tile size in slide pixels.
    pub tile_size: [usize; 2],
    pub overlap_ratio: f64,
    pub policy: AbsentClassPolicy,
}

/// Validated pipeline options.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub input_dir: PathBuf,
    pub input_mode: InputMode,
    /// Root of the ground-truth rasters, `<gt_dir>/<htt>/<file name>`.
    pub gt_dir: Option<PathBuf>,
    pub out_dir: PathBuf,
    /// Cache directory of class weights.
    pub tmp_dir: PathBuf,
    /// Directory of the per-hierarchy CRF parameters `<htt>_crf.json5`.
    pub crf_dir: PathBuf,
    pub patch_size: [usize; 2],
    pub down_fac: f64,
    pub batch_size: NonZeroUsize,
    pub htt_mode: HttMode,
    pub run_level: RunLevel,
    pub save: SaveOptions,
    pub prob_clip: f32,
    pub overlap: Option<OverlapOptions>,
}

/// Per-hierarchy state of a run.
struct HttStage {
    htt: HttClass,
    class_names: Vec<String>,
    colours: Vec<Rgb>,
    channels: IndexMap<usize, usize>,
    adjuster: HierarchicalAdjuster,
    /// Channels that never win the Grad-CAM stage mask.
    gradcam_excluded: Vec<usize>,
    crf: Option<DenseCrf<Configured>>,
    confidence_channel: Option<usize>,
    /// Computed only to feed the adjustment of other hierarchies.
    auxiliary: bool,
}

/// One image of a batch and its patches.
struct BatchImage {
    file_name: String,
    stem: String,
    pixels_size: [usize; 2],
    pixels: Array3<u8>,
    cropped: CroppedImage,
    /// Range of its patches in the batch.
    first_patch: usize,
}

/// The outcome of a run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub num_images: usize,
    pub reports: Vec<StageReport>,
}

/// The segmentation pipeline over a directory of images.
pub struct Pipeline<C>
where
    C: Classifier,
{
    options: PipelineOptions,
    classifier: C,
    thresholds: Thresholds,
    engine: ActivationMapEngine,
    composer: ClassSpecificComposer,
    stages: Vec<HttStage>,
}

impl<C> Pipeline<C>
where
    C: Classifier,
{
    pub fn new(
        options: PipelineOptions,
        atlas: &Atlas,
        classifier: C,
        thresholds: Thresholds,
    ) -> Result<Self> {
        if classifier.num_classes() != atlas.classifier_classes.len() {
            return Err(Error::dimension_mismatch(
                "classifier outputs",
                [atlas.classifier_classes.len()],
                [classifier.num_classes()],
            ));
        }
        if thresholds.values().len() != classifier.num_classes() {
            return Err(Error::dimension_mismatch(
                "thresholds",
                [classifier.num_classes()],
                [thresholds.values().len()],
            ));
        }
        if options.down_fac <= 0.0 {
            return Err(Error::config(format!(
                "down-sampling factor {} must be positive",
                options.down_fac
            )));
        }
        if options.overlap.is_some() {
            if options.input_mode != InputMode::Wsi {
                return Err(Error::config("overlap stitching requires whole-slide input"));
            }
            if !options.save.activation_maps {
                return Err(Error::config(
                    "overlap stitching reads saved activation maps, enable save.activation_maps",
                ));
            }
        }

        // hierarchies whose activations others read are computed first
        let requested = options.htt_mode.hierarchies();
        let mut order: Vec<(HttClass, bool)> = vec![];
        for &htt in &requested {
            let adjuster = HierarchicalAdjuster::new(atlas, htt)?;
            for &external in adjuster.external_hierarchies() {
                if !order.iter().any(|&(other, _)| other == external) {
                    order.push((external, !requested.contains(&external)));
                }
            }
            if let Some(entry) = order.iter_mut().find(|(other, _)| *other == htt) {
                entry.1 = false;
            } else {
                order.push((htt, false));
            }
        }

        let stages: Vec<HttStage> = order
            .into_iter()
            .map(|(htt, auxiliary)| -> Result<_> {
                let hierarchy = atlas.hierarchy(htt)?;
                let crf = if auxiliary || options.run_level < RunLevel::Full {
                    None
                } else {
                    let path = options.crf_dir.join(format!("{}_crf.json5", htt));
                    Some(DenseCrf::new().load_config(&path)?)
                };
                let confidence_channel = hierarchy
                    .confidence_class
                    .as_deref()
                    .and_then(|name| hierarchy.class_index(name));
                if auxiliary {
                    info!("hierarchy '{}' is computed to support other hierarchies", htt);
                }
                let adjuster = HierarchicalAdjuster::new(atlas, htt)?;
                let gradcam_excluded = hierarchy
                    .resolve(&ClassSet::Classes(hierarchy.gradcam_exclude.clone()))
                    .map_err(Error::Atlas)?;
                debug!(
                    "hierarchy '{}' derives channels {:?} and leaves {:?} out of the Grad-CAM stage",
                    htt,
                    adjuster.derived_channels(),
                    gradcam_excluded
                );

                Ok(HttStage {
                    htt,
                    class_names: hierarchy.class_names().map(str::to_string).collect(),
                    colours: hierarchy.colours(),
                    channels: atlas.split_by_htt(htt)?,
                    adjuster,
                    gradcam_excluded,
                    crf,
                    confidence_channel,
                    auxiliary,
                })
            })
            .try_collect()?;

        Ok(Self {
            engine: ActivationMapEngine::new(options.patch_size)?,
            composer: ClassSpecificComposer::new(options.prob_clip)?,
            options,
            classifier,
            thresholds,
            stages,
        })
    }

    /// Process every image of the input directory.
    pub fn run(&mut self) -> Result<RunSummary> {
        let files = self.input_files()?;
        if files.is_empty() {
            warn!(
                "no input images found in '{}'",
                self.options.input_dir.display()
            );
        }
        io::create_dir(&self.options.out_dir)?;

        let mut evaluation = if self.options.run_level == RunLevel::Full {
            self.prepare_evaluation(&files)?
        } else {
            None
        };
        let mut confidences: Vec<(String, f32)> = vec![];
        let batch_size = self.options.batch_size.get();
        let num_batches = (files.len() + batch_size - 1) / batch_size;

        for (batch_index, batch) in files.chunks(batch_size).enumerate() {
            let since = Instant::now();
            info!("batch {} of {}", batch_index + 1, num_batches);
            self.process_batch(batch, evaluation.as_mut(), &mut confidences)?;

            if let Some(evaluation) = &evaluation {
                for stage in Stage::iter() {
                    evaluation.export(stage, &self.options.out_dir)?;
                }
            }
            info!("batch {} took {:?}", batch_index + 1, since.elapsed());
        }

        if !confidences.is_empty() {
            let path = self.options.out_dir.join("glas_confscores.csv");
            io::write_confidence_scores(&path, &confidences)?;
            info!("saved confidence scores '{}'", path.display());
        }

        if self.options.overlap.is_some() {
            self.overlap_and_segment(&files, evaluation.as_mut())?;
            if let Some(evaluation) = &evaluation {
                evaluation.export(Stage::Crf, &self.options.out_dir)?;
            }
        }

        let reports = match evaluation {
            Some(evaluation) => evaluation.finish()?,
            None => vec![],
        };
        for report in &reports {
            for metrics in &report.hierarchies {
                info!(
                    "[{}] {}: mIoU {:.4}, fIoU {:.4}, mean Dice {:.4}",
                    report.stage, metrics.htt, metrics.miou, metrics.fiou, metrics.mean_dice
                );
            }
        }

        Ok(RunSummary {
            num_images: files.len(),
            reports,
        })
    }

    fn input_files(&self) -> Result<Vec<PathBuf>> {
        let files = io::list_images(&self.options.input_dir)?;
        let files = match self.options.input_mode {
            InputMode::Patch => files,
            InputMode::Wsi => files
                .into_iter()
                .filter(|path| {
                    file_stem(path)
                        .parse::<TileKey>()
                        .map(|key| key.level == 1)
                        .unwrap_or(false)
                })
                .collect(),
        };
        info!("found {} input images", files.len());
        Ok(files)
    }

    fn evaluated(&self) -> impl Iterator<Item = &HttStage> + '_ {
        self.stages.iter().filter(|stage| !stage.auxiliary)
    }

    fn gt_path(&self, htt: HttClass, file_name: &str) -> Option<PathBuf> {
        self.options
            .gt_dir
            .as_ref()
            .map(|dir| dir.join(htt.to_string()).join(file_name))
    }

    /// Check ground-truth directories and load the class weights.
    fn prepare_evaluation(&self, files: &[PathBuf]) -> Result<Option<EvaluationRun>> {
        let gt_dir = match &self.options.gt_dir {
            Some(dir) => dir,
            None => return Ok(None),
        };

        let mut evaluation = EvaluationRun::new();
        for stage in self.evaluated() {
            let htt_dir = gt_dir.join(stage.htt.to_string());
            if !htt_dir.is_dir() {
                return Err(Error::data_integrity(format!(
                    "ground-truth directory '{}' does not exist",
                    htt_dir.display()
                )));
            }

            let weights = ClassWeights::load_or_compute(
                &self.options.tmp_dir,
                stage.htt,
                stage.class_names.len(),
                || {
                    let mut counts = vec![0; stage.class_names.len()];
                    for file in files {
                        let path = htt_dir.join(file_name(file));
                        if !path.is_file() {
                            return Err(Error::data_integrity(format!(
                                "ground-truth annotation '{}' does not exist",
                                path.display()
                            )));
                        }
                        let pixels = io::read_pixels(&path)?;
                        let gt = GroundTruthMask::from_colours(&pixels, &stage.colours);
                        izip!(&mut counts, gt.histogram()).for_each(|(sum, count)| *sum += count);
                    }
                    Ok(counts)
                },
            )?;
            evaluation.add_hierarchy(stage.htt, stage.class_names.clone(), weights.weights)?;
        }
        Ok(Some(evaluation))
    }

    fn load_batch(&self, batch: &[PathBuf]) -> Result<(Vec<BatchImage>, Vec<Patch>)> {
        let mut images = vec![];
        let mut patches = vec![];

        for path in batch {
            let pixels = io::read_pixels(path)?;
            let (height, width, _) = pixels.dim();
            let file_name = file_name(path);
            let cropped = crop_into_patches(
                &file_name,
                &pixels,
                self.options.down_fac,
                self.options.patch_size,
            )?;
            if self.options.overlap.is_some() && cropped.patches.len() != 1 {
                return Err(Error::config(format!(
                    "tile '{}' yields {} patches, overlap stitching needs exactly one",
                    file_name,
                    cropped.patches.len()
                )));
            }
            debug!(
                "cropped '{}' into {}×{} patches",
                file_name, cropped.num_crops[0], cropped.num_crops[1]
            );

            let first_patch = patches.len();
            patches.extend(cropped.patches.iter().cloned());
            images.push(BatchImage {
                stem: file_stem(path),
                file_name,
                pixels_size: [height, width],
                pixels,
                cropped,
                first_patch,
            });
        }

        Ok((images, patches))
    }

    fn process_batch(
        &mut self,
        batch: &[PathBuf],
        mut evaluation: Option<&mut EvaluationRun>,
        confidences: &mut Vec<(String, f32)>,
    ) -> Result<()> {
        let since = Instant::now();
        let (images, patches) = self.load_batch(batch)?;
        debug!("loaded {} images in {:?}", images.len(), since.elapsed());

        let since = Instant::now();
        let scores = self.classifier.predict(&patches)?;
        let predictions = self.thresholds.accept(scores.view())?;
        debug!(
            "classified {} patches, {} predictions accepted in {:?}",
            patches.len(),
            predictions.len(),
            since.elapsed()
        );

        let out_dir = self.options.out_dir.clone();
        let mut raw_volumes: IndexMap<HttClass, Vec<ActivationVolume>> = IndexMap::new();

        for index in 0..self.stages.len() {
            let stage = &self.stages[index];
            let htt = stage.htt;
            let preds = split_by_htt(&predictions, &stage.channels);
            let htt_dir = out_dir.join(htt.to_string());

            if !stage.auxiliary {
                if let Some(channel) = stage.confidence_channel {
                    for image in &images {
                        confidences.push((
                            image.file_name.clone(),
                            confidence_score(image, &preds, channel)?,
                        ));
                    }
                } else if self.options.save.patch_confidence {
                    let dir = htt_dir.join("patchconfidence");
                    io::create_dir(&dir)?;
                    for image in &images {
                        let num_patches = image.cropped.patches.len();
                        let patch_names: Vec<String> = (0..num_patches)
                            .map(|crop| patch_name(image, crop))
                            .collect();
                        let local: Vec<HttPrediction> = preds
                            .iter()
                            .filter(|pred| {
                                (image.first_patch..image.first_patch + num_patches)
                                    .contains(&pred.image)
                            })
                            .map(|pred| HttPrediction {
                                image: pred.image - image.first_patch,
                                ..*pred
                            })
                            .collect();
                        io::write_patch_confidence(
                            dir.join(format!("{}.csv", image.stem)),
                            &patch_names,
                            &stage.class_names,
                            &local,
                        )?;
                    }
                }
            }
            if self.options.run_level == RunLevel::Classify {
                continue;
            }

            let since = Instant::now();
            let maps = self
                .engine
                .generate(&mut self.classifier, &patches, &preds)?;
            let stage = &self.stages[index];
            let volumes =
                self.engine
                    .expand_image_wise(&maps, patches.len(), stage.class_names.len())?;
            debug!(
                "[{}] {} activation maps in {:?}",
                htt,
                maps.len(),
                since.elapsed()
            );

            if !stage.auxiliary {
                self.segment_hierarchy(
                    stage,
                    &images,
                    &patches,
                    &preds,
                    &volumes,
                    &raw_volumes,
                    evaluation.as_deref_mut(),
                )?;
            }
            raw_volumes.insert(htt, volumes);
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn segment_hierarchy(
        &self,
        stage: &HttStage,
        images: &[BatchImage],
        patches: &[Patch],
        preds: &[HttPrediction],
        volumes: &[ActivationVolume],
        raw_volumes: &IndexMap<HttClass, Vec<ActivationVolume>>,
        mut evaluation: Option<&mut EvaluationRun>,
    ) -> Result<()> {
        let htt = stage.htt;
        let htt_dir = self.options.out_dir.join(htt.to_string());
        let save = self.options.save;
        let since = Instant::now();

        let mut stage_masks: IndexMap<Stage, Vec<LabelMask>> = IndexMap::new();
        let mut composed_volumes = Vec::with_capacity(volumes.len());

        for (patch_index, (patch, volume)) in izip!(patches, volumes).enumerate() {
            let mut gradcam = volume.clone();
            for &channel in &stage.gradcam_excluded {
                gradcam.channel_mut(channel).fill(SUPPRESSED);
            }
            stage_masks
                .entry(Stage::GradCam)
                .or_default()
                .push(gradcam.argmax());

            let externals: ExternalVolumes = raw_volumes
                .iter()
                .map(|(&other, volumes)| (other, &volumes[patch_index]))
                .collect();
            let adjusted = stage.adjuster.adjust(volume, &patch.pixels, &externals)?;
            let composed = self.composer.compose(&adjusted);
            stage_masks
                .entry(Stage::Adjust)
                .or_default()
                .push(self.composer.labels(&composed));

            if let Some(crf) = &stage.crf {
                if self.options.overlap.is_none() {
                    let probs = self.composer.probabilities(&composed);
                    let output = crf.process(&probs, &patch.pixels)?;
                    stage_masks.entry(Stage::Crf).or_default().push(output.labels);
                }
            }
            composed_volumes.push(composed);
        }
        debug!("[{}] refined {} patches in {:?}", htt, patches.len(), since.elapsed());

        if save.activation_maps {
            let dir = htt_dir.join("gradcam");
            io::create_dir(&dir)?;
            for image in images {
                for crop in 0..image.cropped.patches.len() {
                    let patch_index = image.first_patch + crop;
                    let composed = &composed_volumes[patch_index];
                    let channels = preds
                        .iter()
                        .filter(|pred| pred.image == patch_index)
                        .map(|pred| pred.channel)
                        .dedup();
                    for channel in channels {
                        let name = format!(
                            "{}_h{}.png",
                            patch_name(image, crop),
                            stage.class_names[channel]
                        );
                        io::write_activation_map(dir.join(name), &composed.channel(channel).to_owned())?;
                    }
                }
            }
        }

        for image in images {
            let range = image.first_patch..image.first_patch + image.cropped.patches.len();
            let gt = match self.gt_path(htt, &image.file_name) {
                Some(path) if self.options.run_level == RunLevel::Full => {
                    Some(io::read_ground_truth(&path, &stage.colours, image.pixels_size)?)
                }
                _ => None,
            };

            for (&kind, masks) in &stage_masks {
                let mask = image
                    .cropped
                    .assemble_labels(&masks[range.clone()], image.pixels_size)?;

                if save.label_masks {
                    let dir = htt_dir.join(format!("ablative_{}", kind));
                    io::create_dir(&dir)?;
                    io::write_pixels(dir.join(&image.file_name), &mask.colorize(&stage.colours)?)?;
                }
                if kind == Stage::Crf {
                    let colourized = mask.colorize(&stage.colours)?;
                    if save.label_masks {
                        let dir = htt_dir.join("patch");
                        io::create_dir(&dir)?;
                        io::write_pixels(dir.join(&image.file_name), &colourized)?;
                    }
                    if save.overlays {
                        let dir = htt_dir.join("overlay");
                        io::create_dir(&dir)?;
                        io::write_pixels(
                            dir.join(&image.file_name),
                            &io::overlay(&colourized, &image.pixels)?,
                        )?;
                    }
                }

                if let (Some(gt), Some(evaluation)) = (&gt, evaluation.as_deref_mut()) {
                    evaluation.record(kind, htt, &mask, gt)?;
                }
            }
        }

        Ok(())
    }

    /// Stitch cached activation maps of neighbouring tiles and refine them.
    fn overlap_and_segment(
        &self,
        files: &[PathBuf],
        mut evaluation: Option<&mut EvaluationRun>,
    ) -> Result<()> {
        let overlap = match self.options.overlap {
            Some(overlap) => overlap,
            None => return Ok(()),
        };
        let geometry =
            StitchGeometry::from_ratio(self.options.patch_size, overlap.tile_size, overlap.overlap_ratio)?;
        let merger = StitchOverlapMerger::new(geometry, overlap.policy);

        for stage in self.evaluated() {
            let since = Instant::now();
            let htt = stage.htt;
            let htt_dir = self.options.out_dir.join(htt.to_string());
            let tiles = self.load_tile_maps(stage, &htt_dir.join("gradcam"), files)?;

            for file in files {
                let key: TileKey = file_stem(file).parse()?;
                let merged = merger.merge(&key, &tiles, stage.class_names.len())?;

                if self.options.save.activation_maps {
                    let dir = htt_dir.join("gradcam_overlap");
                    io::create_dir(&dir)?;
                    for &class in tiles[&key].keys() {
                        let name = ActivationFileName {
                            tile: key.clone(),
                            class: stage.class_names[class].clone(),
                        };
                        io::write_activation_map(
                            dir.join(name.to_string()),
                            &merged.channel(class).to_owned(),
                        )?;
                    }
                }

                let crf = match &stage.crf {
                    Some(crf) => crf,
                    None => continue,
                };
                let image = io::read_pixels(file)?;
                let (height, width, _) = image.dim();
                let pixels = resize_pixels(&image, self.options.patch_size);
                let output = crf.process(merged.data(), &pixels)?;
                let mask = output.labels.resized([height, width]);
                let colourized = mask.colorize(&stage.colours)?;
                let file_name = file_name(file);

                if self.options.save.label_masks {
                    let dir = htt_dir.join("patch");
                    io::create_dir(&dir)?;
                    io::write_pixels(dir.join(&file_name), &colourized)?;
                }
                if self.options.save.overlays {
                    let dir = htt_dir.join("overlay");
                    io::create_dir(&dir)?;
                    io::write_pixels(dir.join(&file_name), &io::overlay(&colourized, &image)?)?;
                }
                if let (Some(path), Some(evaluation)) =
                    (self.gt_path(htt, &file_name), evaluation.as_deref_mut())
                {
                    let gt = io::read_ground_truth(&path, &stage.colours, [height, width])?;
                    evaluation.record(Stage::Crf, htt, &mask, &gt)?;
                }
            }
            info!(
                "[{}] stitched {} tiles in {:?}",
                htt,
                files.len(),
                since.elapsed()
            );
        }

        Ok(())
    }

    /// Read the cached maps of every input tile, keyed by tile.
    fn load_tile_maps(
        &self,
        stage: &HttStage,
        dir: &Path,
        files: &[PathBuf],
    ) -> Result<IndexMap<TileKey, TileMaps>> {
        let mut tiles: IndexMap<TileKey, TileMaps> = files
            .iter()
            .map(|file| -> Result<_> { Ok((file_stem(file).parse()?, TileMaps::new())) })
            .try_collect()?;
        if !dir.is_dir() {
            warn!("no activation maps in '{}'", dir.display());
            return Ok(tiles);
        }

        for path in io::list_images(dir)? {
            let name: ActivationFileName = file_name(&path).parse()?;
            let channel = stage
                .class_names
                .iter()
                .position(|class| *class == name.class)
                .ok_or_else(|| {
                    Error::config(format!(
                        "activation map '{}' names no class of hierarchy '{}'",
                        path.display(),
                        stage.htt
                    ))
                })?;
            let map = io::read_activation_map(&path)?;
            tiles.entry(name.tile).or_default().insert(channel, map);
        }
        Ok(tiles)
    }
}

/// Mean confidence of a class over the patches of one image.
///
/// Every patch must have an accepted prediction of the class.
fn confidence_score(image: &BatchImage, preds: &[HttPrediction], channel: usize) -> Result<f32> {
    let num_patches = image.cropped.patches.len();
    let range = image.first_patch..image.first_patch + num_patches;
    let scores: Vec<f32> = preds
        .iter()
        .filter(|pred| pred.channel == channel && range.contains(&pred.image))
        .map(|pred| pred.score)
        .collect();
    if scores.len() < num_patches {
        return Err(Error::data_integrity(format!(
            "{} confidence scores for {} patches of '{}'",
            scores.len(),
            num_patches,
            image.file_name
        )));
    }
    Ok(scores.iter().sum::<f32>() / scores.len() as f32)
}

fn patch_name(image: &BatchImage, crop: usize) -> String {
    if image.cropped.patches.len() == 1 {
        image.stem.clone()
    } else {
        format!("{}_c{}", image.stem, crop)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}
