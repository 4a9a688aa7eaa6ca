//! Segmentation quality metrics accumulated over a whole run.

use crate::{
    common::*,
    volume::{GroundTruthMask, LabelMask},
};
use strum::{AsRefStr, EnumIter, IntoEnumIterator as _};

const IOU_EPSILON: f64 = 1e-12;
const DICE_EPSILON: f64 = 1e-8;
const CONFUSION_EPSILON: f64 = 1e-7;

/// The pipeline stage at which a mask is scored.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, AsRefStr, EnumIter, Serialize, Deserialize,
)]
pub enum Stage {
    #[strum(serialize = "GradCAM")]
    GradCam,
    Adjust,
    #[strum(serialize = "CRF")]
    Crf,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

/// Pixel counts of one hierarchy at one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionAccumulator {
    intersection: Vec<u64>,
    union: Vec<u64>,
    gt_counts: Vec<u64>,
    /// Rows are ground-truth classes, columns predicted classes.
    confusion: Array2<u64>,
}

impl ConfusionAccumulator {
    pub fn new(num_classes: usize) -> Self {
        Self {
            intersection: vec![0; num_classes],
            union: vec![0; num_classes],
            gt_counts: vec![0; num_classes],
            confusion: Array2::zeros((num_classes, num_classes)),
        }
    }

    pub fn num_classes(&self) -> usize {
        self.intersection.len()
    }

    /// Add the counts of one predicted mask against its ground truth.
    ///
    /// Ground-truth pixels of no class only enter the union of the predicted
    /// class.
    pub fn accumulate(&mut self, pred: &LabelMask, gt: &GroundTruthMask) -> Result<()> {
        let num_classes = self.num_classes();
        if pred.num_classes() != num_classes || gt.num_classes() != num_classes {
            return Err(Error::dimension_mismatch(
                "class count",
                [num_classes, num_classes],
                [pred.num_classes(), gt.num_classes()],
            ));
        }
        if pred.size() != gt.size() {
            return Err(Error::dimension_mismatch(
                "ground-truth mask",
                pred.size(),
                gt.size(),
            ));
        }

        izip!(pred.labels().iter(), gt.labels().iter()).for_each(|(&pred, &gt)| {
            self.union[pred] += 1;
            if let Some(gt) = gt {
                self.gt_counts[gt] += 1;
                self.confusion[[gt, pred]] += 1;
                if gt == pred {
                    self.intersection[pred] += 1;
                } else {
                    self.union[gt] += 1;
                }
            }
        });
        Ok(())
    }

    /// Merge the counts of another accumulator of the same hierarchy.
    pub fn merge(&mut self, other: &Self) -> Result<()> {
        if other.num_classes() != self.num_classes() {
            return Err(Error::dimension_mismatch(
                "accumulator",
                [self.num_classes()],
                [other.num_classes()],
            ));
        }
        izip!(&mut self.intersection, &other.intersection).for_each(|(lhs, rhs)| *lhs += rhs);
        izip!(&mut self.union, &other.union).for_each(|(lhs, rhs)| *lhs += rhs);
        izip!(&mut self.gt_counts, &other.gt_counts).for_each(|(lhs, rhs)| *lhs += rhs);
        self.confusion += &other.confusion;
        Ok(())
    }

    pub fn intersection(&self) -> &[u64] {
        &self.intersection
    }

    pub fn union(&self) -> &[u64] {
        &self.union
    }

    pub fn gt_counts(&self) -> &[u64] {
        &self.gt_counts
    }

    pub fn confusion(&self) -> &Array2<u64> {
        &self.confusion
    }

    pub fn iou(&self) -> Vec<f64> {
        izip!(&self.intersection, &self.union)
            .map(|(&inter, &union)| inter as f64 / (union as f64 + IOU_EPSILON))
            .collect()
    }

    pub fn mean_iou(&self) -> f64 {
        let iou = self.iou();
        iou.iter().sum::<f64>() / iou.len() as f64
    }

    /// IoU weighted by per-class weights.
    pub fn frequency_weighted_iou(&self, weights: &[f64]) -> Result<f64> {
        if weights.len() != self.num_classes() {
            return Err(Error::dimension_mismatch(
                "class weights",
                [self.num_classes()],
                [weights.len()],
            ));
        }
        Ok(izip!(weights, self.iou()).map(|(weight, iou)| weight * iou).sum())
    }

    /// Per-class Dice coefficient from the confusion matrix.
    pub fn dice(&self) -> Vec<f64> {
        let row_sums = self.confusion.sum_axis(Axis(1));
        let col_sums = self.confusion.sum_axis(Axis(0));
        (0..self.num_classes())
            .map(|class| {
                (2.0 * self.confusion[[class, class]] as f64 + DICE_EPSILON)
                    / (row_sums[class] as f64 + col_sums[class] as f64 + DICE_EPSILON)
            })
            .collect()
    }

    /// Mean Dice coefficient ignoring undefined classes.
    pub fn mean_dice(&self) -> f64 {
        let (sum, count) = self
            .dice()
            .into_iter()
            .filter(|dice| !dice.is_nan())
            .fold((0.0, 0), |(sum, count), dice| (sum + dice, count + 1));
        if count == 0 {
            f64::NAN
        } else {
            sum / count as f64
        }
    }

    /// The confusion matrix with each row divided by its ground-truth count.
    pub fn normalized_confusion(&self) -> Array2<f64> {
        let mut normalized = self.confusion.mapv(|count| count as f64);
        normalized
            .outer_iter_mut()
            .zip(&self.gt_counts)
            .for_each(|(mut row, &count)| row /= count as f64 + CONFUSION_EPSILON);
        normalized
    }
}

/// Log-inverse-frequency class weights from a ground-truth histogram.
///
/// Classes that never occur, or whose log count is zero, get zero weight. The
/// remaining weights sum to one.
pub fn log_inverse_frequency(counts: &[u64]) -> Vec<f64> {
    let logs: Vec<f64> = counts
        .iter()
        .map(|&count| if count == 0 { 0.0 } else { (count as f64).ln() })
        .collect();
    let total: f64 = logs.iter().sum();
    let raw: Vec<f64> = logs
        .iter()
        .map(|&log| if log > 0.0 { total / log } else { 0.0 })
        .collect();
    let norm: f64 = raw.iter().sum();
    if norm > 0.0 {
        raw.into_iter().map(|weight| weight / norm).collect()
    } else {
        raw
    }
}

/// Cached class weights of one hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassWeights {
    pub htt: HttClass,
    pub weights: Vec<f64>,
}

impl ClassWeights {
    /// The cache file of a hierarchy under `dir`.
    pub fn cache_path(dir: &Path, htt: HttClass) -> PathBuf {
        dir.join(format!("httweights_{}.json", htt))
    }

    /// Reload cached weights, or compute and cache them from a ground-truth
    /// histogram.
    pub fn load_or_compute<F>(
        dir: &Path,
        htt: HttClass,
        num_classes: usize,
        histogram: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<Vec<u64>>,
    {
        let path = Self::cache_path(dir, htt);
        if path.is_file() {
            let text = fs::read_to_string(&path).map_err(|err| Error::io(&path, err))?;
            let cached: Self = serde_json::from_str(&text)?;
            if cached.htt == htt && cached.weights.len() == num_classes {
                debug!("reuse class weights '{}'", path.display());
                return Ok(cached);
            }
            warn!(
                "ignore stale class weights '{}' with {} classes",
                path.display(),
                cached.weights.len()
            );
        }

        let counts = histogram()?;
        if counts.len() != num_classes {
            return Err(Error::dimension_mismatch(
                "ground-truth histogram",
                [num_classes],
                [counts.len()],
            ));
        }
        let weights = Self {
            htt,
            weights: log_inverse_frequency(&counts),
        };
        fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;
        let text = serde_json::to_string_pretty(&weights)?;
        fs::write(&path, text).map_err(|err| Error::io(&path, err))?;
        info!("saved class weights '{}'", path.display());
        Ok(weights)
    }
}

/// The metrics of one hierarchy at one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct HttMetrics {
    pub htt: HttClass,
    pub iou: Vec<f64>,
    pub fiou: f64,
    pub miou: f64,
    pub dice: Vec<f64>,
    pub mean_dice: f64,
}

/// The metrics of every hierarchy at one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    pub stage: Stage,
    pub hierarchies: Vec<HttMetrics>,
}

#[derive(Debug, Clone)]
struct HttEntry {
    class_names: Vec<String>,
    weights: Vec<f64>,
}

/// The accumulators of a run, one per hierarchy and stage.
#[derive(Debug, Clone)]
pub struct EvaluationRun {
    entries: IndexMap<HttClass, HttEntry>,
    accumulators: IndexMap<(Stage, HttClass), ConfusionAccumulator>,
}

impl EvaluationRun {
    pub fn new() -> Self {
        Self {
            entries: IndexMap::new(),
            accumulators: IndexMap::new(),
        }
    }

    /// Register a hierarchy with its class names and frequency weights.
    pub fn add_hierarchy(
        &mut self,
        htt: HttClass,
        class_names: Vec<String>,
        weights: Vec<f64>,
    ) -> Result<()> {
        if weights.len() != class_names.len() {
            return Err(Error::dimension_mismatch(
                format!("class weights of hierarchy '{}'", htt),
                [class_names.len()],
                [weights.len()],
            ));
        }
        for stage in Stage::iter() {
            self.accumulators
                .insert((stage, htt), ConfusionAccumulator::new(class_names.len()));
        }
        self.entries.insert(
            htt,
            HttEntry {
                class_names,
                weights,
            },
        );
        Ok(())
    }

    pub fn hierarchies(&self) -> impl Iterator<Item = HttClass> + '_ {
        self.entries.keys().copied()
    }

    pub fn accumulator(&self, stage: Stage, htt: HttClass) -> Option<&ConfusionAccumulator> {
        self.accumulators.get(&(stage, htt))
    }

    pub fn record(
        &mut self,
        stage: Stage,
        htt: HttClass,
        pred: &LabelMask,
        gt: &GroundTruthMask,
    ) -> Result<()> {
        let acc = self.accumulators.get_mut(&(stage, htt)).ok_or_else(|| {
            Error::data_integrity(format!("hierarchy '{}' is not evaluated", htt))
        })?;
        acc.accumulate(pred, gt)
    }

    pub fn report(&self, stage: Stage) -> Result<StageReport> {
        let hierarchies = self
            .entries
            .iter()
            .map(|(&htt, entry)| -> Result<_> {
                let acc = &self.accumulators[&(stage, htt)];
                Ok(HttMetrics {
                    htt,
                    iou: acc.iou(),
                    fiou: acc.frequency_weighted_iou(&entry.weights)?,
                    miou: acc.mean_iou(),
                    dice: acc.dice(),
                    mean_dice: acc.mean_dice(),
                })
            })
            .try_collect()?;
        Ok(StageReport { stage, hierarchies })
    }

    /// Write the tables of one stage under `dir`:
    ///
    /// - `<htt>_IoU_metric_results.csv`, the per-class IoU,
    /// - `metric_results_<stage>.csv`, the summary metrics of every hierarchy,
    /// - `confusion_matrix_<htt>_<stage>.csv`, the row-normalized confusion matrix.
    pub fn export(&self, stage: Stage, dir: &Path) -> Result<StageReport> {
        fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))?;
        let report = self.report(stage)?;

        let summary_path = dir.join(format!("metric_results_{}.csv", stage));
        let mut summary = csv::Writer::from_path(&summary_path)?;
        summary.write_record(&["metric", "value"])?;

        for metrics in &report.hierarchies {
            let htt = metrics.htt;
            let entry = &self.entries[&htt];

            let iou_path = dir.join(format!("{}_IoU_metric_results.csv", htt));
            let mut writer = csv::Writer::from_path(&iou_path)?;
            writer.write_record(&entry.class_names)?;
            writer.write_record(metrics.iou.iter().map(|iou| iou.to_string()))?;
            writer.flush().map_err(|err| Error::io(&iou_path, err))?;

            let confusion_path = dir.join(format!("confusion_matrix_{}_{}.csv", htt, stage));
            let mut writer = csv::Writer::from_path(&confusion_path)?;
            writer.write_record(
                std::iter::once("ground truth \\ prediction").chain(entry.class_names.iter().map(String::as_str)),
            )?;
            let normalized = self.accumulators[&(stage, htt)].normalized_confusion();
            for (name, row) in izip!(&entry.class_names, normalized.outer_iter()) {
                writer.write_record(
                    std::iter::once(name.clone()).chain(row.iter().map(|value| value.to_string())),
                )?;
            }
            writer.flush().map_err(|err| Error::io(&confusion_path, err))?;

            let scalars = [
                ("fIoU", metrics.fiou),
                ("mIoU", metrics.miou),
                ("mdice", metrics.mean_dice),
            ];
            for (name, value) in scalars {
                summary.write_record(&[format!("{}_{}", htt, name), value.to_string()])?;
            }
            for (class, dice) in izip!(&entry.class_names, &metrics.dice) {
                summary.write_record(&[format!("{}_dice_{}", htt, class), dice.to_string()])?;
            }
        }
        summary
            .flush()
            .map_err(|err| Error::io(&summary_path, err))?;

        Ok(report)
    }

    /// Consume the run and produce the report of every stage.
    pub fn finish(self) -> Result<Vec<StageReport>> {
        Stage::iter().map(|stage| self.report(stage)).try_collect()
    }
}

impl Default for EvaluationRun {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn all_zero_three_class_scenario() -> Result<()> {
        let pred = LabelMask::filled(0, 3, [4, 4])?;
        let gt = GroundTruthMask::from(LabelMask::filled(0, 3, [4, 4])?);

        let mut acc = ConfusionAccumulator::new(3);
        acc.accumulate(&pred, &gt)?;
        assert_eq!(acc.intersection(), &[16, 0, 0]);
        assert_eq!(acc.union(), &[16, 0, 0]);
        assert_eq!(acc.gt_counts(), &[16, 0, 0]);
        let iou = acc.iou();
        assert_eq!(iou.len(), 3);
        assert_abs_diff_eq!(iou[0], 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(iou[1], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(iou[2], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(acc.mean_iou(), 1.0 / 3.0, epsilon = 1e-9);

        let dice = acc.dice();
        assert_abs_diff_eq!(dice[0], 1.0, epsilon = 1e-9);
        // undefined classes count as perfect agreement through the epsilons
        assert_abs_diff_eq!(dice[1], 1.0, epsilon = 1e-9);
        Ok(())
    }

    #[test]
    fn accumulation_is_additive() -> Result<()> {
        let pred_a = LabelMask::new(array![[0, 1], [2, 2]], 3)?;
        let gt_a = GroundTruthMask::new(array![[Some(0), Some(2)], [Some(2), None]], 3)?;
        let pred_b = LabelMask::new(array![[1, 1], [0, 2]], 3)?;
        let gt_b = GroundTruthMask::new(array![[Some(1), Some(0)], [Some(0), Some(2)]], 3)?;

        let mut together = ConfusionAccumulator::new(3);
        together.accumulate(&pred_a, &gt_a)?;
        together.accumulate(&pred_b, &gt_b)?;

        let mut first = ConfusionAccumulator::new(3);
        first.accumulate(&pred_a, &gt_a)?;
        let mut second = ConfusionAccumulator::new(3);
        second.accumulate(&pred_b, &gt_b)?;
        first.merge(&second)?;
        assert_eq!(first, together);

        for (&inter, &union) in izip!(together.intersection(), together.union()) {
            assert!(inter <= union);
        }
        assert_eq!(together.confusion().sum(), together.gt_counts().iter().sum::<u64>());
        Ok(())
    }

    #[test]
    fn dice_is_symmetric() -> Result<()> {
        let pred = LabelMask::new(array![[0, 1, 1], [2, 2, 0]], 3)?;
        let gt = LabelMask::new(array![[0, 0, 1], [2, 1, 1]], 3)?;

        let mut forward = ConfusionAccumulator::new(3);
        forward.accumulate(&pred, &gt.clone().into())?;
        let mut backward = ConfusionAccumulator::new(3);
        backward.accumulate(&gt, &pred.into())?;

        for (lhs, rhs) in izip!(forward.dice(), backward.dice()) {
            assert_abs_diff_eq!(lhs, rhs, epsilon = 1e-12);
        }
        assert_eq!(forward.confusion().t(), backward.confusion().view());
        Ok(())
    }

    #[test]
    fn log_inverse_weights() {
        let weights = log_inverse_frequency(&[100, 0, 10, 1]);
        assert_eq!(weights[1], 0.0);
        assert_eq!(weights[3], 0.0);
        assert_abs_diff_eq!(weights.iter().sum::<f64>(), 1.0, epsilon = 1e-12);
        // rarer classes weigh more
        assert!(weights[2] > weights[0]);
        assert_abs_diff_eq!(weights[2] / weights[0], 2.0, epsilon = 1e-9);
    }

    #[test]
    fn weights_are_cached() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("histoseg-weights-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        let computed = ClassWeights::load_or_compute(&dir, HttClass::Glas, 2, || Ok(vec![10, 100]))?;
        assert!(ClassWeights::cache_path(&dir, HttClass::Glas).is_file());

        let reloaded = ClassWeights::load_or_compute(&dir, HttClass::Glas, 2, || {
            Err(Error::data_integrity("histogram must not be recomputed"))
        })?;
        assert_eq!(computed, reloaded);

        fs::remove_dir_all(&dir).map_err(|err| Error::io(&dir, err))?;
        Ok(())
    }

    #[test]
    fn export_stage_tables() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("histoseg-eval-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        let mut run = EvaluationRun::new();
        run.add_hierarchy(HttClass::Glas, vec!["Other".into(), "G.O".into()], vec![0.5, 0.5])?;
        let pred = LabelMask::new(array![[0, 1], [1, 1]], 2)?;
        let gt = GroundTruthMask::new(array![[Some(0), Some(1)], [Some(0), Some(1)]], 2)?;
        run.record(Stage::Crf, HttClass::Glas, &pred, &gt)?;
        assert!(run.record(Stage::Crf, HttClass::Morph, &pred, &gt).is_err());

        let report = run.export(Stage::Crf, &dir)?;
        let glas = &report.hierarchies[0];
        assert_abs_diff_eq!(glas.iou[0], 0.5, epsilon = 1e-9);
        assert_abs_diff_eq!(glas.iou[1], 2.0 / 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(glas.fiou, glas.miou, epsilon = 1e-9);

        assert!(dir.join("glas_IoU_metric_results.csv").is_file());
        assert!(dir.join("metric_results_CRF.csv").is_file());
        assert!(dir.join("confusion_matrix_glas_CRF.csv").is_file());

        let reports = run.finish()?;
        assert_eq!(reports.len(), 3);
        assert_eq!(reports[0].stage, Stage::GradCam);
        assert!(reports[0].hierarchies[0].iou.iter().all(|&iou| iou == 0.0));

        fs::remove_dir_all(&dir).map_err(|err| Error::io(&dir, err))?;
        Ok(())
    }
}
