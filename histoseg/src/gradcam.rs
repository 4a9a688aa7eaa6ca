//! Gradient-weighted class activation maps (Grad-CAM).
//!
//! The classifier is a black box behind the [Classifier] trait. It reports
//! per-class scores and, for a target class, the final convolutional feature
//! map together with the gradient of the pre-softmax class score with respect
//! to that map. The engine turns those into patch-sized activation maps.

use crate::{
    common::*,
    patch::Patch,
    utils::resize_bilinear,
    volume::{ActivationMap, ActivationVolume},
};

#[cfg(feature = "tch")]
pub mod torch;

/// The final convolutional feature map of a patch and the gradient of a class
/// score with respect to it, both laid out as `channels × height × width`.
#[derive(Debug, Clone)]
pub struct FeatureGradients {
    pub features: Array3<f32>,
    pub gradients: Array3<f32>,
}

/// A patch classifier exposing the gradients required by Grad-CAM.
pub trait Classifier {
    /// The number of classifier outputs.
    fn num_classes(&self) -> usize;

    /// Confidence scores laid out as `patches × classes`.
    fn predict(&mut self, patches: &[Patch]) -> Result<Array2<f32>>;

    /// Feature map and score gradients of one patch for one classifier class.
    fn feature_gradients(&mut self, patch: &Patch, class: usize) -> Result<FeatureGradients>;

    /// The name of the final convolutional layer.
    fn final_layer(&self) -> &str;
}

impl<C> Classifier for &mut C
where
    C: Classifier + ?Sized,
{
    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }

    fn predict(&mut self, patches: &[Patch]) -> Result<Array2<f32>> {
        (**self).predict(patches)
    }

    fn feature_gradients(&mut self, patch: &Patch, class: usize) -> Result<FeatureGradients> {
        (**self).feature_gradients(patch, class)
    }

    fn final_layer(&self) -> &str {
        (**self).final_layer()
    }
}

/// An accepted classifier prediction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Index of the patch in the batch.
    pub image: usize,
    /// Classifier output index.
    pub class: usize,
    pub score: f32,
}

/// A prediction routed to a channel of a hierarchy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HttPrediction {
    pub image: usize,
    pub class: usize,
    pub channel: usize,
    pub score: f32,
}

/// Per-class acceptance thresholds of classifier scores.
#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    values: Vec<f32>,
}

impl Thresholds {
    /// The threshold of classes absent from a threshold file.
    pub const DEFAULT: f32 = 0.5;

    pub fn uniform(num_classes: usize, value: f32) -> Self {
        Self {
            values: vec![value; num_classes],
        }
    }

    /// Build thresholds from a `class name → threshold` table.
    pub fn from_map(class_names: &[String], table: &IndexMap<String, f64>) -> Result<Self> {
        if let Some(name) = table.keys().find(|name| !class_names.contains(name)) {
            return Err(Error::config(format!(
                "threshold given for unknown class '{}'",
                name
            )));
        }
        let values = class_names
            .iter()
            .map(|name| {
                table
                    .get(name)
                    .map(|&value| value as f32)
                    .unwrap_or(Self::DEFAULT)
            })
            .collect();
        Ok(Self { values })
    }

    /// Load a json5 `class name → threshold` table.
    pub fn open<P>(path: P, class_names: &[String]) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| Error::io(path, err))?;
        let table: IndexMap<String, f64> = json5::from_str(&text).map_err(|err| {
            Error::config(format!(
                "malformed threshold file '{}': {}",
                path.display(),
                err
            ))
        })?;
        Self::from_map(class_names, &table)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Collect `(patch, class, score)` triples reaching their class threshold.
    ///
    /// Triples are ordered by patch, then by class.
    pub fn accept(&self, scores: ArrayView2<'_, f32>) -> Result<Vec<Prediction>> {
        let (num_images, num_classes) = scores.dim();
        if num_classes != self.values.len() {
            return Err(Error::dimension_mismatch(
                "classifier scores",
                [num_images, self.values.len()],
                [num_images, num_classes],
            ));
        }

        let predictions = iproduct!(0..num_images, 0..num_classes)
            .filter_map(|(image, class)| {
                let score = scores[[image, class]];
                (score >= self.values[class]).then(|| Prediction {
                    image,
                    class,
                    score,
                })
            })
            .collect();
        Ok(predictions)
    }
}

/// Keep the predictions of classes covered by a hierarchy and attach their
/// channel index.
pub fn split_by_htt(
    predictions: &[Prediction],
    channels: &IndexMap<usize, usize>,
) -> Vec<HttPrediction> {
    predictions
        .iter()
        .filter_map(|pred| {
            let &channel = channels.get(&pred.class)?;
            Some(HttPrediction {
                image: pred.image,
                class: pred.class,
                channel,
                score: pred.score,
            })
        })
        .collect()
}

/// Compute a Grad-CAM heat map and upsample it to `size`.
///
/// Channel weights are the spatial means of the gradients. The weighted sum of
/// feature channels is rectified before upsampling.
pub fn grad_cam(input: &FeatureGradients, size: [usize; 2]) -> Result<ActivationMap> {
    let FeatureGradients {
        features,
        gradients,
    } = input;
    if features.dim() != gradients.dim() {
        return Err(Error::dimension_mismatch(
            "feature gradients",
            features.shape(),
            gradients.shape(),
        ));
    }

    let (_, feat_h, feat_w) = features.dim();
    let weights = gradients
        .mean_axis(Axis(2))
        .and_then(|mean| mean.mean_axis(Axis(1)))
        .ok_or_else(|| Error::config("empty feature map"))?;

    let mut cam = Array2::<f32>::zeros((feat_h, feat_w));
    izip!(weights.iter(), features.outer_iter())
        .for_each(|(&weight, channel)| cam.scaled_add(weight, &channel));
    cam.mapv_inplace(|value| value.max(0.0));

    Ok(resize_bilinear(cam.view(), size))
}

/// A heat map of one accepted (patch, class) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassActivationMap {
    pub image: usize,
    pub channel: usize,
    pub score: f32,
    pub map: ActivationMap,
}

/// Produces class activation maps for accepted predictions.
#[derive(Debug, Clone)]
pub struct ActivationMapEngine {
    patch_size: [usize; 2],
}

impl ActivationMapEngine {
    pub fn new(patch_size: [usize; 2]) -> Result<Self> {
        if patch_size.contains(&0) {
            return Err(Error::config(format!("invalid patch size {:?}", patch_size)));
        }
        Ok(Self { patch_size })
    }

    pub fn patch_size(&self) -> [usize; 2] {
        self.patch_size
    }

    /// One activation map per accepted prediction, in prediction order.
    pub fn generate<C>(
        &self,
        classifier: &mut C,
        patches: &[Patch],
        predictions: &[HttPrediction],
    ) -> Result<Vec<ClassActivationMap>>
    where
        C: Classifier + ?Sized,
    {
        predictions
            .iter()
            .map(|pred| {
                let patch = patches.get(pred.image).ok_or_else(|| {
                    Error::data_integrity(format!(
                        "prediction refers to patch {}, but the batch has {} patches",
                        pred.image,
                        patches.len()
                    ))
                })?;
                let input = classifier.feature_gradients(patch, pred.class)?;
                let map = grad_cam(&input, self.patch_size)?;
                Ok(ClassActivationMap {
                    image: pred.image,
                    channel: pred.channel,
                    score: pred.score,
                    map,
                })
            })
            .collect()
    }

    /// Expand sparse activation maps into one full volume per patch.
    ///
    /// Every hierarchy class gets a channel; classes without an accepted
    /// prediction are zero filled.
    pub fn expand_image_wise(
        &self,
        maps: &[ClassActivationMap],
        num_images: usize,
        num_classes: usize,
    ) -> Result<Vec<ActivationVolume>> {
        let mut volumes = vec![ActivationVolume::zeros(num_classes, self.patch_size); num_images];

        for cam in maps {
            if cam.image >= num_images || cam.channel >= num_classes {
                return Err(Error::data_integrity(format!(
                    "activation map of patch {} channel {} exceeds {} patches × {} classes",
                    cam.image, cam.channel, num_images, num_classes
                )));
            }
            let [height, width] = self.patch_size;
            if cam.map.dim() != (height, width) {
                return Err(Error::dimension_mismatch(
                    "activation map",
                    self.patch_size,
                    cam.map.shape(),
                ));
            }

            let mut channel = volumes[cam.image].channel_mut(cam.channel);
            Zip::from(&mut channel)
                .and(&cam.map)
                .for_each(|dst, &src| *dst = dst.max(src));
        }

        Ok(volumes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    /// A classifier whose features are fixed and whose class score is a
    /// linear read-out of one feature channel per class.
    struct LinearReadout {
        features: Array3<f32>,
        scores: Array2<f32>,
    }

    impl Classifier for LinearReadout {
        fn num_classes(&self) -> usize {
            self.scores.ncols()
        }

        fn predict(&mut self, patches: &[Patch]) -> Result<Array2<f32>> {
            Ok(self.scores.slice(s![..patches.len(), ..]).to_owned())
        }

        fn feature_gradients(&mut self, _patch: &Patch, class: usize) -> Result<FeatureGradients> {
            let mut gradients = Array3::zeros(self.features.dim());
            gradients.index_axis_mut(Axis(0), class).fill(1.0);
            Ok(FeatureGradients {
                features: self.features.clone(),
                gradients,
            })
        }

        fn final_layer(&self) -> &str {
            "readout"
        }
    }

    fn patch(index: usize) -> Patch {
        Patch {
            pixels: Array3::zeros((4, 4, 3)),
            image_id: "slide.png".into(),
            offset: [0, 0],
            crop_index: index,
        }
    }

    #[test]
    fn grad_cam_rectifies_weighted_channels() -> Result<()> {
        let features = Array3::from_shape_vec(
            (2, 2, 2),
            vec![
                1.0, -1.0, 2.0, 0.0, //
                5.0, 5.0, 5.0, 5.0,
            ],
        )
        .unwrap();
        let mut gradients = Array3::zeros((2, 2, 2));
        gradients.index_axis_mut(Axis(0), 0).fill(0.5);

        let cam = grad_cam(
            &FeatureGradients {
                features,
                gradients,
            },
            [2, 2],
        )?;
        assert_eq!(cam, array![[0.5, 0.0], [1.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn thresholds_and_split() -> Result<()> {
        let names: Vec<String> = vec!["A.W".into(), "G.O".into(), "T".into()];
        let table: IndexMap<String, f64> = [("G.O".to_string(), 0.9)].into_iter().collect();
        let thresholds = Thresholds::from_map(&names, &table)?;
        assert_eq!(thresholds.values(), &[0.5, 0.9, 0.5]);

        let scores = array![[0.6, 0.8, 0.1], [0.2, 0.95, 0.5]];
        let preds = thresholds.accept(scores.view())?;
        let pairs: Vec<_> = preds.iter().map(|pred| (pred.image, pred.class)).collect();
        assert_eq!(pairs, vec![(0, 0), (1, 1), (1, 2)]);

        let channels: IndexMap<usize, usize> = [(1, 2), (2, 4)].into_iter().collect();
        let split = split_by_htt(&preds, &channels);
        assert_eq!(split.len(), 2);
        assert_eq!((split[0].image, split[0].channel), (1, 2));
        assert_eq!((split[1].image, split[1].channel), (1, 4));

        let unknown: IndexMap<String, f64> = [("X".to_string(), 0.1)].into_iter().collect();
        assert!(Thresholds::from_map(&names, &unknown).is_err());
        Ok(())
    }

    #[test]
    fn expand_fills_missing_classes_with_zeros() -> Result<()> {
        let mut features = Array3::zeros((3, 2, 2));
        features.index_axis_mut(Axis(0), 1).fill(2.0);
        let mut readout = LinearReadout {
            features,
            scores: array![[0.1, 0.9, 0.1], [0.1, 0.1, 0.1]],
        };
        let patches = vec![patch(0), patch(1)];

        let scores = readout.predict(&patches)?;
        let preds = Thresholds::uniform(3, 0.5).accept(scores.view())?;
        let channels: IndexMap<usize, usize> = [(0, 1), (1, 2), (2, 3)].into_iter().collect();
        let preds = split_by_htt(&preds, &channels);

        let engine = ActivationMapEngine::new([4, 4])?;
        let maps = engine.generate(&mut readout, &patches, &preds)?;
        assert_eq!(maps.len(), 1);

        let volumes = engine.expand_image_wise(&maps, patches.len(), 4)?;
        assert_eq!(volumes.len(), 2);
        assert!(volumes.iter().all(|volume| volume.num_classes() == 4));
        assert!(volumes[0].channel(2).iter().all(|&value| value == 2.0));
        assert!(volumes[0].channel(0).iter().all(|&value| value == 0.0));
        assert!(volumes[1].data().iter().all(|&value| value == 0.0));
        Ok(())
    }

    #[test]
    fn reject_predictions_outside_batch() -> Result<()> {
        let mut readout = LinearReadout {
            features: Array3::zeros((1, 2, 2)),
            scores: array![[1.0]],
        };
        let engine = ActivationMapEngine::new([4, 4])?;
        let preds = [HttPrediction {
            image: 3,
            class: 0,
            channel: 0,
            score: 1.0,
        }];
        assert!(engine.generate(&mut readout, &[patch(0)], &preds).is_err());
        Ok(())
    }
}
