//! TorchScript classifier backend.

use super::{Classifier, FeatureGradients};
use crate::{common::*, patch::Patch};
use tch::{CModule, Device, IValue, Kind, Tensor};

/// A TorchScript classifier whose `forward` returns `(features, logits)`,
/// `features` being the output of the final convolutional layer.
pub struct TorchClassifier {
    module: CModule,
    device: Device,
    num_classes: usize,
    final_layer: String,
    mean: [f32; 3],
    std: [f32; 3],
}

impl fmt::Debug for TorchClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorchClassifier")
            .field("device", &self.device)
            .field("num_classes", &self.num_classes)
            .field("final_layer", &self.final_layer)
            .finish()
    }
}

impl TorchClassifier {
    pub fn open<P>(
        path: P,
        device: Device,
        num_classes: usize,
        final_layer: impl Into<String>,
        mean: [f32; 3],
        std: [f32; 3],
    ) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::config(format!(
                "model file '{}' does not exist",
                path.display()
            )));
        }
        if std.iter().any(|&value| value <= 0.0) {
            return Err(Error::config("normalization std must be positive"));
        }
        let module = CModule::load_on_device(path, device)?;
        info!("loaded classifier '{}' on {:?}", path.display(), device);

        Ok(Self {
            module,
            device,
            num_classes,
            final_layer: final_layer.into(),
            mean,
            std,
        })
    }

    /// Normalize patches into a `batch × 3 × height × width` tensor.
    fn input_tensor(&self, patches: &[Patch]) -> Result<Tensor> {
        let [height, width] = patches
            .first()
            .map(|patch| patch.size())
            .ok_or_else(|| Error::config("empty patch batch"))?;
        if let Some(patch) = patches.iter().find(|patch| patch.size() != [height, width]) {
            return Err(Error::dimension_mismatch(
                "patch batch",
                [height, width],
                patch.size(),
            ));
        }

        let values: Vec<f32> = patches
            .iter()
            .flat_map(|patch| {
                patch
                    .pixels
                    .indexed_iter()
                    .map(|((_, _, ch), &value)| {
                        (value as f32 / 255.0 - self.mean[ch]) / self.std[ch]
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        let input = Tensor::of_slice(&values)
            .view([patches.len() as i64, height as i64, width as i64, 3])
            .permute(&[0, 3, 1, 2])
            .contiguous()
            .to_device(self.device);
        Ok(input)
    }

    fn forward(&self, input: &Tensor) -> Result<(Tensor, Tensor)> {
        let output = self.module.forward_is(&[IValue::Tensor(input.shallow_clone())])?;
        match output {
            IValue::Tuple(mut items) if items.len() == 2 => {
                let logits = items.pop();
                let features = items.pop();
                match (features, logits) {
                    (Some(IValue::Tensor(features)), Some(IValue::Tensor(logits))) => {
                        Ok((features, logits))
                    }
                    _ => Err(Error::config("classifier outputs must be tensors")),
                }
            }
            _ => Err(Error::config(
                "classifier must return a (features, logits) tuple",
            )),
        }
    }
}

impl Classifier for TorchClassifier {
    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn predict(&mut self, patches: &[Patch]) -> Result<Array2<f32>> {
        if patches.is_empty() {
            return Ok(Array2::zeros((0, self.num_classes)));
        }
        let input = self.input_tensor(patches)?;
        let scores = tch::no_grad(|| -> Result<_> {
            let (_, logits) = self.forward(&input)?;
            Ok(logits.sigmoid())
        })?;

        let values = to_vec(&scores);
        let num_classes = values.len() / patches.len();
        if num_classes != self.num_classes {
            return Err(Error::dimension_mismatch(
                "classifier scores",
                [patches.len(), self.num_classes],
                [patches.len(), num_classes],
            ));
        }
        Array2::from_shape_vec((patches.len(), num_classes), values)
            .map_err(|err| Error::config(format!("malformed classifier scores: {}", err)))
    }

    fn feature_gradients(&mut self, patch: &Patch, class: usize) -> Result<FeatureGradients> {
        if class >= self.num_classes {
            return Err(Error::data_integrity(format!(
                "class {} exceeds {} classifier outputs",
                class, self.num_classes
            )));
        }
        let input = self
            .input_tensor(std::slice::from_ref(patch))?
            .set_requires_grad(true);
        let (features, logits) = self.forward(&input)?;
        let target = logits.select(1, class as i64).sum(Kind::Float);
        let mut gradients = Tensor::run_backward(&[&target], &[&features], false, false);
        let gradients = gradients
            .pop()
            .ok_or_else(|| Error::config("missing feature gradients"))?;

        let shape: Vec<usize> = features.size().iter().map(|&dim| dim as usize).collect();
        let (channels, height, width) = match shape.as_slice() {
            &[1, c, h, w] => (c, h, w),
            _ => {
                return Err(Error::dimension_mismatch(
                    format!("output of layer '{}'", self.final_layer),
                    [1, 0, 0, 0],
                    shape.clone(),
                ))
            }
        };
        let to_array = |tensor: &Tensor| -> Result<Array3<f32>> {
            Array3::from_shape_vec((channels, height, width), to_vec(tensor))
                .map_err(|err| Error::config(format!("malformed feature map: {}", err)))
        };

        Ok(FeatureGradients {
            features: to_array(&features.detach())?,
            gradients: to_array(&gradients)?,
        })
    }

    fn final_layer(&self) -> &str {
        &self.final_layer
    }
}

fn to_vec(tensor: &Tensor) -> Vec<f32> {
    let flat = tensor
        .to_device(Device::Cpu)
        .to_kind(Kind::Float)
        .flatten(0, -1);
    Vec::<f32>::from(&flat)
}
