//! Class-specific activation composition.

use crate::{
    common::*,
    volume::{ActivationVolume, LabelMask, SUPPRESSED},
};

/// Turns adjusted activations into class-specific activations.
///
/// Each channel is compared against the strongest competing channel at the
/// same pixel, `cs[c] = a[c] - max_{k != c} a[k]`. The winning channel ends up
/// non-negative and every other channel non-positive, so the per-pixel argmax
/// is unchanged. Suppressed channels stay suppressed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassSpecificComposer {
    clip: f32,
}

impl Default for ClassSpecificComposer {
    fn default() -> Self {
        Self { clip: 1e-5 }
    }
}

impl ClassSpecificComposer {
    /// `clip` is the lower bound of the probability view.
    pub fn new(clip: f32) -> Result<Self> {
        if !(clip > 0.0 && clip < 1.0) {
            return Err(Error::config(format!(
                "probability clip {} must lie in (0, 1)",
                clip
            )));
        }
        Ok(Self { clip })
    }

    pub fn clip(&self) -> f32 {
        self.clip
    }

    pub fn compose(&self, volume: &ActivationVolume) -> ActivationVolume {
        let mut composed = volume.clone();
        let num_classes = volume.num_classes();

        Zip::from(composed.data_mut().lanes_mut(Axis(0)))
            .and(volume.data().lanes(Axis(0)))
            .for_each(|mut out, lane| {
                // the two strongest activations and the index of the first
                let (top_index, top, second) = lane.iter().enumerate().fold(
                    (num_classes, SUPPRESSED, SUPPRESSED),
                    |(index, top, second), (candidate, &value)| {
                        if index == num_classes || value > top {
                            (candidate, value, top)
                        } else if value > second {
                            (index, top, value)
                        } else {
                            (index, top, second)
                        }
                    },
                );

                izip!(0.., out.iter_mut(), lane.iter()).for_each(|(index, out, &value)| {
                    let rival = if index == top_index { second } else { top };
                    *out = if value == SUPPRESSED {
                        SUPPRESSED
                    } else {
                        value - rival
                    };
                });
            });

        composed
    }

    /// Class-specific activations clamped into `[clip, 1]`.
    ///
    /// Suppressed entries become zero, so that a channel suppressed at every
    /// pixel carries no probability mass.
    pub fn probabilities(&self, composed: &ActivationVolume) -> Array3<f32> {
        composed.data().mapv(|value| {
            if value == SUPPRESSED {
                0.0
            } else {
                value.clamp(self.clip, 1.0)
            }
        })
    }

    /// Per-pixel argmax labeling; ties resolve to the lowest class index.
    pub fn labels(&self, composed: &ActivationVolume) -> LabelMask {
        composed.argmax()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn compose_single_pixel() {
        let volume =
            ActivationVolume::from_array(Array3::from_shape_vec((3, 1, 1), vec![0.2, 0.7, 0.5]).unwrap());
        let composer = ClassSpecificComposer::default();
        let composed = composer.compose(&volume);
        let values: Vec<f32> = composed.data().iter().copied().collect();
        assert_abs_diff_eq!(values[0], -0.5);
        assert_abs_diff_eq!(values[1], 0.2);
        assert_abs_diff_eq!(values[2], -0.2);
    }

    #[test]
    fn suppressed_channels_stay_suppressed() {
        let volume = ActivationVolume::from_array(
            Array3::from_shape_vec((3, 1, 2), vec![SUPPRESSED, SUPPRESSED, 0.3, SUPPRESSED, 0.1, SUPPRESSED])
                .unwrap(),
        );
        let composer = ClassSpecificComposer::default();
        let composed = composer.compose(&volume);
        assert_eq!(composed.data()[[0, 0, 0]], SUPPRESSED);
        assert_eq!(composed.data()[[0, 0, 1]], SUPPRESSED);
        assert_abs_diff_eq!(composed.data()[[1, 0, 0]], 0.2);
        assert!(composed.data().iter().all(|value| !value.is_nan()));

        let probs = composer.probabilities(&composed);
        assert_eq!(probs[[0, 0, 0]], 0.0);
        assert_abs_diff_eq!(probs[[2, 0, 0]], 1e-5);
        assert_eq!(composer.labels(&composed).labels()[[0, 0]], 1);
        assert_eq!(composer.labels(&composed).labels()[[0, 1]], 0);
    }

    #[test]
    fn composition_preserves_argmax() {
        let mut rng = StdRng::seed_from_u64(7);
        let composer = ClassSpecificComposer::default();

        for _ in 0..20 {
            let data = Array3::from_shape_fn((5, 6, 6), |_| {
                if rng.gen_bool(0.2) {
                    SUPPRESSED
                } else {
                    rng.gen_range(0.0..1.0)
                }
            });
            let volume = ActivationVolume::from_array(data);
            let composed = composer.compose(&volume);
            assert_eq!(volume.argmax(), composer.labels(&composed));
        }
    }

    #[test]
    fn reject_invalid_clip() {
        assert!(ClassSpecificComposer::new(0.0).is_err());
        assert!(ClassSpecificComposer::new(1.5).is_err());
        assert!(ClassSpecificComposer::new(1e-3).is_ok());
    }
}
