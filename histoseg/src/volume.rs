//! Activation volumes and label masks.

use crate::{common::*, utils::resize_nearest};

/// The value of a suppressed activation. It never wins an argmax.
pub const SUPPRESSED: f32 = f32::NEG_INFINITY;

/// RGB pixels laid out as `height × width × 3`.
pub type Pixels = Array3<u8>;

/// A patch-sized heat map of one (patch, class) pair.
pub type ActivationMap = Array2<f32>;

/// Stacked activation maps of every class of one hierarchy for one patch.
///
/// The array is laid out as `classes × height × width`, channels following the
/// canonical class order of the hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationVolume {
    data: Array3<f32>,
}

impl ActivationVolume {
    pub fn zeros(num_classes: usize, [height, width]: [usize; 2]) -> Self {
        Self {
            data: Array3::zeros((num_classes, height, width)),
        }
    }

    pub fn from_array(data: Array3<f32>) -> Self {
        Self { data }
    }

    pub fn num_classes(&self) -> usize {
        self.data.shape()[0]
    }

    /// The `[height, width]` of each channel.
    pub fn size(&self) -> [usize; 2] {
        let (_, height, width) = self.data.dim();
        [height, width]
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<f32> {
        &mut self.data
    }

    pub fn channel(&self, index: usize) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(0), index)
    }

    pub fn channel_mut(&mut self, index: usize) -> ArrayViewMut2<'_, f32> {
        self.data.index_axis_mut(Axis(0), index)
    }

    /// Per-pixel maximum over a subset of channels.
    ///
    /// An empty subset yields the suppression sentinel everywhere.
    pub fn max_over(&self, channels: &[usize]) -> Array2<f32> {
        let [height, width] = self.size();
        channels.iter().fold(
            Array2::from_elem((height, width), SUPPRESSED),
            |mut acc, &index| {
                Zip::from(&mut acc)
                    .and(&self.channel(index))
                    .for_each(|acc, &value| *acc = acc.max(value));
                acc
            },
        )
    }

    /// Per-pixel argmax over channels. Ties resolve to the lowest channel.
    pub fn argmax(&self) -> LabelMask {
        let labels = self.data.map_axis(Axis(0), |lane| argmax(lane));
        LabelMask {
            labels,
            num_classes: self.num_classes(),
        }
    }

    /// Check that the volume agrees with an expected channel count and size.
    pub fn ensure_shape(&self, context: &str, num_classes: usize, size: [usize; 2]) -> Result<()> {
        let [height, width] = size;
        if self.data.dim() != (num_classes, height, width) {
            return Err(Error::dimension_mismatch(
                context,
                [num_classes, height, width],
                self.data.shape(),
            ));
        }
        Ok(())
    }
}

/// Index of the largest value; NaN never wins and ties take the first index.
pub fn argmax(values: ArrayView1<'_, f32>) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NAN), |(best, best_value), (index, &value)| {
            if best_value.is_nan() || value > best_value {
                if value.is_nan() {
                    (best, best_value)
                } else {
                    (index, value)
                }
            } else {
                (best, best_value)
            }
        })
        .0
}

/// A per-pixel class assignment of one hierarchy.
///
/// Every label is smaller than `num_classes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMask {
    labels: Array2<usize>,
    num_classes: usize,
}

impl LabelMask {
    pub fn new(labels: Array2<usize>, num_classes: usize) -> Result<Self> {
        if let Some(&label) = labels.iter().find(|&&label| label >= num_classes) {
            return Err(Error::data_integrity(format!(
                "label {} is out of range for {} classes",
                label, num_classes
            )));
        }
        Ok(Self {
            labels,
            num_classes,
        })
    }

    /// A mask assigning the same class to every pixel.
    pub fn filled(label: usize, num_classes: usize, [height, width]: [usize; 2]) -> Result<Self> {
        Self::new(Array2::from_elem((height, width), label), num_classes)
    }

    pub fn labels(&self) -> &Array2<usize> {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn size(&self) -> [usize; 2] {
        let (height, width) = self.labels.dim();
        [height, width]
    }

    /// Nearest-neighbour resize.
    pub fn resized(&self, size: [usize; 2]) -> Self {
        let labels = self.labels.view().insert_axis(Axis(2)).to_owned();
        Self {
            labels: resize_nearest(&labels, size).index_axis_move(Axis(2), 0),
            num_classes: self.num_classes,
        }
    }

    /// Paint each pixel with its class colour.
    pub fn colorize(&self, colours: &[Rgb]) -> Result<Pixels> {
        if colours.len() != self.num_classes {
            return Err(Error::dimension_mismatch(
                "colour table",
                [self.num_classes],
                [colours.len()],
            ));
        }
        let [height, width] = self.size();
        let pixels = Array3::from_shape_fn((height, width, 3), |(row, col, ch)| {
            colours[self.labels[[row, col]]].0[ch]
        });
        Ok(pixels)
    }
}

/// Ground-truth class membership decoded from an annotation raster.
///
/// Pixels whose colour matches no class are `None` and count towards no class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroundTruthMask {
    labels: Array2<Option<usize>>,
    num_classes: usize,
}

impl GroundTruthMask {
    pub fn new(labels: Array2<Option<usize>>, num_classes: usize) -> Result<Self> {
        if let Some(label) = labels.iter().flatten().find(|&&label| label >= num_classes) {
            return Err(Error::data_integrity(format!(
                "ground-truth label {} is out of range for {} classes",
                label, num_classes
            )));
        }
        Ok(Self {
            labels,
            num_classes,
        })
    }

    /// Match every pixel against the colour table by exact RGB equality.
    pub fn from_colours(pixels: &Pixels, colours: &[Rgb]) -> Self {
        Self {
            labels: decode_colours(pixels, colours),
            num_classes: colours.len(),
        }
    }

    pub fn labels(&self) -> &Array2<Option<usize>> {
        &self.labels
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn size(&self) -> [usize; 2] {
        let (height, width) = self.labels.dim();
        [height, width]
    }

    /// Pixel count of each class.
    pub fn histogram(&self) -> Vec<u64> {
        let mut counts = vec![0; self.num_classes];
        self.labels
            .iter()
            .flatten()
            .for_each(|&label| counts[label] += 1);
        counts
    }
}

impl From<LabelMask> for GroundTruthMask {
    fn from(mask: LabelMask) -> Self {
        Self {
            labels: mask.labels.mapv(Some),
            num_classes: mask.num_classes,
        }
    }
}

fn decode_colours(pixels: &Pixels, colours: &[Rgb]) -> Array2<Option<usize>> {
    pixels.map_axis(Axis(2), |rgb| {
        let colour = Rgb::new(rgb[0], rgb[1], rgb[2]);
        colours.iter().position(|&candidate| candidate == colour)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn argmax_prefers_first_and_skips_suppressed() {
        let volume = ActivationVolume::from_array(
            Array3::from_shape_vec(
                (3, 1, 3),
                vec![
                    SUPPRESSED, 0.5, 0.2, //
                    0.1, 0.5, f32::NAN, //
                    0.1, 0.1, 0.3,
                ],
            )
            .unwrap(),
        );
        let mask = volume.argmax();
        assert_eq!(mask.labels(), &array![[1, 0, 2]]);
        assert_eq!(mask.num_classes(), 3);
    }

    #[test]
    fn max_over_channels() {
        let mut volume = ActivationVolume::zeros(3, [2, 2]);
        volume.channel_mut(1).fill(0.25);
        volume.channel_mut(2)[[0, 1]] = 0.75;
        let max = volume.max_over(&[1, 2]);
        assert_eq!(max, array![[0.25, 0.75], [0.25, 0.25]]);
        assert!(volume.max_over(&[]).iter().all(|&value| value == SUPPRESSED));
    }

    #[test]
    fn resize_label_mask() -> Result<()> {
        let mask = LabelMask::new(array![[0, 1], [2, 0]], 3)?;
        let resized = mask.resized([4, 2]);
        assert_eq!(resized.labels(), &array![[0, 1], [0, 1], [2, 0], [2, 0]]);
        assert_eq!(resized.num_classes(), 3);
        Ok(())
    }

    #[test]
    fn reject_out_of_range_labels() {
        assert!(LabelMask::new(array![[0, 3]], 3).is_err());
        assert!(GroundTruthMask::new(array![[None, Some(2)]], 2).is_err());
    }

    #[test]
    fn colour_round_trip_with_unknown_colour() -> Result<()> {
        let colours = [Rgb::new(255, 255, 255), Rgb::new(255, 0, 0)];
        let mask = LabelMask::new(array![[0, 1], [1, 1]], 2)?;
        let mut pixels = mask.colorize(&colours)?;
        pixels[[0, 0, 1]] = 7;

        let gt = GroundTruthMask::from_colours(&pixels, &colours);
        assert_eq!(gt.labels(), &array![[None, Some(1)], [Some(1), Some(1)]]);
        assert_eq!(gt.histogram(), vec![0, 3]);
        Ok(())
    }
}
