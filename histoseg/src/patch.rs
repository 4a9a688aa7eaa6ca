//! Patch extraction from source images.

use crate::{
    common::*,
    utils::{reflect_index, resize_bilinear},
    volume::{LabelMask, Pixels},
};

/// A fixed-size tile cropped from a source image.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub pixels: Pixels,
    /// The file name of the source image.
    pub image_id: String,
    /// `[row, col]` of the top-left pixel in the downsampled source image.
    pub offset: [usize; 2],
    /// The row-major index of the crop within its source image.
    pub crop_index: usize,
}

impl Patch {
    pub fn size(&self) -> [usize; 2] {
        let (height, width, _) = self.pixels.dim();
        [height, width]
    }
}

/// The patches cropped from one source image.
#[derive(Debug, Clone)]
pub struct CroppedImage {
    pub patches: Vec<Patch>,
    /// Number of crops along `[rows, cols]`.
    pub num_crops: [usize; 2],
    /// The downsampled and padded image the patches tile exactly.
    pub canvas: Pixels,
    /// `[row, col]` where the source image starts on the canvas. Non-zero
    /// only for mirror padded small images.
    pub origin: [usize; 2],
    /// `[height, width]` the source image covers on the canvas.
    pub downsampled: [usize; 2],
}

impl CroppedImage {
    /// Tile per-patch label masks back into one mask of size `size`.
    ///
    /// Masks are expected in crop order. Padding on every border is dropped
    /// and the remainder resized by nearest neighbour sampling.
    pub fn assemble_labels(&self, masks: &[LabelMask], size: [usize; 2]) -> Result<LabelMask> {
        let first = masks
            .first()
            .ok_or_else(|| Error::data_integrity("no patch masks to assemble"))?;
        if masks.len() != self.patches.len() {
            return Err(Error::data_integrity(format!(
                "expect {} patch masks, but get {}",
                self.patches.len(),
                masks.len()
            )));
        }
        let num_classes = first.num_classes();
        let (canvas_h, canvas_w, _) = self.canvas.dim();
        let mut labels = Array2::zeros((canvas_h, canvas_w));

        for (patch, mask) in izip!(&self.patches, masks) {
            if mask.num_classes() != num_classes || mask.size() != patch.size() {
                return Err(Error::dimension_mismatch(
                    format!("label mask of crop {}", patch.crop_index),
                    [num_classes, patch.size()[0], patch.size()[1]],
                    [mask.num_classes(), mask.size()[0], mask.size()[1]],
                ));
            }
            let [top, left] = patch.offset;
            let [height, width] = patch.size();
            labels
                .slice_mut(s![top..top + height, left..left + width])
                .assign(mask.labels());
        }

        let [top, left] = self.origin;
        let [ds_h, ds_w] = self.downsampled;
        let cropped = labels
            .slice(s![top..top + ds_h, left..left + ds_w])
            .to_owned();
        Ok(LabelMask::new(cropped, num_classes)?.resized(size))
    }
}

/// Downsample an image by `down_fac` and tile it into `patch_size` crops.
///
/// Images whose downsampled size is smaller than a patch are mirror padded
/// before downsampling. The canvas is then reflected at its bottom and right
/// borders up to a whole number of patches.
pub fn crop_into_patches(
    image_id: &str,
    image: &Pixels,
    down_fac: f64,
    patch_size: [usize; 2],
) -> Result<CroppedImage> {
    let (orig_h, orig_w, num_channels) = image.dim();
    if num_channels != 3 {
        return Err(Error::dimension_mismatch(
            format!("image '{}'", image_id),
            [orig_h, orig_w, 3],
            [orig_h, orig_w, num_channels],
        ));
    }
    if orig_h == 0 || orig_w == 0 {
        return Err(Error::config(format!("image '{}' is empty", image_id)));
    }
    if down_fac <= 0.0 || patch_size.contains(&0) {
        return Err(Error::config(format!(
            "invalid down-sampling factor {} or patch size {:?}",
            down_fac, patch_size
        )));
    }

    let downsampled = |len: usize| (len as f64 / down_fac).round() as usize;
    let [patch_h, patch_w] = patch_size;

    // mirror pad small images so that downsampling yields at least one patch
    let (source, [ds_h, ds_w], origin, extent) = if downsampled(orig_h) < patch_h || downsampled(orig_w) < patch_w {
        let pad = |orig: usize, patch: usize| -> usize {
            let missing = (patch as f64 * down_fac - orig as f64).max(0.0);
            (missing / 2.0).ceil() as usize
        };
        let pad_v = pad(orig_h, patch_h);
        let pad_h = pad(orig_w, patch_w);
        let padded = reflect_pad(image, [pad_v, pad_v], [pad_h, pad_h]);
        let (padded_h, padded_w, _) = padded.dim();
        let ds_h = cmp::max(downsampled(padded_h), patch_h);
        let ds_w = cmp::max(downsampled(padded_w), patch_w);

        // locate the unpadded image on the resized canvas
        let locate = |pad: usize, orig: usize, padded: usize, ds: usize| -> (usize, usize) {
            let scale = ds as f64 / padded as f64;
            let start = cmp::min((pad as f64 * scale).round() as usize, ds - 1);
            let len = ((orig as f64 * scale).round() as usize).clamp(1, ds - start);
            (start, len)
        };
        let (top, extent_h) = locate(pad_v, orig_h, padded_h, ds_h);
        let (left, extent_w) = locate(pad_h, orig_w, padded_w, ds_w);
        (padded, [ds_h, ds_w], [top, left], [extent_h, extent_w])
    } else {
        let ds_h = downsampled(orig_h);
        let ds_w = downsampled(orig_w);
        (image.clone(), [ds_h, ds_w], [0, 0], [ds_h, ds_w])
    };

    let resized = resize_pixels(&source, [ds_h, ds_w]);
    let num_crops = [
        (ds_h + patch_h - 1) / patch_h,
        (ds_w + patch_w - 1) / patch_w,
    ];
    let canvas = reflect_pad(
        &resized,
        [0, num_crops[0] * patch_h - ds_h],
        [0, num_crops[1] * patch_w - ds_w],
    );

    let patches = iproduct!(0..num_crops[0], 0..num_crops[1])
        .enumerate()
        .map(|(crop_index, (row, col))| {
            let top = row * patch_h;
            let left = col * patch_w;
            let pixels = canvas
                .slice(s![top..top + patch_h, left..left + patch_w, ..])
                .to_owned();
            Patch {
                pixels,
                image_id: image_id.to_string(),
                offset: [top, left],
                crop_index,
            }
        })
        .collect();

    Ok(CroppedImage {
        patches,
        num_crops,
        canvas,
        origin,
        downsampled: extent,
    })
}

/// Reflect-pad the spatial axes of an image.
pub fn reflect_pad(image: &Pixels, [top, bottom]: [usize; 2], [left, right]: [usize; 2]) -> Pixels {
    let (height, width, channels) = image.dim();
    Array3::from_shape_fn(
        (height + top + bottom, width + left + right, channels),
        |(row, col, ch)| {
            let src_row = reflect_index(row as isize - top as isize, height);
            let src_col = reflect_index(col as isize - left as isize, width);
            image[[src_row, src_col, ch]]
        },
    )
}

/// Bilinear resize of each colour channel.
pub fn resize_pixels(image: &Pixels, size: [usize; 2]) -> Pixels {
    let (height, width, channels) = image.dim();
    if [height, width] == size {
        return image.clone();
    }
    let [out_h, out_w] = size;
    let mut output = Array3::zeros((out_h, out_w, channels));
    for ch in 0..channels {
        let plane = image.index_axis(Axis(2), ch).mapv(|value| value as f32);
        let resized = resize_bilinear(plane.view(), size);
        output
            .index_axis_mut(Axis(2), ch)
            .assign(&resized.mapv(|value| value.round().clamp(0.0, 255.0) as u8));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_image(height: usize, width: usize) -> Pixels {
        Array3::from_shape_fn((height, width, 3), |(row, col, ch)| {
            ((row * 7 + col * 3 + ch) % 256) as u8
        })
    }

    #[test]
    fn tile_without_downsampling() -> Result<()> {
        let image = gradient_image(10, 6);
        let cropped = crop_into_patches("a.png", &image, 1.0, [4, 4])?;

        assert_eq!(cropped.num_crops, [3, 2]);
        assert_eq!(cropped.patches.len(), 6);
        assert_eq!(cropped.canvas.dim(), (12, 8, 3));

        let last = &cropped.patches[5];
        assert_eq!(last.offset, [8, 4]);
        assert_eq!(last.crop_index, 5);
        assert_eq!(last.size(), [4, 4]);

        // interior pixels are copied verbatim
        assert_eq!(cropped.patches[1].pixels[[1, 1, 2]], image[[1, 5, 2]]);
        // padded rows mirror the last rows
        assert_eq!(cropped.canvas[[10, 0, 0]], image[[9, 0, 0]]);
        assert_eq!(cropped.canvas[[11, 0, 0]], image[[8, 0, 0]]);
        Ok(())
    }

    #[test]
    fn small_images_are_padded_to_a_patch() -> Result<()> {
        let image = gradient_image(2, 2);
        let cropped = crop_into_patches("b.png", &image, 2.0, [4, 4])?;
        assert_eq!(cropped.num_crops, [1, 1]);
        assert_eq!(cropped.patches.len(), 1);
        assert_eq!(cropped.patches[0].size(), [4, 4]);
        assert_eq!(cropped.origin, [2, 2]);
        assert_eq!(cropped.downsampled, [1, 1]);
        Ok(())
    }

    #[test]
    fn assemble_labels_of_padded_image() -> Result<()> {
        // rows of grey levels 0, 100 and 200
        let image = Array3::from_shape_fn((3, 3, 3), |(row, _, _)| (row * 100) as u8);
        let cropped = crop_into_patches("e.png", &image, 1.0, [4, 4])?;
        assert_eq!(cropped.origin, [1, 1]);
        assert_eq!(cropped.downsampled, [3, 3]);

        let masks: Vec<_> = cropped
            .patches
            .iter()
            .map(|patch| {
                let grey = patch.pixels.index_axis(Axis(2), 0);
                LabelMask::new(grey.mapv(|value| value as usize / 100), 3)
            })
            .try_collect()?;
        let assembled = cropped.assemble_labels(&masks, [3, 3])?;
        for row in 0..3 {
            assert!(assembled.labels().row(row).iter().all(|&label| label == row));
        }
        Ok(())
    }

    #[test]
    fn assemble_patch_labels() -> Result<()> {
        let image = gradient_image(6, 6);
        let cropped = crop_into_patches("d.png", &image, 1.0, [4, 4])?;
        assert_eq!(cropped.downsampled, [6, 6]);

        let masks: Vec<_> = cropped
            .patches
            .iter()
            .map(|patch| LabelMask::filled(patch.crop_index, 4, patch.size()))
            .try_collect()?;
        let assembled = cropped.assemble_labels(&masks, [6, 6])?;
        assert_eq!(assembled.labels()[[0, 0]], 0);
        assert_eq!(assembled.labels()[[0, 5]], 1);
        assert_eq!(assembled.labels()[[5, 0]], 2);
        assert_eq!(assembled.labels()[[5, 5]], 3);

        let upscaled = cropped.assemble_labels(&masks, [12, 12])?;
        assert_eq!(upscaled.size(), [12, 12]);
        assert_eq!(upscaled.labels()[[11, 11]], 3);

        assert!(cropped.assemble_labels(&masks[..2], [6, 6]).is_err());
        Ok(())
    }

    #[test]
    fn reject_invalid_factors() {
        let image = gradient_image(4, 4);
        assert!(crop_into_patches("c.png", &image, 0.0, [4, 4]).is_err());
        assert!(crop_into_patches("c.png", &image, 1.0, [0, 4]).is_err());
    }
}
