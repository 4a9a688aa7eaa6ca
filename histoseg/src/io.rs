//! Raster reading and artifact export.

use crate::{
    common::*,
    gradcam::HttPrediction,
    utils::resize_nearest,
    volume::{ActivationMap, GroundTruthMask, Pixels},
};
use image::{GrayImage, RgbImage};

/// The weight of the mask colour in an overlay.
pub const OVERLAY_RATIO: f64 = 0.75;

pub fn read_pixels(path: impl AsRef<Path>) -> Result<Pixels> {
    let path = path.as_ref();
    let image = image::open(path)
        .map_err(|err| Error::image(path, err))?
        .to_rgb8();
    let (width, height) = image.dimensions();
    Array3::from_shape_vec((height as usize, width as usize, 3), image.into_raw())
        .map_err(|err| Error::config(format!("malformed image '{}': {}", path.display(), err)))
}

pub fn write_pixels(path: impl AsRef<Path>, pixels: &Pixels) -> Result<()> {
    let path = path.as_ref();
    let (height, width, _) = pixels.dim();
    let raw: Vec<u8> = pixels.iter().copied().collect();
    let image = RgbImage::from_raw(width as u32, height as u32, raw).ok_or_else(|| {
        Error::dimension_mismatch(
            format!("image '{}'", path.display()),
            [height, width, 3],
            pixels.shape(),
        )
    })?;
    image.save(path).map_err(|err| Error::image(path, err))
}

/// Read a grayscale activation map scaled into `[0, 1]`.
pub fn read_activation_map(path: impl AsRef<Path>) -> Result<ActivationMap> {
    let path = path.as_ref();
    let image = image::open(path)
        .map_err(|err| Error::image(path, err))?
        .to_luma8();
    let (width, height) = image.dimensions();
    let values: Vec<f32> = image.into_raw().into_iter().map(|value| value as f32 / 255.0).collect();
    Array2::from_shape_vec((height as usize, width as usize), values)
        .map_err(|err| Error::config(format!("malformed image '{}': {}", path.display(), err)))
}

/// Save an activation map as grayscale, clipping values outside `[0, 1]`.
pub fn write_activation_map(path: impl AsRef<Path>, map: &ActivationMap) -> Result<()> {
    let path = path.as_ref();
    let (height, width) = map.dim();
    let raw: Vec<u8> = map
        .iter()
        .map(|&value| {
            let value = if value.is_finite() { value } else { 0.0 };
            (value.clamp(0.0, 1.0) * 255.0).round() as u8
        })
        .collect();
    let image = GrayImage::from_raw(width as u32, height as u32, raw).ok_or_else(|| {
        Error::dimension_mismatch(
            format!("image '{}'", path.display()),
            [height, width],
            map.shape(),
        )
    })?;
    image.save(path).map_err(|err| Error::image(path, err))
}

/// Read a colour-coded annotation raster, resized to `size` by nearest
/// neighbour sampling when needed.
pub fn read_ground_truth(
    path: impl AsRef<Path>,
    colours: &[Rgb],
    size: [usize; 2],
) -> Result<GroundTruthMask> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(Error::data_integrity(format!(
            "ground-truth annotation '{}' does not exist",
            path.display()
        )));
    }
    let pixels = resize_nearest(&read_pixels(path)?, size);
    Ok(GroundTruthMask::from_colours(&pixels, colours))
}

/// Blend a colourized mask over the source image.
pub fn overlay(mask: &Pixels, image: &Pixels) -> Result<Pixels> {
    if mask.dim() != image.dim() {
        return Err(Error::dimension_mismatch(
            "overlay",
            mask.shape(),
            image.shape(),
        ));
    }
    fn rgb(lane: ArrayView1<'_, u8>) -> Rgb {
        Rgb([lane[0], lane[1], lane[2]])
    }

    let mut blended = Pixels::zeros(image.dim());
    Zip::from(blended.lanes_mut(Axis(2)))
        .and(mask.lanes(Axis(2)))
        .and(image.lanes(Axis(2)))
        .for_each(|mut out, mask, pixel| {
            let colour = rgb(mask).blend(rgb(pixel), OVERLAY_RATIO);
            out.assign(&ArrayView1::from(&colour.0[..]));
        });
    Ok(blended)
}

/// List the png images of a directory in file name order.
pub fn list_images(dir: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(Error::config(format!(
            "input directory '{}' does not exist",
            dir.display()
        )));
    }
    let pattern = format!("{}/*.png", glob::Pattern::escape(&dir.display().to_string()));
    let paths: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|err| Error::config(format!("invalid pattern '{}': {}", pattern, err)))?
        .map(|entry| {
            entry.map_err(|err| {
                let path = err.path().to_owned();
                Error::io(path, std::io::Error::from(err))
            })
        })
        .filter_ok(|path| path.is_file())
        .try_collect()?;
    Ok(paths.into_iter().sorted().collect())
}

/// Write the accepted predictions of a hierarchy, one row per patch.
pub fn write_patch_confidence(
    path: impl AsRef<Path>,
    patch_names: &[String],
    class_names: &[String],
    predictions: &[HttPrediction],
) -> Result<()> {
    let path = path.as_ref();
    let mut scores = Array2::<f32>::zeros((patch_names.len(), class_names.len()));
    for pred in predictions {
        if pred.image >= patch_names.len() || pred.channel >= class_names.len() {
            return Err(Error::data_integrity(format!(
                "prediction of patch {} channel {} is out of range",
                pred.image, pred.channel
            )));
        }
        scores[[pred.image, pred.channel]] = pred.score;
    }

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(std::iter::once("patch").chain(class_names.iter().map(String::as_str)))?;
    for (name, row) in izip!(patch_names, scores.outer_iter()) {
        writer.write_record(
            std::iter::once(name.clone()).chain(row.iter().map(|score| score.to_string())),
        )?;
    }
    writer.flush().map_err(|err| Error::io(path, err))
}

/// Write the mean confidence of the reported class for each image.
pub fn write_confidence_scores(path: impl AsRef<Path>, scores: &[(String, f32)]) -> Result<()> {
    let path = path.as_ref();
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&["image", "confidence"])?;
    for (image, score) in scores {
        writer.write_record(&[image.clone(), score.to_string()])?;
    }
    writer.flush().map_err(|err| Error::io(path, err))
}

pub fn create_dir(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).map_err(|err| Error::io(dir, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::LabelMask;
    use ndarray::array;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("histoseg-io-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn png_round_trip() -> Result<()> {
        let dir = scratch_dir("png");
        let pixels = Array3::from_shape_fn((3, 5, 3), |(row, col, ch)| (row * 50 + col * 10 + ch) as u8);
        let path = dir.join("image.png");
        write_pixels(&path, &pixels)?;
        assert_eq!(read_pixels(&path)?, pixels);

        let map = array![[0.0, 0.5, 1.0], [2.0, -1.0, 0.25]];
        let map_path = dir.join("map.png");
        write_activation_map(&map_path, &map)?;
        let loaded = read_activation_map(&map_path)?;
        assert_abs_diff_eq!(loaded[[0, 1]], 128.0 / 255.0, epsilon = 1e-6);
        assert_abs_diff_eq!(loaded[[1, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(loaded[[1, 1]], 0.0, epsilon = 1e-6);

        assert_eq!(list_images(&dir)?, vec![path, map_path]);
        fs::remove_dir_all(&dir).map_err(|err| Error::io(&dir, err))?;
        Ok(())
    }

    #[test]
    fn ground_truth_is_resized() -> Result<()> {
        let dir = scratch_dir("gt");
        let colours = [Rgb::new(0, 0, 0), Rgb::new(255, 255, 255)];
        let mask = LabelMask::new(array![[0, 1], [1, 0]], 2)?;
        let path = dir.join("gt.png");
        write_pixels(&path, &mask.colorize(&colours)?)?;

        let gt = read_ground_truth(&path, &colours, [4, 4])?;
        assert_eq!(gt.size(), [4, 4]);
        assert_eq!(gt.histogram(), vec![8, 8]);
        assert_eq!(gt.labels()[[0, 3]], Some(1));

        assert!(matches!(
            read_ground_truth(dir.join("missing.png"), &colours, [4, 4]),
            Err(Error::DataIntegrity(_))
        ));
        fs::remove_dir_all(&dir).map_err(|err| Error::io(&dir, err))?;
        Ok(())
    }

    #[test]
    fn overlay_blends_mask_over_image() -> Result<()> {
        let mask = Array3::from_elem((1, 1, 3), 200);
        let image = Array3::from_elem((1, 1, 3), 100);
        assert_eq!(overlay(&mask, &image)?[[0, 0, 0]], 175);

        let mask = ndarray::array![[[255, 0, 0], [0, 0, 255]]];
        let image = Array3::from_elem((1, 2, 3), 40);
        let blended = overlay(&mask, &image)?;
        assert_eq!(blended.slice(s![0, 0, ..]).to_vec(), vec![201, 10, 10]);
        assert_eq!(blended.slice(s![0, 1, ..]).to_vec(), vec![10, 10, 201]);
        assert!(overlay(&mask, &Array3::zeros((2, 1, 3))).is_err());
        Ok(())
    }
}
