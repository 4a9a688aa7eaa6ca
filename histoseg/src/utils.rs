//! Resampling and filtering helpers on 2D grids.

use crate::common::*;

/// Map an out-of-range index into `0..len` by half-sample symmetric
/// reflection (`d c b a | a b c d | d c b a`).
pub fn reflect_index(index: isize, len: usize) -> usize {
    let len = len as isize;
    let period = 2 * len;
    let index = index.rem_euclid(period);
    let index = if index >= len { period - index - 1 } else { index };
    index as usize
}

/// Bilinear resize with pixel-centre alignment.
pub fn resize_bilinear(input: ArrayView2<'_, f32>, [out_h, out_w]: [usize; 2]) -> Array2<f32> {
    let (in_h, in_w) = input.dim();
    if (in_h, in_w) == (out_h, out_w) {
        return input.to_owned();
    }
    if in_h == 0 || in_w == 0 {
        return Array2::zeros((out_h, out_w));
    }

    let sample_axis = |out_index: usize, in_len: usize, out_len: usize| -> (usize, usize, f32) {
        let scale = in_len as f32 / out_len as f32;
        let pos = ((out_index as f32 + 0.5) * scale - 0.5).clamp(0.0, (in_len - 1) as f32);
        let lower = pos.floor() as usize;
        let upper = cmp::min(lower + 1, in_len - 1);
        (lower, upper, pos - lower as f32)
    };

    let rows: Vec<_> = (0..out_h).map(|y| sample_axis(y, in_h, out_h)).collect();
    let cols: Vec<_> = (0..out_w).map(|x| sample_axis(x, in_w, out_w)).collect();

    Array2::from_shape_fn((out_h, out_w), |(y, x)| {
        let (y0, y1, fy) = rows[y];
        let (x0, x1, fx) = cols[x];
        let top = input[[y0, x0]] * (1.0 - fx) + input[[y0, x1]] * fx;
        let bottom = input[[y1, x0]] * (1.0 - fx) + input[[y1, x1]] * fx;
        top * (1.0 - fy) + bottom * fy
    })
}

/// Normalized 1D Gaussian kernel truncated at `truncate` standard deviations.
pub fn gaussian_kernel(sigma: f32, truncate: f32) -> Vec<f32> {
    let radius = (truncate * sigma + 0.5) as isize;
    let weights: Vec<f32> = (-radius..=radius)
        .map(|offset| (-0.5 * (offset as f32 / sigma).powi(2)).exp())
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|weight| weight / sum).collect()
}

/// Separable Gaussian smoothing with reflected borders.
pub fn gaussian_filter(input: ArrayView2<'_, f32>, sigma: f32) -> Array2<f32> {
    if sigma <= 0.0 {
        return input.to_owned();
    }
    let kernel = gaussian_kernel(sigma, 4.0);
    let radius = (kernel.len() / 2) as isize;
    let (height, width) = input.dim();

    let horizontal = Array2::from_shape_fn((height, width), |(y, x)| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, weight)| {
                let col = reflect_index(x as isize + k as isize - radius, width);
                weight * input[[y, col]]
            })
            .sum::<f32>()
    });

    Array2::from_shape_fn((height, width), |(y, x)| {
        kernel
            .iter()
            .enumerate()
            .map(|(k, weight)| {
                let row = reflect_index(y as isize + k as isize - radius, height);
                weight * horizontal[[row, x]]
            })
            .sum::<f32>()
    })
}

/// Nearest-neighbour resize of the first two axes.
pub fn resize_nearest<A>(input: &Array3<A>, [out_h, out_w]: [usize; 2]) -> Array3<A>
where
    A: Copy,
{
    let (in_h, in_w, channels) = input.dim();
    if (in_h, in_w) == (out_h, out_w) {
        return input.clone();
    }
    Array3::from_shape_fn((out_h, out_w, channels), |(row, col, ch)| {
        let src_row = cmp::min(row * in_h / out_h, in_h - 1);
        let src_col = cmp::min(col * in_w / out_w, in_w - 1);
        input[[src_row, src_col, ch]]
    })
}

pub fn sigmoid(value: f32) -> f32 {
    1.0 / (1.0 + (-value).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn reflect_indices() {
        assert_eq!(reflect_index(-1, 4), 0);
        assert_eq!(reflect_index(-2, 4), 1);
        assert_eq!(reflect_index(4, 4), 3);
        assert_eq!(reflect_index(5, 4), 2);
        assert_eq!(reflect_index(2, 4), 2);
    }

    #[test]
    fn upsample_constant_and_ramp() {
        let constant = Array2::from_elem((2, 2), 3.0);
        let resized = resize_bilinear(constant.view(), [8, 8]);
        assert!(resized
            .iter()
            .all(|&value| abs_diff_eq!(value, 3.0, epsilon = 1e-5)));

        let ramp = array![[0.0, 1.0]];
        let resized = resize_bilinear(ramp.view(), [1, 4]);
        assert_abs_diff_eq!(resized[[0, 0]], 0.0);
        assert_abs_diff_eq!(resized[[0, 1]], 0.25);
        assert_abs_diff_eq!(resized[[0, 2]], 0.75);
        assert_abs_diff_eq!(resized[[0, 3]], 1.0);
    }

    #[test]
    fn gaussian_preserves_mass_and_constants() {
        let constant = Array2::from_elem((5, 7), 2.0);
        let smoothed = gaussian_filter(constant.view(), 2.0);
        assert!(smoothed.iter().all(|&value| abs_diff_eq!(value, 2.0, epsilon = 1e-5)));

        let kernel = gaussian_kernel(2.0, 4.0);
        assert_eq!(kernel.len(), 17);
        assert_abs_diff_eq!(kernel.iter().sum::<f32>(), 1.0, epsilon = 1e-6);
    }
}
