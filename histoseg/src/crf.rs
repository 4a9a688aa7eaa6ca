//! Dense conditional random field refinement.
//!
//! The pairwise term mixes a spatial Gaussian kernel and a bilateral kernel on
//! position and colour, both with Potts compatibility. Each kernel reaches
//! three standard deviations around a pixel. The Gaussian window is visited
//! densely while the bilateral window is sampled on a regular grid of at most
//! `2 * BILATERAL_TAPS + 1` offsets per axis, each sample standing for its grid
//! cell. Inference runs a fixed number of mean-field iterations.

use crate::{
    common::*,
    volume::{argmax, LabelMask, Pixels},
};

/// Probabilities below this value are clamped before taking logarithms.
const MIN_PROBABILITY: f32 = 1e-5;
/// Bilateral samples on each side of a pixel along one axis.
const BILATERAL_TAPS: isize = 16;

/// The window radius covering three standard deviations of a kernel.
fn kernel_radius(sxy: R64) -> usize {
    (3.0 * sxy.raw()).ceil() as usize
}

/// Pairwise hyperparameters of one hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrfParams {
    /// Spatial standard deviation of the Gaussian kernel in pixels.
    pub gauss_sxy: R64,
    pub gauss_compat: R64,
    /// Spatial standard deviation of the bilateral kernel in pixels.
    pub bilat_sxy: R64,
    /// Colour standard deviation of the bilateral kernel in intensity units.
    pub bilat_srgb: R64,
    pub bilat_compat: R64,
    pub num_iterations: usize,
    /// Caps the window radius of both kernels. Pixels farther apart than
    /// this along either axis do not interact.
    #[serde(default)]
    pub window_radius: Option<usize>,
}

impl CrfParams {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|err| {
            Error::config(format!(
                "unable to read CRF parameters '{}': {}",
                path.display(),
                err
            ))
        })?;
        let params: Self = json5::from_str(&text).map_err(|err| {
            Error::config(format!(
                "malformed CRF parameters '{}': {}",
                path.display(),
                err
            ))
        })?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("gauss_sxy", self.gauss_sxy),
            ("bilat_sxy", self.bilat_sxy),
            ("bilat_srgb", self.bilat_srgb),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value <= 0.0) {
            return Err(Error::config(format!("CRF parameter {} must be positive", name)));
        }
        let non_negative = [
            ("gauss_compat", self.gauss_compat),
            ("bilat_compat", self.bilat_compat),
        ];
        if let Some((name, _)) = non_negative.iter().find(|(_, value)| *value < 0.0) {
            return Err(Error::config(format!(
                "CRF parameter {} must be non-negative",
                name
            )));
        }
        if self.num_iterations == 0 {
            return Err(Error::config("CRF needs at least one iteration"));
        }
        if let Some(radius) = self.window_radius {
            let reach = kernel_radius(self.bilat_sxy);
            if radius < reach {
                warn!(
                    "CRF window radius {} truncates the bilateral kernel, which reaches {} pixels",
                    radius, reach
                );
            }
        }
        Ok(())
    }

    /// The window radius of the Gaussian kernel.
    pub fn gauss_radius(&self) -> usize {
        self.capped(kernel_radius(self.gauss_sxy))
    }

    /// The window radius of the bilateral kernel.
    pub fn bilat_radius(&self) -> usize {
        self.capped(kernel_radius(self.bilat_sxy))
    }

    fn capped(&self, radius: usize) -> usize {
        self.window_radius
            .map_or(radius, |limit| cmp::min(limit, radius))
    }
}

/// A refiner without parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unconfigured;

/// A refiner ready to process volumes.
#[derive(Debug, Clone)]
pub struct Configured {
    params: CrfParams,
}

#[derive(Debug, Clone)]
pub struct DenseCrf<S> {
    state: S,
}

impl Default for DenseCrf<Unconfigured> {
    fn default() -> Self {
        Self::new()
    }
}

impl DenseCrf<Unconfigured> {
    pub fn new() -> Self {
        Self {
            state: Unconfigured,
        }
    }

    pub fn configure(self, params: CrfParams) -> Result<DenseCrf<Configured>> {
        params.validate()?;
        Ok(DenseCrf {
            state: Configured { params },
        })
    }

    /// Load the parameters from a json5 file.
    pub fn load_config<P>(self, path: P) -> Result<DenseCrf<Configured>>
    where
        P: AsRef<Path>,
    {
        self.configure(CrfParams::open(path)?)
    }
}

/// The refined labeling and the final mean-field marginals laid out as
/// `classes × height × width`.
#[derive(Debug, Clone)]
pub struct CrfOutput {
    pub labels: LabelMask,
    pub marginals: Array3<f32>,
}

struct Neighbour {
    dy: isize,
    dx: isize,
    gauss: f32,
    bilat: f32,
}

impl DenseCrf<Configured> {
    pub fn params(&self) -> &CrfParams {
        &self.state.params
    }

    /// Refine a `classes × height × width` probability volume of the patch
    /// `pixels`.
    ///
    /// Channels without probability mass never win. The labels index the
    /// channels of the input volume.
    pub fn process(&self, probs: &Array3<f32>, pixels: &Pixels) -> Result<CrfOutput> {
        let params = &self.state.params;
        let (num_classes, height, width) = probs.dim();
        if pixels.dim() != (height, width, 3) {
            return Err(Error::dimension_mismatch(
                "CRF input image",
                [height, width, 3],
                pixels.shape(),
            ));
        }

        let active: Vec<usize> = (0..num_classes)
            .filter(|&class| probs.index_axis(Axis(0), class).sum() > 0.0)
            .collect();
        if active.is_empty() {
            warn!("no class carries probability mass, assigning class 0");
            return Ok(CrfOutput {
                labels: LabelMask::filled(0, num_classes.max(1), [height, width])?,
                marginals: Array3::zeros((num_classes, height, width)),
            });
        }
        let num_labels = active.len();

        let unary = Array3::from_shape_fn((height, width, num_labels), |(y, x, label)| {
            -probs[[active[label], y, x]].max(MIN_PROBABILITY).ln()
        });
        let colour = pixels.mapv(|value| value as f32);
        let neighbours = self.neighbours([height, width]);
        let bilat_compat = params.bilat_compat.raw() as f32;
        let srgb_denom = 2.0 * (params.bilat_srgb.raw() as f32).powi(2);

        let mut marginals = unary.clone();
        marginals
            .lanes_mut(Axis(2))
            .into_iter()
            .for_each(softmax_negated);

        for _ in 0..params.num_iterations {
            let mut next = Array3::<f32>::zeros((height, width, num_labels));
            Zip::indexed(next.lanes_mut(Axis(2))).par_for_each(|(y, x), mut energy| {
                energy.assign(&unary.slice(s![y, x, ..]));

                for nb in &neighbours {
                    let ny = y as isize + nb.dy;
                    let nx = x as isize + nb.dx;
                    if ny < 0 || nx < 0 || ny >= height as isize || nx >= width as isize {
                        continue;
                    }
                    let (ny, nx) = (ny as usize, nx as usize);

                    let colour_dist: f32 = (0..3)
                        .map(|ch| (colour[[y, x, ch]] - colour[[ny, nx, ch]]).powi(2))
                        .sum();
                    let weight = nb.gauss + bilat_compat * nb.bilat * (-colour_dist / srgb_denom).exp();

                    izip!(energy.iter_mut(), marginals.slice(s![ny, nx, ..]))
                        .for_each(|(energy, &q)| *energy -= weight * q);
                }

                softmax_negated(energy);
            });
            marginals = next;
        }

        let labels = marginals.map_axis(Axis(2), |lane| active[argmax(lane)]);
        let mut full = Array3::zeros((num_classes, height, width));
        for (label, &class) in active.iter().enumerate() {
            full.index_axis_mut(Axis(0), class)
                .assign(&marginals.index_axis(Axis(2), label));
        }

        Ok(CrfOutput {
            labels: LabelMask::new(labels, num_classes)?,
            marginals: full,
        })
    }

    /// Window offsets with their spatial kernel weights, the centre excluded.
    ///
    /// Windows never exceed the patch `size`. Bilateral weights are scaled by
    /// the area of the sampling cell.
    fn neighbours(&self, [height, width]: [usize; 2]) -> Vec<Neighbour> {
        let params = &self.state.params;
        let limit = cmp::max(height, width).saturating_sub(1);
        let gauss_radius = cmp::min(params.gauss_radius(), limit) as isize;
        let bilat_radius = cmp::min(params.bilat_radius(), limit) as isize;
        let stride = cmp::max(1, (bilat_radius + BILATERAL_TAPS - 1) / BILATERAL_TAPS);
        let taps = bilat_radius / stride;

        let gauss_denom = 2.0 * (params.gauss_sxy.raw() as f32).powi(2);
        let bilat_denom = 2.0 * (params.bilat_sxy.raw() as f32).powi(2);
        let gauss_compat = params.gauss_compat.raw() as f32;
        let cell_area = (stride * stride) as f32;

        let dense = iproduct!(-gauss_radius..=gauss_radius, -gauss_radius..=gauss_radius);
        let sampled = iproduct!(-taps..=taps, -taps..=taps).map(|(i, j)| (i * stride, j * stride));

        dense
            .chain(sampled)
            .filter(|&offset| offset != (0, 0))
            .sorted()
            .dedup()
            .map(|(dy, dx)| {
                let dist = (dy * dy + dx * dx) as f32;
                let in_gauss = dy.abs() <= gauss_radius && dx.abs() <= gauss_radius;
                let in_bilat = dy % stride == 0
                    && dx % stride == 0
                    && dy.abs() <= taps * stride
                    && dx.abs() <= taps * stride;
                Neighbour {
                    dy,
                    dx,
                    gauss: if in_gauss {
                        gauss_compat * (-dist / gauss_denom).exp()
                    } else {
                        0.0
                    },
                    bilat: if in_bilat {
                        cell_area * (-dist / bilat_denom).exp()
                    } else {
                        0.0
                    },
                }
            })
            .collect()
    }
}

/// Turn energies into a distribution, `softmax(-energy)`, in place.
fn softmax_negated(mut values: ArrayViewMut1<'_, f32>) {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    values.mapv_inplace(|value| (min - value).exp());
    let sum = values.sum();
    values /= sum;
}
