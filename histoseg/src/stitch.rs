//! Overlap averaging of activation maps across neighbouring slide tiles.

use crate::{
    common::*,
    volume::{ActivationMap, ActivationVolume},
};

/// The position of a tile cut from a whole-slide image.
///
/// Tiles are named `<slide>_i<row>_j<col>_f<level>`, `row` and `col` being the
/// coordinates of the top-left pixel in the slide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub slide: String,
    pub row: i64,
    pub col: i64,
    pub level: u32,
}

impl TileKey {
    /// The tile whose top-left pixel is displaced by `[rows, cols]`.
    pub fn shifted(&self, [rows, cols]: [i64; 2]) -> Self {
        Self {
            row: self.row + rows,
            col: self.col + cols,
            ..self.clone()
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_i{}_j{}_f{}",
            self.slide, self.row, self.col, self.level
        )
    }
}

impl FromStr for TileKey {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::config(format!("'{}' is not a tile name", name));

        let (rest, level) = name.rsplit_once("_f").ok_or_else(invalid)?;
        let (rest, col) = rest.rsplit_once("_j").ok_or_else(invalid)?;
        let (slide, row) = rest.rsplit_once("_i").ok_or_else(invalid)?;
        if slide.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            slide: slide.to_string(),
            row: row.parse().map_err(|_| invalid())?,
            col: col.parse().map_err(|_| invalid())?,
            level: level.parse().map_err(|_| invalid())?,
        })
    }
}

/// The file name of a cached activation map, `<tile>_h<class>.png`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActivationFileName {
    pub tile: TileKey,
    pub class: String,
}

impl fmt::Display for ActivationFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_h{}.png", self.tile, self.class)
    }
}

impl FromStr for ActivationFileName {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::config(format!("'{}' is not an activation map file name", name));
        let stem = name.strip_suffix(".png").ok_or_else(invalid)?;
        let (tile, class) = stem.rsplit_once("_h").ok_or_else(invalid)?;
        if class.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            tile: tile.parse()?,
            class: class.to_string(),
        })
    }
}

/// How a neighbour lacking a class map takes part in the average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbsentClassPolicy {
    /// The neighbour contributes zero and is counted.
    ZeroFill,
    /// Tiles lacking a class map, the merged tile included, are left out of
    /// the average of that class.
    Exclude,
}

impl Default for AbsentClassPolicy {
    fn default() -> Self {
        Self::ZeroFill
    }
}

/// Tile layout of a whole-slide image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StitchGeometry {
    /// Size of each activation map.
    pub patch_size: [usize; 2],
    /// Distance between neighbouring tile origins in slide pixels.
    pub shift: [i64; 2],
    /// Width of the band shared with a neighbour in activation map pixels.
    pub overlap: [usize; 2],
}

impl StitchGeometry {
    /// Derive the layout from the tile size in slide pixels and the overlap
    /// ratio between neighbouring tiles.
    pub fn from_ratio(
        patch_size: [usize; 2],
        tile_size: [usize; 2],
        overlap_ratio: f64,
    ) -> Result<Self> {
        if !(0.0..1.0).contains(&overlap_ratio) {
            return Err(Error::config(format!(
                "overlap ratio {} must lie in [0, 1)",
                overlap_ratio
            )));
        }
        if patch_size.contains(&0) || tile_size.contains(&0) {
            return Err(Error::config("tile and patch sizes must be positive"));
        }
        let shift = |len: usize| ((1.0 - overlap_ratio) * len as f64) as i64;
        let overlap = |len: usize| (overlap_ratio * len as f64) as usize;
        Ok(Self {
            patch_size,
            shift: [shift(tile_size[0]), shift(tile_size[1])],
            overlap: [overlap(patch_size[0]), overlap(patch_size[1])],
        })
    }

    /// Rows (or cols) of the current map and of the neighbour covering the
    /// same pixels, for a neighbour in direction `step` along one axis.
    fn bands(&self, axis: usize, step: i64) -> (Range, Range) {
        let len = self.patch_size[axis];
        let ov = self.overlap[axis];
        let head = Range(0, ov);
        let tail = Range(len - ov, len);
        match step {
            -1 => (head, tail),
            1 => (tail, head),
            _ => (Range(0, len), Range(0, len)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Range(usize, usize);

/// The sparse activation maps of one tile, keyed by channel index.
pub type TileMaps = IndexMap<usize, ActivationMap>;

/// Averages each tile's activation maps with those of its eight neighbours.
#[derive(Debug, Clone)]
pub struct StitchOverlapMerger {
    geometry: StitchGeometry,
    policy: AbsentClassPolicy,
}

impl StitchOverlapMerger {
    pub fn new(geometry: StitchGeometry, policy: AbsentClassPolicy) -> Self {
        if policy == AbsentClassPolicy::Exclude {
            debug!("stitching excludes neighbours lacking a class");
        }
        Self { geometry, policy }
    }

    pub fn geometry(&self) -> &StitchGeometry {
        &self.geometry
    }

    /// Merge the maps of tile `key` with its neighbours into a
    /// `num_classes`-channel volume.
    ///
    /// Channels absent from the tile and all its neighbours stay zero.
    /// Neighbours missing from `tiles` do not contribute.
    pub fn merge(
        &self,
        key: &TileKey,
        tiles: &IndexMap<TileKey, TileMaps>,
        num_classes: usize,
    ) -> Result<ActivationVolume> {
        let [height, width] = self.geometry.patch_size;
        let own = tiles
            .get(key)
            .ok_or_else(|| Error::data_integrity(format!("tile '{}' has no activation maps", key)))?;

        let neighbours: Vec<(i64, i64, &TileMaps)> =
            iproduct!(-1i64..=1, -1i64..=1)
                .filter(|&step| step != (0, 0))
                .filter_map(|(di, dj)| {
                    let [shift_i, shift_j] = self.geometry.shift;
                    let neighbour_key = key.shifted([di * shift_i, dj * shift_j]);
                    if neighbour_key == *key {
                        return None;
                    }
                    Some((di, dj, tiles.get(&neighbour_key)?))
                })
                .collect();

        let classes: Vec<usize> = own
            .keys()
            .chain(neighbours.iter().flat_map(|(_, _, maps)| maps.keys()))
            .copied()
            .sorted()
            .dedup()
            .collect();

        let mut merged = ActivationVolume::zeros(num_classes, self.geometry.patch_size);
        for tile_maps in std::iter::once(own).chain(neighbours.iter().map(|(_, _, maps)| *maps)) {
            if let Some((&class, map)) = tile_maps
                .iter()
                .find(|(class, map)| **class >= num_classes || map.dim() != (height, width))
            {
                return Err(Error::dimension_mismatch(
                    format!("activation map of class {}", class),
                    [num_classes, height, width],
                    [class + 1, map.nrows(), map.ncols()],
                ));
            }
        }

        for class in classes {
            let own_map = own.get(&class);
            let mut sum = own_map
                .cloned()
                .unwrap_or_else(|| Array2::zeros((height, width)));
            // under exclusion a tile lacking the class does not count itself
            let own_count = match (own_map, self.policy) {
                (None, AbsentClassPolicy::Exclude) => 0.0,
                _ => 1.0,
            };
            let mut count = Array2::<f32>::from_elem((height, width), own_count);

            for &(di, dj, maps) in &neighbours {
                let neighbour = maps.get(&class);
                if neighbour.is_none() && self.policy == AbsentClassPolicy::Exclude {
                    continue;
                }

                let (Range(cur_r0, cur_r1), Range(nb_r0, nb_r1)) = self.geometry.bands(0, di);
                let (Range(cur_c0, cur_c1), Range(nb_c0, nb_c1)) = self.geometry.bands(1, dj);

                if let Some(neighbour) = neighbour {
                    let mut region = sum.slice_mut(s![cur_r0..cur_r1, cur_c0..cur_c1]);
                    region += &neighbour.slice(s![nb_r0..nb_r1, nb_c0..nb_c1]);
                }
                count
                    .slice_mut(s![cur_r0..cur_r1, cur_c0..cur_c1])
                    .mapv_inplace(|count| count + 1.0);
            }

            Zip::from(merged.channel_mut(class))
                .and(&sum)
                .and(&count)
                .for_each(|out, &sum, &count| {
                    *out = if count > 0.0 { sum / count } else { 0.0 };
                });
        }

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tile_names() -> Result<()> {
        let key: TileKey = "slide_01_i1088_j-816_f1".parse()?;
        assert_eq!(key.slide, "slide_01");
        assert_eq!((key.row, key.col, key.level), (1088, -816, 1));
        assert_eq!(key.to_string(), "slide_01_i1088_j-816_f1");

        let file: ActivationFileName = "slide_01_i0_j816_f1_hG.O.png".parse()?;
        assert_eq!(file.class, "G.O");
        assert_eq!(file.tile.col, 816);
        assert_eq!(file.to_string(), "slide_01_i0_j816_f1_hG.O.png");

        assert!("slide.png".parse::<ActivationFileName>().is_err());
        assert!("slide_ia_j0_f1".parse::<TileKey>().is_err());
        Ok(())
    }

    fn strip() -> (StitchGeometry, IndexMap<TileKey, TileMaps>, TileKey, TileKey) {
        // two 1×4 tiles sharing two columns
        let geometry = StitchGeometry::from_ratio([1, 4], [1, 4], 0.5).unwrap();
        assert_eq!(geometry.shift, [0, 2]);
        assert_eq!(geometry.overlap, [0, 2]);

        let left: TileKey = "s_i0_j0_f1".parse().unwrap();
        let right = left.shifted([0, 2]);
        let tiles: IndexMap<_, _> = [
            (
                left.clone(),
                [(1, Array2::from_elem((1, 4), 0.8))].into_iter().collect(),
            ),
            (
                right.clone(),
                [(0, Array2::from_elem((1, 4), 0.4))].into_iter().collect(),
            ),
        ]
        .into_iter()
        .collect();
        (geometry, tiles, left, right)
    }

    #[test]
    fn zero_fill_halves_missing_class() -> Result<()> {
        let (geometry, tiles, left, right) = strip();
        let merger = StitchOverlapMerger::new(geometry, AbsentClassPolicy::default());

        let merged = merger.merge(&left, &tiles, 2)?;
        let class1: Vec<f32> = merged.channel(1).iter().copied().collect();
        assert_eq!(class1, vec![0.8, 0.8, 0.4, 0.4]);
        let class0: Vec<f32> = merged.channel(0).iter().copied().collect();
        assert_eq!(class0, vec![0.0, 0.0, 0.2, 0.2]);

        let merged = merger.merge(&right, &tiles, 2)?;
        let class1: Vec<f32> = merged.channel(1).iter().copied().collect();
        assert_eq!(class1, vec![0.4, 0.4, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn exclude_keeps_present_values() -> Result<()> {
        let (geometry, tiles, left, _) = strip();
        let merger = StitchOverlapMerger::new(geometry, AbsentClassPolicy::Exclude);
        let merged = merger.merge(&left, &tiles, 2)?;
        let class1: Vec<f32> = merged.channel(1).iter().copied().collect();
        assert_eq!(class1, vec![0.8, 0.8, 0.8, 0.8]);

        // a class carried only by the neighbour keeps its full value
        let class0: Vec<f32> = merged.channel(0).iter().copied().collect();
        assert_eq!(class0, vec![0.0, 0.0, 0.4, 0.4]);
        Ok(())
    }

    #[test]
    fn lone_tile_is_unchanged() -> Result<()> {
        let (geometry, mut tiles, left, right) = strip();
        tiles.remove(&right);
        let merger = StitchOverlapMerger::new(geometry, AbsentClassPolicy::ZeroFill);
        let merged = merger.merge(&left, &tiles, 2)?;
        assert!(merged.channel(1).iter().all(|&value| value == 0.8));
        assert!(merger.merge(&right, &tiles, 2).is_err());
        Ok(())
    }
}
