//! Inter-hierarchy activation adjustment.
//!
//! The adjustment table of a hierarchy is compiled once from the atlas into
//! channel indices and then evaluated rule by rule on every patch volume.

use crate::{
    common::*,
    utils::{gaussian_filter, sigmoid},
    volume::{ActivationVolume, Pixels, SUPPRESSED},
};
use atlas::{AdjustRule, Condition, SourceSet};

/// The smoothing scale of the brightness background estimate.
const BACKGROUND_SIGMA: f32 = 2.0;
/// The mean intensity at which the background estimate reaches half its maximum.
const BACKGROUND_MIDPOINT: f32 = 240.0;
const BACKGROUND_SLOPE: f32 = 4.0;

/// Volumes of other hierarchies of the same patch, read by cross-hierarchy
/// rules.
pub type ExternalVolumes<'a> = IndexMap<HttClass, &'a ActivationVolume>;

#[derive(Debug, Clone, PartialEq)]
struct ChannelSource {
    hierarchy: Option<HttClass>,
    channels: Vec<usize>,
    num_classes: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum CompiledRule {
    DeriveBackground {
        channel: usize,
        max: f32,
        exceptions: Vec<usize>,
    },
    DeriveOther {
        channel: usize,
        mult: f32,
        external: Option<ChannelSource>,
    },
    Suppress {
        targets: Vec<usize>,
        source: ChannelSource,
        condition: Condition,
    },
}

/// Applies the adjustment rules of one hierarchy.
#[derive(Debug, Clone)]
pub struct HierarchicalAdjuster {
    htt: HttClass,
    num_classes: usize,
    rules: Vec<CompiledRule>,
    derived: Vec<usize>,
    externals: Vec<HttClass>,
}

impl HierarchicalAdjuster {
    pub fn new(atlas: &Atlas, htt: HttClass) -> Result<Self> {
        let hierarchy = atlas.hierarchy(htt)?;

        let compile_source = |source: &SourceSet| -> Result<ChannelSource> {
            let hier = match source.hierarchy {
                Some(other) => atlas.hierarchy(other)?,
                None => hierarchy,
            };
            Ok(ChannelSource {
                hierarchy: source.hierarchy.filter(|&other| other != htt),
                channels: hier.resolve(&source.set)?,
                num_classes: hier.num_classes(),
            })
        };
        let channel_of = |name: &str| -> Result<usize> {
            hierarchy.class_index(name).ok_or_else(|| {
                Error::Atlas(anyhow::format_err!(
                    "class '{}' does not exist in hierarchy '{}'",
                    name,
                    htt
                ))
            })
        };

        let rules: Vec<CompiledRule> = hierarchy
            .rules
            .iter()
            .map(|rule| -> Result<_> {
                let compiled = match rule {
                    AdjustRule::DeriveBackground {
                        channel,
                        max,
                        exceptions,
                    } => CompiledRule::DeriveBackground {
                        channel: channel_of(channel)?,
                        max: max.raw() as f32,
                        exceptions: hierarchy.resolve(exceptions)?,
                    },
                    AdjustRule::DeriveOther {
                        channel,
                        mult,
                        external,
                    } => CompiledRule::DeriveOther {
                        channel: channel_of(channel)?,
                        mult: mult.raw() as f32,
                        external: external.as_ref().map(compile_source).transpose()?,
                    },
                    AdjustRule::Suppress {
                        target,
                        source,
                        condition,
                    } => CompiledRule::Suppress {
                        targets: hierarchy.resolve(target)?,
                        source: compile_source(source)?,
                        condition: *condition,
                    },
                };
                Ok(compiled)
            })
            .try_collect()?;

        let derived: Vec<usize> = hierarchy
            .rules
            .iter()
            .filter_map(AdjustRule::derived_channel)
            .map(channel_of)
            .try_collect()?;
        let derived = derived.into_iter().sorted().dedup().collect();
        let externals = hierarchy
            .rules
            .iter()
            .flat_map(AdjustRule::external_hierarchies)
            .filter(|&other| other != htt)
            .sorted()
            .dedup()
            .collect();

        debug!(
            "compiled {} adjustment rules for hierarchy '{}'",
            rules.len(),
            htt
        );

        Ok(Self {
            htt,
            num_classes: hierarchy.num_classes(),
            rules,
            derived,
            externals,
        })
    }

    pub fn htt(&self) -> HttClass {
        self.htt
    }

    /// Channels rewritten from pixel statistics rather than taken from the
    /// classifier.
    pub fn derived_channels(&self) -> &[usize] {
        &self.derived
    }

    /// Other hierarchies whose volumes the rules read.
    pub fn external_hierarchies(&self) -> &[HttClass] {
        &self.externals
    }

    /// Apply the rule table to a patch volume.
    ///
    /// `pixels` is the patch the volume was computed from. `externals` must
    /// hold the volume of every hierarchy reported by
    /// [external_hierarchies](Self::external_hierarchies).
    pub fn adjust(
        &self,
        volume: &ActivationVolume,
        pixels: &Pixels,
        externals: &ExternalVolumes<'_>,
    ) -> Result<ActivationVolume> {
        let size = volume.size();
        volume.ensure_shape(
            &format!("activation volume of hierarchy '{}'", self.htt),
            self.num_classes,
            size,
        )?;
        let (pix_h, pix_w, _) = pixels.dim();
        if [pix_h, pix_w] != size {
            return Err(Error::dimension_mismatch(
                "patch pixels",
                size,
                [pix_h, pix_w],
            ));
        }

        // raw activations feed every rule; derived channels never see each other
        let original = volume;
        let mut adjusted = volume.clone();

        for rule in &self.rules {
            match rule {
                CompiledRule::DeriveBackground {
                    channel,
                    max,
                    exceptions,
                } => {
                    let mut background = background_estimate(pixels, *max);
                    if !exceptions.is_empty() {
                        background -= &original.max_over(exceptions);
                    }
                    adjusted.channel_mut(*channel).assign(&background);
                }
                CompiledRule::DeriveOther {
                    channel,
                    mult,
                    external,
                } => {
                    let tissue: Vec<usize> = (0..self.num_classes)
                        .filter(|index| !self.derived.contains(index))
                        .collect();
                    let strongest = original.max_over(&tissue);
                    let mut other = strongest.mapv(|value| {
                        if value == SUPPRESSED {
                            *mult
                        } else {
                            mult * (1.0 - value)
                        }
                    });

                    if let Some(source) = external {
                        let source_max = self.source_max(source, original, externals)?;
                        Zip::from(&mut other)
                            .and(&source_max)
                            .for_each(|other, &value| *other = other.max(value));
                    }
                    adjusted.channel_mut(*channel).assign(&other);
                }
                CompiledRule::Suppress {
                    targets,
                    source,
                    condition,
                } => {
                    let source_max = self.source_max(source, &adjusted, externals)?;
                    let mask = match condition {
                        Condition::AnyActive => source_max.mapv(|value| value > 0.0),
                        Condition::Dominates => {
                            let target_max = adjusted.max_over(targets);
                            Zip::from(&source_max)
                                .and(&target_max)
                                .map_collect(|&source, &target| source > target)
                        }
                    };
                    for &target in targets {
                        Zip::from(&mut adjusted.channel_mut(target))
                            .and(&mask)
                            .for_each(|value, &hit| {
                                if hit {
                                    *value = SUPPRESSED;
                                }
                            });
                    }
                }
            }
        }

        Ok(adjusted)
    }

    fn source_max(
        &self,
        source: &ChannelSource,
        own: &ActivationVolume,
        externals: &ExternalVolumes<'_>,
    ) -> Result<Array2<f32>> {
        let volume = match source.hierarchy {
            None => own,
            Some(htt) => {
                let volume = externals.get(&htt).copied().ok_or_else(|| {
                    Error::data_integrity(format!(
                        "adjusting hierarchy '{}' requires the activations of hierarchy '{}'",
                        self.htt, htt
                    ))
                })?;
                volume.ensure_shape(
                    &format!("external activation volume of hierarchy '{}'", htt),
                    source.num_classes,
                    own.size(),
                )?;
                volume
            }
        };
        Ok(volume.max_over(&source.channels))
    }
}

/// Smoothed brightness-based background likelihood of a patch.
fn background_estimate(pixels: &Pixels, max: f32) -> Array2<f32> {
    let brightness = pixels.map_axis(Axis(2), |rgb| {
        let mean = rgb.iter().map(|&value| value as f32).sum::<f32>() / rgb.len() as f32;
        max * sigmoid(BACKGROUND_SLOPE * (mean - BACKGROUND_MIDPOINT))
    });
    gaussian_filter(brightness.view(), BACKGROUND_SIGMA)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATLAS: &str = r#"{
        classifier_classes: ["E.M.S", "A.W", "G.O", "T"],
        hierarchies: [
            {
                htt: "morph",
                classes: [
                    { name: "Background", colour: [255, 255, 255] },
                    { name: "E.M.S", colour: [0, 0, 128] },
                    { name: "A.W", colour: [255, 255, 0] },
                ],
                groups: { adipose: ["A.W"] },
                rules: [
                    { rule: "derive_background", channel: "Background", max: 0.75, exceptions: { group: "adipose" } },
                    { rule: "suppress", target: { classes: ["Background"] },
                      source: { set: { all_except: ["Background"] } }, condition: "any_active" },
                ],
            },
            {
                htt: "func",
                classes: [
                    { name: "Background", colour: [255, 255, 255] },
                    { name: "Other", colour: [3, 3, 3] },
                    { name: "G.O", colour: [0, 0, 255] },
                    { name: "T", colour: [255, 0, 0] },
                ],
                groups: { tissue: ["G.O", "T"] },
                rules: [
                    { rule: "derive_background", channel: "Background", max: 0.75, exceptions: { group: "tissue" } },
                    { rule: "derive_other", channel: "Other", mult: 0.05,
                      external: { hierarchy: "morph", set: { group: "adipose" } } },
                    { rule: "suppress", target: { group: "tissue" },
                      source: { hierarchy: "morph", set: { group: "adipose" } }, condition: "dominates" },
                    { rule: "suppress", target: { classes: ["Background", "Other"] },
                      source: { set: { group: "tissue" } }, condition: "any_active" },
                ],
            },
        ],
    }"#;

    fn atlas() -> Atlas {
        let atlas: Atlas = json5::from_str(ATLAS).unwrap();
        atlas.validate().unwrap();
        atlas
    }

    fn white(size: usize) -> Pixels {
        Array3::from_elem((size, size, 3), 255)
    }

    #[test]
    fn morph_background_is_suppressed_under_tissue() -> Result<()> {
        let adjuster = HierarchicalAdjuster::new(&atlas(), HttClass::Morph)?;
        assert_eq!(adjuster.derived_channels(), &[0]);
        assert!(adjuster.external_hierarchies().is_empty());

        let mut volume = ActivationVolume::zeros(3, [6, 6]);
        volume
            .channel_mut(1)
            .slice_mut(s![..3, ..])
            .fill(0.4);
        volume.channel_mut(2)[[5, 5]] = 0.2;

        let adjusted = adjuster.adjust(&volume, &white(6), &IndexMap::new())?;
        for ((row, col), &background) in adjusted.channel(0).indexed_iter() {
            let active = (1..3).any(|ch| volume.channel(ch)[[row, col]] > 0.0);
            if active {
                assert_eq!(background, SUPPRESSED);
            } else {
                assert_abs_diff_eq!(background, 0.75, epsilon = 1e-4);
            }
        }
        // tissue channels are left untouched
        assert_eq!(adjusted.channel(1), volume.channel(1));
        Ok(())
    }

    #[test]
    fn dark_pixels_have_no_background() -> Result<()> {
        let adjuster = HierarchicalAdjuster::new(&atlas(), HttClass::Morph)?;
        let volume = ActivationVolume::zeros(3, [4, 4]);
        let pixels = Array3::from_elem((4, 4, 3), 120);
        let adjusted = adjuster.adjust(&volume, &pixels, &IndexMap::new())?;
        assert!(adjusted.channel(0).iter().all(|&value| value < 1e-6));
        Ok(())
    }

    #[test]
    fn functional_rules_read_morph_adipose() -> Result<()> {
        let atlas = atlas();
        let adjuster = HierarchicalAdjuster::new(&atlas, HttClass::Func)?;
        assert_eq!(adjuster.derived_channels(), &[0, 1]);
        assert_eq!(adjuster.external_hierarchies(), &[HttClass::Morph]);

        let mut morph = ActivationVolume::zeros(3, [2, 2]);
        morph.channel_mut(2)[[0, 0]] = 0.9;

        let mut func = ActivationVolume::zeros(4, [2, 2]);
        func.channel_mut(2)[[0, 0]] = 0.5;
        func.channel_mut(3)[[1, 1]] = 0.6;

        let externals: ExternalVolumes = [(HttClass::Morph, &morph)].into_iter().collect();
        let adjusted = adjuster.adjust(&func, &white(2), &externals)?;

        // adipose dominates the gland at (0, 0)
        assert_eq!(adjusted.channel(2)[[0, 0]], SUPPRESSED);
        assert_eq!(adjusted.channel(3)[[0, 0]], SUPPRESSED);
        // tissue at (1, 1) suppresses background and other
        assert_eq!(adjusted.channel(0)[[1, 1]], SUPPRESSED);
        assert_eq!(adjusted.channel(1)[[1, 1]], SUPPRESSED);
        assert_abs_diff_eq!(adjusted.channel(3)[[1, 1]], 0.6);
        // other is raised to the adipose activation
        assert_abs_diff_eq!(adjusted.channel(1)[[0, 0]], 0.9);
        assert_abs_diff_eq!(adjusted.channel(1)[[0, 1]], 0.05);
        Ok(())
    }

    #[test]
    fn missing_external_volume_is_an_error() -> Result<()> {
        let adjuster = HierarchicalAdjuster::new(&atlas(), HttClass::Func)?;
        let volume = ActivationVolume::zeros(4, [2, 2]);
        let err = adjuster
            .adjust(&volume, &white(2), &IndexMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::DataIntegrity(_)));
        Ok(())
    }

    #[test]
    fn reject_mismatched_pixels() -> Result<()> {
        let adjuster = HierarchicalAdjuster::new(&atlas(), HttClass::Morph)?;
        let volume = ActivationVolume::zeros(3, [4, 4]);
        let err = adjuster
            .adjust(&volume, &white(3), &IndexMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        Ok(())
    }
}
