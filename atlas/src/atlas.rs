//! The tissue atlas file format.

use crate::{
    colour::Rgb,
    common::*,
    htt::HttClass,
    rule::{AdjustRule, ClassSet, SourceSet},
};

/// A class of a hierarchy and its annotation colour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassEntry {
    pub name: String,
    pub colour: Rgb,
}

/// The class list and rules of one tissue-type hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hierarchy {
    pub htt: HttClass,
    /// Classes in canonical channel order.
    pub classes: Vec<ClassEntry>,
    /// Named class groups referenced by rules.
    #[serde(default)]
    pub groups: IndexMap<String, Vec<String>>,
    /// Ordered activation adjustment rules.
    #[serde(default)]
    pub rules: Vec<AdjustRule>,
    /// The class whose patch confidence is reported per image.
    #[serde(default)]
    pub confidence_class: Option<String>,
    /// Classes left out of the Grad-CAM stage mask. They only enter the
    /// segmentation after adjustment.
    #[serde(default)]
    pub gradcam_exclude: Vec<String>,
}

impl Hierarchy {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.classes.iter().map(|entry| entry.name.as_str())
    }

    pub fn colours(&self) -> Vec<Rgb> {
        self.classes.iter().map(|entry| entry.colour).collect()
    }

    pub fn class_index(&self, name: &str) -> Option<usize> {
        self.classes.iter().position(|entry| entry.name == name)
    }

    /// Resolve a class set to sorted channel indices.
    pub fn resolve(&self, set: &ClassSet) -> Result<Vec<usize>> {
        let lookup = |name: &str| -> Result<usize> {
            self.class_index(name).ok_or_else(|| {
                format_err!("class '{}' does not exist in hierarchy '{}'", name, self.htt)
            })
        };

        let indices: Vec<usize> = match set {
            ClassSet::Classes(names) => names.iter().map(|name| lookup(name)).try_collect()?,
            ClassSet::Group(group) => {
                let names = self.groups.get(group).ok_or_else(|| {
                    format_err!("group '{}' does not exist in hierarchy '{}'", group, self.htt)
                })?;
                names.iter().map(|name| lookup(name)).try_collect()?
            }
            ClassSet::AllExcept(names) => {
                let excluded: Vec<usize> = names.iter().map(|name| lookup(name)).try_collect()?;
                (0..self.num_classes())
                    .filter(|index| !excluded.contains(index))
                    .collect()
            }
        };

        Ok(indices.into_iter().sorted().dedup().collect())
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            !self.classes.is_empty(),
            "hierarchy '{}' has no classes",
            self.htt
        );

        if let Some(name) = self.class_names().duplicates().next() {
            bail!("duplicated class '{}' in hierarchy '{}'", name, self.htt);
        }
        if let Some(colour) = self.colours().into_iter().duplicates().next() {
            bail!("duplicated colour {} in hierarchy '{}'", colour, self.htt);
        }

        for (group, names) in &self.groups {
            self.resolve(&ClassSet::Classes(names.clone()))
                .with_context(|| format!("invalid group '{}'", group))?;
        }

        self.resolve(&ClassSet::Classes(self.gradcam_exclude.clone()))
            .context("invalid Grad-CAM exclusion")?;
        ensure!(
            self.gradcam_exclude.len() < self.num_classes(),
            "hierarchy '{}' excludes every class from the Grad-CAM stage",
            self.htt
        );

        if let Some(name) = &self.confidence_class {
            ensure!(
                self.class_index(name).is_some(),
                "confidence class '{}' does not exist in hierarchy '{}'",
                name,
                self.htt
            );
        }

        Ok(())
    }
}

/// The tissue atlas: classifier outputs and the hierarchies built on them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atlas {
    /// Output class names of the patch classifier, in output order.
    pub classifier_classes: Vec<String>,
    pub hierarchies: Vec<Hierarchy>,
}

impl Atlas {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("unable to read atlas file '{}'", path.display()))?;
        let atlas: Self = json5::from_str(&text)
            .with_context(|| format!("unable to parse atlas file '{}'", path.display()))?;
        atlas.validate()?;
        Ok(atlas)
    }

    /// Check names, colours, groups and rule references.
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = self.classifier_classes.iter().duplicates().next() {
            bail!("duplicated classifier class '{}'", name);
        }
        if let Some(htt) = self.hierarchies.iter().map(|hier| hier.htt).duplicates().next() {
            bail!("hierarchy '{}' is defined twice", htt);
        }

        self.hierarchies
            .iter()
            .try_for_each(|hierarchy| hierarchy.validate())?;

        for hierarchy in &self.hierarchies {
            for rule in &hierarchy.rules {
                self.check_rule(hierarchy, rule).with_context(|| {
                    format!("invalid rule {:?} in hierarchy '{}'", rule, hierarchy.htt)
                })?;
            }
        }

        Ok(())
    }

    pub fn hierarchy(&self, htt: HttClass) -> Result<&Hierarchy> {
        self.hierarchies
            .iter()
            .find(|hierarchy| hierarchy.htt == htt)
            .ok_or_else(|| format_err!("hierarchy '{}' is not defined in the atlas", htt))
    }

    /// The classifier output index of each channel of a hierarchy.
    ///
    /// Channels without a classifier counterpart, such as derived background
    /// classes, map to `None`.
    pub fn channel_sources(&self, htt: HttClass) -> Result<Vec<Option<usize>>> {
        let hierarchy = self.hierarchy(htt)?;
        let sources = hierarchy
            .class_names()
            .map(|name| self.classifier_classes.iter().position(|cls| cls == name))
            .collect();
        Ok(sources)
    }

    /// Map classifier output indices to hierarchy channels.
    ///
    /// Returns the pairs `(classifier index, channel index)` covered by the
    /// hierarchy.
    pub fn split_by_htt(&self, htt: HttClass) -> Result<IndexMap<usize, usize>> {
        let map = self
            .channel_sources(htt)?
            .into_iter()
            .enumerate()
            .filter_map(|(channel, source)| Some((source?, channel)))
            .collect();
        Ok(map)
    }

    fn check_rule(&self, hierarchy: &Hierarchy, rule: &AdjustRule) -> Result<()> {
        let check_source = |source: &SourceSet| -> Result<()> {
            let hier = match source.hierarchy {
                Some(htt) => self.hierarchy(htt)?,
                None => hierarchy,
            };
            hier.resolve(&source.set)?;
            Ok(())
        };

        match rule {
            AdjustRule::DeriveBackground {
                channel,
                max,
                exceptions,
            } => {
                ensure!(*max >= 0.0, "background maximum must be non-negative");
                hierarchy.resolve(&ClassSet::Classes(vec![channel.clone()]))?;
                hierarchy.resolve(exceptions)?;
            }
            AdjustRule::DeriveOther {
                channel,
                mult,
                external,
            } => {
                ensure!(*mult >= 0.0, "other tissue multiplier must be non-negative");
                hierarchy.resolve(&ClassSet::Classes(vec![channel.clone()]))?;
                if let Some(external) = external {
                    check_source(external)?;
                }
            }
            AdjustRule::Suppress { target, source, .. } => {
                let target = hierarchy.resolve(target)?;
                ensure!(!target.is_empty(), "suppression target must not be empty");
                check_source(source)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEXT: &str = r#"{
        classifier_classes: ["A.W", "G.O", "T"],
        hierarchies: [
            {
                htt: "morph",
                classes: [
                    { name: "Background", colour: [255, 255, 255] },
                    { name: "A.W", colour: [255, 0, 0] },
                ],
                groups: { adipose: ["A.W"] },
            },
            {
                htt: "func",
                classes: [
                    { name: "Background", colour: [255, 255, 255] },
                    { name: "Other", colour: [3, 3, 3] },
                    { name: "G.O", colour: [0, 0, 255] },
                    { name: "T", colour: [0, 255, 0] },
                ],
                rules: [
                    { rule: "suppress", target: { all_except: ["Background", "Other"] },
                      source: { hierarchy: "morph", set: { group: "adipose" } }, condition: "dominates" },
                ],
            },
        ],
    }"#;

    #[test]
    fn split_classifier_outputs() -> Result<()> {
        let atlas: Atlas = json5::from_str(TEXT)?;
        atlas.validate()?;

        let func = atlas.split_by_htt(HttClass::Func)?;
        assert_eq!(func.get(&1), Some(&2));
        assert_eq!(func.get(&2), Some(&3));
        assert_eq!(func.get(&0), None);

        assert_eq!(
            atlas.channel_sources(HttClass::Morph)?,
            vec![None, Some(0)]
        );
        Ok(())
    }

    #[test]
    fn resolve_class_sets() -> Result<()> {
        let atlas: Atlas = json5::from_str(TEXT)?;
        let func = atlas.hierarchy(HttClass::Func)?;
        assert_eq!(
            func.resolve(&ClassSet::AllExcept(vec!["Background".into(), "Other".into()]))?,
            vec![2, 3]
        );
        assert!(func.resolve(&ClassSet::Group("adipose".into())).is_err());
        Ok(())
    }

    #[test]
    fn reject_unknown_rule_reference() -> Result<()> {
        let mut atlas: Atlas = json5::from_str(TEXT)?;
        atlas.hierarchies[1].rules.push(AdjustRule::Suppress {
            target: ClassSet::Classes(vec!["Missing".into()]),
            source: SourceSet {
                hierarchy: None,
                set: ClassSet::AllExcept(vec![]),
            },
            condition: crate::rule::Condition::AnyActive,
        });
        assert!(atlas.validate().is_err());
        Ok(())
    }
    #[test]
    fn reject_unknown_gradcam_exclusion() -> Result<()> {
        let mut atlas: Atlas = json5::from_str(TEXT)?;
        atlas.hierarchies[1].gradcam_exclude = vec!["Background".into(), "Other".into()];
        atlas.validate()?;

        atlas.hierarchies[0].gradcam_exclude = vec!["Missing".into()];
        assert!(atlas.validate().is_err());

        atlas.hierarchies[0].gradcam_exclude = vec!["Background".into(), "A.W".into()];
        assert!(atlas.validate().is_err());
        Ok(())
    }
}
