//! Declarative activation adjustment rules.
//!
//! Rules are listed per hierarchy and applied in order. Class references are
//! names, resolved against the atlas when the rules are compiled.

use crate::{common::*, htt::HttClass};

/// A set of classes of one hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassSet {
    /// Explicitly named classes.
    Classes(Vec<String>),
    /// A named group of the hierarchy, e.g. `adipose`.
    Group(String),
    /// Every class of the hierarchy except the named ones.
    AllExcept(Vec<String>),
}

/// Where the activations of a rule source are read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSet {
    /// The hierarchy providing the activations. The adjusted hierarchy itself
    /// if unset.
    #[serde(default)]
    pub hierarchy: Option<HttClass>,
    pub set: ClassSet,
}

/// The per-pixel condition under which a suppression applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Any source channel is strictly positive.
    AnyActive,
    /// The maximum source activation exceeds the maximum target activation.
    Dominates,
}

/// One step of the adjustment table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum AdjustRule {
    /// Replace a channel by a background estimate computed from pixel
    /// brightness, minus the strongest activation among `exceptions`.
    DeriveBackground {
        channel: String,
        max: R64,
        #[serde(default = "empty_class_set")]
        exceptions: ClassSet,
    },
    /// Replace a channel by `mult * (1 - max activation)`, optionally raised to
    /// the strongest activation of an external class set.
    DeriveOther {
        channel: String,
        mult: R64,
        #[serde(default)]
        external: Option<SourceSet>,
    },
    /// Force `target` channels to the suppression sentinel where `condition`
    /// holds between `source` and `target`.
    Suppress {
        target: ClassSet,
        source: SourceSet,
        condition: Condition,
    },
}

impl AdjustRule {
    /// The external hierarchies this rule reads from.
    pub fn external_hierarchies(&self) -> Vec<HttClass> {
        match self {
            Self::DeriveBackground { .. } => vec![],
            Self::DeriveOther { external, .. } => {
                external.iter().filter_map(|src| src.hierarchy).collect()
            }
            Self::Suppress { source, .. } => source.hierarchy.into_iter().collect(),
        }
    }

    /// The channel rewritten from pixel statistics, if any.
    pub fn derived_channel(&self) -> Option<&str> {
        match self {
            Self::DeriveBackground { channel, .. } | Self::DeriveOther { channel, .. } => {
                Some(channel.as_str())
            }
            Self::Suppress { .. } => None,
        }
    }
}

fn empty_class_set() -> ClassSet {
    ClassSet::Classes(vec![])
}
