use crate::common::*;

/// The tag of a tissue-type hierarchy.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HttClass {
    /// Morphological tissue types.
    Morph,
    /// Functional tissue types.
    Func,
    /// Gland segmentation task classes.
    Glas,
}

/// The selection of hierarchies to segment in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttMode {
    Both,
    Morph,
    Func,
    Glas,
}

impl HttMode {
    /// Hierarchies in processing order.
    ///
    /// The morphological hierarchy always precedes the functional one, since
    /// functional adjustments read the morphological activations.
    pub fn hierarchies(&self) -> Vec<HttClass> {
        match self {
            Self::Both => vec![HttClass::Morph, HttClass::Func],
            Self::Morph => vec![HttClass::Morph],
            Self::Func => vec![HttClass::Func],
            Self::Glas => vec![HttClass::Glas],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn htt_class_names() {
        assert_eq!(HttClass::Morph.as_ref(), "morph");
        assert_eq!(HttClass::from_str("func").unwrap(), HttClass::Func);
        assert_eq!(HttClass::iter().count(), 3);
    }

    #[test]
    fn both_mode_orders_morph_first() {
        assert_eq!(
            HttMode::Both.hierarchies(),
            vec![HttClass::Morph, HttClass::Func]
        );
    }
}
