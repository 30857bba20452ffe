//! The closed set of defect classes the detection model is trained on.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Defect categories recognized on the line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefectClass {
    Cap,
    Crumbled,
    Label,
    NoCap,
    NotCrumbled,
}

impl DefectClass {
    pub const ALL: [DefectClass; 5] = [
        DefectClass::Cap,
        DefectClass::Crumbled,
        DefectClass::Label,
        DefectClass::NoCap,
        DefectClass::NotCrumbled,
    ];

    /// Wire name used in documents, logs, and configuration.
    pub fn slug(self) -> &'static str {
        match self {
            DefectClass::Cap => "cap",
            DefectClass::Crumbled => "crumbled",
            DefectClass::Label => "label",
            DefectClass::NoCap => "no-cap",
            DefectClass::NotCrumbled => "not-crumbled",
        }
    }

    /// Human-facing name drawn on overlays and stored alongside the slug.
    pub fn display_name(self) -> &'static str {
        match self {
            DefectClass::Cap => "Cap",
            DefectClass::Crumbled => "Crumbled",
            DefectClass::Label => "Label",
            DefectClass::NoCap => "No Cap",
            DefectClass::NotCrumbled => "Not Crumbled",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        DefectClass::ALL.iter().copied().find(|c| c.slug() == slug)
    }
}

impl fmt::Display for DefectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassTableError {
    #[error("model id {id} is mapped twice")]
    DuplicateId { id: i64 },
    #[error("defect class {class} is mapped by both id {first} and id {second}")]
    DuplicateClass {
        class: DefectClass,
        first: i64,
        second: i64,
    },
    #[error("defect class {class} has no model id")]
    MissingClass { class: DefectClass },
}

/// Model class id to [`DefectClass`] mapping.
///
/// Construction rejects any table that is not total and injective over the
/// five classes: every class mapped, every id mapped once. An id the model
/// emits that is absent here is a configuration fault, not a skippable
/// detection.
#[derive(Debug, Clone)]
pub struct ClassTable {
    by_id: HashMap<i64, DefectClass>,
}

impl ClassTable {
    /// Table matching the shipped model's training order (ids 0 through 4).
    pub fn builtin() -> Self {
        let by_id = DefectClass::ALL
            .iter()
            .enumerate()
            .map(|(id, &class)| (id as i64, class))
            .collect();
        Self { by_id }
    }

    pub fn new(
        entries: impl IntoIterator<Item = (i64, DefectClass)>,
    ) -> Result<Self, ClassTableError> {
        let mut by_id = HashMap::new();
        let mut id_of: HashMap<DefectClass, i64> = HashMap::new();

        for (id, class) in entries {
            if by_id.insert(id, class).is_some() {
                return Err(ClassTableError::DuplicateId { id });
            }
            if let Some(first) = id_of.insert(class, id) {
                return Err(ClassTableError::DuplicateClass {
                    class,
                    first,
                    second: id,
                });
            }
        }

        for class in DefectClass::ALL {
            if !id_of.contains_key(&class) {
                return Err(ClassTableError::MissingClass { class });
            }
        }

        Ok(Self { by_id })
    }

    pub fn lookup(&self, class_id: i64) -> Option<DefectClass> {
        self.by_id.get(&class_id).copied()
    }
}

impl Default for ClassTable {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_table_is_total() {
        let table = ClassTable::builtin();
        for (id, class) in DefectClass::ALL.iter().enumerate() {
            assert_eq!(table.lookup(id as i64), Some(*class));
        }
        assert_eq!(table.lookup(5), None);
    }

    #[test]
    fn permuted_table_is_accepted() {
        let table = ClassTable::new([
            (4, DefectClass::Cap),
            (3, DefectClass::Crumbled),
            (2, DefectClass::Label),
            (1, DefectClass::NoCap),
            (0, DefectClass::NotCrumbled),
        ])
        .unwrap();
        assert_eq!(table.lookup(4), Some(DefectClass::Cap));
        assert_eq!(table.lookup(0), Some(DefectClass::NotCrumbled));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let err = ClassTable::new([(0, DefectClass::Cap), (0, DefectClass::Label)]).unwrap_err();
        assert_eq!(err, ClassTableError::DuplicateId { id: 0 });
    }

    #[test]
    fn duplicate_class_is_rejected() {
        let err = ClassTable::new([(0, DefectClass::Cap), (1, DefectClass::Cap)]).unwrap_err();
        assert_eq!(
            err,
            ClassTableError::DuplicateClass {
                class: DefectClass::Cap,
                first: 0,
                second: 1,
            }
        );
    }

    #[test]
    fn partial_table_is_rejected() {
        let err = ClassTable::new([(0, DefectClass::Cap)]).unwrap_err();
        assert!(matches!(err, ClassTableError::MissingClass { .. }));
    }

    #[test]
    fn slugs_round_trip() {
        for class in DefectClass::ALL {
            assert_eq!(DefectClass::from_slug(class.slug()), Some(class));
        }
        assert_eq!(DefectClass::from_slug("dent"), None);
    }

    #[test]
    fn serde_uses_slug_names() {
        let json = serde_json::to_string(&DefectClass::NoCap).unwrap();
        assert_eq!(json, "\"no-cap\"");
        let back: DefectClass = serde_json::from_str("\"not-crumbled\"").unwrap();
        assert_eq!(back, DefectClass::NotCrumbled);
    }
}
