//! Typed category codes and ordered classification rules.
//!
//! [`CategoryMap`] is a bidirectional `code <-> label` table checked at
//! construction. [`RuleTable`] is an ordered list of named predicates
//! evaluated top to bottom with a mandatory default.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::PipelineError;

/// One `code <-> label` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Raster value.
    pub code: i32,
    /// Human-readable name.
    pub label: String,
}

/// A validated bidirectional mapping between category codes and labels.
///
/// Serialized as a list of [`Category`] entries and re-validated on
/// deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Category>", into = "Vec<Category>")]
pub struct CategoryMap {
    by_code: BTreeMap<i32, String>,
    by_label: BTreeMap<String, i32>,
}

impl CategoryMap {
    /// Build a map from `(code, label)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] for an empty label, a duplicate
    /// code or a duplicate label.
    pub fn new<L: Into<String>>(
        entries: impl IntoIterator<Item = (i32, L)>,
    ) -> Result<Self, PipelineError> {
        let mut by_code = BTreeMap::new();
        let mut by_label = BTreeMap::new();
        for (code, label) in entries {
            let label: String = label.into();
            if label.trim().is_empty() {
                return Err(PipelineError::Config(format!(
                    "category {code} has an empty label"
                )));
            }
            if let Some(existing) = by_code.get(&code) {
                return Err(PipelineError::Config(format!(
                    "category code {code} is used by both {existing:?} and {label:?}"
                )));
            }
            if let Some(existing) = by_label.get(&label) {
                return Err(PipelineError::Config(format!(
                    "label {label:?} is used by both codes {existing} and {code}"
                )));
            }
            by_label.insert(label.clone(), code);
            by_code.insert(code, label);
        }
        Ok(Self { by_code, by_label })
    }

    /// Label of a code.
    #[must_use]
    pub fn label(&self, code: i32) -> Option<&str> {
        self.by_code.get(&code).map(String::as_str)
    }

    /// Code of a label.
    #[must_use]
    pub fn code(&self, label: &str) -> Option<i32> {
        self.by_label.get(label).copied()
    }

    /// Entries in ascending code order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &str)> {
        self.by_code.iter().map(|(&c, l)| (c, l.as_str()))
    }

    /// Number of categories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_code.len()
    }

    /// Whether the map has no categories.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_code.is_empty()
    }

    /// Require that every code in `codes` has a label.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] naming the first unlabeled code.
    pub fn ensure_labeled(&self, codes: impl IntoIterator<Item = i32>) -> Result<(), PipelineError> {
        for code in codes {
            if !self.by_code.contains_key(&code) {
                return Err(PipelineError::Config(format!(
                    "category code {code} has no label"
                )));
            }
        }
        Ok(())
    }
}

impl TryFrom<Vec<Category>> for CategoryMap {
    type Error = PipelineError;

    fn try_from(entries: Vec<Category>) -> Result<Self, Self::Error> {
        Self::new(entries.into_iter().map(|c| (c.code, c.label)))
    }
}

impl From<CategoryMap> for Vec<Category> {
    fn from(map: CategoryMap) -> Self {
        map.by_code
            .into_iter()
            .map(|(code, label)| Category { code, label })
            .collect()
    }
}

/// Class of a cell in the splice partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionClass {
    /// Neither floodplain nor river.
    Upland,
    /// Floodplain.
    Floodplain,
    /// River channel.
    River,
}

impl PartitionClass {
    /// All classes in code order.
    pub const ALL: [Self; 3] = [Self::Upland, Self::Floodplain, Self::River];

    /// Raster code of the class.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Upland => 0,
            Self::Floodplain => 1,
            Self::River => 2,
        }
    }

    /// Class of a raster code.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Upland),
            1 => Some(Self::Floodplain),
            2 => Some(Self::River),
            _ => None,
        }
    }

    /// Lowercase label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Upland => "upland",
            Self::Floodplain => "floodplain",
            Self::River => "river",
        }
    }

    /// The partition classes as a [`CategoryMap`].
    ///
    /// # Errors
    ///
    /// Never fails for the built-in classes; the `Result` comes from
    /// [`CategoryMap::new`].
    pub fn category_map() -> Result<CategoryMap, PipelineError> {
        CategoryMap::new(Self::ALL.map(|c| (i32::from(c.code()), c.label())))
    }

    /// Default partition rules: river wins over floodplain, everything
    /// else is upland.
    #[must_use]
    pub fn rules() -> RuleTable<PartitionCell, Self> {
        RuleTable::new(Self::Upland)
            .rule("river channel", |c: &PartitionCell| c.river, Self::River)
            .rule("floodplain", |c: &PartitionCell| c.floodplain, Self::Floodplain)
    }
}

impl fmt::Display for PartitionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Inputs the partition rules look at for one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionCell {
    /// The floodplain raster has data here.
    pub floodplain: bool,
    /// The river raster has data here.
    pub river: bool,
}

type Predicate<I> = Box<dyn Fn(&I) -> bool + Send + Sync>;

struct Rule<I, L> {
    name: String,
    predicate: Predicate<I>,
    label: L,
}

/// Ordered `(predicate, label)` rules with a mandatory default.
///
/// The first rule whose predicate holds decides the label; when none
/// holds, the default applies.
pub struct RuleTable<I, L> {
    rules: Vec<Rule<I, L>>,
    default: L,
}

impl<I, L> RuleTable<I, L> {
    /// A table with no rules yet.
    #[must_use]
    pub const fn new(default: L) -> Self {
        Self {
            rules: Vec::new(),
            default,
        }
    }

    /// Append a rule. Rules are evaluated in insertion order.
    #[must_use]
    pub fn rule(
        mut self,
        name: impl Into<String>,
        predicate: impl Fn(&I) -> bool + Send + Sync + 'static,
        label: L,
    ) -> Self {
        self.rules.push(Rule {
            name: name.into(),
            predicate: Box::new(predicate),
            label,
        });
        self
    }

    /// Label for `input`.
    pub fn classify(&self, input: &I) -> &L {
        self.rules
            .iter()
            .find(|r| (r.predicate)(input))
            .map_or(&self.default, |r| &r.label)
    }

    /// Name of the first matching rule, `None` when the default applies.
    pub fn matching_rule(&self, input: &I) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| (r.predicate)(input))
            .map(|r| r.name.as_str())
    }

    /// Rule names and labels in evaluation order, then the default.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &L)> {
        self.rules
            .iter()
            .map(|r| (r.name.as_str(), &r.label))
            .chain(std::iter::once(("default", &self.default)))
    }

    /// Number of rules, not counting the default.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether only the default is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl<I, L: fmt::Debug> fmt::Debug for RuleTable<I, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries()).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn map_is_bidirectional() {
        let map = CategoryMap::new([(1, "sedge meadow"), (4, "willow shrub")]).unwrap();
        assert_eq!(map.label(4), Some("willow shrub"));
        assert_eq!(map.code("sedge meadow"), Some(1));
        assert_eq!(map.label(2), None);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn duplicates_and_blanks_are_rejected() {
        assert!(CategoryMap::new([(1, "a"), (1, "b")]).unwrap_err().is_config());
        assert!(CategoryMap::new([(1, "a"), (2, "a")]).is_err());
        assert!(CategoryMap::new([(1, " ")]).is_err());
    }

    #[test]
    fn serde_revalidates() {
        let map = PartitionClass::category_map().unwrap();
        let json = serde_json::to_string(&map).unwrap();
        assert!(json.starts_with('['), "{json}");
        let back: CategoryMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);

        let dup = r#"[{"code": 1, "label": "a"}, {"code": 1, "label": "b"}]"#;
        assert!(serde_json::from_str::<CategoryMap>(dup).is_err());
    }

    #[test]
    fn missing_labels_are_reported() {
        let map = PartitionClass::category_map().unwrap();
        assert!(map.ensure_labeled([0, 1, 2]).is_ok());
        assert!(map.ensure_labeled([0, 3]).is_err());
    }

    #[test]
    fn partition_rules_in_order() {
        let rules = PartitionClass::rules();
        let both = PartitionCell {
            floodplain: true,
            river: true,
        };
        assert_eq!(*rules.classify(&both), PartitionClass::River);
        assert_eq!(rules.matching_rule(&both), Some("river channel"));

        let floodplain = PartitionCell {
            floodplain: true,
            river: false,
        };
        assert_eq!(*rules.classify(&floodplain), PartitionClass::Floodplain);

        let neither = PartitionCell::default();
        assert_eq!(*rules.classify(&neither), PartitionClass::Upland);
        assert_eq!(rules.matching_rule(&neither), None);
    }

    #[test]
    fn rule_table_evaluates_top_to_bottom() {
        let table = RuleTable::new("low")
            .rule("very high", |v: &f64| *v > 10.0, "very high")
            .rule("high", |v: &f64| *v > 5.0, "high");
        assert_eq!(*table.classify(&20.0), "very high");
        assert_eq!(*table.classify(&7.0), "high");
        assert_eq!(*table.classify(&1.0), "low");
        let names: Vec<&str> = table.entries().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["very high", "high", "default"]);
    }

    #[test]
    fn codes_round_trip() {
        for class in PartitionClass::ALL {
            assert_eq!(PartitionClass::from_code(class.code()), Some(class));
        }
        assert_eq!(PartitionClass::from_code(9), None);
    }
}
