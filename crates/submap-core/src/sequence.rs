//! Sequence position mapping between messagesets.
//!
//! A subscriber's position in one messageset's sequence is translated to the
//! equivalent position in another messageset. Rules are registered per
//! messageset pair: forward lookups are keyed by the source short name and
//! backward lookups by the target short name.
//!
//! # Transforms
//!
//! | Transform | Result |
//! |-----------|--------|
//! | `noop` | position unchanged |
//! | `affine { numerator, denominator, offset }` | `max(0, floor(seq * numerator / denominator) + offset)` |
//!
//! # Example
//!
//! ```ignore
//! let mapper = SequenceMapper::new().with_rule(SequenceRule::new(
//!     "gates_prebirth",
//!     "gates_postbirth",
//!     Transform::affine(2, 1, -1),
//!     Transform::affine(1, 2, 1),
//! ))?;
//!
//! assert_eq!(mapper.map_forward("gates_prebirth", 5)?, ("gates_postbirth".into(), 9));
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};

/// Position within a messageset's sequence of messages.
pub type Sequence = u32;

/// Mapping lookup errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    /// No rule is registered for the messageset.
    #[error("No mapping can be found for messageset {messageset} and sequence {sequence}")]
    NoMappingFound {
        /// Short name of the messageset that was looked up.
        messageset: String,
        /// Sequence position that was being mapped.
        sequence: Sequence,
    },
}

/// A position transform for one direction of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    /// Keep the position as is.
    Noop,
    /// `max(0, floor(seq * numerator / denominator) + offset)`.
    Affine {
        /// Multiplier applied to the position.
        numerator: i64,
        /// Divisor applied after multiplication; must be positive.
        denominator: i64,
        /// Added after the floored division.
        offset: i64,
    },
}

impl Transform {
    /// Create an affine transform.
    pub const fn affine(numerator: i64, denominator: i64, offset: i64) -> Self {
        Transform::Affine {
            numerator,
            denominator,
            offset,
        }
    }

    /// Apply the transform to a position.
    pub fn apply(&self, sequence: Sequence) -> Sequence {
        match *self {
            Transform::Noop => sequence,
            Transform::Affine {
                numerator,
                denominator,
                offset,
            } => {
                let mapped = i64::from(sequence)
                    .saturating_mul(numerator)
                    .div_euclid(denominator)
                    .saturating_add(offset);
                mapped.clamp(0, i64::from(Sequence::MAX)) as Sequence
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        match *self {
            Transform::Affine { denominator, .. } if denominator <= 0 => {
                Err(format!("denominator must be positive, got {denominator}"))
            }
            _ => Ok(()),
        }
    }
}

/// Mapping rule between a source and a target messageset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRule {
    /// Short name of the messageset subscribers are migrated from.
    pub source: String,
    /// Short name of the messageset subscribers are migrated to.
    pub target: String,
    /// Transform from a source position to a target position.
    pub forward: Transform,
    /// Transform from a target position back to a source position.
    pub backward: Transform,
}

impl SequenceRule {
    /// Create a rule.
    pub fn new(
        source: impl Into<String>,
        target: impl Into<String>,
        forward: Transform,
        backward: Transform,
    ) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            forward,
            backward,
        }
    }

    /// Create a rule that keeps positions unchanged in both directions.
    pub fn noop(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(source, target, Transform::Noop, Transform::Noop)
    }
}

#[derive(Debug, Deserialize)]
struct MappingTable {
    rules: Vec<SequenceRule>,
}

/// Registered table of sequence mapping rules.
#[derive(Debug, Clone, Default)]
pub struct SequenceMapper {
    forward: HashMap<String, (String, Transform)>,
    backward: HashMap<String, (String, Transform)>,
}

impl SequenceMapper {
    /// Create a mapper with no rules; every lookup fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule, returning the mapper.
    pub fn with_rule(mut self, rule: SequenceRule) -> Result<Self> {
        self.register(rule)?;
        Ok(self)
    }

    /// Build a mapper from a set of rules.
    pub fn from_rules(rules: impl IntoIterator<Item = SequenceRule>) -> Result<Self> {
        let mut mapper = Self::new();
        for rule in rules {
            mapper.register(rule)?;
        }
        Ok(mapper)
    }

    /// Parse a JSON mapping table of the form `{"rules": [...]}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let table: MappingTable =
            serde_json::from_str(json).map_err(|e| Error::MappingTable(e.to_string()))?;
        Self::from_rules(table.rules)
    }

    /// Load a JSON mapping table from disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| Error::MappingTable(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Register a rule. Each source and each target may appear in one rule only.
    pub fn register(&mut self, rule: SequenceRule) -> Result<()> {
        rule.forward
            .validate()
            .and_then(|_| rule.backward.validate())
            .map_err(|e| Error::MappingTable(format!("{} -> {}: {e}", rule.source, rule.target)))?;

        if self.forward.contains_key(&rule.source) {
            return Err(Error::MappingTable(format!(
                "duplicate rule for source messageset {}",
                rule.source
            )));
        }
        if self.backward.contains_key(&rule.target) {
            return Err(Error::MappingTable(format!(
                "duplicate rule for target messageset {}",
                rule.target
            )));
        }

        self.forward
            .insert(rule.source.clone(), (rule.target.clone(), rule.forward));
        self.backward
            .insert(rule.target, (rule.source, rule.backward));
        Ok(())
    }

    /// Number of registered rules.
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    /// Whether no rules are registered.
    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Map a position in a source messageset to its target messageset.
    pub fn map_forward(
        &self,
        messageset: &str,
        sequence: Sequence,
    ) -> std::result::Result<(String, Sequence), MappingError> {
        Self::lookup(&self.forward, messageset, sequence)
    }

    /// Map a position in a target messageset back to its source messageset.
    pub fn map_backward(
        &self,
        messageset: &str,
        sequence: Sequence,
    ) -> std::result::Result<(String, Sequence), MappingError> {
        Self::lookup(&self.backward, messageset, sequence)
    }

    fn lookup(
        rules: &HashMap<String, (String, Transform)>,
        messageset: &str,
        sequence: Sequence,
    ) -> std::result::Result<(String, Sequence), MappingError> {
        rules
            .get(messageset)
            .map(|(mapped, transform)| (mapped.clone(), transform.apply(sequence)))
            .ok_or_else(|| MappingError::NoMappingFound {
                messageset: messageset.to_string(),
                sequence,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn halving_mapper() -> SequenceMapper {
        SequenceMapper::new()
            .with_rule(SequenceRule::new(
                "gates_prebirth",
                "gates_postbirth",
                Transform::affine(2, 1, -1),
                Transform::affine(1, 2, 1),
            ))
            .unwrap()
    }

    #[test]
    fn test_forward_doubles_and_floors_at_zero() {
        let mapper = halving_mapper();

        for (seq, expected) in [(0, 0), (1, 1), (2, 3), (5, 9), (1_000_000, 1_999_999)] {
            assert_eq!(
                mapper.map_forward("gates_prebirth", seq).unwrap(),
                ("gates_postbirth".to_string(), expected),
                "forward({seq})"
            );
        }
    }

    #[test]
    fn test_backward_halves_and_adds_one() {
        let mapper = halving_mapper();

        for (seq, expected) in [(0, 1), (1, 1), (2, 2), (5, 3), (9, 5), (1_999_999, 1_000_000)] {
            assert_eq!(
                mapper.map_backward("gates_postbirth", seq).unwrap(),
                ("gates_prebirth".to_string(), expected),
                "backward({seq})"
            );
        }
    }

    #[test]
    fn test_backward_undoes_forward_from_one() {
        let mapper = halving_mapper();

        for seq in [1, 2, 3, 17, 4096] {
            let (target, forward) = mapper.map_forward("gates_prebirth", seq).unwrap();
            let (source, back) = mapper.map_backward(&target, forward).unwrap();
            assert_eq!(source, "gates_prebirth");
            assert_eq!(back, seq);
        }
    }

    #[test]
    fn test_large_positions_saturate() {
        let mapper = halving_mapper();
        let (_, seq) = mapper.map_forward("gates_prebirth", Sequence::MAX).unwrap();
        assert_eq!(seq, Sequence::MAX);
    }

    #[test]
    fn test_unknown_messageset_fails_both_directions() {
        let mapper = halving_mapper();

        let err = mapper.map_forward("gates_postbirth", 3).unwrap_err();
        assert_eq!(
            err,
            MappingError::NoMappingFound {
                messageset: "gates_postbirth".to_string(),
                sequence: 3,
            }
        );
        assert!(mapper.map_backward("gates_prebirth", 3).is_err());
        assert!(mapper.map_forward("unknown", 0).is_err());
        assert!(SequenceMapper::new().map_backward("gates_postbirth", 1).is_err());
    }

    #[test]
    fn test_noop_rule() {
        let mapper = SequenceMapper::new()
            .with_rule(SequenceRule::noop("momconnect_a", "momconnect_b"))
            .unwrap();

        assert_eq!(
            mapper.map_forward("momconnect_a", 5).unwrap(),
            ("momconnect_b".to_string(), 5)
        );
        assert_eq!(
            mapper.map_backward("momconnect_b", 0).unwrap(),
            ("momconnect_a".to_string(), 0)
        );
    }

    #[test]
    fn test_duplicate_rules_rejected() {
        let mapper = halving_mapper();
        let err = mapper
            .clone()
            .with_rule(SequenceRule::noop("gates_prebirth", "other"))
            .unwrap_err();
        assert!(matches!(err, Error::MappingTable(_)));

        let err = mapper
            .with_rule(SequenceRule::noop("other", "gates_postbirth"))
            .unwrap_err();
        assert!(matches!(err, Error::MappingTable(_)));
    }

    #[test]
    fn test_zero_denominator_rejected() {
        let err = SequenceMapper::new()
            .with_rule(SequenceRule::new(
                "a",
                "b",
                Transform::affine(1, 0, 0),
                Transform::Noop,
            ))
            .unwrap_err();
        assert!(err.to_string().contains("denominator"));
    }

    #[test]
    fn test_load_json_table() {
        let json = r#"{
            "rules": [
                {
                    "source": "gates_prebirth",
                    "target": "gates_postbirth",
                    "forward": {"kind": "affine", "numerator": 2, "denominator": 1, "offset": -1},
                    "backward": {"kind": "affine", "numerator": 1, "denominator": 2, "offset": 1}
                },
                {
                    "source": "whatsapp_a",
                    "target": "whatsapp_b",
                    "forward": {"kind": "noop"},
                    "backward": {"kind": "noop"}
                }
            ]
        }"#;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapping.json");
        std::fs::write(&path, json).unwrap();

        let mapper = SequenceMapper::load(&path).unwrap();
        assert_eq!(mapper.len(), 2);
        assert_eq!(
            mapper.map_forward("gates_prebirth", 4).unwrap(),
            ("gates_postbirth".to_string(), 7)
        );
        assert_eq!(
            mapper.map_backward("whatsapp_b", 12).unwrap(),
            ("whatsapp_a".to_string(), 12)
        );
    }

    #[test]
    fn test_malformed_json_table() {
        let err = SequenceMapper::from_json(r#"{"rules": [{"source": "a"}]}"#).unwrap_err();
        assert!(matches!(err, Error::MappingTable(_)));
    }
}
