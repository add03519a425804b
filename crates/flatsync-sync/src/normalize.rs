//! Table-driven normalization of raw detail fields into the canonical schema.
//!
//! A [`MappingSpec`] is an ordered list of typed rules loaded from YAML. The
//! [`Normalizer`] applies them by rule class (direct, numeric, enumerated,
//! composite, coordinates, address) onto a JSON tree seeded from the kind's
//! default record, then deserializes the tree back into the typed record.

use std::collections::BTreeMap;
use std::path::Path;

use flatsync_core::{CanonicalRecord, ListingKind, RawFields, Result, SyncError};
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use tracing::{debug, warn};

const SALE_MAPPING: &str = include_str!("../mappings/sale.yaml");
const RENT_MAPPING: &str = include_str!("../mappings/rent.yaml");

/// One source label, or several alternatives tried in order.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SourceLabels {
    One(String),
    Many(Vec<String>),
}

impl SourceLabels {
    pub fn labels(&self) -> &[String] {
        match self {
            SourceLabels::One(label) => std::slice::from_ref(label),
            SourceLabels::Many(labels) => labels,
        }
    }

    /// Value of the first label present in `raw`.
    pub fn first_present<'a>(&self, raw: &'a RawFields) -> Option<&'a str> {
        self.labels()
            .iter()
            .find_map(|label| raw.get(label).map(String::as_str))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberKind {
    Int,
    Float,
}

fn default_pair_delimiter() -> String {
    "/".to_string()
}

fn default_coordinate_delimiter() -> String {
    ",".to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MappingRule {
    /// Copy the text verbatim.
    Direct { target: String, source: SourceLabels },
    Numeric {
        target: String,
        source: SourceLabels,
        number: NumberKind,
        /// Unit and currency markers removed before parsing, in order.
        #[serde(default)]
        strip: Vec<String>,
        /// Parse only the first whitespace-separated token.
        #[serde(default)]
        leading: bool,
    },
    /// Known phrase -> canonical token; anything else resolves to `default`.
    Enumerated {
        target: String,
        source: SourceLabels,
        choices: BTreeMap<String, Value>,
        #[serde(default)]
        default: Value,
    },
    /// Two integers packed into one value, e.g. `"6 / 7"`.
    Composite {
        source: SourceLabels,
        targets: [String; 2],
        #[serde(default = "default_pair_delimiter")]
        delimiter: String,
    },
    Coordinates {
        source: SourceLabels,
        targets: [String; 2],
        #[serde(default = "default_coordinate_delimiter")]
        delimiter: String,
    },
    Address { target: String, source: SourceLabels },
}

impl MappingRule {
    /// Position of the rule's class in the application order.
    fn class_rank(&self) -> u8 {
        match self {
            MappingRule::Direct { .. } => 0,
            MappingRule::Numeric { .. } => 1,
            MappingRule::Enumerated { .. } => 2,
            MappingRule::Composite { .. } => 3,
            MappingRule::Coordinates { .. } => 4,
            MappingRule::Address { .. } => 5,
        }
    }

    fn source(&self) -> &SourceLabels {
        match self {
            MappingRule::Direct { source, .. }
            | MappingRule::Numeric { source, .. }
            | MappingRule::Enumerated { source, .. }
            | MappingRule::Composite { source, .. }
            | MappingRule::Coordinates { source, .. }
            | MappingRule::Address { source, .. } => source,
        }
    }

    fn targets(&self) -> Vec<&str> {
        match self {
            MappingRule::Direct { target, .. }
            | MappingRule::Numeric { target, .. }
            | MappingRule::Enumerated { target, .. }
            | MappingRule::Address { target, .. } => vec![target.as_str()],
            MappingRule::Composite { targets, .. } | MappingRule::Coordinates { targets, .. } => {
                targets.iter().map(String::as_str).collect()
            }
        }
    }

    /// Target writes produced by this rule for `raw`, or none when the source
    /// label is absent or the value does not convert.
    fn evaluate(&self, raw: &RawFields) -> Vec<(&str, Value)> {
        let Some(text) = self.source().first_present(raw) else {
            return Vec::new();
        };

        match self {
            MappingRule::Direct { target, .. } | MappingRule::Address { target, .. } => {
                vec![(target.as_str(), Value::String(text.to_string()))]
            }
            MappingRule::Numeric {
                target,
                number,
                strip,
                leading,
                ..
            } => match parse_number(text, *number, strip, *leading) {
                Some(value) => vec![(target.as_str(), value)],
                None => {
                    debug!(field = %target, value = text, "numeric value did not parse");
                    Vec::new()
                }
            },
            MappingRule::Enumerated {
                target,
                choices,
                default,
                ..
            } => {
                let token = choices.get(text.trim()).unwrap_or(default);
                vec![(target.as_str(), token.clone())]
            }
            MappingRule::Composite {
                targets, delimiter, ..
            } => split_pair(text, delimiter, |part| part.parse::<i64>().ok().map(Value::from))
                .map(|(a, b)| vec![(targets[0].as_str(), a), (targets[1].as_str(), b)])
                .unwrap_or_default(),
            MappingRule::Coordinates {
                targets, delimiter, ..
            } => split_pair(text, delimiter, |part| {
                part.parse::<f64>().ok().and_then(float_value)
            })
            .map(|(a, b)| vec![(targets[0].as_str(), a), (targets[1].as_str(), b)])
            .unwrap_or_default(),
        }
    }

    /// Representative values each target of this rule may receive.
    fn probe_values(&self) -> Vec<Value> {
        match self {
            MappingRule::Direct { .. } | MappingRule::Address { .. } => {
                vec![Value::String("probe".to_string())]
            }
            MappingRule::Numeric { number, .. } => match number {
                NumberKind::Int => vec![Value::from(1)],
                NumberKind::Float => vec![Value::from(1.5)],
            },
            MappingRule::Enumerated {
                choices, default, ..
            } => choices
                .values()
                .chain(std::iter::once(default))
                .cloned()
                .collect(),
            MappingRule::Composite { .. } => vec![Value::from(1)],
            MappingRule::Coordinates { .. } => vec![Value::from(1.5)],
        }
    }
}

fn float_value(value: f64) -> Option<Value> {
    Number::from_f64(value).map(Value::Number)
}

/// Locale-tolerant number parse: non-breaking spaces, unit markers, thousands
/// separators and a decimal comma are all accepted.
fn parse_number(text: &str, number: NumberKind, strip: &[String], leading: bool) -> Option<Value> {
    let mut cleaned = text.replace(['\u{a0}', '\u{202f}'], " ");
    for marker in strip {
        cleaned = cleaned.replace(marker.as_str(), "");
    }
    if leading {
        cleaned = cleaned.split_whitespace().next()?.to_string();
    }
    let compact = cleaned
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c })
        .collect::<String>();
    if compact.is_empty() {
        return None;
    }

    match number {
        NumberKind::Int => compact.parse::<i64>().ok().map(Value::from),
        NumberKind::Float => compact
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .and_then(float_value),
    }
}

/// Split into exactly two trimmed parts and convert both, or nothing.
fn split_pair(
    text: &str,
    delimiter: &str,
    convert: impl Fn(&str) -> Option<Value>,
) -> Option<(Value, Value)> {
    let parts = text.split(delimiter).map(str::trim).collect::<Vec<_>>();
    let [first, second] = parts.as_slice() else {
        return None;
    };
    Some((convert(first)?, convert(second)?))
}

/// Write `value` at a dotted path, creating missing intermediate objects and
/// leaving siblings untouched. Returns false if a non-object sits on the path.
pub fn set_path(tree: &mut Value, path: &str, value: Value) -> bool {
    let Value::Object(map) = tree else {
        return false;
    };
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
            true
        }
        Some((head, rest)) => {
            let child = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            set_path(child, rest, value)
        }
    }
}

fn path_exists(tree: &Value, path: &str) -> bool {
    path.split('.')
        .try_fold(tree, |node, segment| node.get(segment))
        .is_some()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingSpec {
    pub version: u32,
    pub kind: ListingKind,
    pub rules: Vec<MappingRule>,
}

impl MappingSpec {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text)
            .map_err(|e| SyncError::Config(format!("parsing mapping spec: {e}")))
    }

    pub fn builtin(kind: ListingKind) -> Result<Self> {
        match kind {
            ListingKind::Sale => Self::from_yaml(SALE_MAPPING),
            ListingKind::Rent => Self::from_yaml(RENT_MAPPING),
        }
    }

    /// `<dir>/<kind>.yaml` when present, otherwise the built-in spec.
    pub fn load(kind: ListingKind, dir: Option<&Path>) -> Result<Self> {
        let Some(path) = dir.map(|d| d.join(format!("{kind}.yaml"))) else {
            return Self::builtin(kind);
        };
        if !path.is_file() {
            debug!(%kind, path = %path.display(), "no mapping override, using built-in");
            return Self::builtin(kind);
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| SyncError::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }
}

/// Converts raw detail fields of one listing kind into its canonical record.
#[derive(Debug, Clone)]
pub struct Normalizer {
    kind: ListingKind,
    rules: Vec<MappingRule>,
    defaults: Value,
}

impl Normalizer {
    /// Build from a spec, rejecting rules whose targets or tokens do not fit the schema.
    pub fn new(spec: MappingSpec) -> Result<Self> {
        let defaults = serde_json::to_value(CanonicalRecord::default_for(spec.kind))
            .map_err(|e| SyncError::Config(format!("serializing default record: {e}")))?;

        let mut rules = spec.rules;
        rules.sort_by_key(MappingRule::class_rank);

        let normalizer = Self {
            kind: spec.kind,
            rules,
            defaults,
        };
        normalizer.check_rules()?;
        Ok(normalizer)
    }

    pub fn builtin(kind: ListingKind) -> Result<Self> {
        Self::new(MappingSpec::builtin(kind)?)
    }

    pub fn load(kind: ListingKind, dir: Option<&Path>) -> Result<Self> {
        let spec = MappingSpec::load(kind, dir)?;
        if spec.kind != kind {
            return Err(SyncError::Config(format!(
                "mapping spec for {} loaded where {kind} was expected",
                spec.kind
            )));
        }
        Self::new(spec)
    }

    pub fn kind(&self) -> ListingKind {
        self.kind
    }

    pub fn rules(&self) -> &[MappingRule] {
        &self.rules
    }

    fn check_rules(&self) -> Result<()> {
        for rule in &self.rules {
            for target in rule.targets() {
                if !path_exists(&self.defaults, target) {
                    return Err(SyncError::Config(format!(
                        "{} mapping targets unknown field `{target}`",
                        self.kind
                    )));
                }
                for value in rule.probe_values() {
                    let mut tree = self.defaults.clone();
                    set_path(&mut tree, target, value.clone());
                    if let Err(e) = serde_json::from_value::<CanonicalRecord>(tree) {
                        return Err(SyncError::Config(format!(
                            "{} mapping writes {value} into `{target}`: {e}",
                            self.kind
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Total: absent or malformed source values leave the target at its default.
    pub fn normalize(&self, raw: &RawFields) -> CanonicalRecord {
        let mut tree = self.defaults.clone();
        for rule in &self.rules {
            for (target, value) in rule.evaluate(raw) {
                if !set_path(&mut tree, target, value) {
                    warn!(kind = %self.kind, path = target, "mapping target is not addressable");
                }
            }
        }

        match serde_json::from_value(tree) {
            Ok(record) => record,
            Err(e) => {
                warn!(kind = %self.kind, error = %e, "normalized record rejected, using defaults");
                CanonicalRecord::default_for(self.kind)
            }
        }
    }
}
