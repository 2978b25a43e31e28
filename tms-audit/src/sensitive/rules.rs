//! Per-resource redaction rules

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::crypto::string_of;
use serde_json::Value;

/// What happens to a matched field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensitiveFieldAction {
    /// Remove the key
    Omit,
    /// Replace with the active mask strategy's output
    Mask,
    /// Replace with `SHA256:<hex>`
    Hash,
    /// Replace with `ENC:gcm:<base64>`; masks when no key is configured
    Encrypt,
}

impl std::fmt::Display for SensitiveFieldAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Omit => write!(f, "omit"),
            Self::Mask => write!(f, "mask"),
            Self::Hash => write!(f, "hash"),
            Self::Encrypt => write!(f, "encrypt"),
        }
    }
}

/// A registered redaction rule.
///
/// `path` narrows a name to one location (`profile.licenseNumber`, or
/// `moves[].driverId` for every element of an array). `pattern` restricts the
/// rule to values whose string form matches; a rule with a pattern and no name
/// applies to any matching scalar value of the resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensitiveField {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    pub action: SensitiveFieldAction,
}

impl SensitiveField {
    pub fn new(name: impl Into<String>, action: SensitiveFieldAction) -> Self {
        Self {
            name: name.into(),
            path: None,
            pattern: None,
            action,
        }
    }

    pub fn omit(name: impl Into<String>) -> Self {
        Self::new(name, SensitiveFieldAction::Omit)
    }

    pub fn mask(name: impl Into<String>) -> Self {
        Self::new(name, SensitiveFieldAction::Mask)
    }

    pub fn hash(name: impl Into<String>) -> Self {
        Self::new(name, SensitiveFieldAction::Hash)
    }

    pub fn encrypt(name: impl Into<String>) -> Self {
        Self::new(name, SensitiveFieldAction::Encrypt)
    }

    /// A rule that matches values rather than names.
    pub fn matching(pattern: impl Into<String>, action: SensitiveFieldAction) -> Self {
        Self {
            name: String::new(),
            path: None,
            pattern: Some(pattern.into()),
            action,
        }
    }

    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = (!path.is_empty()).then_some(path);
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    /// Lookup key: `path.name`, or the bare name.
    pub fn key(&self) -> String {
        match &self.path {
            Some(path) => format!("{}.{}", path, self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub field: SensitiveField,
    pub regex: Option<Regex>,
}

impl CompiledRule {
    /// True when the rule has no pattern or the value's string form matches it.
    pub fn accepts(&self, value: &Value) -> bool {
        match &self.regex {
            None => true,
            Some(re) => match value {
                Value::Null | Value::Array(_) | Value::Object(_) => false,
                other => re.is_match(&string_of(other)),
            },
        }
    }
}

/// Rules for one resource. Cloned and swapped whole on registration.
#[derive(Debug, Clone, Default)]
pub(crate) struct RuleSet {
    by_key: HashMap<String, CompiledRule>,
    by_value: Vec<CompiledRule>,
}

impl RuleSet {
    /// Insert or replace the rule with the same key.
    pub fn insert(&mut self, rule: CompiledRule) {
        if rule.field.name.is_empty() {
            let pattern = rule.field.pattern.clone();
            self.by_value.retain(|r| r.field.pattern != pattern);
            self.by_value.push(rule);
        } else {
            self.by_key.insert(rule.field.key(), rule);
        }
    }

    /// First rule registered under any of `paths`, then a path-less rule for `name`.
    pub fn lookup(&self, paths: &[&str], name: &str, value: &Value) -> Option<&CompiledRule> {
        paths
            .iter()
            .filter_map(|p| self.by_key.get(*p))
            .chain(
                self.by_key
                    .get(name)
                    .filter(|r| r.field.path.is_none()),
            )
            .find(|r| r.accepts(value))
    }

    /// First value-only rule matching `value`.
    pub fn lookup_value(&self, value: &Value) -> Option<&CompiledRule> {
        self.by_value.iter().find(|r| r.accepts(value))
    }

    /// Every installed rule, sorted by key.
    pub fn fields(&self) -> Vec<SensitiveField> {
        let mut fields: Vec<SensitiveField> = self
            .by_key
            .values()
            .chain(self.by_value.iter())
            .map(|r| r.field.clone())
            .collect();
        fields.sort_by_key(|f| f.key());
        fields
    }
}
