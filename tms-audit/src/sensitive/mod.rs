//! Sensitive-data manager
//!
//! Redacts the four data maps of an [`Entry`] and its embedded user snapshot
//! before the entry is admitted. A field is redacted by the first of:
//!
//! 1. a rule registered for the entry's resource under the field's full path
//!    (for array elements also `parent.field` and `parent[].field`),
//! 2. a path-less rule registered under the field's name,
//! 3. a value-only rule whose pattern matches the field's value,
//! 4. the field-name heuristics (auto-detection only, always masks),
//! 5. the value-pattern scan of string values (auto-detection only, always masks).
//!
//! Replaced values are never recursed into, and values that are already the
//! output of a redaction are left alone, so sanitizing twice is a no-op.

pub mod crypto;
pub mod mask;
pub mod patterns;
pub mod rules;

pub use crypto::{FieldCipher, ENCRYPTED_PREFIX, HASH_PREFIX};
pub use mask::MaskStrategy;
pub use patterns::PatternCache;
pub use rules::{SensitiveField, SensitiveFieldAction};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::AuditConfig;
use crate::entry::{DataMap, Entry, Resource, UserSnapshot};
use crate::error::{Error, Result};
use rules::{CompiledRule, RuleSet};

#[derive(Debug, Default)]
struct Counters {
    sanitized: AtomicU64,
    masked: AtomicU64,
    hashed: AtomicU64,
    encrypted: AtomicU64,
    omitted: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time redaction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SanitizeMetrics {
    /// Fields transformed by any action
    pub sanitized: u64,
    pub masked: u64,
    pub hashed: u64,
    pub encrypted: u64,
    pub omitted: u64,
    pub errors: u64,
}

/// Field-level redactor shared by every `log_action` call.
#[derive(Debug)]
pub struct SensitiveDataManager {
    rules: DashMap<Resource, Arc<RuleSet>>,
    value_patterns: DashMap<String, String>,
    cache: PatternCache,
    strategy: AtomicU8,
    auto_detect: AtomicBool,
    cipher: RwLock<Option<FieldCipher>>,
    counters: Counters,
}

impl Default for SensitiveDataManager {
    fn default() -> Self {
        Self::new(MaskStrategy::Default, true)
    }
}

impl SensitiveDataManager {
    /// Create a manager with the built-in value patterns and default rules.
    pub fn new(strategy: MaskStrategy, auto_detect: bool) -> Self {
        let manager = Self {
            rules: DashMap::new(),
            value_patterns: patterns::BUILTIN_VALUE_PATTERNS
                .iter()
                .map(|(name, pattern)| (name.to_string(), pattern.to_string()))
                .collect(),
            cache: PatternCache::new(),
            strategy: AtomicU8::new(strategy.to_u8()),
            auto_detect: AtomicBool::new(auto_detect),
            cipher: RwLock::new(None),
            counters: Counters::default(),
        };
        manager.install_default_rules();
        manager
    }

    /// Create a manager tuned for the configured environment.
    pub fn from_config(config: &AuditConfig) -> Result<Self> {
        let (strategy, auto_detect) = config.sensitive_profile();
        let manager = Self::new(strategy, auto_detect);
        if let Some(secret) = config.encryption_key.as_deref() {
            manager.set_encryption_key(secret)?;
        }
        tracing::info!(
            environment = %config.environment,
            strategy = %strategy,
            auto_detect,
            encryption = manager.has_encryption_key(),
            "Sensitive data manager initialized"
        );
        Ok(manager)
    }

    fn install_default_rules(&self) {
        let defaults = [
            (
                Resource::User,
                vec![
                    SensitiveField::omit("password"),
                    SensitiveField::omit("hashedPassword"),
                    SensitiveField::mask("emailAddress"),
                    SensitiveField::mask("address"),
                ],
            ),
            (
                Resource::Organization,
                vec![SensitiveField::mask("logoUrl"), SensitiveField::mask("taxId")],
            ),
            (
                Resource::Worker,
                vec![
                    SensitiveField::mask("licenseNumber"),
                    SensitiveField::mask("dateOfBirth"),
                    SensitiveField::mask("licenseNumber").at_path("profile"),
                ],
            ),
        ];
        for (resource, fields) in defaults {
            if let Err(e) = self.register_sensitive_fields(resource, fields) {
                tracing::error!(resource = %resource, error = %e, "Failed to install default sensitive fields");
            }
        }
    }

    /// Install rules for a resource, replacing any rule with the same key.
    ///
    /// Every rule is validated before any is installed: a rule needs a name or
    /// a pattern, patterns must compile, and `Encrypt` needs a key.
    pub fn register_sensitive_fields(&self, resource: Resource, fields: Vec<SensitiveField>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let has_key = self.has_encryption_key();
        let mut compiled = Vec::with_capacity(fields.len());
        for field in fields {
            if field.name.is_empty() && field.pattern.is_none() {
                return Err(Error::InvalidInput(format!(
                    "sensitive field for {} needs a name or a pattern",
                    resource
                )));
            }
            if field.action == SensitiveFieldAction::Encrypt && !has_key {
                return Err(Error::InvalidInput(format!(
                    "field '{}' of {} uses encrypt but no encryption key is configured",
                    field.key(),
                    resource
                )));
            }
            let regex = field
                .pattern
                .as_deref()
                .map(|p| self.cache.get_or_compile(p))
                .transpose()?;
            compiled.push(CompiledRule { field, regex });
        }

        let count = compiled.len();
        let mut slot = self.rules.entry(resource).or_default();
        let mut next = RuleSet::clone(&slot);
        for rule in compiled {
            next.insert(rule);
        }
        *slot = Arc::new(next);

        tracing::debug!(resource = %resource, fields = count, "Registered sensitive fields");
        Ok(())
    }

    /// Rules currently registered for a resource, sorted by key.
    pub fn registered_fields(&self, resource: Resource) -> Vec<SensitiveField> {
        self.rules
            .get(&resource)
            .map(|r| r.fields())
            .unwrap_or_default()
    }

    /// Redact an entry in place.
    ///
    /// Sets `sensitive_data` when anything was transformed; never clears it.
    pub fn sanitize_entry(&self, entry: &mut Entry) -> Result<()> {
        let rules = self
            .rules
            .get(&entry.resource)
            .map(|r| Arc::clone(&r))
            .unwrap_or_default();
        let cipher = self
            .cipher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut pass = Pass {
            manager: self,
            rules: &rules,
            strategy: self.mask_strategy(),
            auto_detect: self.auto_detect(),
            cipher,
            tally: Tally::default(),
        };

        let outcome = pass.sanitize_entry(entry);
        let tally = pass.tally;
        if let Err(e) = outcome {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                entry_id = %entry.id,
                resource = %entry.resource,
                error = %e,
                "Sanitization failed"
            );
            return Err(e);
        }

        if tally.total() > 0 {
            entry.sensitive_data = true;
            self.counters.sanitized.fetch_add(tally.total(), Ordering::Relaxed);
            self.counters.masked.fetch_add(tally.masked, Ordering::Relaxed);
            self.counters.hashed.fetch_add(tally.hashed, Ordering::Relaxed);
            self.counters.encrypted.fetch_add(tally.encrypted, Ordering::Relaxed);
            self.counters.omitted.fetch_add(tally.omitted, Ordering::Relaxed);
            tracing::debug!(
                entry_id = %entry.id,
                resource = %entry.resource,
                fields = tally.total(),
                "Sanitized entry"
            );
        }
        Ok(())
    }

    /// True if a string contains anything the value-pattern scan recognises.
    pub fn contains_sensitive_pattern(&self, value: &str) -> bool {
        if patterns::is_token_like(value) {
            return true;
        }
        self.value_patterns.iter().any(|p| {
            self.cache
                .get_or_compile(p.value())
                .map(|re| re.is_match(value))
                .unwrap_or(false)
        })
    }

    /// Add a named pattern to the value scan.
    pub fn add_custom_pattern(&self, name: impl Into<String>, pattern: impl Into<String>) -> Result<()> {
        let name = name.into();
        let pattern = pattern.into();
        self.cache.get_or_compile(&pattern)?;
        tracing::debug!(name = %name, "Added custom sensitive pattern");
        self.value_patterns.insert(name, pattern);
        Ok(())
    }

    /// Remove a named pattern from the value scan. Returns whether it existed.
    pub fn remove_custom_pattern(&self, name: &str) -> bool {
        self.value_patterns.remove(name).is_some()
    }

    /// Names of the patterns in the value scan, sorted.
    pub fn pattern_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.value_patterns.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    /// Drop compiled patterns; they are recompiled on next use.
    pub fn clear_pattern_cache(&self) {
        self.cache.clear();
    }

    pub fn set_mask_strategy(&self, strategy: MaskStrategy) {
        self.strategy.store(strategy.to_u8(), Ordering::Relaxed);
    }

    pub fn mask_strategy(&self) -> MaskStrategy {
        MaskStrategy::from_u8(self.strategy.load(Ordering::Relaxed))
    }

    pub fn set_auto_detect(&self, enabled: bool) {
        self.auto_detect.store(enabled, Ordering::Relaxed);
    }

    pub fn auto_detect(&self) -> bool {
        self.auto_detect.load(Ordering::Relaxed)
    }

    /// Install the secret `Encrypt` rules derive their key from.
    pub fn set_encryption_key(&self, secret: &str) -> Result<()> {
        let cipher = FieldCipher::from_secret(secret)?;
        *self.cipher.write().unwrap_or_else(PoisonError::into_inner) = Some(cipher);
        Ok(())
    }

    pub fn has_encryption_key(&self) -> bool {
        self.cipher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Decrypt a value produced by an `Encrypt` rule.
    pub fn decrypt(&self, encrypted: &str) -> Result<String> {
        let guard = self.cipher.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(cipher) => cipher.decrypt(encrypted),
            None => Err(Error::InvalidInput("no encryption key is configured".into())),
        }
    }

    pub fn metrics(&self) -> SanitizeMetrics {
        SanitizeMetrics {
            sanitized: self.counters.sanitized.load(Ordering::Relaxed),
            masked: self.counters.masked.load(Ordering::Relaxed),
            hashed: self.counters.hashed.load(Ordering::Relaxed),
            encrypted: self.counters.encrypted.load(Ordering::Relaxed),
            omitted: self.counters.omitted.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    masked: u64,
    hashed: u64,
    encrypted: u64,
    omitted: u64,
}

impl Tally {
    fn total(&self) -> u64 {
        self.masked + self.hashed + self.encrypted + self.omitted
    }
}

enum Outcome {
    Keep,
    Replace(Value),
    Remove,
}

/// Where a map sits, which decides the paths its keys are looked up under.
#[derive(Clone, Copy)]
enum Scope<'a> {
    Root,
    Object(&'a str),
    Element { generic: &'a str, specific: &'a str },
}

struct Paths {
    lookup: Vec<String>,
    heuristic: String,
    child: String,
}

impl Scope<'_> {
    fn paths(self, key: &str) -> Paths {
        match self {
            Scope::Root => Paths {
                lookup: vec![key.to_string()],
                heuristic: key.to_string(),
                child: key.to_string(),
            },
            Scope::Object(parent) => {
                let full = format!("{}.{}", parent, key);
                Paths {
                    lookup: vec![full.clone()],
                    heuristic: full.clone(),
                    child: full,
                }
            }
            Scope::Element { generic, specific } => {
                let generic_path = format!("{}.{}", generic, key);
                let specific_path = format!("{}.{}", specific, key);
                Paths {
                    lookup: vec![
                        generic_path.clone(),
                        specific_path.clone(),
                        format!("{}[].{}", generic, key),
                    ],
                    heuristic: generic_path,
                    child: specific_path,
                }
            }
        }
    }
}

/// One sanitization of one entry.
struct Pass<'a> {
    manager: &'a SensitiveDataManager,
    rules: &'a RuleSet,
    strategy: MaskStrategy,
    auto_detect: bool,
    cipher: Option<FieldCipher>,
    tally: Tally,
}

impl Pass<'_> {
    fn sanitize_entry(&mut self, entry: &mut Entry) -> Result<()> {
        self.sanitize_map(&mut entry.current_state, Scope::Root)?;
        self.sanitize_map(&mut entry.previous_state, Scope::Root)?;
        self.sanitize_map(&mut entry.metadata, Scope::Root)?;
        self.sanitize_changes(&mut entry.changes)?;
        if let Some(user) = entry.user.as_mut() {
            self.sanitize_user(user);
        }
        Ok(())
    }

    /// The action for a field, if any layer claims it.
    fn classify(&self, paths: &Paths, key: &str, value: &Value) -> Option<SensitiveFieldAction> {
        let lookup: Vec<&str> = paths.lookup.iter().map(String::as_str).collect();
        if let Some(rule) = self.rules.lookup(&lookup, key, value) {
            return Some(rule.field.action);
        }
        if let Some(rule) = self.rules.lookup_value(value) {
            return Some(rule.field.action);
        }
        if !self.auto_detect {
            return None;
        }
        if patterns::is_sensitive_field_name(key) || patterns::is_sensitive_field_name(&paths.heuristic) {
            return Some(SensitiveFieldAction::Mask);
        }
        if self.scan_string(value) {
            return Some(SensitiveFieldAction::Mask);
        }
        None
    }

    fn scan_string(&self, value: &Value) -> bool {
        match value {
            Value::String(s) => !mask::is_redacted(s, self.strategy) && self.manager.contains_sensitive_pattern(s),
            _ => false,
        }
    }

    fn sanitize_map(&mut self, map: &mut DataMap, scope: Scope<'_>) -> Result<()> {
        let keys: Vec<String> = map.keys().cloned().collect();
        for key in keys {
            let paths = scope.paths(&key);
            let Some(value) = map.get(&key) else {
                continue;
            };

            if let Some(action) = self.classify(&paths, &key, value) {
                match self.apply(action, value)? {
                    Outcome::Keep => {}
                    Outcome::Replace(v) => {
                        map.insert(key, v);
                    }
                    Outcome::Remove => {
                        map.remove(&key);
                    }
                }
                continue;
            }

            match map.get_mut(&key) {
                Some(Value::Object(child)) => self.sanitize_map(child, Scope::Object(&paths.child))?,
                Some(Value::Array(items)) => self.sanitize_array(items, &paths.child)?,
                _ => {}
            }
        }
        Ok(())
    }

    fn sanitize_array(&mut self, items: &mut [Value], parent: &str) -> Result<()> {
        for (i, item) in items.iter_mut().enumerate() {
            let specific = format!("{}[{}]", parent, i);
            match item {
                Value::Object(child) => self.sanitize_map(
                    child,
                    Scope::Element {
                        generic: parent,
                        specific: &specific,
                    },
                )?,
                Value::Array(nested) => self.sanitize_array(nested, &specific)?,
                Value::String(_) => {
                    let action = match self.rules.lookup_value(item) {
                        Some(rule) => Some(rule.field.action),
                        None if self.auto_detect && self.scan_string(item) => Some(SensitiveFieldAction::Mask),
                        None => None,
                    };
                    if let Some(action) = action {
                        match self.apply(action, item)? {
                            Outcome::Keep => {}
                            Outcome::Replace(v) => *item = v,
                            // Elements keep their index; an omitted element becomes null.
                            Outcome::Remove => *item = Value::Null,
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Change records are keyed by dotted path and redacted through their
    /// `from` and `to` leaves.
    fn sanitize_changes(&mut self, changes: &mut DataMap) -> Result<()> {
        let keys: Vec<String> = changes.keys().cloned().collect();
        for path in keys {
            let name = path.rsplit('.').next().unwrap_or(path.as_str()).to_string();
            let Some(Value::Object(record)) = changes.get_mut(&path) else {
                continue;
            };

            for leaf in ["from", "to"] {
                let Some(value) = record.get(leaf) else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }

                let action = match self.rules.lookup(&[path.as_str()], &name, value) {
                    Some(rule) => Some(rule.field.action),
                    None => match self.rules.lookup_value(value) {
                        Some(rule) => Some(rule.field.action),
                        None if self.auto_detect && patterns::is_sensitive_field_name(&path) => {
                            Some(SensitiveFieldAction::Mask)
                        }
                        None if self.auto_detect && self.scan_string(value) => Some(SensitiveFieldAction::Mask),
                        None => None,
                    },
                };

                if let Some(action) = action {
                    match self.apply(action, value)? {
                        Outcome::Keep => {}
                        Outcome::Replace(v) => {
                            record.insert(leaf.to_string(), v);
                        }
                        Outcome::Remove => {
                            record.remove(leaf);
                        }
                    }
                    continue;
                }

                match record.get_mut(leaf) {
                    Some(Value::Object(child)) => self.sanitize_map(child, Scope::Object(&path))?,
                    Some(Value::Array(items)) => self.sanitize_array(items, &path)?,
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn sanitize_user(&mut self, user: &mut UserSnapshot) {
        if !user.email_address.is_empty() && !mask::is_redacted(&user.email_address, self.strategy) {
            let masked = if user.email_address.contains('@') {
                mask::mask_email(&user.email_address, self.strategy)
            } else {
                mask::DEFAULT_MASK.to_string()
            };
            if masked != user.email_address {
                user.email_address = masked;
                self.tally.masked += 1;
            }
        }

        if self.strategy != MaskStrategy::Partial {
            for id in [
                &mut user.id,
                &mut user.business_unit_id,
                &mut user.current_organization_id,
            ] {
                if id.is_empty() || id.contains('*') {
                    continue;
                }
                *id = mask::mask_prefixed_id(id);
                self.tally.masked += 1;
            }
        }

        if self.auto_detect && self.strategy == MaskStrategy::Strict {
            for url in [&mut user.profile_pic_url, &mut user.thumbnail_url] {
                if !url.is_empty() {
                    url.clear();
                    self.tally.omitted += 1;
                }
            }
        }
    }

    fn apply(&mut self, action: SensitiveFieldAction, value: &Value) -> Result<Outcome> {
        if action == SensitiveFieldAction::Omit {
            self.tally.omitted += 1;
            return Ok(Outcome::Remove);
        }
        if value.is_null() {
            return Ok(Outcome::Keep);
        }
        if let Value::String(s) = value {
            if s.is_empty() || mask::is_redacted(s, self.strategy) {
                return Ok(Outcome::Keep);
            }
        }

        match action {
            SensitiveFieldAction::Hash => {
                self.tally.hashed += 1;
                Ok(Outcome::Replace(Value::String(crypto::hash_value(value))))
            }
            SensitiveFieldAction::Encrypt => match &self.cipher {
                Some(cipher) => {
                    let encrypted = cipher.encrypt(value)?;
                    self.tally.encrypted += 1;
                    Ok(Outcome::Replace(Value::String(encrypted)))
                }
                None => Ok(self.mask(value)),
            },
            SensitiveFieldAction::Mask | SensitiveFieldAction::Omit => Ok(self.mask(value)),
        }
    }

    fn mask(&mut self, value: &Value) -> Outcome {
        let masked = mask::mask_value(value, self.strategy);
        if &masked == value {
            return Outcome::Keep;
        }
        self.tally.masked += 1;
        Outcome::Replace(masked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Operation;
    use serde_json::json;

    fn entry(resource: Resource, state: Value) -> Entry {
        let mut e = Entry::new(resource, "res_1", Operation::Update, "usr_1", "org_1", "bu_1");
        if let Value::Object(map) = state {
            e.current_state = map;
        }
        e
    }

    #[test]
    fn test_omit_rule_removes_key() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Partial, false);
        let mut e = entry(Resource::User, json!({"password": "hunter2", "name": "Ada"}));
        sdm.sanitize_entry(&mut e).unwrap();

        assert_eq!(Value::Object(e.current_state.clone()), json!({"name": "Ada"}));
        assert!(e.sensitive_data);
        assert_eq!(sdm.metrics().omitted, 1);
    }

    #[test]
    fn test_production_heuristics() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Strict, true);
        let mut e = entry(
            Resource::Customer,
            json!({"emailAddress": "alice@example.com", "token": "ABCDEFGHIJKLMNOPQRSTUV"}),
        );
        sdm.sanitize_entry(&mut e).unwrap();

        assert_eq!(e.current_state["emailAddress"], "****@example.com");
        assert_eq!(e.current_state["token"], "*".repeat(22));
    }

    #[test]
    fn test_development_heuristics() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Partial, true);
        let mut e = entry(
            Resource::Customer,
            json!({"emailAddress": "alice@example.com", "token": "ABCDEFGHIJKLMNOPQRSTUV"}),
        );
        sdm.sanitize_entry(&mut e).unwrap();

        assert_eq!(e.current_state["emailAddress"], "al***@example.com");
        assert_eq!(e.current_state["token"], "ABCD**************STUV");
    }

    #[test]
    fn test_clean_entry_is_untouched() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Strict, true);
        let mut e = entry(
            Resource::Shipment,
            json!({"status": "New", "weight": 4200, "customerId": "cus_01h455vb4pex5vsknk084sn02q"}),
        );
        let before = e.current_state.clone();
        sdm.sanitize_entry(&mut e).unwrap();

        assert_eq!(e.current_state, before);
        assert!(!e.sensitive_data);
    }

    #[test]
    fn test_no_auto_detect_only_applies_rules() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Partial, false);
        let mut e = entry(Resource::Customer, json!({"token": "ABCDEFGHIJKLMNOPQRSTUV"}));
        sdm.sanitize_entry(&mut e).unwrap();
        assert_eq!(e.current_state["token"], "ABCDEFGHIJKLMNOPQRSTUV");
        assert!(!e.sensitive_data);
    }

    #[test]
    fn test_nested_path_rule() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Strict, false);
        let mut e = entry(
            Resource::Worker,
            json!({"profile": {"licenseNumber": "D1234567", "state": "TX"}}),
        );
        sdm.sanitize_entry(&mut e).unwrap();
        assert_eq!(e.current_state["profile"]["licenseNumber"], "********");
        assert_eq!(e.current_state["profile"]["state"], "TX");
    }

    #[test]
    fn test_array_notation_rule() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Strict, false);
        sdm.register_sensitive_fields(
            Resource::Shipment,
            vec![SensitiveField::hash("driverPhone").at_path("moves[]")],
        )
        .unwrap();

        let mut e = entry(
            Resource::Shipment,
            json!({"moves": [
                {"driverPhone": "5125550100", "sequence": 1},
                {"driverPhone": "5125550199", "sequence": 2}
            ]}),
        );
        sdm.sanitize_entry(&mut e).unwrap();

        for i in 0..2 {
            let phone = e.current_state["moves"][i]["driverPhone"].as_str().unwrap();
            assert!(phone.starts_with(HASH_PREFIX));
            assert_eq!(e.current_state["moves"][i]["sequence"], i + 1);
        }
        assert_eq!(sdm.metrics().hashed, 2);
    }

    #[test]
    fn test_array_strings_are_scanned() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Strict, true);
        let mut e = entry(
            Resource::Customer,
            json!({"contacts": ["ops@example.com", "Dispatch desk"]}),
        );
        sdm.sanitize_entry(&mut e).unwrap();
        assert_eq!(e.current_state["contacts"], json!(["****@example.com", "Dispatch desk"]));
    }

    #[test]
    fn test_changes_leaves_follow_rules() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Default, false);
        let mut e = entry(Resource::User, json!({}));
        e.changes.insert(
            "emailAddress".into(),
            json!({"from": "alice@example.com", "to": "bob@example.com", "type": "updated", "path": "emailAddress"}),
        );
        e.changes.insert(
            "password".into(),
            json!({"from": "old", "to": "new", "type": "updated", "path": "password"}),
        );
        e.changes.insert("name".into(), json!({"from": "A", "to": "B"}));
        sdm.sanitize_entry(&mut e).unwrap();

        assert_eq!(e.changes["emailAddress"]["from"], "a***@example.com");
        assert_eq!(e.changes["emailAddress"]["to"], "b***@example.com");
        assert_eq!(e.changes["emailAddress"]["type"], "updated");
        let password = e.changes["password"].as_object().unwrap();
        assert!(!password.contains_key("from"));
        assert!(!password.contains_key("to"));
        assert_eq!(e.changes["name"]["to"], "B");
    }

    #[test]
    fn test_changes_path_heuristic() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Strict, true);
        let mut e = entry(Resource::Integration, json!({}));
        e.changes.insert(
            "configuration.apiKey".into(),
            json!({"from": null, "to": "sk-live-1234"}),
        );
        sdm.sanitize_entry(&mut e).unwrap();
        assert_eq!(e.changes["configuration.apiKey"]["from"], Value::Null);
        assert_eq!(e.changes["configuration.apiKey"]["to"], "************");
    }

    #[test]
    fn test_user_snapshot() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Strict, true);
        let mut e = entry(Resource::Shipment, json!({}));
        e.user = Some(UserSnapshot {
            id: "usr_01h455".into(),
            business_unit_id: "bu_01h455".into(),
            current_organization_id: "org_01h455".into(),
            name: "Ada".into(),
            username: "ada".into(),
            email_address: "ada@example.com".into(),
            profile_pic_url: "https://cdn.example.com/ada.png".into(),
            thumbnail_url: "https://cdn.example.com/ada_t.png".into(),
        });
        sdm.sanitize_entry(&mut e).unwrap();

        let user = e.user.as_ref().unwrap();
        assert_eq!(user.email_address, "****@example.com");
        assert_eq!(user.id, "usr_******");
        assert_eq!(user.current_organization_id, "org_******");
        assert!(user.profile_pic_url.is_empty());
        assert_eq!(user.name, "Ada");
        assert!(e.sensitive_data);
    }

    #[test]
    fn test_partial_keeps_user_ids() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Partial, true);
        let mut e = entry(Resource::Shipment, json!({}));
        e.user = Some(UserSnapshot {
            id: "usr_01h455".into(),
            email_address: "ada@example.com".into(),
            ..Default::default()
        });
        sdm.sanitize_entry(&mut e).unwrap();
        let user = e.user.as_ref().unwrap();
        assert_eq!(user.id, "usr_01h455");
        assert_eq!(user.email_address, "ad***@example.com");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        for strategy in [MaskStrategy::Strict, MaskStrategy::Default, MaskStrategy::Partial] {
            let sdm = SensitiveDataManager::new(strategy, true);
            sdm.register_sensitive_fields(Resource::Customer, vec![SensitiveField::hash("accountNumber")])
                .unwrap();
            let mut e = entry(
                Resource::Customer,
                json!({
                    "email": "billing@example.com",
                    "password": "hunter2",
                    "accountNumber": "0012345678",
                    "card": "4111111111111111",
                    "nested": {"apiKey": "ABCDEFGHIJKLMNOPQRSTUV", "note": "ok"},
                    "salary": 125000
                }),
            );
            sdm.sanitize_entry(&mut e).unwrap();
            let once = serde_json::to_string(&e).unwrap();
            sdm.sanitize_entry(&mut e).unwrap();
            assert_eq!(serde_json::to_string(&e).unwrap(), once, "strategy {strategy}");
        }
    }

    #[test]
    fn test_redaction_lookalikes_are_still_sanitized() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Strict, true);
        sdm.register_sensitive_fields(
            Resource::Customer,
            vec![SensitiveField::hash("accountPin"), SensitiveField::mask("secretAnswer")],
        )
        .unwrap();
        let mut e = entry(
            Resource::Customer,
            json!({
                "accountPin": "1234***",
                "password": "SHA256:hunter2",
                "secretAnswer": "fluffy***dog",
                "token": "XXX-XX-realsecret"
            }),
        );
        sdm.sanitize_entry(&mut e).unwrap();

        assert!(e.sensitive_data);
        assert_eq!(e.current_state["accountPin"], crypto::hash_value(&json!("1234***")));
        assert_eq!(e.current_state["password"], "*".repeat(14));
        assert_eq!(e.current_state["secretAnswer"], "*".repeat(12));
        assert_eq!(e.current_state["token"], "*".repeat(17));
    }

    #[test]
    fn test_encrypt_requires_key_at_registration() {
        let sdm = SensitiveDataManager::default();
        let err = sdm
            .register_sensitive_fields(Resource::Customer, vec![SensitiveField::encrypt("taxId")])
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        sdm.set_encryption_key("s3cret").unwrap();
        sdm.register_sensitive_fields(Resource::Customer, vec![SensitiveField::encrypt("taxId")])
            .unwrap();

        let mut e = entry(Resource::Customer, json!({"taxId": "12-3456789"}));
        sdm.sanitize_entry(&mut e).unwrap();
        let encrypted = e.current_state["taxId"].as_str().unwrap().to_string();
        assert!(encrypted.starts_with(ENCRYPTED_PREFIX));
        assert_eq!(sdm.decrypt(&encrypted).unwrap(), "12-3456789");
        assert_eq!(sdm.metrics().encrypted, 1);
    }

    #[test]
    fn test_invalid_registration_installs_nothing() {
        let sdm = SensitiveDataManager::default();
        let result = sdm.register_sensitive_fields(
            Resource::Tractor,
            vec![
                SensitiveField::mask("vin"),
                SensitiveField::mask("code").with_pattern("(unclosed"),
            ],
        );
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(sdm.registered_fields(Resource::Tractor).is_empty());

        let nameless = SensitiveField {
            name: String::new(),
            path: None,
            pattern: None,
            action: SensitiveFieldAction::Mask,
        };
        assert!(sdm.register_sensitive_fields(Resource::Tractor, vec![nameless]).is_err());
    }

    #[test]
    fn test_registration_merges_with_defaults() {
        let sdm = SensitiveDataManager::default();
        sdm.register_sensitive_fields(Resource::User, vec![SensitiveField::hash("phoneNumber")])
            .unwrap();
        let keys: Vec<String> = sdm.registered_fields(Resource::User).iter().map(|f| f.key()).collect();
        assert!(keys.contains(&"password".to_string()));
        assert!(keys.contains(&"phoneNumber".to_string()));
    }

    #[test]
    fn test_custom_patterns() {
        let sdm = SensitiveDataManager::new(MaskStrategy::Strict, true);
        assert!(sdm.add_custom_pattern("bad", "(").is_err());
        sdm.add_custom_pattern("employeeBadge", r"\bEMP-\d{6}\b").unwrap();
        assert!(sdm.contains_sensitive_pattern("badge EMP-123456"));
        assert!(sdm.remove_custom_pattern("employeeBadge"));
        assert!(!sdm.contains_sensitive_pattern("badge EMP-123456"));
        assert!(!sdm.remove_custom_pattern("employeeBadge"));
        sdm.clear_pattern_cache();
        assert!(sdm.contains_sensitive_pattern("ops@example.com"));
    }

    #[test]
    fn test_runtime_controls() {
        let sdm = SensitiveDataManager::default();
        assert_eq!(sdm.mask_strategy(), MaskStrategy::Default);
        sdm.set_mask_strategy(MaskStrategy::Strict);
        assert_eq!(sdm.mask_strategy(), MaskStrategy::Strict);
        sdm.set_auto_detect(false);
        assert!(!sdm.auto_detect());
    }
}
