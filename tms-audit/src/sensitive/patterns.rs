//! Field-name heuristics, value patterns and the compiled-regex cache

use dashmap::DashMap;
use regex::Regex;
use std::sync::LazyLock;

use crate::error::{Error, Result};

/// Field names (or dotted paths) that are treated as sensitive on sight.
///
/// Short tokens only match as a whole word: at a separator or a camelCase
/// boundary, so `customerSsn` matches and `className` does not.
const FIELD_NAME_PATTERNS: &[&str] = &[
    r"(?i)password",
    r"(?i)secret",
    r"(?i)token",
    r"(?i)api[_-]?key",
    r"(?i)apikey",
    r"(?i)private[_-]?key",
    r"(?:^|[^A-Za-z])(?i:ssn)(?:$|[^a-z])|[a-z0-9](?:Ssn|SSN)(?:$|[^a-z])",
    r"(?i)social[_-]?security",
    r"(?i)credit[_-]?card",
    r"(?i)bank[_-]?account",
    r"(?i)routing[_-]?number",
    r"(?i)license[_-]?number",
    r"(?i)passport",
    r"(?i)tax[_-]?id",
    r"(?i)date[_-]?of[_-]?birth",
    r"(?:^|[^A-Za-z])(?i:dob)(?:$|[^a-z])|[a-z0-9](?:Dob|DOB)(?:$|[^a-z])",
    r"(?i)salary|income",
    r"(?:^|[^A-Za-z])(?i:wages?)(?:$|[^a-z])|[a-z0-9](?:Wages?|WAGES?)(?:$|[^a-z])",
    r"(?i)medical|health[_-]?(?:record|info|data|condition|history|insurance)",
    r"(?i)configuration\.apiKey",
];

/// Built-in value patterns, scanned against string values when auto-detection is on.
pub const BUILTIN_VALUE_PATTERNS: &[(&str, &str)] = &[
    ("ssn", r"\b\d{3}-\d{2}-\d{4}\b|\b\d{9}\b"),
    ("creditCard", r"\b(?:\d[ -]*?){13,19}\b"),
    ("email", r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b"),
    ("phone", r"\b(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}\b"),
    (
        "apiKey",
        r#"(?i)\b(?:api[_-]?key|apikey|api[_-]?secret|access[_-]?token|auth[_-]?token|bearer)\s*[:=]\s*["']?[\w\-]{20,}["']?"#,
    ),
    ("googleApiKey", r"\bAIza[0-9A-Za-z\-_]{35}\b"),
    ("awsKey", r"\b(?:AKIA|A3T|AGPA|AIDA|AROA|AIPA|ANPA|ANVA|ASIA)[0-9A-Z]{16}\b"),
    ("jwt", r"\beyJ[A-Za-z0-9_\-]{10,}\.[A-Za-z0-9_\-]{10,}\.[A-Za-z0-9_\-]{10,}\b"),
    (
        "dbConnection",
        r"(?i)\b(?:mongodb|postgres|postgresql|mysql|redis|mssql|oracle)://\S+",
    ),
    (
        "privateKey",
        r"-----BEGIN\s+(?:RSA\s+)?PRIVATE\s+KEY-----[\s\S]+?-----END\s+(?:RSA\s+)?PRIVATE\s+KEY-----",
    ),
    (
        "ipAddress",
        r"\b(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\b",
    ),
    ("bankAccount", r"\b\d{9}\s*\d{1,17}\b"),
    (
        "driversLicense",
        r"(?i)\b(?:license|licence|dl|driver)\s*(?:number|no|#)?\s*[:=]?\s*[A-Z0-9]{5,20}\b",
    ),
    (
        "dateOfBirth",
        r"\b(?:0[1-9]|1[0-2])[-/](?:0[1-9]|[12][0-9]|3[01])[-/](?:19|20)\d{2}\b",
    ),
    ("taxId", r"\b\d{2}-\d{7}\b"),
    ("passport", r"(?i)\bpassport\s*(?:number|no|#)?\s*[:=]?\s*[A-Z0-9]{6,20}\b"),
];

static FIELD_NAMES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    FIELD_NAME_PATTERNS
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
});

static TOKEN_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_\-]+$").expect("token regex is valid"));

/// True if a field name or dotted path looks sensitive.
pub fn is_sensitive_field_name(name: &str) -> bool {
    FIELD_NAMES.iter().any(|re| re.is_match(name))
}

/// Quick check for opaque credentials: 20+ URL-safe characters.
///
/// TypeID-shaped record identifiers (`usr_01h455vb…`) are exempt.
pub fn is_token_like(value: &str) -> bool {
    value.len() >= 20 && TOKEN_LIKE.is_match(value) && !crate::ids::looks_like_type_id(value)
}

/// Memoized regex compilation keyed by pattern source.
#[derive(Debug, Default)]
pub struct PatternCache {
    compiled: DashMap<String, Regex>,
}

impl PatternCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the compiled form of `pattern`, compiling and caching on a miss.
    pub fn get_or_compile(&self, pattern: &str) -> Result<Regex> {
        if let Some(re) = self.compiled.get(pattern) {
            return Ok(re.value().clone());
        }
        let re = Regex::new(pattern)
            .map_err(|e| Error::InvalidInput(format!("invalid regex pattern '{}': {}", pattern, e)))?;
        self.compiled.insert(pattern.to_string(), re.clone());
        Ok(re)
    }

    /// Number of cached patterns
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    /// True when nothing is cached
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Drop every cached pattern
    pub fn clear(&self) {
        self.compiled.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_name_heuristics() {
        for name in [
            "password",
            "hashedPassword",
            "apiKey",
            "api_key",
            "refreshToken",
            "SSN",
            "creditCardNumber",
            "routing_number",
            "dateOfBirth",
            "annualSalary",
            "configuration.apiKey",
        ] {
            assert!(is_sensitive_field_name(name), "{name} should be sensitive");
        }
        for name in ["name", "status", "city", "weight"] {
            assert!(!is_sensitive_field_name(name), "{name} should not be sensitive");
        }
    }

    #[test]
    fn test_short_field_tokens_need_word_boundaries() {
        for name in [
            "ssn",
            "customerSsn",
            "driver_ssn",
            "profile.ssn",
            "ssnLast4",
            "DOB",
            "userDob",
            "hourlyWage",
            "healthRecord",
        ] {
            assert!(is_sensitive_field_name(name), "{name} should be sensitive");
        }
        for name in [
            "className",
            "classNames",
            "adobeId",
            "healthCheck",
            "lastHealthCheckAt",
            "sewageFee",
        ] {
            assert!(!is_sensitive_field_name(name), "{name} should not be sensitive");
        }
    }

    #[test]
    fn test_builtin_patterns_compile() {
        let cache = PatternCache::new();
        for (name, pattern) in BUILTIN_VALUE_PATTERNS {
            assert!(cache.get_or_compile(pattern).is_ok(), "{name} failed to compile");
        }
        assert_eq!(cache.len(), BUILTIN_VALUE_PATTERNS.len());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let cache = PatternCache::new();
        assert!(matches!(cache.get_or_compile("(unclosed"), Err(Error::InvalidInput(_))));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_token_like_exempts_type_ids() {
        assert!(is_token_like("ABCDEFGHIJKLMNOPQRSTUV"));
        assert!(!is_token_like("usr_01h455vb4pex5vsknk084sn02q"));
        assert!(!is_token_like("short"));
        assert!(!is_token_like("has spaces in it but is long"));
    }
}
