//! Options applied to an entry before validation
//!
//! Each option mutates the entry in place and may fail; the service applies
//! them in call order and stops at the first error.
//!
//! ```rust
//! use tms_audit::options;
//! use serde_json::json;
//!
//! let opts = vec![
//!     options::comment("Shipment rerouted"),
//!     options::diff(&json!({"city": "Austin"}), &json!({"city": "Dallas"})),
//!     options::tags(["reroute", "dispatch"]),
//! ];
//! assert_eq!(opts.len(), 3);
//! ```

use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use crate::diff::{DiffOptions, Differ, JsonDiffer};
use crate::entry::{Category, DataMap, Entry, UserSnapshot};
use crate::error::{Error, Result};
use crate::ids::CorrelationId;

/// Metadata key for [`location`]
pub const METADATA_LOCATION: &str = "location";
/// Metadata key for [`session_id`]
pub const METADATA_SESSION_ID: &str = "sessionId";
/// Metadata key for [`tags`]
pub const METADATA_TAGS: &str = "tags";
/// Metadata key for [`severity`]
pub const METADATA_SEVERITY: &str = "severity";

/// A single entry mutation.
pub struct LogOption(Box<dyn FnOnce(&mut Entry) -> Result<()> + Send>);

impl LogOption {
    /// Wrap an arbitrary mutation.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&mut Entry) -> Result<()> + Send + 'static,
    {
        Self(Box::new(f))
    }

    pub(crate) fn apply(self, entry: &mut Entry) -> Result<()> {
        (self.0)(entry)
    }
}

impl fmt::Debug for LogOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LogOption")
    }
}

/// Apply `opts` in order, stopping at the first failure.
pub fn apply_all(entry: &mut Entry, opts: impl IntoIterator<Item = LogOption>) -> Result<()> {
    for opt in opts {
        opt.apply(entry)?;
    }
    Ok(())
}

/// Set the free-form comment.
pub fn comment(text: impl Into<String>) -> LogOption {
    let text = text.into();
    LogOption::new(move |e| {
        e.comment = text;
        Ok(())
    })
}

/// Populate `changes` with the default differ.
///
/// Snapshots are serialized when the option is created, so later mutation
/// of `before`/`after` by the caller cannot leak into the entry.
pub fn diff<B: Serialize, A: Serialize>(before: &B, after: &A) -> LogOption {
    diff_with(Arc::new(JsonDiffer), before, after, DiffOptions::default())
}

/// Like [`diff`], but each change carries only `from` and `to`.
pub fn compact_diff<B: Serialize, A: Serialize>(before: &B, after: &A) -> LogOption {
    diff_with(Arc::new(JsonDiffer), before, after, DiffOptions::compact())
}

/// Populate `changes` with a caller-supplied differ.
pub fn diff_with<B: Serialize, A: Serialize>(
    differ: Arc<dyn Differ>,
    before: &B,
    after: &A,
    diff_options: DiffOptions,
) -> LogOption {
    let snapshots = serde_json::to_value(before).and_then(|b| serde_json::to_value(after).map(|a| (b, a)));
    LogOption::new(move |e| {
        let (before, after) = snapshots
            .map_err(|err| Error::InvalidInput(format!("cannot serialize diff input: {}", err)))?;
        e.changes = differ.diff(&before, &after, &diff_options)?;
        Ok(())
    })
}

/// Merge caller metadata; caller keys win over defaults.
pub fn metadata(values: DataMap) -> LogOption {
    LogOption::new(move |e| {
        e.metadata.extend(values);
        Ok(())
    })
}

/// Set the user agent.
pub fn user_agent(agent: impl Into<String>) -> LogOption {
    let agent = agent.into();
    LogOption::new(move |e| {
        e.user_agent = agent;
        Ok(())
    })
}

/// Set the client IP address.
pub fn ip_address(ip: impl Into<String>) -> LogOption {
    let ip = ip.into();
    LogOption::new(move |e| {
        e.ip_address = ip;
        Ok(())
    })
}

/// Record the client location under the `location` metadata key.
pub fn location(location: impl Into<String>) -> LogOption {
    metadata_value(METADATA_LOCATION, Value::String(location.into()))
}

/// Record the session under the `sessionId` metadata key.
pub fn session_id(session: impl Into<String>) -> LogOption {
    metadata_value(METADATA_SESSION_ID, Value::String(session.into()))
}

/// Record tags under the `tags` metadata key.
pub fn tags<I, S>(tags: I) -> LogOption
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let tags = tags.into_iter().map(|t| Value::String(t.into())).collect();
    metadata_value(METADATA_TAGS, Value::Array(tags))
}

/// Record a severity label under the `severity` metadata key.
pub fn severity(level: impl Into<String>) -> LogOption {
    metadata_value(METADATA_SEVERITY, Value::String(level.into()))
}

fn metadata_value(key: &'static str, value: Value) -> LogOption {
    LogOption::new(move |e| {
        e.metadata.insert(key.to_string(), value);
        Ok(())
    })
}

/// Generate a fresh correlation ID.
pub fn correlation_id() -> LogOption {
    LogOption::new(|e| {
        e.correlation_id = Some(CorrelationId::new());
        Ok(())
    })
}

/// Join an existing correlation.
pub fn custom_correlation_id(id: impl Into<String>) -> LogOption {
    let id = id.into();
    LogOption::new(move |e| {
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("correlation ID must not be empty".into()));
        }
        e.correlation_id = Some(CorrelationId::from_raw(id));
        Ok(())
    })
}

/// Override the default category.
pub fn category(category: Category) -> LogOption {
    LogOption::new(move |e| {
        e.category = category;
        Ok(())
    })
}

/// Route the entry through the synchronous write path.
pub fn critical() -> LogOption {
    LogOption::new(|e| {
        e.critical = true;
        Ok(())
    })
}

/// Override the timestamp (seconds since epoch).
pub fn timestamp(seconds: i64) -> LogOption {
    LogOption::new(move |e| {
        e.timestamp = seconds;
        Ok(())
    })
}

/// Attach a display snapshot of the acting user.
pub fn user(snapshot: UserSnapshot) -> LogOption {
    LogOption::new(move |e| {
        e.user = Some(snapshot);
        Ok(())
    })
}
