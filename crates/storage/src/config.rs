//! Façade configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Result limit used by `list` and `values` when the caller gives none.
pub const DEFAULT_RESULT_LIMIT: usize = 100;

/// Configuration for [`Storage`](crate::Storage).
///
/// # Example
///
/// ```
/// use cursordb_storage::StorageConfig;
///
/// let config = StorageConfig::builder().name("notes").default_result_limit(20).build();
/// assert!(config.validate().is_ok());
///
/// let parsed: StorageConfig = serde_json::from_str(r#"{"name": "notes"}"#).unwrap();
/// assert_eq!(parsed.default_result_limit, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Database name, used in request labels and spans.
    #[builder(into, default = default_name())]
    #[serde(default = "default_name")]
    pub name: String,

    /// Limit applied when a listing call passes `None`.
    #[builder(default = DEFAULT_RESULT_LIMIT)]
    #[serde(default = "default_result_limit")]
    pub default_result_limit: usize,

    /// Whether rejections nobody observes are reported to the unhandled
    /// rejection hook.
    #[builder(default = true)]
    #[serde(default = "default_report_unhandled")]
    pub report_unhandled_rejections: bool,
}

fn default_name() -> String {
    "default".to_owned()
}

fn default_result_limit() -> usize {
    DEFAULT_RESULT_LIMIT
}

fn default_report_unhandled() -> bool {
    true
}

impl StorageConfig {
    /// Checks field constraints.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Empty`] if `name` is empty.
    /// - [`ConfigError::BelowMinimum`] if `default_result_limit` is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::Empty { field: "name" });
        }
        if self.default_result_limit < 1 {
            return Err(ConfigError::BelowMinimum {
                field: "default_result_limit",
                min: "1".to_owned(),
                value: self.default_result_limit.to_string(),
            });
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
