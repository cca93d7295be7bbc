//! Settings schema and validation for job runs.
//!
//! Every job's schema starts with the built-in `count` and `batch_size`
//! number fields. Required fields must be present and non-empty; number
//! fields outside their declared range are clamped rather than rejected.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobError;

/// Free-form key/value settings captured when a run starts.
pub type Settings = serde_json::Map<String, Value>;

/// Upper bound of the built-in `count` field.
pub const MAX_COUNT: i64 = 10_000;
/// Upper bound of the built-in `batch_size` field.
pub const MAX_BATCH_SIZE: i64 = 200;

/// Input type of a settings field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldKind {
    Number {
        #[serde(skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Select {
        /// `(value, label)` pairs.
        options: Vec<(String, String)>,
    },
    Text,
}

/// One entry of a job's settings schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingField {
    pub key: String,
    pub label: String,
    #[serde(flatten)]
    pub kind: FieldKind,
    pub default: Value,
    pub required: bool,
}

impl SettingField {
    pub fn number(
        key: impl Into<String>,
        label: impl Into<String>,
        default: i64,
        min: Option<i64>,
        max: Option<i64>,
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            kind: FieldKind::Number { min, max },
            default: Value::from(default),
            required: true,
        }
    }

    pub fn select(
        key: impl Into<String>,
        label: impl Into<String>,
        default: &str,
        options: &[(&str, &str)],
    ) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            kind: FieldKind::Select {
                options: options
                    .iter()
                    .map(|(v, l)| (v.to_string(), l.to_string()))
                    .collect(),
            },
            default: Value::from(default),
            required: true,
        }
    }

    pub fn text(key: impl Into<String>, label: impl Into<String>, default: &str) -> Self {
        Self {
            key: key.into(),
            label: label.into(),
            kind: FieldKind::Text,
            default: Value::from(default),
            required: false,
        }
    }
}

/// The `count` and `batch_size` fields every job carries.
pub fn builtin_fields(default_total: u64, default_batch_size: u64) -> Vec<SettingField> {
    vec![
        SettingField::number(
            "count",
            "Number of items to create",
            i64::try_from(default_total).unwrap_or(MAX_COUNT),
            Some(1),
            Some(MAX_COUNT),
        ),
        SettingField::number(
            "batch_size",
            "Batch size",
            i64::try_from(default_batch_size).unwrap_or(MAX_BATCH_SIZE),
            Some(1),
            Some(MAX_BATCH_SIZE),
        ),
    ]
}

/// Settings after validation, plus whether any number was clamped.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedSettings {
    pub settings: Settings,
    pub clamped: bool,
}

/// Validate raw settings against a schema.
pub fn validate_settings(fields: &[SettingField], raw: Settings) -> Result<ValidatedSettings, JobError> {
    let mut settings = raw;
    let mut clamped = false;

    for field in fields {
        let value = settings.get(&field.key);
        if is_missing(value) {
            if field.required {
                return Err(JobError::Validation(format!(
                    "Field \"{}\" is required",
                    field.label
                )));
            }
            continue;
        }

        match &field.kind {
            FieldKind::Number { min, max } => {
                let Some(number) = value.and_then(as_integer) else {
                    return Err(JobError::Validation(format!(
                        "Field \"{}\" must be a number",
                        field.label
                    )));
                };
                let mut bounded = number;
                if let Some(min) = min {
                    bounded = bounded.max(*min);
                }
                if let Some(max) = max {
                    bounded = bounded.min(*max);
                }
                if bounded != number {
                    clamped = true;
                }
                settings.insert(field.key.clone(), Value::from(bounded));
            }
            FieldKind::Select { options } => {
                let chosen = value.map(value_as_text).unwrap_or_default();
                if !options.iter().any(|(v, _)| *v == chosen) {
                    return Err(JobError::Validation(format!(
                        "Field \"{}\" has an unknown option: {chosen}",
                        field.label
                    )));
                }
            }
            FieldKind::Text => {}
        }
    }

    Ok(ValidatedSettings { settings, clamped })
}

/// Read a non-negative integer setting, accepting numeric strings.
pub fn setting_u64(settings: &Settings, key: &str) -> Option<u64> {
    settings
        .get(key)
        .and_then(as_integer)
        .and_then(|n| u64::try_from(n).ok())
}

fn is_missing(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
