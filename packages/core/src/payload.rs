//! Job payload envelope and the function whitelist guarding its decoding.
//!
//! Only functions registered in a [`Whitelist`] can be reconstructed from a
//! stored payload, and nested values may only carry known `__type__` tags.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const TYPE_TAG: &str = "__type__";
const DATETIME_TAG: &str = "datetime";

/// Serialized call: function reference plus arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub func: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

/// Payload decoding errors.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("function {0} is not allowed to be called from a job")]
    NotWhitelisted(String),

    #[error("unknown value type {0}")]
    UnknownType(String),

    #[error("invalid {kind} value: {value}")]
    InvalidValue { kind: &'static str, value: String },
}

/// Set of function names a payload may reference.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    names: BTreeSet<String>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

impl<S: Into<String>> FromIterator<S> for Whitelist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl JobPayload {
    pub fn new(func: impl Into<String>) -> Self {
        Self {
            func: func.into(),
            args: Vec::new(),
            kwargs: Map::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwarg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.kwargs.insert(key.into(), value);
        self
    }

    /// Build the payload of a stored job. `args` may be an array of
    /// positional arguments, an object of keyword arguments, or
    /// `{"args": [...], "kwargs": {...}}`.
    pub fn from_job_args(func: &str, args: &Value) -> Self {
        let mut payload = Self::new(func);
        match args {
            Value::Null => {}
            Value::Array(items) => payload.args = items.clone(),
            Value::Object(map) if map.contains_key("args") || map.contains_key("kwargs") => {
                if let Some(Value::Array(items)) = map.get("args") {
                    payload.args = items.clone();
                }
                if let Some(Value::Object(kwargs)) = map.get("kwargs") {
                    payload.kwargs = kwargs.clone();
                }
            }
            Value::Object(map) => payload.kwargs = map.clone(),
            other => payload.args = vec![other.clone()],
        }
        payload
    }

    pub fn encode(&self) -> Result<String, PayloadError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a payload, refusing functions outside `whitelist`.
    pub fn decode(raw: &str, whitelist: &Whitelist) -> Result<Self, PayloadError> {
        let payload: JobPayload = serde_json::from_str(raw)?;
        payload.check(whitelist)?;
        Ok(payload)
    }

    /// Validate the function reference and every tagged value.
    pub fn check(&self, whitelist: &Whitelist) -> Result<(), PayloadError> {
        if !whitelist.contains(&self.func) {
            return Err(PayloadError::NotWhitelisted(self.func.clone()));
        }
        self.args.iter().try_for_each(check_value)?;
        self.kwargs.values().try_for_each(check_value)
    }

    /// Keyword argument lookup.
    pub fn kwarg(&self, key: &str) -> Option<&Value> {
        self.kwargs.get(key)
    }
}

/// Tag a datetime so it survives the JSON round trip as a datetime.
pub fn datetime_value(value: DateTime<Utc>) -> Value {
    let mut map = Map::new();
    map.insert(TYPE_TAG.into(), Value::String(DATETIME_TAG.into()));
    map.insert("value".into(), Value::String(value.to_rfc3339()));
    Value::Object(map)
}

/// Read back a value produced by [`datetime_value`].
pub fn as_datetime(value: &Value) -> Result<DateTime<Utc>, PayloadError> {
    let raw = value
        .get("value")
        .and_then(Value::as_str)
        .filter(|_| value.get(TYPE_TAG).and_then(Value::as_str) == Some(DATETIME_TAG))
        .ok_or_else(|| PayloadError::InvalidValue {
            kind: DATETIME_TAG,
            value: value.to_string(),
        })?;
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| PayloadError::InvalidValue {
            kind: DATETIME_TAG,
            value: raw.to_string(),
        })
}

fn check_value(value: &Value) -> Result<(), PayloadError> {
    match value {
        Value::Array(items) => items.iter().try_for_each(check_value),
        Value::Object(map) => match map.get(TYPE_TAG) {
            Some(Value::String(tag)) if tag == DATETIME_TAG => as_datetime(value).map(|_| ()),
            Some(tag) => Err(PayloadError::UnknownType(tag.to_string())),
            None => map.values().try_for_each(check_value),
        },
        _ => Ok(()),
    }
}
