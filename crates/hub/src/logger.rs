// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Leveled, structured log records.
//!
//! Diagnostics go through `tracing` like everything else; records at warn or
//! above (or tagged errors at high severity) are additionally shipped to the
//! external log sink through the bounded queue.

use std::collections::BTreeMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, HubError, Severity};
use crate::logship::ShipperHandle;

/// Extra key/value payload attached to a record.
pub type Fields = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Fatal => "fatal",
        }
    }
}

/// One newline-delimited JSON record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub at: String,
    pub level: LogLevel,
    pub service: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: Fields,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

/// Current UTC time as an ISO 8601 string (e.g. "2026-02-14T01:23:45Z").
pub fn iso8601_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Per-service logger. Cheap to clone.
#[derive(Clone)]
pub struct ServiceLogger {
    service: String,
    shipper: Option<ShipperHandle>,
}

impl ServiceLogger {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into(), shipper: None }
    }

    pub fn with_shipper(service: impl Into<String>, shipper: ShipperHandle) -> Self {
        Self { service: service.into(), shipper: Some(shipper) }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn debug(&self, msg: &str, fields: Option<Fields>) {
        self.log(LogLevel::Debug, msg, fields);
    }

    pub fn info(&self, msg: &str, fields: Option<Fields>) {
        self.log(LogLevel::Info, msg, fields);
    }

    pub fn warn(&self, msg: &str, fields: Option<Fields>) {
        self.log(LogLevel::Warn, msg, fields);
    }

    pub fn error(&self, msg: &str, fields: Option<Fields>) {
        self.log(LogLevel::Error, msg, fields);
    }

    pub fn fatal(&self, msg: &str, fields: Option<Fields>) {
        self.log(LogLevel::Fatal, msg, fields);
    }

    /// Log a tagged error, extracting its kind, severity, ids, and context.
    pub fn log_tagged_error(&self, err: &HubError) {
        let mut context: Fields = err
            .context()
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        if let Some(device_id) = err.device_id() {
            context.insert("device_id".into(), serde_json::Value::String(device_id.into()));
        }
        if let Some(room_id) = err.room_id() {
            context.insert("room_id".into(), serde_json::Value::String(room_id.into()));
        }

        let level = if err.is_critical() { LogLevel::Fatal } else { LogLevel::Error };
        let record = LogRecord {
            at: iso8601_now(),
            level,
            service: self.service.clone(),
            msg: err.to_string(),
            context,
            severity: Some(err.severity()),
            kind: Some(err.kind()),
        };

        tracing::error!(
            service = %self.service,
            kind = %err.kind(),
            severity = %err.severity(),
            "{err}"
        );
        self.ship(record);
    }

    fn log(&self, level: LogLevel, msg: &str, fields: Option<Fields>) {
        let context = fields.unwrap_or_default();
        let context_json = if context.is_empty() {
            None
        } else {
            serde_json::to_string(&context).ok()
        };

        match (level, context_json.as_deref()) {
            (LogLevel::Debug, None) => tracing::debug!(service = %self.service, "{msg}"),
            (LogLevel::Debug, Some(ctx)) => {
                tracing::debug!(service = %self.service, context = ctx, "{msg}");
            }
            (LogLevel::Info, None) => tracing::info!(service = %self.service, "{msg}"),
            (LogLevel::Info, Some(ctx)) => {
                tracing::info!(service = %self.service, context = ctx, "{msg}");
            }
            (LogLevel::Warn, None) => tracing::warn!(service = %self.service, "{msg}"),
            (LogLevel::Warn, Some(ctx)) => {
                tracing::warn!(service = %self.service, context = ctx, "{msg}");
            }
            (LogLevel::Error | LogLevel::Fatal, None) => {
                tracing::error!(service = %self.service, "{msg}");
            }
            (LogLevel::Error | LogLevel::Fatal, Some(ctx)) => {
                tracing::error!(service = %self.service, context = ctx, "{msg}");
            }
        }

        if level >= LogLevel::Warn {
            self.ship(LogRecord {
                at: iso8601_now(),
                level,
                service: self.service.clone(),
                msg: msg.to_owned(),
                context,
                severity: None,
                kind: None,
            });
        }
    }

    /// Enqueue for shipping when the record qualifies: level >= warn, or a
    /// tagged error at high severity or above.
    fn ship(&self, record: LogRecord) {
        let Some(ref shipper) = self.shipper else {
            return;
        };
        let qualifies = record.level >= LogLevel::Warn
            || record.severity.is_some_and(|s| s >= Severity::High);
        if qualifies {
            shipper.enqueue(record);
        }
    }
}

#[cfg(test)]
#[path = "logger_tests.rs"]
mod tests;
