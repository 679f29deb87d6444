// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Tagged error values shared by every subsystem.
//!
//! Errors carry a kind, a severity, and a retryability flag so that the retry
//! and circuit-breaker layers can make policy decisions without downcasting.
//! Wrapping preserves the cause's classification unless explicitly overridden.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};

pub type HubResult<T> = Result<T, HubError>;

/// Classification of an error's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    Device,
    Service,
    System,
    Validation,
    Business,
    Io,
    Auth,
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Device => "device",
            Self::Service => "service",
            Self::System => "system",
            Self::Validation => "validation",
            Self::Business => "business",
            Self::Io => "io",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
        }
    }

    fn default_severity(self) -> Severity {
        match self {
            Self::Connection | Self::Service | Self::Auth => Severity::High,
            Self::Device | Self::Business | Self::Io | Self::Timeout => Severity::Medium,
            Self::Validation => Severity::Low,
            Self::System => Severity::Critical,
        }
    }

    fn default_retryable(self) -> bool {
        match self {
            Self::Connection | Self::Device | Self::Service | Self::Io | Self::Timeout => true,
            Self::System | Self::Validation | Self::Business | Self::Auth => false,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity levels, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error value used across the coordinator.
#[derive(Debug)]
pub struct HubError {
    kind: ErrorKind,
    severity: Severity,
    retryable: bool,
    message: String,
    cause: Option<Box<dyn StdError + Send + Sync + 'static>>,
    context: BTreeMap<String, String>,
    device_id: Option<String>,
    room_id: Option<String>,
}

impl HubError {
    /// Create an error of `kind` with that kind's default severity and
    /// retryability.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            retryable: kind.default_retryable(),
            message: message.into(),
            cause: None,
            context: BTreeMap::new(),
            device_id: None,
            room_id: None,
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn device(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Device, message)
    }

    pub fn service(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Service, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn business(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Business, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Wrap another hub error, inheriting its kind, severity, retryability,
    /// annotations, and context. The new message prefixes the cause.
    pub fn wrap(cause: HubError, message: impl Into<String>) -> Self {
        Self {
            kind: cause.kind,
            severity: cause.severity,
            retryable: cause.retryable,
            message: message.into(),
            context: cause.context.clone(),
            device_id: cause.device_id.clone(),
            room_id: cause.room_id.clone(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Attach a foreign error as the cause, keeping this error's classification.
    pub fn with_cause(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_room(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    pub fn is_retryable(&self) -> bool {
        self.retryable
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}): {}", self.kind, self.severity, self.message)?;
        if let Some(ref cause) = self.cause {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl StdError for HubError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn StdError + 'static))
    }
}

/// Per-service error wrapper that stamps every wrapped error with the
/// owning service's name.
#[derive(Debug, Clone)]
pub struct ErrorHandler {
    service: String,
}

impl ErrorHandler {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Wrap `err` with `message`, attaching the service name to the context.
    pub fn wrap(&self, err: HubError, message: impl Into<String>) -> HubError {
        HubError::wrap(err, message).with_context("service", self.service.clone())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
