// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn kind_defaults_follow_taxonomy() -> anyhow::Result<()> {
    let conn = HubError::connection("broker unreachable");
    assert_eq!(conn.severity(), Severity::High);
    assert!(conn.is_retryable());

    let dev = HubError::device("plug offline");
    assert_eq!(dev.severity(), Severity::Medium);
    assert!(dev.is_retryable());

    let val = HubError::validation("empty topic");
    assert_eq!(val.severity(), Severity::Low);
    assert!(!val.is_retryable());

    let sys = HubError::system("out of file descriptors");
    assert_eq!(sys.severity(), Severity::Critical);
    assert!(!sys.is_retryable());
    assert!(sys.is_critical());

    let biz = HubError::business("not implemented");
    assert_eq!(biz.severity(), Severity::Medium);
    assert!(!biz.is_retryable());

    let auth = HubError::auth("bad credentials");
    assert!(!auth.is_retryable());
    Ok(())
}

#[test]
fn wrap_preserves_cause_classification() -> anyhow::Result<()> {
    let cause = HubError::auth("code 1003")
        .with_device("plug-1")
        .with_context("ip", "10.0.0.9");
    let wrapped = HubError::wrap(cause, "handshake failed");

    assert_eq!(wrapped.kind(), ErrorKind::Auth);
    assert_eq!(wrapped.severity(), Severity::High);
    assert!(!wrapped.is_retryable());
    assert_eq!(wrapped.device_id(), Some("plug-1"));
    assert_eq!(wrapped.context().get("ip").map(String::as_str), Some("10.0.0.9"));
    Ok(())
}

#[test]
fn display_renders_kind_severity_and_message() -> anyhow::Result<()> {
    let err = HubError::connection("broker unreachable");
    assert_eq!(err.to_string(), "connection(high): broker unreachable");

    let quiet = HubError::validation("empty topic");
    assert_eq!(quiet.to_string(), "validation(low): empty topic");

    let wrapped = HubError::wrap(HubError::io("read failed"), "poll aborted");
    assert_eq!(wrapped.to_string(), "io(medium): poll aborted: io(medium): read failed");
    Ok(())
}

#[test]
fn wrap_keeps_cause_in_source_chain() -> anyhow::Result<()> {
    let wrapped = HubError::wrap(HubError::io("read failed"), "poll aborted");
    let rendered = wrapped.to_string();
    assert!(rendered.contains("poll aborted"), "got: {rendered}");
    assert!(rendered.contains("read failed"), "got: {rendered}");
    assert!(std::error::Error::source(&wrapped).is_some());
    Ok(())
}

#[test]
fn builders_return_annotated_values() -> anyhow::Result<()> {
    let err = HubError::device("stale reading")
        .with_room("kitchen")
        .with_severity(Severity::High)
        .retryable(false)
        .with_context("attempts", "3");

    assert_eq!(err.room_id(), Some("kitchen"));
    assert_eq!(err.severity(), Severity::High);
    assert!(!err.is_retryable());
    assert_eq!(err.context().get("attempts").map(String::as_str), Some("3"));
    Ok(())
}

#[test]
fn severity_ordering() -> anyhow::Result<()> {
    assert!(Severity::Low < Severity::Medium);
    assert!(Severity::Medium < Severity::High);
    assert!(Severity::High < Severity::Critical);
    Ok(())
}

#[test]
fn handler_attaches_service_name() -> anyhow::Result<()> {
    let handler = ErrorHandler::new("sensor-hub");
    let wrapped = handler.wrap(HubError::validation("bad topic"), "message dropped");
    assert_eq!(wrapped.context().get("service").map(String::as_str), Some("sensor-hub"));
    assert_eq!(wrapped.kind(), ErrorKind::Validation);
    Ok(())
}
