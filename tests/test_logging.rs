//! Tests for logging configuration and format parsing
//!
//! Covers the pure functions that turn environment values into logging
//! settings; installing the global subscriber is left to the binary.

use blynk_edge::observability::logging::{
    build_filter, init_logging, parse_level, parse_spans_flag, LogFormat,
};
use tracing::Level;

#[test]
fn test_log_format_parse_known_values() {
    assert_eq!(LogFormat::parse("json"), LogFormat::Json);
    assert_eq!(LogFormat::parse("Pretty"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("COMPACT"), LogFormat::Compact);
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    assert_eq!(LogFormat::parse("invalid"), LogFormat::Json);
    assert_eq!(LogFormat::parse(""), LogFormat::Json);
    assert_eq!(LogFormat::parse("  pretty  "), LogFormat::Json);
}

#[test]
fn test_unknown_level_defaults_to_info() {
    assert_eq!(parse_level("loud"), Level::INFO);
    assert_eq!(parse_level("warn"), Level::WARN);
}

#[test]
fn test_spans_flag_requires_true() {
    assert!(parse_spans_flag("True"));
    assert!(!parse_spans_flag("on"));
}

#[test]
fn test_filter_keeps_tls_noise_down() {
    let filter = build_filter(Level::TRACE, None).to_string().to_lowercase();
    assert!(filter.contains("trace"));
    assert!(filter.contains("tokio_rustls=warn"));
    assert!(filter.contains("tokio=warn"));
}

#[test]
fn test_repeated_init_does_not_panic() {
    init_logging(Level::INFO, LogFormat::Compact, false);
    init_logging(Level::DEBUG, LogFormat::Json, true);
}
