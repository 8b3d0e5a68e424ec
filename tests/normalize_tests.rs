// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for canonical code normalization

use codescan::{EngineKind, normalize};

fn matrix(raw: &str) -> Option<String> {
    normalize(raw, EngineKind::Matrix)
        .ok()
        .map(|c| c.into_string())
}

fn linear(raw: &str) -> Option<String> {
    normalize(raw, EngineKind::Linear)
        .ok()
        .map(|c| c.into_string())
}

#[test]
fn short_digit_strings_left_pad_to_eight() {
    for (raw, expected) in [
        ("1", "00000001"),
        ("42", "00000042"),
        ("999", "00000999"),
        ("1234567", "01234567"),
    ] {
        assert_eq!(linear(raw).as_deref(), Some(expected), "raw {:?}", raw);
        assert_eq!(matrix(raw).as_deref(), Some(expected), "raw {:?}", raw);
    }
}

#[test]
fn long_digit_strings_keep_last_eight() {
    for (raw, expected) in [
        ("123456789", "23456789"),
        ("0012345678", "12345678"),
        ("5901234123457", "34123457"),
    ] {
        assert_eq!(linear(raw).as_deref(), Some(expected), "raw {:?}", raw);
        assert_eq!(matrix(raw).as_deref(), Some(expected), "raw {:?}", raw);
    }
}

#[test]
fn exact_eight_digits_is_identity() {
    assert_eq!(linear("12345678").as_deref(), Some("12345678"));
    assert_eq!(matrix("12345678").as_deref(), Some("12345678"));
}

#[test]
fn embedded_eight_digit_run_extracted_for_matrix_sources() {
    assert_eq!(matrix("ABC12345678XYZ").as_deref(), Some("12345678"));
}

#[test]
fn single_digit_from_matrix_source_pads() {
    assert_eq!(matrix("9").as_deref(), Some("00000009"));
}

#[test]
fn digitless_text_is_rejected_with_descriptive_reason() {
    let err = normalize("hello", EngineKind::Linear).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("hello"));
    assert!(message.contains("8-digit"));

    assert!(normalize("hello", EngineKind::Matrix).is_err());
    assert!(normalize("", EngineKind::Linear).is_err());
    assert!(normalize("---", EngineKind::Matrix).is_err());
}

#[test]
fn precedence_is_not_reordered() {
    // All-digit payloads never use the substring rules, even when an
    // embedded reading would differ
    assert_eq!(matrix("123456789").as_deref(), Some("23456789"));

    // The exactly-8 run wins over an earlier shorter run for 2D sources
    assert_eq!(matrix("lot:123 code:87654321").as_deref(), Some("87654321"));

    // Linear sources fall straight through to the first run
    assert_eq!(linear("lot:123 code:87654321").as_deref(), Some("00000123"));

    // With no exactly-8 run, 2D sources fall back to the first run
    assert_eq!(matrix("a1234b567890123c").as_deref(), Some("00001234"));
}
