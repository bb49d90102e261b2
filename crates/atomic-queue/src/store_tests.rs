//! Tests for store reply handling.

use super::*;

fn bulk(value: &str) -> Reply {
    Reply::Bulk(value.to_string())
}

#[test]
fn test_field_pairs_keep_positional_pairing() {
    let reply = Reply::Array(vec![
        bulk("id"),
        Reply::Int(3),
        bulk("status"),
        bulk("received"),
    ]);

    let pairs = reply.into_field_pairs().unwrap();
    assert_eq!(
        pairs,
        vec![
            ("id".to_string(), "3".to_string()),
            ("status".to_string(), "received".to_string()),
        ]
    );
}

#[test]
fn test_field_pairs_reject_odd_length() {
    let reply = Reply::Array(vec![bulk("id"), bulk("3"), bulk("status")]);
    let err = reply.into_field_pairs().unwrap_err();
    assert!(err.contains("odd length 3"));
}

#[test]
fn test_field_pairs_reject_non_array() {
    assert!(Reply::Nil.into_field_pairs().is_err());
    assert!(Reply::Int(1).into_field_pairs().is_err());
}

#[test]
fn test_field_pairs_reject_nested_values() {
    let reply = Reply::Array(vec![bulk("id"), Reply::Array(vec![])]);
    assert!(reply.into_field_pairs().is_err());
}

#[test]
fn test_reply_scalar_conversions() {
    assert_eq!(Reply::Int(5).as_int(), Some(5));
    assert_eq!(bulk("12").as_int(), Some(12));
    assert_eq!(bulk("x").as_int(), None);
    assert_eq!(Reply::Nil.as_text(), None);
    assert!(Reply::Nil.is_nil());
}
