//! Entry Codec Tests
//!
//! Tests verify:
//! - Wire layout of each entry kind (tag byte, little-endian payload)
//! - Nested lists
//! - Truncated and unknown input is rejected
//! - The total order across kinds

use pagekv::codec::{tag, Entry, MAX_VARIABLE_LEN};
use pagekv::PageKvError;

// =============================================================================
// Helper Functions
// =============================================================================

fn round_trip(entry: &Entry) -> Entry {
    let bytes = entry.to_bytes().unwrap();
    assert_eq!(bytes.len(), entry.encoded_len());
    let (decoded, used) = Entry::decode(&bytes).unwrap();
    assert_eq!(used, bytes.len());
    decoded
}

// =============================================================================
// Layout Tests
// =============================================================================

#[test]
fn test_fixed_width_layout() {
    assert_eq!(Entry::Byte(-1).to_bytes().unwrap(), vec![tag::BYTE, 0xFF]);
    assert_eq!(Entry::Short(0x0102).to_bytes().unwrap(), vec![tag::SHORT, 0x02, 0x01]);
    assert_eq!(
        Entry::Int(1).to_bytes().unwrap(),
        vec![tag::INT, 1, 0, 0, 0]
    );
    assert_eq!(Entry::Long(7).to_bytes().unwrap().len(), 9);
    assert_eq!(Entry::Double(1.111).to_bytes().unwrap().len(), 9);
    assert_eq!(Entry::Boolean(true).to_bytes().unwrap(), vec![tag::BOOLEAN, 1]);
    assert_eq!(Entry::Empty.to_bytes().unwrap(), vec![tag::EMPTY]);
}

#[test]
fn test_string_layout() {
    let bytes = Entry::from("hi").to_bytes().unwrap();
    assert_eq!(bytes, vec![tag::STRING, 2, 0, b'h', b'i']);
}

#[test]
fn test_list_layout() {
    let list = Entry::List(vec![Entry::Byte(1), Entry::Empty]);
    let bytes = list.to_bytes().unwrap();
    assert_eq!(bytes, vec![tag::LIST, 3, 0, tag::BYTE, 1, tag::EMPTY]);
}

#[test]
fn test_round_trip_of_each_kind() {
    let entries = vec![
        Entry::Byte(-128),
        Entry::Short(i16::MIN),
        Entry::Int(i32::MAX),
        Entry::Long(-1),
        Entry::Float(3.5),
        Entry::Double(-0.25),
        Entry::Boolean(false),
        Entry::from("päge"),
        Entry::ByteArray(vec![0, 1, 2, 255]),
        Entry::Empty,
    ];
    for entry in &entries {
        assert_eq!(&round_trip(entry), entry);
    }
}

#[test]
fn test_nested_list_round_trip() {
    let nested = Entry::List(vec![
        Entry::Int(1),
        Entry::List(vec![Entry::from("inner"), Entry::List(vec![])]),
        Entry::ByteArray(vec![9; 10]),
    ]);
    let decoded = round_trip(&nested);
    assert_eq!(decoded, nested);
    assert_eq!(decoded.as_list().unwrap().len(), 3);
}

#[test]
fn test_decode_reports_consumed_length() {
    let mut bytes = Entry::Int(5).to_bytes().unwrap();
    bytes.extend_from_slice(&[0xAA, 0xBB]);
    let (entry, used) = Entry::decode(&bytes).unwrap();
    assert_eq!(entry, Entry::Int(5));
    assert_eq!(used, 5);
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_truncated_input_is_rejected() {
    let bytes = Entry::Long(99).to_bytes().unwrap();
    let err = Entry::decode(&bytes[..5]).unwrap_err();
    assert!(matches!(err, PageKvError::Codec(_)));

    let bytes = Entry::from("truncated").to_bytes().unwrap();
    assert!(Entry::decode(&bytes[..4]).is_err());
    assert!(Entry::decode(&[]).is_err());
}

#[test]
fn test_unknown_tag_is_rejected() {
    assert!(Entry::decode(&[3]).is_err());
    assert!(Entry::decode(&[11, 0]).is_err());
}

#[test]
fn test_invalid_utf8_is_rejected() {
    assert!(Entry::decode(&[tag::STRING, 2, 0, 0xC3, 0x28]).is_err());
}

#[test]
fn test_oversized_string_is_rejected() {
    let big = Entry::String("x".repeat(MAX_VARIABLE_LEN + 1));
    assert!(big.to_bytes().is_err());
}

#[test]
fn test_rejected_marshal_writes_nothing() {
    let mut out = vec![0xAB];

    let big = Entry::ByteArray(vec![1; MAX_VARIABLE_LEN + 1]);
    assert!(matches!(big.marshal(&mut out), Err(PageKvError::Codec(_))));
    assert_eq!(out, vec![0xAB]);

    let nested = Entry::List(vec![
        Entry::Long(1),
        Entry::List(vec![Entry::String("y".repeat(MAX_VARIABLE_LEN))]),
    ]);
    assert!(nested.marshal(&mut out).is_err());
    assert_eq!(out, vec![0xAB]);

    // the buffer is still usable afterwards
    Entry::Byte(7).marshal(&mut out).unwrap();
    assert_eq!(out, vec![0xAB, tag::BYTE, 7]);
}

#[test]
fn test_marshal_into_short_buffer_fails() {
    let mut out = [0u8; 4];
    let mut slice = &mut out[..];
    assert!(Entry::Long(1).marshal(&mut slice).is_err());
}

// =============================================================================
// Ordering Tests
// =============================================================================

#[test]
fn test_order_across_kinds() {
    let ordered = vec![
        Entry::Empty,
        Entry::Int(-5),
        Entry::Double(0.5),
        Entry::Long(3),
        Entry::Boolean(false),
        Entry::Boolean(true),
        Entry::from("a"),
        Entry::from("b"),
        Entry::ByteArray(vec![0]),
        Entry::List(vec![Entry::Int(1)]),
    ];
    let mut shuffled = ordered.clone();
    shuffled.reverse();
    shuffled.sort();
    assert_eq!(shuffled, ordered);
}

#[test]
fn test_numeric_comparison_by_value() {
    assert!(Entry::Byte(10) > Entry::Long(9));
    assert!(Entry::Float(1.5) < Entry::Int(2));
    assert!(Entry::Short(-3) < Entry::Double(-2.5));
}

#[test]
fn test_equal_numbers_of_different_width_are_distinct() {
    assert_ne!(Entry::Int(1), Entry::Long(1));
    assert!(Entry::Int(1) < Entry::Long(1));
}

#[test]
fn test_list_order_is_lexicographic() {
    let short = Entry::List(vec![Entry::Int(1)]);
    let long = Entry::List(vec![Entry::Int(1), Entry::Int(0)]);
    let bigger = Entry::List(vec![Entry::Int(2)]);
    assert!(short < long);
    assert!(long < bigger);
}

#[test]
fn test_display() {
    assert_eq!(Entry::from("k").to_string(), "\"k\"");
    assert_eq!(Entry::Long(3).to_string(), "3L");
    assert_eq!(
        Entry::List(vec![Entry::Int(1), Entry::Boolean(true)]).to_string(),
        "[1, true]"
    );
}
