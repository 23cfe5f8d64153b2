//! Conversion-graph scenarios across the predefined types.

use mbus_data::{
    from_bool, from_f64, from_i32, from_json_text, from_stringz, to_bool, to_f64, to_i32,
    to_jsonc, to_stringz, Data, DataError, TypeRegistry, BOOL, F64, I32, I64, JSON, JSONC, OPAQUE,
    STRINGZ, U32, U64,
};

#[test]
fn i32_to_json_and_back() {
    let reg = TypeRegistry::new();
    let d = from_i32(42);
    let json = reg.convert(&d, JSON).unwrap();
    assert_eq!(json.read().bytes().unwrap(), b"42\0");
    let back = reg.convert(&json, I32).unwrap();
    assert_eq!(to_i32(&back).unwrap(), 42);
}

#[test]
fn i32_to_jsonc_stays_numeric() {
    let reg = TypeRegistry::new();
    let tree = reg.convert(&from_i32(42), JSONC).unwrap();
    let value = to_jsonc(&tree).unwrap();
    assert!(!value.is_boolean());
    assert_eq!(value.as_i64(), Some(42));
}

#[test]
fn i32_to_bool_fails_without_a_bridge() {
    let reg = TypeRegistry::new();
    assert!(matches!(
        reg.convert(&from_i32(42), BOOL),
        Err(DataError::NoConverter)
    ));
}

#[test]
fn exact_integer_round_trips_through_json() {
    let reg = TypeRegistry::new();
    for value in [0i64, 1, -1, i64::MIN, i64::MAX] {
        let json = reg.convert(&mbus_data::from_i64(value), JSON).unwrap();
        let back = reg.convert(&json, I64).unwrap();
        assert_eq!(mbus_data::to_i64(&back).unwrap(), value);
    }
    for value in [0u64, u64::MAX] {
        let json = reg.convert(&mbus_data::from_u64(value), JSON).unwrap();
        let back = reg.convert(&json, U64).unwrap();
        assert_eq!(mbus_data::to_u64(&back).unwrap(), value);
    }
    for value in [0u32, u32::MAX] {
        let json = reg.convert(&mbus_data::from_u32(value), JSON).unwrap();
        let back = reg.convert(&json, U32).unwrap();
        assert_eq!(mbus_data::to_u32(&back).unwrap(), value);
    }
}

#[test]
fn bool_round_trips_everywhere() {
    let reg = TypeRegistry::new();
    for value in [true, false] {
        let json = reg.convert(&from_bool(value), JSON).unwrap();
        assert_eq!(
            to_stringz(&json).unwrap(),
            if value { "true" } else { "false" }
        );
        assert_eq!(to_bool(&reg.convert(&json, BOOL).unwrap()).unwrap(), value);

        let tree = reg.convert(&from_bool(value), JSONC).unwrap();
        assert_eq!(to_jsonc(&tree).unwrap().as_bool(), Some(value));
        assert_eq!(to_bool(&reg.convert(&tree, BOOL).unwrap()).unwrap(), value);
    }
}

#[test]
fn double_round_trip_is_precision_bounded() {
    let reg = TypeRegistry::new();
    for value in [0.0, 1.5, -2.25, 0.1, 1e300, -1e-300] {
        let json = reg.convert(&from_f64(value), JSON).unwrap();
        let back = to_f64(&reg.convert(&json, F64).unwrap()).unwrap();
        let bound = value.abs() * 1e-12 + 1e-300;
        assert!((back - value).abs() <= bound, "{value} came back as {back}");
    }
}

#[test]
fn range_violations_are_reported() {
    let reg = TypeRegistry::new();
    let too_big = from_json_text("4294967296"); // u32::MAX + 1
    assert!(reg.convert(&too_big, U32).is_err());
    let negative = from_json_text("-1");
    assert!(reg.convert(&negative, U64).is_err());
    let garbage = from_json_text("4x");
    assert!(reg.convert(&garbage, I32).is_err());
}

#[test]
fn stringz_alias_chain() {
    let reg = TypeRegistry::new();
    // json text is a stringz by family, stringz aliases to bytearray.
    let json = from_json_text("\"abc\"");
    let s = reg.convert(&json, STRINGZ).unwrap();
    assert_eq!(to_stringz(&s).unwrap(), "\"abc\"");
    let bytes = reg.convert(&s, mbus_data::BYTEARRAY).unwrap();
    assert_eq!(bytes.read().bytes().unwrap(), b"\"abc\"\0");
}

#[test]
fn opaque_is_reversible_through_stringz_and_json() {
    let reg = TypeRegistry::new();
    let secret = Data::new_copy(OPAQUE, &[0xde, 0xad]);

    let s = reg.convert(&secret, STRINGZ).unwrap();
    let back = reg.convert(&s, OPAQUE).unwrap();
    assert!(back.same(&secret), "stringz round-trip must hit the same data");

    let json = reg.convert(&secret, JSON).unwrap();
    let text = to_stringz(&json).unwrap();
    assert!(text.starts_with("\"#@") && text.ends_with('"'));
    let back = reg.convert(&json, OPAQUE).unwrap();
    assert!(back.same(&secret), "json round-trip must hit the same data");
}

#[test]
fn stale_opaque_references_fail() {
    let reg = TypeRegistry::new();
    let secret = Data::new_copy(OPAQUE, &[1]);
    let s = reg.convert(&secret, STRINGZ).unwrap();
    let encoded = to_stringz(&s).unwrap();
    drop(secret);
    drop(s); // also drops the cached conversion chain
    let back = reg.convert(&from_stringz(&encoded), OPAQUE);
    assert!(back.is_err());
}

#[test]
fn update_into_preallocated_target() {
    let reg = TypeRegistry::new();
    let target = from_i32(0);
    reg.update(&from_json_text("77"), &target).unwrap();
    assert_eq!(to_i32(&target).unwrap(), 77);

    // No path: updating bool from a bytearray fails.
    let blob = Data::new_copy(mbus_data::BYTEARRAY, &[9]);
    let flag = from_bool(false);
    assert!(reg.update(&blob, &flag).is_err());
}
