//! Predefined types, their constructors/accessors and the canonical
//! conversion set installed at registry construction.
//!
//! Numbers are held in native-endian fixed-width bytes, `bool` in one byte
//! (0 or 1), `stringz` and `json` as NUL-terminated UTF-8, `jsonc` as a
//! parsed tree. Opaque references encode as `#@xxxx` (quoted in JSON form)
//! and decode back to the very value they were taken from, as long as it
//! lives.

use std::sync::Arc;

use serde_json::Value;

use crate::data::{Data, Payload};
use crate::error::DataError;
use crate::registry::{OpDesc, OpKind, Operation, TypeFlags, TypeId, TypeRegistry};

pub const OPAQUE: TypeId = TypeId(0);
pub const BYTEARRAY: TypeId = TypeId(1);
pub const STRINGZ: TypeId = TypeId(2);
pub const JSON: TypeId = TypeId(3);
pub const JSONC: TypeId = TypeId(4);
pub const BOOL: TypeId = TypeId(5);
pub const I32: TypeId = TypeId(6);
pub const U32: TypeId = TypeId(7);
pub const I64: TypeId = TypeId(8);
pub const U64: TypeId = TypeId(9);
pub const F64: TypeId = TypeId(10);

/// First id handed to user-registered types.
pub const FIRST_USER_TYPEID: u16 = 11;

// ---------------------------------------------------------------------------
// Constructors and accessors
// ---------------------------------------------------------------------------

/// NUL-terminated `stringz` value.
pub fn from_stringz(s: &str) -> Data {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    Data::new_raw(STRINGZ, bytes, None)
}

/// The text of a `stringz`-shaped value (trailing NUL removed).
pub fn to_stringz(data: &Data) -> Result<String, DataError> {
    let guard = data.read();
    let bytes = guard.bytes().ok_or(DataError::InvalidValue)?;
    let text = match bytes.split_last() {
        Some((0, head)) => head,
        _ => bytes,
    };
    String::from_utf8(text.to_vec()).map_err(|_| DataError::InvalidValue)
}

/// `json` value from its UTF-8 text (not validated here).
pub fn from_json_text(s: &str) -> Data {
    let mut bytes = s.as_bytes().to_vec();
    bytes.push(0);
    Data::new_raw(JSON, bytes, None)
}

/// `jsonc` value from a parsed tree.
pub fn from_jsonc(value: Value) -> Data {
    Data::new_json(JSONC, value)
}

/// The tree of a `jsonc` value.
pub fn to_jsonc(data: &Data) -> Result<Value, DataError> {
    data.read().json().cloned().ok_or(DataError::InvalidValue)
}

macro_rules! basic_value {
    ($from:ident, $to:ident, $ty:ty, $type_id:expr, $size:expr) => {
        pub fn $from(value: $ty) -> Data {
            Data::new_copy($type_id, &value.to_ne_bytes())
        }

        pub fn $to(data: &Data) -> Result<$ty, DataError> {
            let guard = data.read();
            let bytes = guard.bytes().ok_or(DataError::InvalidValue)?;
            let raw: [u8; $size] = bytes
                .get(..$size)
                .and_then(|b| b.try_into().ok())
                .ok_or(DataError::InvalidValue)?;
            Ok(<$ty>::from_ne_bytes(raw))
        }
    };
}

basic_value!(from_i32, to_i32, i32, I32, 4);
basic_value!(from_u32, to_u32, u32, U32, 4);
basic_value!(from_i64, to_i64, i64, I64, 8);
basic_value!(from_u64, to_u64, u64, U64, 8);
basic_value!(from_f64, to_f64, f64, F64, 8);

/// One-byte boolean, normalised to 0/1.
pub fn from_bool(value: bool) -> Data {
    Data::new_copy(BOOL, &[u8::from(value)])
}

pub fn to_bool(data: &Data) -> Result<bool, DataError> {
    let guard = data.read();
    let bytes = guard.bytes().ok_or(DataError::InvalidValue)?;
    match bytes.first() {
        Some(b) => Ok(*b != 0),
        None => Err(DataError::InvalidValue),
    }
}

// ---------------------------------------------------------------------------
// Opaque encoding
// ---------------------------------------------------------------------------

const OPAQUE_KEY: &str = "#@";

fn encode_opaque(reg: &TypeRegistry, data: &Data) -> Result<String, DataError> {
    let id = reg.opacify(data)?;
    Ok(format!("{OPAQUE_KEY}{id:04x}"))
}

fn decode_opaque(reg: &TypeRegistry, text: &str) -> Result<Data, DataError> {
    let hex = text.strip_prefix(OPAQUE_KEY).ok_or(DataError::BadOpaque)?;
    let id = u16::from_str_radix(hex, 16).map_err(|_| DataError::BadOpaque)?;
    reg.find_by_opaque_id(id)
}

// ---------------------------------------------------------------------------
// Installation
// ---------------------------------------------------------------------------

fn convert<F>(f: F) -> Operation
where
    F: Fn(&TypeRegistry, &Data, TypeId) -> Result<Data, DataError> + Send + Sync + 'static,
{
    Operation::Convert(Arc::new(f))
}

fn update<F>(f: F) -> Operation
where
    F: Fn(&TypeRegistry, &Data, &Data) -> Result<(), DataError> + Send + Sync + 'static,
{
    Operation::Update(Arc::new(f))
}

fn set_bytes(to_data: &Data, bytes: Vec<u8>) -> Result<(), DataError> {
    to_data.write()?.set(Payload::Bytes(bytes.into()));
    Ok(())
}

macro_rules! install_numeric_json_ops {
    ($reg:expr, $type_id:expr, $ty:ty, $to:ident, $from:ident,
     $from_value:expr, $to_value:expr) => {{
        // to json: decimal text
        $reg.push_predefined_op(
            $type_id,
            OpDesc {
                kind: OpKind::ConvertTo,
                other: JSON,
                op: convert(|_, data, _| {
                    let v = $to(data)?;
                    let mut bytes = v.to_string().into_bytes();
                    bytes.push(0);
                    Ok(Data::new_raw(JSON, bytes, None))
                }),
            },
        );
        // from json: strict full-string parse
        $reg.push_predefined_op(
            $type_id,
            OpDesc {
                kind: OpKind::ConvertFrom,
                other: JSON,
                op: convert(|_, data, _| {
                    let text = to_stringz(data)?;
                    let v: $ty = text.parse().map_err(|_| DataError::OutOfRange)?;
                    Ok($from(v))
                }),
            },
        );
        $reg.push_predefined_op(
            $type_id,
            OpDesc {
                kind: OpKind::UpdateFrom,
                other: JSON,
                op: update(|_, data, to_data| {
                    let text = to_stringz(data)?;
                    let v: $ty = text.parse().map_err(|_| DataError::OutOfRange)?;
                    set_bytes(to_data, v.to_ne_bytes().to_vec())
                }),
            },
        );
        // to jsonc: tree number
        $reg.push_predefined_op(
            $type_id,
            OpDesc {
                kind: OpKind::ConvertTo,
                other: JSONC,
                op: convert(|_, data, _| {
                    let v = $to(data)?;
                    Ok(Data::new_json(JSONC, $from_value(v)?))
                }),
            },
        );
        // from jsonc: tree number, range checked
        $reg.push_predefined_op(
            $type_id,
            OpDesc {
                kind: OpKind::ConvertFrom,
                other: JSONC,
                op: convert(|_, data, _| {
                    let value = to_jsonc(data)?;
                    let v: $ty = $to_value(&value)?;
                    Ok($from(v))
                }),
            },
        );
        $reg.push_predefined_op(
            $type_id,
            OpDesc {
                kind: OpKind::UpdateFrom,
                other: JSONC,
                op: update(|_, data, to_data| {
                    let value = to_jsonc(data)?;
                    let v: $ty = $to_value(&value)?;
                    set_bytes(to_data, v.to_ne_bytes().to_vec())
                }),
            },
        );
    }};
}

macro_rules! install_widening {
    ($reg:expr, $from_tid:expr, $to_tid:expr, $to:ident, $make:expr) => {{
        $reg.push_predefined_op(
            $from_tid,
            OpDesc {
                kind: OpKind::ConvertTo,
                other: $to_tid,
                op: convert(|_, data, _| {
                    let v = $to(data)?;
                    Ok($make(v))
                }),
            },
        );
    }};
}

fn int_from_value<T: TryFrom<i64>>(value: &Value) -> Result<T, DataError> {
    let v = value.as_i64().ok_or(DataError::InvalidValue)?;
    T::try_from(v).map_err(|_| DataError::OutOfRange)
}

fn u64_from_value(value: &Value) -> Result<u64, DataError> {
    value.as_u64().ok_or(DataError::InvalidValue)
}

fn f64_from_value(value: &Value) -> Result<f64, DataError> {
    value.as_f64().ok_or(DataError::InvalidValue)
}

/// Register the predefined descriptors and their conversion graph.
pub(crate) fn install(reg: &TypeRegistry) {
    let opaque = TypeFlags {
        opaque: true,
        ..TypeFlags::default()
    };
    let streamable = TypeFlags {
        streamable: true,
        shareable: true,
        ..TypeFlags::default()
    };
    let shareable = TypeFlags {
        shareable: true,
        ..TypeFlags::default()
    };

    let mut declare = |name: &str, flags: TypeFlags, expect: TypeId| {
        let id = reg
            .register_internal(name, flags, None, true)
            .expect("predefined registration cannot fail on a fresh registry");
        assert_eq!(id, expect);
    };
    declare("opaque", opaque, OPAQUE);
    declare("bytearray", streamable, BYTEARRAY);
    declare("stringz", streamable, STRINGZ);
    declare("json", streamable, JSON);
    declare("jsonc", TypeFlags::default(), JSONC);
    declare("bool", shareable, BOOL);
    declare("i32", shareable, I32);
    declare("u32", shareable, U32);
    declare("i64", shareable, I64);
    declare("u64", shareable, U64);
    declare("f64", shareable, F64);

    // json texts are stringz texts
    reg.set_predefined_family(JSON, STRINGZ);

    // -- opaque ------------------------------------------------------------
    reg.push_predefined_op(
        OPAQUE,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: STRINGZ,
            op: convert(|reg, data, _| {
                let mut bytes = encode_opaque(reg, data)?.into_bytes();
                bytes.push(0);
                Ok(Data::new_raw(STRINGZ, bytes, None))
            }),
        },
    );
    reg.push_predefined_op(
        OPAQUE,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: JSON,
            op: convert(|reg, data, _| {
                let mut bytes = format!("\"{}\"", encode_opaque(reg, data)?).into_bytes();
                bytes.push(0);
                Ok(Data::new_raw(JSON, bytes, None))
            }),
        },
    );
    reg.push_predefined_op(
        OPAQUE,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: JSONC,
            op: convert(|reg, data, _| {
                Ok(Data::new_json(JSONC, Value::String(encode_opaque(reg, data)?)))
            }),
        },
    );

    // -- stringz -----------------------------------------------------------
    reg.push_predefined_op(
        STRINGZ,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: OPAQUE,
            op: convert(|reg, data, _| decode_opaque(reg, &to_stringz(data)?)),
        },
    );
    reg.push_predefined_op(
        STRINGZ,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: BYTEARRAY,
            op: convert(|_, data, to| Ok(data.alias(to))),
        },
    );
    reg.push_predefined_op(
        STRINGZ,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: JSONC,
            op: convert(|_, data, _| {
                Ok(Data::new_json(JSONC, Value::String(to_stringz(data)?)))
            }),
        },
    );
    reg.push_predefined_op(
        STRINGZ,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: JSON,
            op: convert(|_, data, _| {
                let quoted = serde_json::to_string(&to_stringz(data)?)
                    .map_err(|_| DataError::InvalidValue)?;
                let mut bytes = quoted.into_bytes();
                bytes.push(0);
                Ok(Data::new_raw(JSON, bytes, None))
            }),
        },
    );

    // -- json --------------------------------------------------------------
    reg.push_predefined_op(
        JSON,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: OPAQUE,
            op: convert(|reg, data, _| {
                let text = to_stringz(data)?;
                let inner = text
                    .strip_prefix('"')
                    .and_then(|t| t.strip_suffix('"'))
                    .ok_or(DataError::BadOpaque)?;
                decode_opaque(reg, inner)
            }),
        },
    );
    reg.push_predefined_op(
        JSON,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: JSONC,
            op: convert(|_, data, _| {
                let value: Value = serde_json::from_str(&to_stringz(data)?)
                    .map_err(|_| DataError::InvalidValue)?;
                Ok(Data::new_json(JSONC, value))
            }),
        },
    );

    // -- jsonc -------------------------------------------------------------
    reg.push_predefined_op(
        JSONC,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: OPAQUE,
            op: convert(|reg, data, _| match to_jsonc(data)? {
                Value::String(s) => decode_opaque(reg, &s),
                _ => Err(DataError::InvalidValue),
            }),
        },
    );
    reg.push_predefined_op(
        JSONC,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: JSON,
            op: convert(|_, data, _| {
                let text = serde_json::to_string(&to_jsonc(data)?)
                    .map_err(|_| DataError::InvalidValue)?;
                let mut bytes = text.into_bytes();
                bytes.push(0);
                Ok(Data::new_raw(JSON, bytes, None))
            }),
        },
    );

    // -- bool --------------------------------------------------------------
    reg.push_predefined_op(
        BOOL,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: JSON,
            op: convert(|_, data, _| {
                Ok(Data::new_static(
                    JSON,
                    if to_bool(data)? { b"true\0" } else { b"false\0" },
                ))
            }),
        },
    );
    reg.push_predefined_op(
        BOOL,
        OpDesc {
            kind: OpKind::ConvertFrom,
            other: JSON,
            op: convert(|_, data, _| match to_stringz(data)?.as_str() {
                "true" => Ok(from_bool(true)),
                "false" => Ok(from_bool(false)),
                _ => Err(DataError::InvalidValue),
            }),
        },
    );
    reg.push_predefined_op(
        BOOL,
        OpDesc {
            kind: OpKind::UpdateFrom,
            other: JSON,
            op: update(|_, data, to_data| match to_stringz(data)?.as_str() {
                "true" => set_bytes(to_data, vec![1]),
                "false" => set_bytes(to_data, vec![0]),
                _ => Err(DataError::InvalidValue),
            }),
        },
    );
    reg.push_predefined_op(
        BOOL,
        OpDesc {
            kind: OpKind::ConvertTo,
            other: JSONC,
            op: convert(|_, data, _| Ok(Data::new_json(JSONC, Value::Bool(to_bool(data)?)))),
        },
    );
    reg.push_predefined_op(
        BOOL,
        OpDesc {
            kind: OpKind::ConvertFrom,
            other: JSONC,
            op: convert(|_, data, _| match to_jsonc(data)? {
                Value::Bool(b) => Ok(from_bool(b)),
                _ => Err(DataError::InvalidValue),
            }),
        },
    );
    install_widening!(reg, BOOL, I32, to_bool, |v: bool| from_i32(i32::from(v)));
    install_widening!(reg, BOOL, U32, to_bool, |v: bool| from_u32(u32::from(v)));
    install_widening!(reg, BOOL, I64, to_bool, |v: bool| from_i64(i64::from(v)));
    install_widening!(reg, BOOL, U64, to_bool, |v: bool| from_u64(u64::from(v)));
    install_widening!(reg, BOOL, F64, to_bool, |v: bool| from_f64(f64::from(
        u8::from(v)
    )));

    // -- numbers -----------------------------------------------------------
    install_numeric_json_ops!(
        reg,
        I32,
        i32,
        to_i32,
        from_i32,
        |v: i32| Ok::<_, DataError>(Value::from(v)),
        int_from_value::<i32>
    );
    install_widening!(reg, I32, I64, to_i32, |v: i32| from_i64(i64::from(v)));
    install_widening!(reg, I32, F64, to_i32, |v: i32| from_f64(f64::from(v)));

    install_numeric_json_ops!(
        reg,
        U32,
        u32,
        to_u32,
        from_u32,
        |v: u32| Ok::<_, DataError>(Value::from(v)),
        int_from_value::<u32>
    );
    install_widening!(reg, U32, I64, to_u32, |v: u32| from_i64(i64::from(v)));
    install_widening!(reg, U32, U64, to_u32, |v: u32| from_u64(u64::from(v)));
    install_widening!(reg, U32, F64, to_u32, |v: u32| from_f64(f64::from(v)));

    install_numeric_json_ops!(
        reg,
        I64,
        i64,
        to_i64,
        from_i64,
        |v: i64| Ok::<_, DataError>(Value::from(v)),
        int_from_value::<i64>
    );
    #[allow(clippy::cast_precision_loss)]
    {
        install_widening!(reg, I64, F64, to_i64, |v: i64| from_f64(v as f64));
    }

    install_numeric_json_ops!(
        reg,
        U64,
        u64,
        to_u64,
        from_u64,
        |v: u64| Ok::<_, DataError>(Value::from(v)),
        |value: &Value| u64_from_value(value)
    );

    install_numeric_json_ops!(
        reg,
        F64,
        f64,
        to_f64,
        from_f64,
        |v: f64| serde_json::Number::from_f64(v)
            .map(Value::Number)
            .ok_or(DataError::InvalidValue),
        |value: &Value| f64_from_value(value)
    );
}
