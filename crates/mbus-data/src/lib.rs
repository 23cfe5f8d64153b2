//! Typed, reference-counted values and the conversion graph between types.
//!
//! A [`Data`] couples a byte payload (or a parsed JSON tree) with a type
//! drawn from a [`TypeRegistry`]. Conversion from one type to another walks
//! the registry's operation graph in four layers — direct (with family
//! ancestry), fast indirect through a middle type seen from either end, and
//! finally a full scan of candidate middles — stopping at the first
//! converter chain that succeeds.
//!
//! The registry ships the predefined types (`opaque`, `bytearray`,
//! `stringz`, `json`, `jsonc`, `bool`, `i32`, `u32`, `i64`, `u64`, `f64`)
//! and their canonical conversions; predefined descriptors are immutable.

mod data;
mod error;
mod predefined;
mod registry;

pub use data::{Data, Payload, ReadGuard, WriteGuard};
pub use error::DataError;
pub use predefined::{
    from_bool, from_f64, from_i32, from_i64, from_json_text, from_jsonc, from_stringz, from_u32,
    from_u64, to_bool, to_f64, to_i32, to_i64, to_jsonc, to_stringz, to_u32, to_u64, BOOL,
    BYTEARRAY, F64, FIRST_USER_TYPEID, I32, I64, JSON, JSONC, OPAQUE, STRINGZ, U32, U64,
};
pub use registry::{ConvertFn, TypeFlags, TypeId, TypeRegistry, UpdateFn};
