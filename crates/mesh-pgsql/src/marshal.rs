//! Host values to query parameters, and result cells back to host values.
//!
//! Parameters are chosen by a type switch over [`Value`]:
//!
//! | host value | type      | binary payload          | text payload        |
//! |------------|-----------|-------------------------|---------------------|
//! | boolean    | `bool`    | 1 byte                  | `true` / `false`    |
//! | integer    | `int8`    | 8 bytes big-endian      | decimal             |
//! | number     | `float8`  | 8 bytes big-endian IEEE | shortest round-trip |
//! | string     | `text`    | raw bytes, text format  | raw bytes           |
//! | nil        | unknown   | SQL NULL                | SQL NULL            |
//!
//! Integers always travel as 8-byte `int8` whatever the target column is;
//! the server casts to narrower integer columns.
//!
//! Tables, functions, userdata and threads are rejected. Composite values
//! must be flattened by the caller.

use mesh_pq::exec::MAX_PARAMS;
use mesh_pq::types::{
    Oid, BOOLOID, FLOAT4OID, FLOAT8OID, INT2OID, INT4OID, INT8OID, NUMERICOID, OIDOID, TEXTOID,
};

use crate::error::{Error, Result};
use crate::host::Value;

const FORMAT_TEXT: i16 = 0;
const FORMAT_BINARY: i16 = 1;

/// One encoded parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// 0 lets the server infer the type.
    pub oid: Oid,
    /// `None` is SQL NULL.
    pub value: Option<Vec<u8>>,
    pub format: i16,
}

/// Parameters in the parallel-array shape the native calls take.
#[derive(Debug, Default)]
pub struct ParamList {
    types: Vec<Oid>,
    values: Vec<Option<Vec<u8>>>,
    formats: Vec<i16>,
}

impl ParamList {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn types(&self) -> &[Oid] {
        &self.types
    }

    pub fn formats(&self) -> &[i16] {
        &self.formats
    }

    pub fn values(&self) -> Vec<Option<&[u8]>> {
        self.values.iter().map(Option::as_deref).collect()
    }
}

fn check_count(n: usize) -> Result<()> {
    if n > MAX_PARAMS {
        return Err(Error::TooManyParams {
            count: n,
            max: MAX_PARAMS,
        });
    }
    Ok(())
}

/// The parameter type a value would be sent as. `position` is the
/// 1-based argument position used in error reports.
pub fn encode_param_type(value: &Value, position: usize) -> Result<Oid> {
    match value {
        Value::Nil => Ok(0),
        Value::Boolean(_) => Ok(BOOLOID),
        Value::Integer(_) => Ok(INT8OID),
        Value::Number(_) => Ok(FLOAT8OID),
        Value::String(_) => Ok(TEXTOID),
        Value::Table(_) | Value::Function | Value::Userdata | Value::Thread => {
            Err(unsupported(value, position))
        }
    }
}

fn unsupported(value: &Value, position: usize) -> Error {
    Error::UnsupportedType {
        position,
        kind: value.kind(),
    }
}

/// Encode one value. With `want_binary` scalars use their binary wire
/// form; otherwise everything is text.
pub fn encode_param(value: &Value, position: usize, want_binary: bool) -> Result<Param> {
    let oid = encode_param_type(value, position)?;
    let (value, format) = match value {
        Value::Nil => (None, FORMAT_TEXT),
        Value::Boolean(b) if want_binary => (Some(vec![u8::from(*b)]), FORMAT_BINARY),
        Value::Boolean(b) => {
            let text: &[u8] = if *b { b"true" } else { b"false" };
            (Some(text.to_vec()), FORMAT_TEXT)
        }
        Value::Integer(i) if want_binary => (Some(i.to_be_bytes().to_vec()), FORMAT_BINARY),
        Value::Integer(i) => (Some(i.to_string().into_bytes()), FORMAT_TEXT),
        Value::Number(n) if want_binary => {
            (Some(n.to_bits().to_be_bytes().to_vec()), FORMAT_BINARY)
        }
        Value::Number(n) => (Some(float_text(*n).into_bytes()), FORMAT_TEXT),
        Value::String(s) => (Some(s.clone()), FORMAT_TEXT),
        Value::Table(_) | Value::Function | Value::Userdata | Value::Thread => {
            return Err(unsupported(value, position));
        }
    };
    Ok(Param { oid, value, format })
}

/// Encode a whole argument list. The count is checked before anything is
/// allocated, and one bad value fails the whole list.
pub fn encode_params(values: &[Value], want_binary: bool) -> Result<ParamList> {
    check_count(values.len())?;
    let mut list = ParamList::default();
    list.types.try_reserve_exact(values.len()).map_err(|_| Error::Allocation)?;
    list.values.try_reserve_exact(values.len()).map_err(|_| Error::Allocation)?;
    list.formats.try_reserve_exact(values.len()).map_err(|_| Error::Allocation)?;
    for (i, value) in values.iter().enumerate() {
        let param = encode_param(value, i + 1, want_binary)?;
        list.types.push(param.oid);
        list.values.push(param.value);
        list.formats.push(param.format);
    }
    Ok(list)
}

/// Types only, for declaring a prepared statement.
pub fn encode_param_types(values: &[Value]) -> Result<Vec<Oid>> {
    check_count(values.len())?;
    let mut types = Vec::new();
    types.try_reserve_exact(values.len()).map_err(|_| Error::Allocation)?;
    for (i, value) in values.iter().enumerate() {
        types.push(encode_param_type(value, i + 1)?);
    }
    Ok(types)
}

fn float_text(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        // Debug is the shortest string that parses back to the same f64.
        format!("{:?}", n)
    }
}

// ── Decoding ───────────────────────────────────────────────────────────

/// Convert one result cell to a host value.
///
/// Untyped, every non-null cell is a string. Typed, boolean, integer,
/// float and numeric columns are parsed; anything that fails to parse
/// stays a string.
pub fn decode_cell(raw: Option<&[u8]>, oid: Oid, format: i16, typed: bool) -> Value {
    let Some(raw) = raw else {
        return Value::Nil;
    };
    if !typed {
        return Value::String(raw.to_vec());
    }
    let parsed = if format == FORMAT_BINARY {
        decode_binary(raw, oid)
    } else {
        std::str::from_utf8(raw).ok().and_then(|s| decode_text(s, oid))
    };
    parsed.unwrap_or_else(|| Value::String(raw.to_vec()))
}

fn decode_text(s: &str, oid: Oid) -> Option<Value> {
    match oid {
        BOOLOID => match s {
            "t" | "true" => Some(Value::Boolean(true)),
            "f" | "false" => Some(Value::Boolean(false)),
            _ => None,
        },
        INT2OID | INT4OID | INT8OID | OIDOID => s.parse::<i64>().ok().map(Value::Integer),
        FLOAT4OID | FLOAT8OID | NUMERICOID => parse_float(s).map(Value::Number),
        _ => None,
    }
}

fn parse_float(s: &str) -> Option<f64> {
    match s {
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        _ => s.parse().ok(),
    }
}

fn decode_binary(raw: &[u8], oid: Oid) -> Option<Value> {
    match (oid, raw.len()) {
        (BOOLOID, 1) => Some(Value::Boolean(raw[0] != 0)),
        (INT2OID, 2) => Some(Value::Integer(i16::from_be_bytes([raw[0], raw[1]]).into())),
        (INT4OID, 4) => Some(Value::Integer(
            i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]).into(),
        )),
        (OIDOID, 4) => Some(Value::Integer(
            u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]).into(),
        )),
        (INT8OID, 8) => Some(Value::Integer(i64::from_be_bytes(raw.try_into().ok()?))),
        (FLOAT4OID, 4) => Some(Value::Number(
            f32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]).into(),
        )),
        (FLOAT8OID, 8) => Some(Value::Number(f64::from_be_bytes(raw.try_into().ok()?))),
        (NUMERICOID, _) => decode_numeric(raw).map(Value::Number),
        _ => None,
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Binary numeric: ndigits, weight, sign, dscale, then base-10000 digits,
/// the first one weighted by 10000^weight.
fn decode_numeric(raw: &[u8]) -> Option<f64> {
    if raw.len() < 8 {
        return None;
    }
    let word = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
    let ndigits = word(0) as usize;
    let weight = word(2) as i16 as i32;
    let sign = word(4);
    match sign {
        NUMERIC_NAN => return Some(f64::NAN),
        NUMERIC_PINF => return Some(f64::INFINITY),
        NUMERIC_NINF => return Some(f64::NEG_INFINITY),
        0 | NUMERIC_NEG => {}
        _ => return None,
    }
    if raw.len() != 8 + 2 * ndigits {
        return None;
    }
    let mut value = 0.0_f64;
    for i in 0..ndigits {
        let digit = word(8 + 2 * i);
        if digit >= 10000 {
            return None;
        }
        value += f64::from(digit) * 10000_f64.powi(weight - i as i32);
    }
    Some(if sign == NUMERIC_NEG { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(v: Value) -> Value {
        let p = encode_param(&v, 1, true).unwrap();
        decode_cell(p.value.as_deref(), p.oid, p.format, true)
    }

    #[test]
    fn test_binary_encodings() {
        let p = encode_param(&Value::Boolean(true), 1, true).unwrap();
        assert_eq!((p.oid, p.value, p.format), (BOOLOID, Some(vec![1]), 1));

        let p = encode_param(&Value::Integer(1), 1, true).unwrap();
        assert_eq!(p.oid, INT8OID);
        assert_eq!(p.value, Some(vec![0, 0, 0, 0, 0, 0, 0, 1]));

        let p = encode_param(&Value::Number(1.0), 1, true).unwrap();
        assert_eq!(p.oid, FLOAT8OID);
        assert_eq!(p.value, Some(vec![0x3f, 0xf0, 0, 0, 0, 0, 0, 0]));

        let p = encode_param(&Value::from("a\0b"), 1, true).unwrap();
        assert_eq!((p.oid, p.format), (TEXTOID, 0));
        assert_eq!(p.value, Some(b"a\0b".to_vec()));

        let p = encode_param(&Value::Nil, 1, true).unwrap();
        assert_eq!((p.oid, p.value), (0, None));
    }

    #[test]
    fn test_text_encodings() {
        let text = |v: Value| encode_param(&v, 1, false).unwrap().value.unwrap();
        assert_eq!(text(Value::Boolean(false)), b"false");
        assert_eq!(text(Value::Integer(-42)), b"-42");
        assert_eq!(text(Value::Number(0.1)), b"0.1");
        assert_eq!(text(Value::Number(f64::INFINITY)), b"Infinity");
        assert_eq!(text(Value::Number(f64::NEG_INFINITY)), b"-Infinity");
        assert_eq!(text(Value::Number(f64::NAN)), b"NaN");
        assert!(encode_param(&Value::Integer(3), 1, false).unwrap().format == 0);
    }

    #[test]
    fn test_round_trip_scalars() {
        assert_eq!(round_trip(Value::Boolean(false)), Value::Boolean(false));
        assert_eq!(round_trip(Value::Integer(i64::MIN)), Value::Integer(i64::MIN));
        assert_eq!(round_trip(Value::Number(-2.5e-8)), Value::Number(-2.5e-8));
        assert_eq!(round_trip(Value::from("text")), Value::from("text"));
        assert_eq!(round_trip(Value::Nil), Value::Nil);
    }

    #[test]
    fn test_unsupported_kinds_rejected() {
        for (v, kind) in [
            (Value::Table(vec![Value::Integer(1)]), "table"),
            (Value::Function, "function"),
            (Value::Userdata, "userdata"),
            (Value::Thread, "thread"),
        ] {
            let expected = Error::UnsupportedType { position: 2, kind };
            assert_eq!(encode_params(&[Value::Nil, v.clone()], true).unwrap_err(), expected);
            assert_eq!(encode_params(&[Value::Nil, v.clone()], false).unwrap_err(), expected);
            assert_eq!(encode_param_type(&v, 2).unwrap_err(), expected);
        }
    }

    #[test]
    fn test_param_count_limit() {
        let values = vec![Value::Nil; MAX_PARAMS + 1];
        assert_eq!(
            encode_params(&values, true).unwrap_err(),
            Error::TooManyParams { count: 65536, max: 65535 }
        );
        assert!(matches!(
            encode_param_types(&values),
            Err(Error::TooManyParams { .. })
        ));
        assert_eq!(encode_params(&values[..MAX_PARAMS], true).unwrap().len(), MAX_PARAMS);
    }

    #[test]
    fn test_param_list_shape() {
        let list = encode_params(&[Value::Integer(7), Value::from("x"), Value::Nil], true).unwrap();
        assert_eq!(list.types(), &[INT8OID, TEXTOID, 0]);
        assert_eq!(list.formats(), &[1, 0, 0]);
        assert_eq!(list.values()[1], Some(&b"x"[..]));
        assert_eq!(list.values()[2], None);
        assert_eq!(
            encode_param_types(&[Value::Boolean(true), Value::Number(1.0)]).unwrap(),
            vec![BOOLOID, FLOAT8OID]
        );
    }

    #[test]
    fn test_decode_text_typed() {
        let d = |s: &str, oid| decode_cell(Some(s.as_bytes()), oid, 0, true);
        assert_eq!(d("t", BOOLOID), Value::Boolean(true));
        assert_eq!(d("f", BOOLOID), Value::Boolean(false));
        assert_eq!(d("123", INT4OID), Value::Integer(123));
        assert_eq!(d("-5", INT2OID), Value::Integer(-5));
        assert_eq!(d("1.25", NUMERICOID), Value::Number(1.25));
        assert_eq!(d("-Infinity", FLOAT8OID), Value::Number(f64::NEG_INFINITY));
        assert_eq!(d("abc", INT4OID), Value::from("abc"));
        assert_eq!(d("2024-01-01", 1082), Value::from("2024-01-01"));
        assert_eq!(decode_cell(Some(b"1"), INT4OID, 0, false), Value::from("1"));
        assert_eq!(decode_cell(None, INT4OID, 0, true), Value::Nil);
    }

    #[test]
    fn test_decode_binary_numeric() {
        // 12345.678 = digits [1, 2345, 6780], weight 1, dscale 3
        let mut raw = Vec::new();
        for w in [3u16, 1, 0, 3, 1, 2345, 6780] {
            raw.extend_from_slice(&w.to_be_bytes());
        }
        match decode_cell(Some(&raw), NUMERICOID, 1, true) {
            Value::Number(n) => assert!((n - 12345.678).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }
        let mut neg = raw.clone();
        neg[4..6].copy_from_slice(&NUMERIC_NEG.to_be_bytes());
        assert!(matches!(
            decode_cell(Some(&neg), NUMERICOID, 1, true),
            Value::Number(n) if n < 0.0
        ));

        let nan = [0u8, 0, 0, 0, 0xC0, 0, 0, 0];
        assert!(matches!(
            decode_cell(Some(&nan), NUMERICOID, 1, true),
            Value::Number(n) if n.is_nan()
        ));
    }

    #[test]
    fn test_decode_binary_ints() {
        assert_eq!(
            decode_cell(Some(&7_i32.to_be_bytes()), INT4OID, 1, true),
            Value::Integer(7)
        );
        assert_eq!(
            decode_cell(Some(&(-3_i16).to_be_bytes()), INT2OID, 1, true),
            Value::Integer(-3)
        );
        // Wrong width falls back to the raw bytes.
        assert_eq!(
            decode_cell(Some(&[1, 2, 3]), INT4OID, 1, true),
            Value::String(vec![1, 2, 3])
        );
    }
}
