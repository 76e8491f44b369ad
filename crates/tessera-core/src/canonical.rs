//! Canonical JSON serialization
//!
//! Hashes and signatures are computed over this form, so its output is a
//! bit-exact interop contract: object keys sorted lexicographically by
//! codepoint, no insignificant whitespace, UTF-8 output, and integers
//! restricted to the range representable without loss in a double.
//! Non-integer numbers are rejected outright.

use crate::errors::{Error, Result};
use serde_json::Value;

/// Largest integer magnitude permitted in canonical JSON.
pub const MAX_CANONICAL_INT: i64 = (1 << 53) - 1;

/// Serialize a JSON value into its canonical string form.
pub fn to_canonical_string(value: &Value) -> Result<String> {
    let mut out = String::with_capacity(256);
    write_value(&mut out, value)?;
    Ok(out)
}

/// Serialize a JSON value into canonical UTF-8 bytes.
pub fn to_canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    to_canonical_string(value).map(String::into_bytes)
}

fn write_value(out: &mut String, value: &Value) -> Result<()> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(number) => {
            let int = number
                .as_i64()
                .ok_or_else(|| Error::bad_json("non-integer number in canonical JSON"))?;
            if !(-MAX_CANONICAL_INT..=MAX_CANONICAL_INT).contains(&int) {
                return Err(Error::bad_json(format!(
                    "integer {int} outside canonical range"
                )));
            }
            out.push_str(&int.to_string());
        }
        Value::String(string) => write_string(out, string)?,
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            // serde_json's map may or may not preserve insertion order
            // depending on feature unification; sorting here is the contract.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();

            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(out, key)?;
                out.push(':');
                write_value(out, &map[key.as_str()])?;
            }
            out.push('}');
        }
    }

    Ok(())
}

fn write_string(out: &mut String, string: &str) -> Result<()> {
    let escaped =
        serde_json::to_string(string).map_err(|e| Error::bad_json(e.to_string()))?;
    out.push_str(&escaped);
    Ok(())
}
