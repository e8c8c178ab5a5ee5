// SPDX-License-Identifier: BSD-3-Clause

//! Support for byte units like "KB / KiB", "MB / MiB", "GB / GiB" in
//! configuration files.

use byte_unit::Byte;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer};

#[derive(Deserialize)]
#[serde(untagged)]
enum Value {
    Number(u64),
    String(String),
}

/// Deserializes a byte size given either as a plain number of bytes or as
/// a string with units (e.g. `"64 MiB"`, `"1GB"`).
pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Number(n) => Ok(n),
        Value::String(text) => {
            let parsed: Byte = text.parse().map_err(DeError::custom)?;
            Ok(parsed.as_u64())
        }
    }
}
