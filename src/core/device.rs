//! Device-id normalization and set helpers.
//!
//! A device id is the canonical lowercase 12-hex-digit identifier of one
//! remote endpoint. Everything that crosses a targeting or transport
//! boundary goes through `normalize_id` first.

use crate::error::{Error, Result};
use std::collections::HashSet;

pub const DEVICE_ID_LEN: usize = 12;

/// Field names recognized as holding a device id in tabular inputs and
/// query results (matched case-insensitively, in priority order).
pub const ID_FIELDNAMES: &[&str] = &["device_id", "deviceid", "mac", "macs"];

/// Convert a raw device id to canonical form.
///
/// Idempotent: `normalize_id(&normalize_id(x)?) == normalize_id(x)`.
pub fn normalize_id(raw: &str) -> Result<String> {
    let id = raw.trim();

    if id.len() != DEVICE_ID_LEN {
        return Err(Error::Parse(format!(
            "device id `{}` length has to be {}",
            id, DEVICE_ID_LEN
        )));
    }

    if !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::Parse(format!("device id `{}` has invalid format", id)));
    }

    Ok(id.to_ascii_lowercase())
}

/// Normalize an id sequence, dropping duplicates while preserving
/// first-seen order (targeting truncation relies on the input order).
pub fn normalize_unique<I, S>(raw: I) -> Result<Vec<String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    let mut ids = Vec::new();

    for item in raw {
        let id = normalize_id(item.as_ref())?;

        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }

    Ok(ids)
}

/// Select the ids in `ids` that are also present in `registry`,
/// preserving the order of `ids`.
pub fn registry_select(registry: &[String], ids: &[String]) -> Vec<String> {
    let registry: HashSet<&str> = registry.iter().map(String::as_str).collect();

    ids.iter()
        .filter(|id| registry.contains(id.as_str()))
        .cloned()
        .collect()
}

/// Interpret a canonical device id as an integer. Used for deterministic
/// bucket assignment (12 hex digits always fit in a u64).
pub fn id_to_u64(id: &str) -> Result<u64> {
    u64::from_str_radix(id, 16)
        .map_err(|_| Error::Parse(format!("device id `{}` is not hexadecimal", id)))
}

/// Select a recognized device-id field from a set of field names.
pub fn select_id_field<'a, S: AsRef<str>>(fieldnames: &'a [S]) -> Option<&'a str> {
    for wanted in ID_FIELDNAMES {
        if let Some(name) = fieldnames
            .iter()
            .find(|name| name.as_ref().eq_ignore_ascii_case(wanted))
        {
            return Some(name.as_ref());
        }
    }

    None
}
