use std::env;
use std::fs;
use std::process::Command;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::core::device;
use crate::core::error::{Error, Result};
use crate::log_status;

/// Snapshots are written at most once per hour, keyed by their upload
/// hour. The grace interval covers uploads that start just before the
/// hour boundary and land after it.
const UPLOAD_GRACE: i64 = 15;

/// Object-key prefix of the registry snapshots for the current hour.
pub fn snapshot_prefix(env_name: &str, now: DateTime<Utc>) -> String {
    let stamp = now - Duration::seconds(UPLOAD_GRACE);
    format!(
        "{}/device-registry/DR_{}:",
        env_name,
        stamp.format("%m-%d-%Y-%H")
    )
}

/// Parse a registry snapshot: a whitespace-separated table whose first
/// column holds device ids. The header has to name a recognized id
/// field, otherwise the object is not a registry snapshot.
pub fn parse_snapshot(text: &str) -> Result<Vec<String>> {
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| Error::Parse("registry snapshot is empty".into()))?;
    let first_field = header.split_whitespace().next().unwrap_or("");
    if device::select_id_field(&[first_field]).is_none() {
        return Err(Error::Parse(format!(
            "registry snapshot header starts with `{first_field}`, not a device-id field"
        )));
    }

    let raw: Vec<&str> = lines
        .filter_map(|line| line.split_whitespace().next())
        .collect();
    device::normalize_unique(raw)
}

/// Download and parse the newest registry snapshot for `env_name` from
/// the given bucket, using the aws CLI.
pub fn load_latest(bucket: &str, env_name: &str) -> Result<Vec<String>> {
    let prefix = snapshot_prefix(env_name, Utc::now());
    let key = newest_key(bucket, &prefix)?;
    log_status!("registry", "loading snapshot s3://{}/{}", bucket, key);

    let local = env::temp_dir().join(format!("frpc-registry-{}", Uuid::new_v4()));
    let status = Command::new("aws")
        .arg("s3")
        .arg("cp")
        .arg(format!("s3://{bucket}/{key}"))
        .arg(&local)
        .arg("--quiet")
        .status()?;
    if !status.success() {
        return Err(Error::Targeting(format!(
            "aws s3 cp exited with {status} for s3://{bucket}/{key}"
        )));
    }

    let text = fs::read_to_string(&local)?;
    fs::remove_file(&local).ok();
    let ids = parse_snapshot(&text)?;
    log_status!("registry", "snapshot holds {} device(s)", ids.len());
    Ok(ids)
}

fn newest_key(bucket: &str, prefix: &str) -> Result<String> {
    let output = Command::new("aws")
        .arg("s3api")
        .arg("list-objects-v2")
        .arg("--bucket")
        .arg(bucket)
        .arg("--prefix")
        .arg(prefix)
        .arg("--output")
        .arg("json")
        .output()?;
    if !output.status.success() {
        return Err(Error::Targeting(format!(
            "aws s3api list-objects-v2 exited with {} for prefix {}",
            output.status, prefix
        )));
    }

    let body: Value = serde_json::from_slice(&output.stdout)?;
    let contents = body
        .get("Contents")
        .and_then(Value::as_array)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            Error::Targeting(format!(
                "no registry snapshot under s3://{bucket}/{prefix}"
            ))
        })?;

    select_newest(contents).ok_or_else(|| {
        Error::Targeting(format!(
            "registry listing under s3://{bucket}/{prefix} has no usable entries"
        ))
    })
}

fn select_newest(contents: &[Value]) -> Option<String> {
    contents
        .iter()
        .filter_map(|entry| {
            let key = entry.get("Key")?.as_str()?;
            let modified = entry.get("LastModified")?.as_str()?;
            let stamp = DateTime::parse_from_rfc3339(modified).ok()?;
            Some((stamp, key.to_string()))
        })
        .max_by_key(|(stamp, _)| *stamp)
        .map(|(_, key)| key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn prefix_follows_the_upload_hour() {
        let now = Utc.with_ymd_and_hms(2026, 8, 3, 14, 30, 0).unwrap();
        assert_eq!(
            snapshot_prefix("prod", now),
            "prod/device-registry/DR_08-03-2026-14:"
        );
    }

    #[test]
    fn prefix_grace_crosses_hour_boundary() {
        let now = Utc.with_ymd_and_hms(2026, 8, 3, 14, 0, 5).unwrap();
        assert_eq!(
            snapshot_prefix("prod", now),
            "prod/device-registry/DR_08-03-2026-13:"
        );
    }

    #[test]
    fn snapshot_parses_first_column() {
        let text = "mac model\naaaaaaaaaaa1 m1\nAAAAAAAAAAA2 m2\n";
        assert_eq!(
            parse_snapshot(text).unwrap(),
            vec!["aaaaaaaaaaa1", "aaaaaaaaaaa2"]
        );
    }

    #[test]
    fn snapshot_rejects_unknown_header() {
        let err = parse_snapshot("model mac\nm1 aaaaaaaaaaa1\n").unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }

    #[test]
    fn newest_listing_entry_wins() {
        let contents = vec![
            json!({"Key": "a", "LastModified": "2026-08-03T13:05:00+00:00"}),
            json!({"Key": "b", "LastModified": "2026-08-03T13:45:00+00:00"}),
            json!({"Key": "c", "LastModified": "2026-08-03T13:20:00+00:00"}),
        ];
        assert_eq!(select_newest(&contents).as_deref(), Some("b"));
    }
}
