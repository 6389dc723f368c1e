use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::Value;

use crate::core::device;
use crate::core::error::{Error, Result};
use crate::core::ratelimit::RateLimit;
use crate::log_status;

pub const SEARCH_CONFIG_FILENAME: &str = ".frpc_search.json";

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(32);

fn default_page_size() -> usize {
    10_000
}

fn default_requests_per_minute() -> u64 {
    120
}

/// Credentials and tuning for the log-search API, read from
/// `.frpc_search.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    pub access_id: String,
    pub access_key: String,
    pub api_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u64,
}

pub fn load_config(path: Option<&Path>) -> Result<SearchConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => find_config_file()?,
    };
    let body = fs::read_to_string(&path)?;
    Ok(serde_json::from_str(&body)?)
}

fn find_config_file() -> Result<PathBuf> {
    let local = PathBuf::from(SEARCH_CONFIG_FILENAME);
    if local.is_file() {
        return Ok(local);
    }
    let home =
        PathBuf::from(shellexpand::tilde(&format!("~/{SEARCH_CONFIG_FILENAME}")).into_owned());
    if home.is_file() {
        return Ok(home);
    }
    Err(Error::Config(format!(
        "{SEARCH_CONFIG_FILENAME} not found in current or home directory"
    )))
}

/// Time range of a search, either trailing from now or absolute.
/// Boundaries are unix seconds.
#[derive(Debug, Clone, Copy)]
pub enum TimeWindow {
    Trailing(u64),
    Absolute { start: f64, end: f64 },
}

impl TimeWindow {
    pub fn absolute(start: f64, end: f64) -> Result<Self> {
        if start >= end {
            return Err(Error::Config(format!(
                "search window start {start} is not before end {end}"
            )));
        }
        Ok(TimeWindow::Absolute { start, end })
    }

    /// Resolve to millisecond boundaries against the wall clock.
    pub fn to_millis(self) -> (i64, i64) {
        match self {
            TimeWindow::Trailing(seconds) => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_millis() as i64;
                (now - (seconds as i64) * 1000, now)
            }
            TimeWindow::Absolute { start, end } => {
                ((start * 1000.0) as i64, (end * 1000.0) as i64)
            }
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(BACKOFF_CAP)
}

/// Blocking client for the asynchronous search-job API. Every request
/// goes through the rate limiter, and job polling backs off from one
/// second up to a cap.
pub struct SearchClient {
    config: SearchConfig,
    client: reqwest::blocking::Client,
    rate: RateLimit,
}

impl SearchClient {
    pub fn new(config: SearchConfig) -> Self {
        let period = Duration::from_secs(60) / config.requests_per_minute.max(1) as u32;
        SearchClient {
            config,
            client: reqwest::blocking::Client::new(),
            rate: RateLimit::new(period),
        }
    }

    /// Run a query and return the normalized unique device ids from its
    /// records.
    pub fn fetch_device_ids(&self, query: &str, window: TimeWindow) -> Result<Vec<String>> {
        let job_id = self.create_job(query, window)?;
        let run = (|| {
            let count = self.wait_job(&job_id)?;
            let records = self.pull_records(&job_id, count)?;
            extract_device_ids(&records)
        })();
        self.delete_job(&job_id);
        run
    }

    fn create_job(&self, query: &str, window: TimeWindow) -> Result<String> {
        let (from, to) = window.to_millis();
        self.rate.acquire();
        let body: Value = self
            .client
            .post(format!("{}/search/jobs", self.config.api_url))
            .basic_auth(&self.config.access_id, Some(&self.config.access_key))
            .json(&serde_json::json!({
                "query": query,
                "from": from,
                "to": to,
            }))
            .send()?
            .error_for_status()?
            .json()?;
        body.get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Targeting("search job response has no id".into()))
    }

    fn wait_job(&self, job_id: &str) -> Result<usize> {
        let mut backoff = BACKOFF_START;
        loop {
            self.rate.acquire();
            let body: Value = self
                .client
                .get(format!("{}/search/jobs/{}", self.config.api_url, job_id))
                .basic_auth(&self.config.access_id, Some(&self.config.access_key))
                .send()?
                .error_for_status()?
                .json()?;
            let state = body.get("state").and_then(Value::as_str).unwrap_or("");
            match state {
                "DONE GATHERING RESULTS" => {
                    let count = body
                        .get("recordCount")
                        .and_then(Value::as_u64)
                        .unwrap_or(0) as usize;
                    return Ok(count);
                }
                "NOT STARTED" | "GATHERING RESULTS" => {
                    log_status!("search", "job {} is {}, waiting", job_id, state);
                    std::thread::sleep(backoff);
                    backoff = next_backoff(backoff);
                }
                other => {
                    return Err(Error::Targeting(format!(
                        "search job {job_id} ended in state `{other}`"
                    )));
                }
            }
        }
    }

    fn pull_records(&self, job_id: &str, count: usize) -> Result<Vec<HashMap<String, String>>> {
        let mut records = Vec::with_capacity(count);
        let mut offset = 0;
        while offset < count {
            let limit = self.config.page_size.min(count - offset);
            self.rate.acquire();
            let body: Value = self
                .client
                .get(format!(
                    "{}/search/jobs/{}/records?offset={}&limit={}",
                    self.config.api_url, job_id, offset, limit
                ))
                .basic_auth(&self.config.access_id, Some(&self.config.access_key))
                .send()?
                .error_for_status()?
                .json()?;
            let page = body
                .get("records")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::Targeting("search records response has no records".into()))?;
            for record in page {
                let map = record
                    .get("map")
                    .and_then(Value::as_object)
                    .ok_or_else(|| Error::Targeting("search record has no map".into()))?;
                records.push(
                    map.iter()
                        .map(|(k, v)| {
                            let text = match v {
                                Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            (k.clone(), text)
                        })
                        .collect(),
                );
            }
            offset += limit.max(1);
        }
        Ok(records)
    }

    fn delete_job(&self, job_id: &str) {
        self.rate.acquire();
        let result = self
            .client
            .delete(format!("{}/search/jobs/{}", self.config.api_url, job_id))
            .basic_auth(&self.config.access_id, Some(&self.config.access_key))
            .send();
        if result.is_err() {
            log_status!("search", "failed to delete job {}", job_id);
        }
    }
}

fn extract_device_ids(records: &[HashMap<String, String>]) -> Result<Vec<String>> {
    let Some(first) = records.first() else {
        return Ok(Vec::new());
    };
    let fieldnames: Vec<&String> = first.keys().collect();
    let field = device::select_id_field(&fieldnames)
        .ok_or_else(|| Error::Targeting("search records carry no device-id field".into()))?
        .to_string();
    let raw: Vec<&str> = records
        .iter()
        .filter_map(|r| r.get(&field))
        .map(String::as_str)
        .collect();
    device::normalize_unique(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = BACKOFF_START;
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 32]);
    }

    #[test]
    fn absolute_window_validates_order() {
        assert!(TimeWindow::absolute(100.0, 50.0).is_err());
        let (from, to) = TimeWindow::absolute(100.0, 200.0).unwrap().to_millis();
        assert_eq!((from, to), (100_000, 200_000));
    }

    #[test]
    fn trailing_window_ends_now() {
        let (from, to) = TimeWindow::Trailing(60).to_millis();
        assert_eq!(to - from, 60_000);
    }

    #[test]
    fn config_defaults_apply() {
        let config: SearchConfig = serde_json::from_str(
            r#"{"access_id": "a", "access_key": "b", "api_url": "https://api"}"#,
        )
        .unwrap();
        assert_eq!(config.page_size, 10_000);
        assert_eq!(config.requests_per_minute, 120);
    }

    #[test]
    fn extract_ids_picks_recognized_field() {
        let records = vec![
            HashMap::from([
                ("_count".to_string(), "3".to_string()),
                ("device_id".to_string(), "AAAAAAAAAAA1".to_string()),
            ]),
            HashMap::from([
                ("_count".to_string(), "1".to_string()),
                ("device_id".to_string(), "aaaaaaaaaaa1".to_string()),
            ]),
        ];
        assert_eq!(extract_device_ids(&records).unwrap(), vec!["aaaaaaaaaaa1"]);
    }

    #[test]
    fn extract_ids_without_id_field_is_targeting_error() {
        let records = vec![HashMap::from([("count".to_string(), "3".to_string())])];
        let err = extract_device_ids(&records).unwrap_err();
        assert_eq!(err.code(), "TARGETING_ERROR");
    }
}
