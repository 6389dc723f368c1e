use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::command::CommandGroup;
use crate::core::error::{Error, Result};
use crate::core::interface::{ExecutionResult, Interface, InterfaceFactory};
use crate::core::progress::Progress;
use crate::core::ratelimit::RateLimit;
use crate::log_status;

pub const RPC_CREDS_FILENAME: &str = ".rpc_creds.json";

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// One entry of the `.rpc_creds.json` credentials file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq, Hash)]
pub struct RpcCredentials {
    pub env: String,
    pub url: String,
    pub login: String,
    pub password: String,
}

/// Locate and parse the credentials file, then pick the entry for `env`.
/// Search order: explicit path, current directory, home directory.
pub fn load_credentials(path: Option<&Path>, env: &str) -> Result<RpcCredentials> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => find_creds_file()?,
    };
    let body = fs::read_to_string(&path)?;
    let entries: Vec<RpcCredentials> = serde_json::from_str(&body)?;
    entries
        .into_iter()
        .find(|c| c.env == env)
        .ok_or_else(|| {
            Error::Config(format!(
                "no credentials for env `{}` in {}",
                env,
                path.display()
            ))
        })
}

fn find_creds_file() -> Result<PathBuf> {
    let local = PathBuf::from(RPC_CREDS_FILENAME);
    if local.is_file() {
        return Ok(local);
    }
    let home = PathBuf::from(shellexpand::tilde(&format!("~/{RPC_CREDS_FILENAME}")).into_owned());
    if home.is_file() {
        return Ok(home);
    }
    Err(Error::Config(format!(
        "{RPC_CREDS_FILENAME} not found in current or home directory"
    )))
}

enum TokenState {
    InFlight,
    Ready(String),
}

/// Shared access-token cache with a single-producer protocol. The first
/// worker to claim an absent entry becomes the producer and must either
/// `publish` a token or `release` the claim; everyone else blocks on the
/// condvar until one of those happens.
pub struct TokenCache {
    inner: Mutex<HashMap<RpcCredentials, TokenState>>,
    cv: Condvar,
}

impl TokenCache {
    pub fn new() -> Self {
        TokenCache {
            inner: Mutex::new(HashMap::new()),
            cv: Condvar::new(),
        }
    }

    /// Returns the cached token, or None when the caller just became the
    /// producer for these credentials.
    pub fn claim(&self, creds: &RpcCredentials) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            match inner.get(creds) {
                None => {
                    inner.insert(creds.clone(), TokenState::InFlight);
                    return None;
                }
                Some(TokenState::Ready(token)) => return Some(token.clone()),
                Some(TokenState::InFlight) => {
                    inner = self.cv.wait(inner).unwrap();
                }
            }
        }
    }

    pub fn publish(&self, creds: &RpcCredentials, token: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(creds.clone(), TokenState::Ready(token));
        self.cv.notify_all();
    }

    /// Drops a claim after a failed authentication so another worker can
    /// try producing.
    pub fn release(&self, creds: &RpcCredentials) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(creds);
        self.cv.notify_all();
    }
}

impl Default for TokenCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Mask secret fields before a JSON payload reaches a log line.
pub fn redact(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, val) in map {
                if key == "password" || key == "access_token" {
                    out.insert(key.clone(), Value::String("***".into()));
                } else {
                    out.insert(key.clone(), redact(val));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact).collect()),
        other => other.clone(),
    }
}

pub struct RpcFactory {
    creds: RpcCredentials,
    cache: Arc<TokenCache>,
    rate: Arc<RateLimit>,
}

impl RpcFactory {
    pub fn new(creds: RpcCredentials, rate: Arc<RateLimit>) -> Self {
        RpcFactory {
            creds,
            cache: Arc::new(TokenCache::new()),
            rate,
        }
    }
}

impl InterfaceFactory for RpcFactory {
    fn create(&self, device_ids: Vec<String>, progress: Arc<Progress>) -> Box<dyn Interface> {
        Box::new(DirectRpcInterface {
            creds: self.creds.clone(),
            device_ids,
            client: reqwest::blocking::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .unwrap_or_default(),
            cache: Arc::clone(&self.cache),
            rate: Arc::clone(&self.rate),
            progress,
            token: None,
        })
    }
}

/// Talks to each device individually through the fleet RPC service.
/// Authentication happens once per credentials across all workers via
/// the shared token cache.
pub struct DirectRpcInterface {
    creds: RpcCredentials,
    device_ids: Vec<String>,
    client: reqwest::blocking::Client,
    cache: Arc<TokenCache>,
    rate: Arc<RateLimit>,
    progress: Arc<Progress>,
    token: Option<String>,
}

impl DirectRpcInterface {
    fn authenticate(&self) -> Result<String> {
        self.rate.acquire();
        let payload = json!({
            "login": self.creds.login,
            "password": self.creds.password,
        });
        log_status!(
            "rpc",
            "authenticating against {}: {}",
            self.creds.url,
            redact(&payload)
        );
        let response = self
            .client
            .put(format!("{}/rest/v1/authenticate?details=true", self.creds.url))
            .json(&payload)
            .send()?
            .error_for_status()?;
        let body: Value = response.json()?;
        body.get("access_token")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::FatalInterface("authenticate response has no access_token".into())
            })
    }

    fn call_device(&self, token: &str, device_id: &str, command: &str) -> ExecutionResult {
        self.rate.acquire();
        let payload = json!({
            "deviceId": device_id,
            "unixCommand": command,
        });
        let response = self
            .client
            .post(format!(
                "{}/rest/v1/deviceRPC?access_token={}",
                self.creds.url, token
            ))
            .json(&payload)
            .send();
        match response.and_then(|r| r.error_for_status()) {
            Ok(response) => {
                let body = response.text().unwrap_or_default();
                // The control API reports no exit code, only delivery.
                ExecutionResult {
                    device_id: device_id.to_string(),
                    return_code: None,
                    success: true,
                    stdout: Some(body),
                    stderr: None,
                }
            }
            Err(err) => ExecutionResult::unreachable(device_id, err.to_string()),
        }
    }
}

impl Interface for DirectRpcInterface {
    fn open(&mut self) -> Result<()> {
        if let Some(token) = self.cache.claim(&self.creds) {
            self.token = Some(token);
            return Ok(());
        }
        match self.authenticate() {
            Ok(token) => {
                self.cache.publish(&self.creds, token.clone());
                self.token = Some(token);
                Ok(())
            }
            Err(err) => {
                self.cache.release(&self.creds);
                Err(Error::FatalInterface(format!(
                    "authentication failed for env `{}`: {err}",
                    self.creds.env
                )))
            }
        }
    }

    fn execute(&mut self, groups: &[CommandGroup]) -> Result<Vec<ExecutionResult>> {
        let token = self
            .token
            .clone()
            .ok_or_else(|| Error::FatalInterface("interface is not open".into()))?;
        for group in groups {
            if matches!(group, CommandGroup::Upload { .. }) {
                return Err(Error::Config(
                    "file upload is not supported over direct RPC".into(),
                ));
            }
        }
        // One result per device per command group.
        let mut results = Vec::with_capacity(self.device_ids.len() * groups.len());
        for id in &self.device_ids {
            for group in groups {
                let CommandGroup::Exec(body) = group else {
                    continue;
                };
                results.push(self.call_device(&token, id, body));
            }
            self.progress.tick(1);
        }
        Ok(results)
    }

    fn close(&mut self) {
        self.token = None;
    }

    fn device_ids(&self) -> &[String] {
        &self.device_ids
    }
}
