//! Control-plane client
//!
//! Two exchanges share one HTTP client: `talk` (`POST <api_url>/<api_key>/agent/`) sends the root
//! entity and returns configuration, `push` (`POST <api_url>/<api_key>/update/`) delivers the
//! flushed entity channels.
//!
//! A 503 answer carries the backpressure delay in `Retry-After`; the caller must stay silent
//! until it elapses.

use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::config::CloudConfig;
use crate::identity::{self, Definition, IdentityHash};

/// Backpressure delay when a 503 names none
pub const DEFAULT_BACKPRESSURE: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub enum CloudError {
    /// 503, talk again after `delay`
    Backpressure { delay: Duration },
    Http { status: u16 },
    Transport(String),
    Decode(String),
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloudError::Backpressure { delay } => {
                write!(f, "control plane asked to back off for {}s", delay.as_secs())
            }
            CloudError::Http { status } => write!(f, "control plane answered {status}"),
            CloudError::Transport(e) => write!(f, "cannot reach control plane: {e}"),
            CloudError::Decode(e) => write!(f, "unexpected control plane answer: {e}"),
        }
    }
}

impl std::error::Error for CloudError {}

/// Per-object settings pushed by the control plane
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ObjectEntry {
    /// Definition the object is known by
    #[serde(default)]
    pub object: Value,
    #[serde(default)]
    pub config: Value,
}

impl ObjectEntry {
    /// Definition hash of the object; root entities are sent without a definition
    pub fn definition_hash(&self) -> IdentityHash {
        match serde_json::from_value::<Definition>(self.object.clone()) {
            Ok(definition) if !definition.is_empty() && definition.get("local_id").is_some() => {
                identity::hash(Some(&definition))
            }
            _ => IdentityHash::empty(),
        }
    }

    /// Entity kind as named by the definition `type`
    pub fn kind(&self) -> Option<&str> {
        self.object.get("type").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Versions {
    pub current: Option<String>,
    pub old: Option<String>,
    pub obsolete: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CloudResponse {
    #[serde(default)]
    pub config: Value,
    #[serde(default)]
    pub objects: Vec<ObjectEntry>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub versions: Versions,
}

/// Dotted version comparison, missing parts count as zero
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parts = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|part| {
                part.chars()
                    .take_while(char::is_ascii_digit)
                    .collect::<String>()
                    .parse()
                    .unwrap_or(0)
            })
            .collect()
    };

    let (a, b) = (parts(a), parts(b));
    let len = a.len().max(b.len());
    (0..len)
        .map(|i| {
            a.get(i)
                .copied()
                .unwrap_or(0)
                .cmp(&b.get(i).copied().unwrap_or(0))
        })
        .find(|ord| ord.is_ne())
        .unwrap_or(Ordering::Equal)
}

#[derive(Debug, Clone)]
pub struct CloudClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    timeout: Duration,
}

impl CloudClient {
    pub fn new(client: reqwest::Client, config: &CloudConfig) -> Self {
        Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            timeout: Duration::from_secs(config.api_timeout),
        }
    }

    fn url(&self, location: &str) -> String {
        format!("{}/{}/{location}/", self.api_url, self.api_key)
    }

    async fn post(&self, location: &str, body: &Value) -> Result<reqwest::Response, CloudError> {
        let url = self.url(location);
        trace!("posting to {url}");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::SERVICE_UNAVAILABLE => {
                let delay = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .map_or(DEFAULT_BACKPRESSURE, Duration::from_secs);
                Err(CloudError::Backpressure { delay })
            }
            status if !status.is_success() => Err(CloudError::Http {
                status: status.as_u16(),
            }),
            _ => Ok(response),
        }
    }

    /// Send the root entity, receive configuration
    pub async fn talk(&self, root: &Value) -> Result<CloudResponse, CloudError> {
        let response = self.post("agent", root).await?;
        let body = response
            .text()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;

        let parsed: CloudResponse =
            serde_json::from_str(&body).map_err(|e| CloudError::Decode(e.to_string()))?;
        debug!(
            "control plane sent {} objects and {} messages",
            parsed.objects.len(),
            parsed.messages.len()
        );
        Ok(parsed)
    }

    /// Deliver one batch of flushed entity data
    pub async fn push(&self, batch: &Value) -> Result<(), CloudError> {
        self.post("update", batch).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("0.4.0", "0.4"), Ordering::Equal);
        assert_eq!(compare_versions("0.10.1", "0.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.0.0-rc1", "1.0.1"), Ordering::Less);
    }

    #[test]
    fn test_object_entry_hash() {
        let definition = Definition::new()
            .with("type", "nginx")
            .with("local_id", "abc")
            .with("root_uuid", "u");
        let entry = ObjectEntry {
            object: json!(definition),
            ..Default::default()
        };
        assert_eq!(entry.definition_hash(), identity::hash(Some(&definition)));
        assert_eq!(entry.kind(), Some("nginx"));

        let root = ObjectEntry {
            object: json!({"type": "system", "hostname": "web-1", "uuid": "u"}),
            ..Default::default()
        };
        assert!(root.definition_hash().is_empty());
    }

    #[test]
    fn test_response_defaults() {
        let response: CloudResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(response, CloudResponse::default());
    }
}
