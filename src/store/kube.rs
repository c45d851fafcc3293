//! Kubernetes-backed secret store.
//!
//! Talks to the core/v1 Secrets REST API directly. Optimistic concurrency
//! maps onto `metadata.resourceVersion`: an update carrying a stale version
//! is answered with `409 Conflict` by the API server.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use futures::{Stream, StreamExt};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::{
    Secret, SecretPatch, SecretStore, StoreError, StoreResult, WatchEvent, WatchEventKind,
    WatchStream,
};
use crate::Result;
use crate::config::ClusterEndpoint;

/// Secret store backed by a Kubernetes API server.
pub struct KubeSecretStore {
    client: reqwest::Client,
    endpoint: ClusterEndpoint,
    timeout: Duration,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SecretObject {
    #[serde(default = "default_api_version")]
    api_version: String,
    #[serde(default = "default_kind")]
    kind: String,
    metadata: ObjectMeta,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SecretList {
    #[serde(default)]
    items: Vec<SecretObject>,
}

#[derive(Debug, Deserialize)]
struct WatchLine {
    #[serde(rename = "type")]
    kind: String,
    object: Value,
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_kind() -> String {
    "Secret".to_string()
}

impl SecretObject {
    fn from_secret(secret: &Secret) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: secret.name.clone(),
                namespace: Some(secret.namespace.clone()),
                resource_version: secret.resource_version.clone(),
            },
            data: secret
                .data
                .iter()
                .map(|(k, v)| (k.clone(), STANDARD.encode(v)))
                .collect(),
        }
    }

    fn into_secret(self, fallback_namespace: &str) -> StoreResult<Secret> {
        let mut data = BTreeMap::new();
        for (key, value) in self.data {
            let bytes = STANDARD
                .decode(value.as_bytes())
                .map_err(|e| StoreError::Serialization(format!("data[{key}]: {e}")))?;
            data.insert(key, bytes);
        }
        Ok(Secret {
            namespace: self
                .metadata
                .namespace
                .unwrap_or_else(|| fallback_namespace.to_string()),
            name: self.metadata.name,
            data,
            resource_version: self.metadata.resource_version,
        })
    }
}

impl KubeSecretStore {
    /// Create a store for the given API server.
    ///
    /// `timeout` bounds every non-watch request.
    pub fn new(endpoint: &ClusterEndpoint, timeout: Duration) -> Result<Self> {
        let endpoint = endpoint.clone().or_in_cluster();
        let client = endpoint.http_client(None)?;
        Ok(Self {
            client,
            endpoint,
            timeout,
        })
    }

    fn collection_url(&self, namespace: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{namespace}/secrets",
            self.endpoint.api_server.trim_end_matches('/')
        )
    }

    fn item_url(&self, namespace: &str, name: &str) -> String {
        format!("{}/{name}", self.collection_url(namespace))
    }

    async fn authorize(&self, builder: RequestBuilder) -> StoreResult<RequestBuilder> {
        let token = self
            .endpoint
            .resolve_token()
            .await
            .map_err(|e| StoreError::Internal(format!("service account token: {e}")))?;
        Ok(match token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        })
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        namespace: &str,
        name: &str,
        creating: bool,
    ) -> StoreResult<Response> {
        let response = self
            .authorize(builder.timeout(self.timeout))
            .await?
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        Err(match status {
            StatusCode::NOT_FOUND => StoreError::not_found(namespace, name),
            StatusCode::CONFLICT if creating => StoreError::already_exists(namespace, name),
            StatusCode::CONFLICT => StoreError::conflict(namespace, name),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                StoreError::Timeout(format!("API server returned {status}"))
            }
            s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
                StoreError::Connection(format!("API server returned {s}"))
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                StoreError::Internal(format!("API server returned {s}: {body}"))
            }
        })
    }

    async fn read_secret(response: Response, namespace: &str) -> StoreResult<Secret> {
        let object: SecretObject = response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        object.into_secret(namespace)
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(e.to_string())
    } else {
        StoreError::Connection(e.to_string())
    }
}

fn patch_body(patch: &SecretPatch) -> Value {
    let data: Map<String, Value> = patch
        .entries
        .iter()
        .map(|(k, v)| {
            let value = v
                .as_ref()
                .map_or(Value::Null, |bytes| Value::String(STANDARD.encode(bytes)));
            (k.clone(), value)
        })
        .collect();
    json!({ "data": data })
}

fn parse_watch_line(line: &[u8], namespace: &str) -> StoreResult<Option<WatchEvent>> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let parsed: WatchLine =
        serde_json::from_slice(trimmed).map_err(|e| StoreError::Serialization(e.to_string()))?;

    let kind = match parsed.kind.as_str() {
        "ADDED" => WatchEventKind::Added,
        "MODIFIED" => WatchEventKind::Modified,
        "DELETED" => WatchEventKind::Deleted,
        "BOOKMARK" => return Ok(None),
        "ERROR" => {
            let message = parsed
                .object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("watch error");
            return Err(StoreError::Internal(message.to_string()));
        }
        other => {
            return Err(StoreError::Serialization(format!(
                "unknown watch event type {other}"
            )));
        }
    };

    let object: SecretObject = serde_json::from_value(parsed.object)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(Some(WatchEvent {
        kind,
        secret: object.into_secret(namespace)?,
    }))
}

fn watch_events(
    response: Response,
    namespace: String,
) -> impl Stream<Item = StoreResult<WatchEvent>> + Send + 'static {
    let mut chunks = response.bytes_stream();

    async_stream::try_stream! {
        let mut buffer: Vec<u8> = Vec::new();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(transport_error)?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(event) = parse_watch_line(&line, &namespace)? {
                    yield event;
                }
            }
        }
        debug!(namespace = %namespace, "Secret watch stream closed by API server");
    }
}

#[async_trait::async_trait]
impl SecretStore for KubeSecretStore {
    async fn create(&self, secret: Secret) -> StoreResult<Secret> {
        let mut object = SecretObject::from_secret(&secret);
        object.metadata.resource_version = None;
        let builder = self
            .client
            .post(self.collection_url(&secret.namespace))
            .json(&object);
        let response = self
            .send(builder, &secret.namespace, &secret.name, true)
            .await?;
        Self::read_secret(response, &secret.namespace).await
    }

    async fn get(&self, namespace: &str, name: &str) -> StoreResult<Secret> {
        let builder = self.client.get(self.item_url(namespace, name));
        let response = self.send(builder, namespace, name, false).await?;
        Self::read_secret(response, namespace).await
    }

    async fn update(&self, secret: Secret) -> StoreResult<Secret> {
        let object = SecretObject::from_secret(&secret);
        let builder = self
            .client
            .put(self.item_url(&secret.namespace, &secret.name))
            .json(&object);
        let response = self
            .send(builder, &secret.namespace, &secret.name, false)
            .await?;
        Self::read_secret(response, &secret.namespace).await
    }

    async fn list(&self, namespace: &str) -> StoreResult<Vec<Secret>> {
        let builder = self.client.get(self.collection_url(namespace));
        let response = self.send(builder, namespace, "", false).await?;
        let list: SecretList = response
            .json()
            .await
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        list.items
            .into_iter()
            .map(|object| object.into_secret(namespace))
            .collect()
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let builder = self.client.delete(self.item_url(namespace, name));
        self.send(builder, namespace, name, false).await?;
        Ok(())
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &SecretPatch) -> StoreResult<Secret> {
        let body = serde_json::to_vec(&patch_body(patch))
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let builder = self
            .client
            .patch(self.item_url(namespace, name))
            .header("Content-Type", "application/merge-patch+json")
            .body(body);
        let response = self.send(builder, namespace, name, false).await?;
        Self::read_secret(response, namespace).await
    }

    async fn watch(&self, namespace: &str) -> StoreResult<WatchStream> {
        let builder = self
            .client
            .get(self.collection_url(namespace))
            .query(&[("watch", "true")]);
        // Watches are long-lived; only the connect phase is bounded.
        let response = self
            .authorize(builder)
            .await?
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(StoreError::Connection(format!(
                "watch returned {}",
                response.status()
            )));
        }
        Ok(Box::pin(watch_events(response, namespace.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_object_round_trips_data_as_base64() {
        // GIVEN: a secret with binary data
        let secret = Secret {
            namespace: "auth".to_string(),
            name: "session-keyring".to_string(),
            data: BTreeMap::from([("keys".to_string(), vec![0u8, 159, 146, 150])]),
            resource_version: Some("42".to_string()),
        };

        // WHEN: it is encoded to the API shape and read back
        let object = SecretObject::from_secret(&secret);
        let json = serde_json::to_value(&object).unwrap();
        let parsed: SecretObject = serde_json::from_value(json.clone()).unwrap();

        // THEN: the wire form uses camelCase metadata and base64 data
        assert_eq!(json["metadata"]["resourceVersion"], "42");
        assert_eq!(json["data"]["keys"], STANDARD.encode([0u8, 159, 146, 150]));
        assert_eq!(parsed.into_secret("auth").unwrap(), secret);
    }

    #[test]
    fn patch_body_uses_null_for_removals() {
        let patch = SecretPatch::new().set("a", b"x".to_vec()).remove("b");
        let body = patch_body(&patch);

        assert_eq!(body["data"]["a"], STANDARD.encode(b"x"));
        assert!(body["data"]["b"].is_null());
    }

    #[test]
    fn watch_line_parsing() {
        let line = br#"{"type":"MODIFIED","object":{"metadata":{"name":"session-keyring","namespace":"auth","resourceVersion":"7"},"data":{}}}
"#;
        let event = parse_watch_line(line, "auth").unwrap().unwrap();
        assert_eq!(event.kind, WatchEventKind::Modified);
        assert_eq!(event.secret.name, "session-keyring");
        assert_eq!(event.secret.resource_version.as_deref(), Some("7"));

        let bookmark = br#"{"type":"BOOKMARK","object":{"metadata":{"name":""}}}"#;
        assert!(parse_watch_line(bookmark, "auth").unwrap().is_none());

        let gone = br#"{"type":"ERROR","object":{"message":"too old resource version"}}"#;
        assert!(matches!(
            parse_watch_line(gone, "auth"),
            Err(StoreError::Internal(_))
        ));

        assert!(parse_watch_line(b"   \n", "auth").unwrap().is_none());
    }
}
