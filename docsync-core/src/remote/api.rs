use crate::config::EndpointConfig;
use crate::error::{Result, SyncError};
use crate::hash::{self, hex_encode};
use crate::model::Document;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

/// Substrings (case-insensitive) that mark an update response as an
/// optimistic-concurrency collision rather than an ordinary validation
/// error. §4.1.
const TIMESTAMP_MISMATCH_SENTINELS: &[&str] = &[
    "timestamp mismatch",
    "document has been modified",
    "has been modified after you have opened it",
];

/// Maximum total attempts `update` makes against one document before a
/// surviving `TimestampMismatch` is returned to the caller.
const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// Result of a successful `update`: the destination's document as it now
/// stands, plus whether the client had to refetch and retry because of an
/// optimistic-concurrency collision. The executor folds `retried` into its
/// audit message ("retried after timestamp mismatch").
#[derive(Debug, Clone)]
pub struct UpdateOutcome {
    pub document: Document,
    pub retried: bool,
}

/// The generic document-CRUD contract both remotes expose, abstracted so
/// the sync executor can be exercised against an in-memory double without
/// a live HTTP endpoint. `RemoteClient` is the only production
/// implementation; see `MockRemoteClient` in `tests` modules elsewhere for
/// the double used in executor unit tests.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn get(&self, doctype: &str, name: &str) -> Result<Option<Document>>;
    async fn list(
        &self,
        doctype: &str,
        filters: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Document>>;
    async fn create(&self, doctype: &str, fields: Map<String, Value>) -> Result<Document>;
    async fn update(
        &self,
        doctype: &str,
        name: &str,
        fields: Map<String, Value>,
    ) -> Result<UpdateOutcome>;
    async fn delete(&self, doctype: &str, name: &str) -> Result<()>;
    async fn ping(&self) -> Result<String>;
}

/// A handle bound to one endpoint (cloud or local), carrying the API
/// key/secret pair on every request per §4.1. Stateless beyond the
/// `reqwest::Client` connection pool.
pub struct RemoteClient {
    base_url: String,
    api_key: String,
    api_secret: String,
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new(endpoint: &EndpointConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Configuration(format!("building HTTP client: {e}")))?;
        Ok(Self {
            base_url: endpoint.url.trim_end_matches('/').to_string(),
            api_key: endpoint.api_key.clone(),
            api_secret: endpoint.api_secret.clone(),
            http,
        })
    }

    fn auth_header(&self) -> String {
        format!("token {}:{}", self.api_key, self.api_secret)
    }

    fn resource_url(&self, doctype: &str, name: Option<&str>) -> String {
        match name {
            Some(n) => format!("{}/api/resource/{}/{}", self.base_url, doctype, n),
            None => format!("{}/api/resource/{}", self.base_url, doctype),
        }
    }

    /// Extracts the `{data: ...}` envelope on success, or classifies the
    /// error body into the crate's error taxonomy on failure.
    async fn parse_envelope(&self, resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if status.is_success() {
            let value: Value = serde_json::from_str(&body)?;
            Ok(value.get("data").cloned().unwrap_or(value))
        } else {
            Err(classify_error(status, &body))
        }
    }

    async fn get_document(&self, doctype: &str, name: &str) -> Result<Option<Document>> {
        let resp = self
            .http
            .get(self.resource_url(doctype, Some(name)))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let data = self.parse_envelope(resp).await?;
        Ok(Some(document_from_value(data)?))
    }
}

#[async_trait]
impl RemoteApi for RemoteClient {
    async fn get(&self, doctype: &str, name: &str) -> Result<Option<Document>> {
        self.get_document(doctype, name).await
    }

    async fn list(
        &self,
        doctype: &str,
        filters: Option<&str>,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Document>> {
        let mut req = self
            .http
            .get(self.resource_url(doctype, None))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .query(&[
                ("limit_page_length", limit.to_string()),
                ("limit_start", offset.to_string()),
                ("fields", "[\"*\"]".to_string()),
            ]);
        if let Some(f) = filters {
            req = req.query(&[("filters", f)]);
        }

        let resp = req.send().await?;
        let data = self.parse_envelope(resp).await?;
        let items = data.as_array().cloned().unwrap_or_default();
        items.into_iter().map(document_from_value).collect()
    }

    async fn create(&self, doctype: &str, fields: Map<String, Value>) -> Result<Document> {
        let resp = self
            .http
            .post(self.resource_url(doctype, None))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .json(&fields)
            .send()
            .await?;
        let data = self.parse_envelope(resp).await?;
        document_from_value(data)
    }

    async fn update(
        &self,
        doctype: &str,
        name: &str,
        mut fields: Map<String, Value>,
    ) -> Result<UpdateOutcome> {
        let mut attempt = 0;
        let mut retried = false;

        loop {
            attempt += 1;
            let resp = self
                .http
                .put(self.resource_url(doctype, Some(name)))
                .header(reqwest::header::AUTHORIZATION, self.auth_header())
                .json(&fields)
                .send()
                .await?;

            match self.parse_envelope(resp).await {
                Ok(data) => {
                    let document = document_from_value(data)?;
                    return Ok(UpdateOutcome { document, retried });
                }
                Err(SyncError::TimestampMismatch(msg)) if attempt < MAX_UPDATE_ATTEMPTS => {
                    let current = self.get_document(doctype, name).await?.ok_or_else(|| {
                        SyncError::NotFound(format!(
                            "{doctype}/{name} disappeared during timestamp-mismatch retry"
                        ))
                    })?;
                    if let Some(modified) = current.modified() {
                        fields.insert("modified".to_string(), Value::String(modified.to_string()));
                    }
                    tracing::warn!(
                        doctype,
                        name,
                        attempt,
                        "remote update collided on modified timestamp, retrying after refetch: {msg}"
                    );
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn delete(&self, doctype: &str, name: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.resource_url(doctype, Some(name)))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(classify_error(status, &body))
        }
    }

    async fn ping(&self) -> Result<String> {
        let resp = self
            .http
            .get(format!(
                "{}/api/method/frappe.auth.get_logged_user",
                self.base_url
            ))
            .header(reqwest::header::AUTHORIZATION, self.auth_header())
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(classify_error(status, &body));
        }
        let value: Value = serde_json::from_str(&body)?;
        value
            .get("message")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| SyncError::RemoteError("ping response missing 'message'".to_string()))
    }
}

fn document_from_value(value: Value) -> Result<Document> {
    let fields = value
        .as_object()
        .cloned()
        .ok_or_else(|| SyncError::Serialization("expected a JSON object document".to_string()))?;
    Ok(Document::new(fields))
}

/// Pulls a human-readable message out of either a `{"message": ...}` /
/// `{"exc": "..."}`-shaped error body or, failing that, the raw body text,
/// so `is_timestamp_mismatch` has something to substring-match against.
fn extract_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        for key in ["message", "exc", "_server_messages", "error"] {
            if let Some(s) = value.get(key).and_then(Value::as_str) {
                return s.to_string();
            }
        }
    }
    body.to_string()
}

fn is_timestamp_mismatch(message: &str) -> bool {
    let lower = message.to_lowercase();
    TIMESTAMP_MISMATCH_SENTINELS
        .iter()
        .any(|sentinel| lower.contains(sentinel))
}

fn classify_error(status: reqwest::StatusCode, body: &str) -> SyncError {
    let message = extract_message(body);
    if is_timestamp_mismatch(&message) {
        return SyncError::TimestampMismatch(message);
    }
    match status {
        reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
            SyncError::Unauthorized(message)
        }
        reqwest::StatusCode::NOT_FOUND => SyncError::NotFound(message),
        s if s.is_client_error() => SyncError::Validation(message),
        s if s.is_server_error() => SyncError::RemoteError(message),
        s => SyncError::RemoteError(format!("unexpected status {s}: {message}")),
    }
}

/// Computes the canonical content hash for `doc`, delegating to
/// `hash::hash_document` so the client and the executor always agree on
/// the same digest. Exposed on the trait boundary per §4.1's
/// `hash(document, excluded_fields)` contract, even though both endpoints
/// use the identical hashing logic rather than endpoint-specific code.
pub fn hash(doc: &Document, excluded: &[String]) -> String {
    hash::hash_document(doc, excluded)
}

/// HMAC-SHA256 signature over a webhook body, used both to compute the
/// signature an emitter should send and, by the webhook intake, to verify
/// one. Exposed here since it leans on the same hex-encoding helper as the
/// content hash.
pub fn hmac_sha256_hex(secret: &[u8], body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    type HmacSha256 = Hmac<Sha256>;

    let mut mac =
        HmacSha256::new_from_slice(secret).expect("HMAC-SHA256 accepts keys of any length");
    mac.update(body);
    hex_encode(&mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_mismatch_sentinels_are_case_insensitive() {
        assert!(is_timestamp_mismatch("Timestamp Mismatch."));
        assert!(is_timestamp_mismatch(
            "This document has been modified after you have opened it"
        ));
        assert!(!is_timestamp_mismatch("missing mandatory field"));
    }

    #[test]
    fn classify_error_detects_mismatch_before_status_code_rules() {
        let err = classify_error(
            reqwest::StatusCode::CONFLICT,
            r#"{"message": "Document has been modified after you have opened it"}"#,
        );
        assert!(matches!(err, SyncError::TimestampMismatch(_)));
    }

    #[test]
    fn classify_error_maps_4xx_without_sentinel_to_validation() {
        let err = classify_error(
            reqwest::StatusCode::BAD_REQUEST,
            r#"{"message": "customer_name is mandatory"}"#,
        );
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn classify_error_maps_401_to_unauthorized() {
        let err = classify_error(reqwest::StatusCode::UNAUTHORIZED, r#"{"message": "bad key"}"#);
        assert!(matches!(err, SyncError::Unauthorized(_)));
    }

    #[test]
    fn extract_message_falls_back_to_raw_body() {
        assert_eq!(extract_message("plain text error"), "plain text error");
    }

    #[test]
    fn hmac_signature_is_stable_and_hex() {
        let sig = hmac_sha256_hex(b"secret", b"{\"a\":1}");
        assert_eq!(sig.len(), 64);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(sig, hmac_sha256_hex(b"secret", b"{\"a\":1}"));
    }

    #[test]
    fn hmac_signature_changes_with_the_secret() {
        let a = hmac_sha256_hex(b"secret-a", b"body");
        let b = hmac_sha256_hex(b"secret-b", b"body");
        assert_ne!(a, b);
    }
}
