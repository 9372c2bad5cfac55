//! Homeserver transport over the Matrix client-server HTTP API.

use crate::error::SendError;
use crate::transport::{MediaUpload, Transport};
use crate::types::{EventId, RoomId, TxnId};
use async_trait::async_trait;
use courier_config_and_utils::{Config, CoreError, CoreResult};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// HTTP transport configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Homeserver base URL.
    pub homeserver_url: Url,
    /// Bearer token sent with every request.
    pub access_token: String,
    /// Request timeout in seconds.
    pub timeout_secs: u64,
}

impl TransportConfig {
    /// Build the transport configuration from the client configuration.
    pub fn from_config(config: &Config) -> CoreResult<Self> {
        let access_token = config
            .access_token
            .clone()
            .ok_or_else(|| CoreError::Config("access token is not configured".to_string()))?;

        Ok(Self {
            homeserver_url: config.homeserver_url()?,
            access_token,
            timeout_secs: config.request_timeout_secs,
        })
    }
}

#[derive(Debug, Deserialize)]
struct EventIdResponse {
    event_id: String,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    content_uri: String,
}

/// Matrix error body (`{"errcode": ..., "error": ...}`).
#[derive(Debug, Deserialize)]
struct MatrixErrorBody {
    errcode: String,
    #[serde(default)]
    error: String,
}

/// [`Transport`] talking to a homeserver with `reqwest`.
pub struct HttpTransport {
    config: TransportConfig,
    client: Client,
}

impl HttpTransport {
    /// Create a new HTTP transport.
    pub fn new(config: TransportConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    /// Build an endpoint URL from unencoded path segments.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, SendError> {
        let mut url = self.config.homeserver_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                SendError::InvalidRequest(format!(
                    "homeserver URL cannot be a base: {}",
                    self.config.homeserver_url
                ))
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn put_json<T: DeserializeOwned>(&self, url: Url, body: &Value) -> Result<T, SendError> {
        debug!(url = %url, "PUT");
        let response = self
            .client
            .put(url)
            .bearer_auth(&self.config.access_token)
            .json(body)
            .send()
            .await
            .map_err(map_request_error)?;
        parse_response(response).await
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        txn_id: &TxnId,
        content: &Value,
    ) -> Result<EventId, SendError> {
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "rooms",
            room_id.as_str(),
            "send",
            event_type,
            txn_id.as_str(),
        ])?;
        let response: EventIdResponse = self.put_json(url, content).await?;
        Ok(EventId::from(response.event_id))
    }

    async fn redact_event(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        txn_id: &TxnId,
        content: &Value,
    ) -> Result<EventId, SendError> {
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "rooms",
            room_id.as_str(),
            "redact",
            event_id.as_str(),
            txn_id.as_str(),
        ])?;
        let response: EventIdResponse = self.put_json(url, content).await?;
        Ok(EventId::from(response.event_id))
    }

    async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &TxnId,
        messages: &Value,
    ) -> Result<(), SendError> {
        let url = self.endpoint(&[
            "_matrix",
            "client",
            "v3",
            "sendToDevice",
            event_type,
            txn_id.as_str(),
        ])?;
        let _: Value = self.put_json(url, &json!({ "messages": messages })).await?;
        Ok(())
    }

    async fn upload_media(&self, upload: &MediaUpload) -> Result<String, SendError> {
        let mut url = self.endpoint(&["_matrix", "media", "v3", "upload"])?;
        if let Some(filename) = &upload.filename {
            url.query_pairs_mut().append_pair("filename", filename);
        }

        debug!(url = %url, bytes = upload.data.len(), "POST media");
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.access_token)
            .header(reqwest::header::CONTENT_TYPE, &upload.content_type)
            .body(upload.data.clone())
            .send()
            .await
            .map_err(map_request_error)?;

        let response: UploadResponse = parse_response(response).await?;
        Ok(response.content_uri)
    }
}

fn map_request_error(e: reqwest::Error) -> SendError {
    if e.is_builder() {
        SendError::InvalidRequest(e.to_string())
    } else if e.is_decode() {
        SendError::InvalidResponse(e.to_string())
    } else {
        SendError::Connection(e.to_string())
    }
}

async fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T, SendError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| SendError::InvalidResponse(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let (errcode, message) = match serde_json::from_str::<MatrixErrorBody>(&body) {
        Ok(parsed) => (parsed.errcode, parsed.error),
        Err(_) => ("M_UNKNOWN".to_string(), body),
    };

    warn!(status = status.as_u16(), errcode = %errcode, "Homeserver rejected request");
    Err(SendError::Rejected {
        status: status.as_u16(),
        errcode,
        message: non_empty_message(status, message),
    })
}

fn non_empty_message(status: StatusCode, message: String) -> String {
    if message.is_empty() {
        status.canonical_reason().unwrap_or("unknown").to_string()
    } else {
        message
    }
}
