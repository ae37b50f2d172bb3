//! REST client for the hosted record store.
//!
//! Speaks the PostgREST dialect: upserts are `POST` with
//! `Prefer: resolution=merge-duplicates` and an `on_conflict` target, reads
//! are filtered `GET`s asking for a single object.

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use std::time::Duration;
use workspace_sync_core::sync::SyncDataType;

use crate::config::SyncConfig;
use crate::error::{CloudSyncError, Result};
use crate::store::RecordStore;
use crate::types::{ApiErrorResponse, PreferencesRow, SyncRecordRow, DATA_TYPE_COLUMN, OWNER_COLUMN};

const MAX_LOG_BODY_CHARS: usize = 512;
const SINGLE_OBJECT_ACCEPT: &str = "application/vnd.pgrst.object+json";
const UPSERT_PREFER: &str = "resolution=merge-duplicates,return=minimal";
/// Error code for "single object requested, zero rows returned".
const NO_ROWS_CODE: &str = "PGRST116";

/// Record store client for the hosted backend.
#[derive(Debug, Clone)]
pub struct RestRecordStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    bearer_token: String,
    records_table: String,
    preferences_table: String,
}

impl RestRecordStore {
    fn log_response(status: StatusCode, body: &str) {
        if status.is_success() {
            debug!("[CloudSync] API response status: {}", status);
            return;
        }

        let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
        if body.chars().count() > MAX_LOG_BODY_CHARS {
            preview.push_str("...");
        }
        debug!("[CloudSync] API response error ({}): {}", status, preview);
    }

    /// Create a client from `config`. Fails with `NotConfigured` when the
    /// backend URL or key is missing.
    pub fn new(config: &SyncConfig) -> Result<Self> {
        let (Some(base_url), Some(api_key)) = (&config.backend_url, &config.api_key) else {
            return Err(CloudSyncError::not_configured(
                config.missing_reason().unwrap_or("backend not configured"),
            ));
        };
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout.max(Duration::from_millis(1)))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.clone(),
            bearer_token: config.bearer_token().unwrap_or(api_key).to_string(),
            records_table: config.records_table.clone(),
            preferences_table: config.preferences_table.clone(),
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Create headers for an API request.
    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let key_value = HeaderValue::from_str(&self.api_key)
            .map_err(|_| CloudSyncError::auth("Invalid API key format"))?;
        headers.insert("apikey", key_value);

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.bearer_token))
            .map_err(|_| CloudSyncError::auth("Invalid access token format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        Ok(headers)
    }

    fn api_error(status: StatusCode, body: &str) -> CloudSyncError {
        if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(body) {
            return CloudSyncError::api(
                status.as_u16(),
                format!("{}: {}", error.code, error.message),
            );
        }
        CloudSyncError::api(status.as_u16(), format!("Request failed: {}", body))
    }

    /// Checks a write response; the body is ignored on success.
    async fn expect_success(response: reqwest::Response) -> Result<()> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);
        if !status.is_success() {
            return Err(Self::api_error(status, &body));
        }
        Ok(())
    }

    /// Parses a single-object response, mapping "no rows" to `None`.
    async fn parse_single<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Option<T>> {
        let status = response.status();
        let body = response.text().await?;
        Self::log_response(status, &body);

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status == StatusCode::NOT_ACCEPTABLE {
            if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
                if error.code == NO_ROWS_CODE {
                    return Ok(None);
                }
            }
        }
        if !status.is_success() {
            return Err(Self::api_error(status, &body));
        }

        serde_json::from_str(&body).map(Some).map_err(|e| {
            log::error!("[CloudSync] Failed to deserialize response. Body: {}, Error: {}", body, e);
            CloudSyncError::malformed(format!("Failed to parse response: {}", e))
        })
    }

    async fn upsert<T: serde::Serialize + ?Sized>(
        &self,
        table: &str,
        on_conflict: &str,
        row: &T,
    ) -> Result<()> {
        let url = self.table_url(table);
        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .header("Prefer", UPSERT_PREFER)
            .query(&[("on_conflict", on_conflict)])
            .json(row)
            .send()
            .await?;

        Self::expect_success(response).await
    }
}

#[async_trait]
impl RecordStore for RestRecordStore {
    /// POST /rest/v1/{records}?on_conflict=user_id,data_type
    async fn upsert_record(&self, row: &SyncRecordRow) -> Result<()> {
        debug!(
            "[CloudSync] Upserting {} for {}",
            row.data_type, row.user_id
        );
        let on_conflict = format!("{},{}", OWNER_COLUMN, DATA_TYPE_COLUMN);
        self.upsert(&self.records_table, &on_conflict, row).await
    }

    /// GET /rest/v1/{records}?user_id=eq.{owner}&data_type=eq.{type}
    async fn fetch_record(
        &self,
        owner_id: &str,
        data_type: SyncDataType,
    ) -> Result<Option<SyncRecordRow>> {
        let url = self.table_url(&self.records_table);
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .header(ACCEPT, SINGLE_OBJECT_ACCEPT)
            .query(&[
                ("select", "*".to_string()),
                (OWNER_COLUMN, format!("eq.{}", owner_id)),
                (DATA_TYPE_COLUMN, format!("eq.{}", data_type.as_str())),
            ])
            .send()
            .await?;

        Self::parse_single(response).await
    }

    /// POST /rest/v1/{preferences}?on_conflict=user_id
    async fn upsert_preferences(&self, row: &PreferencesRow) -> Result<()> {
        self.upsert(&self.preferences_table, OWNER_COLUMN, row).await
    }

    /// GET /rest/v1/{preferences}?user_id=eq.{owner}
    async fn fetch_preferences(&self, owner_id: &str) -> Result<Option<PreferencesRow>> {
        let url = self.table_url(&self.preferences_table);
        let response = self
            .client
            .get(&url)
            .headers(self.headers()?)
            .header(ACCEPT, SINGLE_OBJECT_ACCEPT)
            .query(&[
                ("select", "*".to_string()),
                (OWNER_COLUMN, format!("eq.{}", owner_id)),
            ])
            .send()
            .await?;

        Self::parse_single(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::Mutex;

    #[derive(Debug, Clone)]
    struct CapturedRequest {
        method: String,
        target: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    impl CapturedRequest {
        fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        }
    }

    fn header_end_offset(buffer: &[u8]) -> Option<usize> {
        buffer.windows(4).position(|window| window == b"\r\n\r\n")
    }

    async fn read_http_request(stream: &mut TcpStream) -> Option<CapturedRequest> {
        let mut buffer = Vec::new();
        let mut chunk = [0_u8; 4096];
        let header_end = loop {
            if let Some(offset) = header_end_offset(&buffer) {
                break offset;
            }
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                return None;
            }
            buffer.extend_from_slice(&chunk[..read]);
        };

        let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
        let mut lines = head.split("\r\n");
        let mut request_line = lines.next()?.split_whitespace();
        let method = request_line.next()?.to_string();
        let target = request_line.next()?.to_string();
        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
            .collect::<Vec<_>>();
        let content_length = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.parse::<usize>().ok())
            .unwrap_or(0);

        let body_start = header_end + 4;
        while buffer.len() < body_start + content_length {
            let read = stream.read(&mut chunk).await.ok()?;
            if read == 0 {
                break;
            }
            buffer.extend_from_slice(&chunk[..read]);
        }
        let body_end = (body_start + content_length).min(buffer.len());
        let body = String::from_utf8_lossy(&buffer[body_start..body_end]).to_string();

        Some(CapturedRequest {
            method,
            target,
            headers,
            body,
        })
    }

    async fn write_http_response(stream: &mut TcpStream, status: u16, body: &str) {
        let response = format!(
            "HTTP/1.1 {} Mock\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }

    async fn start_mock_server(
        responses: Vec<(u16, String)>,
    ) -> (String, Arc<Mutex<Vec<CapturedRequest>>>, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let captured = Arc::new(Mutex::new(Vec::new()));
        let captured_for_server = Arc::clone(&captured);

        let handle = tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                if let Some(request) = read_http_request(&mut stream).await {
                    captured_for_server.lock().await.push(request);
                }
                write_http_response(&mut stream, status, &body).await;
            }
        });

        (format!("http://{}", addr), captured, handle)
    }

    fn store_for(base_url: &str) -> RestRecordStore {
        RestRecordStore::new(&SyncConfig::new(base_url, "anon-key")).expect("configured store")
    }

    #[test]
    fn new_requires_configuration() {
        let err = RestRecordStore::new(&SyncConfig::default()).expect_err("unconfigured");
        assert!(err.is_not_configured());
    }

    #[tokio::test]
    async fn upsert_record_posts_with_conflict_target() {
        let (base_url, captured, server) = start_mock_server(vec![(201, String::new())]).await;
        let store = store_for(&base_url);

        let row = SyncRecordRow {
            user_id: "owner-1".into(),
            data_type: "tabs".into(),
            data: json!([{ "id": "t1" }]),
            device_id: Some("device-a".into()),
            updated_at: Some("2026-01-01T00:00:00Z".into()),
        };
        store.upsert_record(&row).await.expect("upsert");

        let requests = captured.lock().await.clone();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, "POST");
        assert!(request.target.starts_with("/rest/v1/workspace_sync?"));
        assert!(request.target.contains("on_conflict=user_id%2Cdata_type"));
        assert_eq!(
            request.header("prefer"),
            Some("resolution=merge-duplicates,return=minimal")
        );
        assert_eq!(request.header("apikey"), Some("anon-key"));
        assert_eq!(request.header("authorization"), Some("Bearer anon-key"));
        let sent: SyncRecordRow = serde_json::from_str(&request.body).expect("body");
        assert_eq!(sent, row);

        server.abort();
    }

    #[tokio::test]
    async fn fetch_record_maps_no_rows_to_none() {
        let (base_url, captured, server) = start_mock_server(vec![(
            406,
            json!({ "code": "PGRST116", "message": "JSON object requested, multiple (or no) rows returned" })
                .to_string(),
        )])
        .await;
        let store = store_for(&base_url);

        let row = store
            .fetch_record("owner-1", SyncDataType::ExpandedItems)
            .await
            .expect("fetch");
        assert!(row.is_none());

        let requests = captured.lock().await.clone();
        assert_eq!(requests[0].method, "GET");
        assert!(requests[0].target.contains("user_id=eq.owner-1"));
        assert!(requests[0].target.contains("data_type=eq.expanded_items"));
        assert_eq!(requests[0].header("accept"), Some(SINGLE_OBJECT_ACCEPT));

        server.abort();
    }

    #[tokio::test]
    async fn fetch_record_returns_row() {
        let body = json!({
            "user_id": "owner-1",
            "data_type": "tabs",
            "data": [{ "id": "t1", "title": "Board" }],
            "device_id": "device-b",
            "updated_at": "2026-01-01T00:00:00Z"
        })
        .to_string();
        let (base_url, _captured, server) = start_mock_server(vec![(200, body)]).await;
        let store = store_for(&base_url);

        let row = store
            .fetch_record("owner-1", SyncDataType::Tabs)
            .await
            .expect("fetch")
            .expect("row present");
        assert_eq!(row.device_id.as_deref(), Some("device-b"));
        assert_eq!(row.data[0]["title"], "Board");

        server.abort();
    }

    #[tokio::test]
    async fn server_errors_surface_as_api_errors() {
        let (base_url, _captured, server) = start_mock_server(vec![(
            503,
            json!({ "code": "503", "message": "upstream unavailable" }).to_string(),
        )])
        .await;
        let store = store_for(&base_url);

        let err = store
            .fetch_preferences("owner-1")
            .await
            .expect_err("unavailable");
        assert_eq!(err.status_code(), Some(503));

        server.abort();
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_http_error() {
        let store = store_for("http://127.0.0.1:1");
        let err = store
            .upsert_preferences(&PreferencesRow {
                user_id: "owner-1".into(),
                ..PreferencesRow::default()
            })
            .await
            .expect_err("connection refused");
        assert!(matches!(err, CloudSyncError::Http(_)));
    }
}
