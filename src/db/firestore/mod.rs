//! Firestore backend over the REST v1 API.
//!
//! Works against production Firestore with an OAuth2 bearer token, or against
//! the local emulator. The REST surface has no push channel, so listeners poll
//! the collection and publish a snapshot whenever a document was added,
//! removed or rewritten.

mod value;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use super::client::{
    ClientError, Document, DocumentClient, Fields, ListenEvent, ListenerRegistration,
};
use crate::config::{ConfigError, FirestoreConfig};

use value::{decode_fields, encode_fields};

/// Page size for collection reads.
const PAGE_SIZE: &str = "300";
/// Default listener poll interval.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Default bound on a single listener poll.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestDocument {
    name: String,
    #[serde(default)]
    fields: Map<String, Value>,
    update_time: Option<DateTime<Utc>>,
}

impl RestDocument {
    fn into_document(self) -> Document {
        Document {
            key: key_from_name(&self.name).to_string(),
            fields: decode_fields(&self.fields),
            update_time: self.update_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    documents: Vec<RestDocument>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Last path segment of a resource name:
/// `projects/p/databases/(default)/documents/package/<key>` -> `<key>`.
fn key_from_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Builds a `Status` error from a non-success response body.
fn status_error(status: StatusCode, body: &str) -> ClientError {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.trim().to_string());
    ClientError::Status {
        code: status.as_u16(),
        message,
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

fn http_error(e: reqwest::Error) -> ClientError {
    ClientError::Http(e.to_string())
}

fn decode_error(e: reqwest::Error) -> ClientError {
    ClientError::Decode(e.to_string())
}

/// Firestore REST client.
#[derive(Clone)]
pub struct FirestoreClient {
    http: reqwest::Client,
    base_url: String,
    project_id: String,
    database: String,
    access_token: Option<String>,
    poll_interval: Duration,
    request_timeout: Duration,
}

impl FirestoreClient {
    pub fn new(
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            database: database.into(),
            access_token: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Builds a client from the `firestore` section of the config.
    pub fn from_config(
        config: &FirestoreConfig,
        poll_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let project_id = config
            .project_id
            .as_ref()
            .ok_or(ConfigError::NotConfigured("firestore.project_id"))?;

        let mut client = Self::new(config.base_url(), project_id, config.database())
            .with_poll_interval(poll_interval);
        if let Some(token) = &config.access_token {
            client = client.with_access_token(token);
        }
        Ok(client)
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Upper bound for each poll a listener makes.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Uses a preconfigured HTTP client (proxies, TLS roots).
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/v1/projects/{}/databases/{}/documents",
            self.base_url, self.project_id, self.database
        )
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{}", self.documents_url(), urlencoding::encode(collection))
    }

    fn document_url(&self, collection: &str, key: &str) -> String {
        format!(
            "{}/{}",
            self.collection_url(collection),
            urlencoding::encode(key)
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Polls a collection until the registration is dropped or a read fails
    /// or times out.
    async fn poll_collection(self, collection: String, tx: watch::Sender<ListenEvent>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_seen: Option<Vec<(String, Option<DateTime<Utc>>)>> = None;

        loop {
            ticker.tick().await;
            if tx.is_closed() {
                break;
            }

            let polled =
                tokio::time::timeout(self.request_timeout, self.get_collection(&collection))
                    .await
                    .unwrap_or(Err(ClientError::Timeout(self.request_timeout)));

            match polled {
                Ok(docs) => {
                    let seen: Vec<_> = docs
                        .iter()
                        .map(|d| (d.key.clone(), d.update_time))
                        .collect();
                    if last_seen.as_ref() != Some(&seen) {
                        tracing::debug!(
                            "Collection {} changed, publishing {} document(s)",
                            collection,
                            docs.len()
                        );
                        last_seen = Some(seen);
                        tx.send_replace(ListenEvent::Snapshot(Arc::new(docs)));
                    }
                }
                Err(e) => {
                    tracing::warn!("Listener on {} stopped: {}", collection, e);
                    tx.send_replace(ListenEvent::Failed(e));
                    break;
                }
            }
        }
    }
}

impl std::fmt::Debug for FirestoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirestoreClient")
            .field("base_url", &self.base_url)
            .field("project_id", &self.project_id)
            .field("database", &self.database)
            .field("poll_interval", &self.poll_interval)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl DocumentClient for FirestoreClient {
    fn listen(&self, collection: &str) -> Result<ListenerRegistration, ClientError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ClientError::Unavailable(e.to_string()))?;

        let (tx, rx) = watch::channel(ListenEvent::Pending);
        let task = runtime.spawn(self.clone().poll_collection(collection.to_string(), tx));

        Ok(ListenerRegistration::new(rx, move || task.abort()))
    }

    async fn get_collection(&self, collection: &str) -> Result<Vec<Document>, ClientError> {
        let url = self.collection_url(collection);
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .request(Method::GET, &url)
                .query(&[("pageSize", PAGE_SIZE)]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = check(request.send().await.map_err(http_error)?).await?;
            let page: ListResponse = response.json().await.map_err(decode_error)?;

            documents.extend(page.documents.into_iter().map(RestDocument::into_document));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(documents)
    }

    async fn get_document(
        &self,
        collection: &str,
        key: &str,
    ) -> Result<Option<Document>, ClientError> {
        let response = self
            .request(Method::GET, &self.document_url(collection, key))
            .send()
            .await
            .map_err(http_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let doc: RestDocument = check(response)
            .await?
            .json()
            .await
            .map_err(decode_error)?;
        Ok(Some(doc.into_document()))
    }

    async fn add_document(&self, collection: &str, fields: Fields) -> Result<String, ClientError> {
        let body = json!({ "fields": encode_fields(&fields)? });
        let response = self
            .request(Method::POST, &self.collection_url(collection))
            .json(&body)
            .send()
            .await
            .map_err(http_error)?;

        let doc: RestDocument = check(response)
            .await?
            .json()
            .await
            .map_err(decode_error)?;
        Ok(key_from_name(&doc.name).to_string())
    }

    async fn set_document(
        &self,
        collection: &str,
        key: &str,
        fields: Fields,
    ) -> Result<(), ClientError> {
        // No update mask: the document is replaced as a whole.
        let body = json!({ "fields": encode_fields(&fields)? });
        let response = self
            .request(Method::PATCH, &self.document_url(collection, key))
            .json(&body)
            .send()
            .await
            .map_err(http_error)?;

        check(response).await?;
        Ok(())
    }

    async fn delete_document(&self, collection: &str, key: &str) -> Result<(), ClientError> {
        let response = self
            .request(Method::DELETE, &self.document_url(collection, key))
            .send()
            .await
            .map_err(http_error)?;

        check(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        target: String,
        head: String,
        body: String,
    }

    /// Answers one request per connection with the next canned response,
    /// repeating the last one once the list runs out.
    async fn stub_server(responses: Vec<(u16, Value)>) -> (String, Arc<Mutex<Vec<Recorded>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);

        tokio::spawn(async move {
            let mut responses = responses.into_iter();
            let mut last: Option<(u16, Value)> = None;
            loop {
                let Some((status, body)) = responses.next().or_else(|| last.clone()) else {
                    return;
                };
                last = Some((status, body.clone()));

                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let request = read_request(&mut socket).await;
                log.lock().unwrap().push(request);

                let body = body.to_string();
                let reply = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(reply.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        (format!("http://{}", addr), seen)
    }

    async fn read_request(socket: &mut TcpStream) -> Recorded {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let header_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before headers");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
        let content_length = head
            .lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        while buf.len() < header_end + content_length {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let mut request_line = head.lines().next().unwrap_or_default().split_whitespace();
        Recorded {
            method: request_line.next().unwrap_or_default().to_string(),
            target: request_line.next().unwrap_or_default().to_string(),
            head: head.to_lowercase(),
            body: String::from_utf8_lossy(&buf[header_end..]).to_string(),
        }
    }

    fn stub_client(base_url: &str) -> FirestoreClient {
        FirestoreClient::new(base_url, "purisae", "(default)")
            .with_http_client(reqwest::Client::builder().no_proxy().build().unwrap())
    }

    fn rest_doc(key: &str) -> Value {
        json!({
            "name": format!("projects/purisae/databases/(default)/documents/package/{}", key),
            "fields": { "title": { "stringValue": key } },
            "updateTime": "2024-05-02T08:30:00.000000Z"
        })
    }

    fn client() -> FirestoreClient {
        FirestoreClient::new("http://localhost:8080/", "purisae", "(default)")
    }

    #[test]
    fn test_urls() {
        let client = client();
        assert_eq!(
            client.collection_url("package"),
            "http://localhost:8080/v1/projects/purisae/databases/(default)/documents/package"
        );
        assert_eq!(
            client.document_url("package", "a b"),
            "http://localhost:8080/v1/projects/purisae/databases/(default)/documents/package/a%20b"
        );
    }

    #[test]
    fn test_key_from_name() {
        assert_eq!(
            key_from_name("projects/p/databases/(default)/documents/package/Xy12"),
            "Xy12"
        );
        assert_eq!(key_from_name("bare"), "bare");
    }

    #[test]
    fn test_rest_document_into_document() {
        let raw = json!({
            "name": "projects/p/databases/(default)/documents/package/abc",
            "fields": {
                "title": { "stringValue": "Joglo" },
                "price": { "integerValue": "300000" }
            },
            "createTime": "2024-05-01T10:00:00.000001Z",
            "updateTime": "2024-05-02T08:30:00.123456Z"
        });
        let rest: RestDocument = serde_json::from_value(raw).unwrap();
        let doc = rest.into_document();

        assert_eq!(doc.key, "abc");
        assert_eq!(doc.fields["title"], json!("Joglo"));
        assert_eq!(doc.fields["price"], json!(300000));
        assert!(doc.update_time.is_some());
    }

    #[test]
    fn test_list_response_empty_collection() {
        let page: ListResponse = serde_json::from_value(json!({})).unwrap();
        assert!(page.documents.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_status_error_uses_server_message() {
        let body = r#"{"error":{"code":403,"message":"Missing or insufficient permissions.","status":"PERMISSION_DENIED"}}"#;
        let err = status_error(StatusCode::FORBIDDEN, body);
        assert_eq!(
            err,
            ClientError::Status {
                code: 403,
                message: "Missing or insufficient permissions.".into()
            }
        );

        let err = status_error(StatusCode::BAD_GATEWAY, "upstream down\n");
        assert_eq!(
            err,
            ClientError::Status {
                code: 502,
                message: "upstream down".into()
            }
        );
    }

    #[test]
    fn test_from_config_requires_project() {
        let result = FirestoreClient::from_config(&FirestoreConfig::default(), Duration::from_secs(1));
        assert!(matches!(
            result,
            Err(ConfigError::NotConfigured("firestore.project_id"))
        ));
    }

    #[test]
    fn test_from_config() {
        let config = FirestoreConfig {
            project_id: Some("purisae".into()),
            base_url: Some("http://localhost:8080".into()),
            access_token: Some("owner".into()),
            ..FirestoreConfig::default()
        };
        let client = FirestoreClient::from_config(&config, Duration::from_millis(250)).unwrap();

        assert_eq!(client.project_id(), "purisae");
        assert_eq!(client.poll_interval, Duration::from_millis(250));
        assert_eq!(client.access_token.as_deref(), Some("owner"));
        assert!(client.documents_url().ends_with("/databases/(default)/documents"));
    }

    #[tokio::test]
    async fn test_listener_reports_unreachable_backend() {
        // Nothing listens on port 9 locally; the first poll fails.
        let client = FirestoreClient::new("http://127.0.0.1:9", "p", "(default)")
            .with_poll_interval(Duration::from_millis(10));
        let mut reg = client.listen("package").unwrap();

        let result = reg.next().await.unwrap();
        assert!(matches!(result, Err(ClientError::Http(_))));
        assert!(reg.next().await.is_none());
    }

    #[tokio::test]
    async fn test_get_collection_follows_page_tokens() {
        let (base, seen) = stub_server(vec![
            (200, json!({ "documents": [rest_doc("a"), rest_doc("b")], "nextPageToken": "p2" })),
            (200, json!({ "documents": [rest_doc("c")] })),
        ])
        .await;

        let docs = stub_client(&base).get_collection("package").await.unwrap();
        let keys: Vec<&str> = docs.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(docs[2].fields["title"], json!("c"));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|r| r.method == "GET"));
        assert!(seen[0].target.contains("/documents/package?"));
        assert!(seen[0].target.contains("pageSize=300"));
        assert!(!seen[0].target.contains("pageToken"));
        assert!(seen[1].target.contains("pageToken=p2"));
    }

    #[tokio::test]
    async fn test_get_document_not_found_is_none() {
        let (base, seen) = stub_server(vec![
            (404, json!({ "error": { "code": 404, "message": "Document not found" } })),
            (200, rest_doc("k1")),
        ])
        .await;
        let client = stub_client(&base);

        assert!(client.get_document("package", "gone").await.unwrap().is_none());
        let doc = client.get_document("package", "k1").await.unwrap().unwrap();
        assert_eq!(doc.key, "k1");
        assert!(doc.update_time.is_some());

        let seen = seen.lock().unwrap().clone();
        assert!(seen[0].target.ends_with("/documents/package/gone"));
        assert!(seen[1].target.ends_with("/documents/package/k1"));
    }

    #[tokio::test]
    async fn test_add_document_posts_typed_fields() {
        let (base, seen) = stub_server(vec![(200, rest_doc("NewKey01"))]).await;
        let client = stub_client(&base).with_access_token("owner");

        let fields = json!({ "title": "Joglo", "price": 300000 });
        let key = client
            .add_document("package", fields.as_object().unwrap().clone())
            .await
            .unwrap();
        assert_eq!(key, "NewKey01");

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0].method, "POST");
        assert!(seen[0].target.ends_with("/documents/package"));
        assert!(seen[0].head.contains("authorization: bearer owner"));
        let body: Value = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(body["fields"]["title"], json!({ "stringValue": "Joglo" }));
        assert_eq!(body["fields"]["price"], json!({ "integerValue": "300000" }));
    }

    #[tokio::test]
    async fn test_set_and_delete_document() {
        let (base, seen) = stub_server(vec![(200, rest_doc("k1")), (200, json!({}))]).await;
        let client = stub_client(&base);

        let fields = json!({ "title": "Limasan" });
        client
            .set_document("package", "k1", fields.as_object().unwrap().clone())
            .await
            .unwrap();
        client.delete_document("package", "k1").await.unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[0].method, "PATCH");
        // No update mask: the whole document is replaced.
        assert!(seen[0].target.ends_with("/documents/package/k1"));
        let body: Value = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(body["fields"], json!({ "title": { "stringValue": "Limasan" } }));
        assert_eq!(seen[1].method, "DELETE");
        assert!(seen[1].target.ends_with("/documents/package/k1"));
    }

    #[tokio::test]
    async fn test_error_status_carries_server_message() {
        let (base, _seen) = stub_server(vec![(
            403,
            json!({ "error": { "code": 403, "message": "Missing or insufficient permissions." } }),
        )])
        .await;

        let err = stub_client(&base).get_collection("package").await.unwrap_err();
        assert_eq!(
            err,
            ClientError::Status {
                code: 403,
                message: "Missing or insufficient permissions.".into()
            }
        );
    }

    #[tokio::test]
    async fn test_add_rejects_out_of_range_integer() {
        let client = stub_client("http://127.0.0.1:9");
        let fields = json!({ "price": u64::MAX });

        let err = client
            .add_document("package", fields.as_object().unwrap().clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Encode(_)));
    }

    #[tokio::test]
    async fn test_listener_publishes_only_on_change() {
        let (base, seen) = stub_server(vec![(200, json!({ "documents": [rest_doc("a")] }))]).await;
        let client = stub_client(&base).with_poll_interval(Duration::from_millis(20));
        let mut reg = client.listen("package").unwrap();

        let docs = reg.next().await.unwrap().unwrap();
        assert_eq!(docs.len(), 1);

        // Same documents on every later poll: nothing new is published.
        let quiet = tokio::time::timeout(Duration::from_millis(200), reg.next()).await;
        assert!(quiet.is_err());
        assert!(seen.lock().unwrap().len() > 1);
    }

    #[tokio::test]
    async fn test_listener_times_out_on_silent_backend() {
        // Accepts connections and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let client = stub_client(&format!("http://{}", addr))
            .with_poll_interval(Duration::from_millis(10))
            .with_request_timeout(Duration::from_millis(100));
        let mut reg = client.listen("package").unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), reg.next())
            .await
            .expect("listener should give up on its own");
        assert!(matches!(result, Some(Err(ClientError::Timeout(_)))));
        assert!(reg.next().await.is_none());
    }
}
