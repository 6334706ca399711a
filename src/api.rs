use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::dispatcher::ChatBackend;
use crate::workflow::{DataSourceConfig, DocumentIngestor};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("invalid base url: {0}")]
    BaseUrl(#[from] url::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
struct AccountRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access: String,
    pub refresh: String,
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageBody {
    message: Option<String>,
    /// Auth middleware reports rejections here instead of `message`.
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub question: String,
    pub history: Vec<ChatTurn>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatResponse {
    pub answer: String,
}

#[derive(Debug, Deserialize)]
struct IngestResponse {
    status: String,
    message: Option<String>,
    data: Option<IngestData>,
}

#[derive(Debug, Deserialize)]
struct IngestData {
    collection_name: Option<String>,
}

/// Typed client for the workflow hub HTTP API.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ApiError> {
        let mut base_url = Url::parse(base_url)?;
        // joined paths are relative to the base, which must end in '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }

    fn authorized(rb: RequestBuilder, bearer: Option<&str>) -> RequestBuilder {
        match bearer {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, ApiError> {
        let resp = self
            .http
            .post(self.endpoint("auth/login/")?)
            .json(&AccountRequest { email, password })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(rejected(resp, "Invalid credentials.").await);
        }
        resp.json::<LoginResponse>().await.map_err(|e| ApiError::Malformed(e.to_string()))
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<String, ApiError> {
        let resp = self
            .http
            .post(self.endpoint("auth/register/")?)
            .json(&AccountRequest { email, password })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(rejected(resp, "Registration failed.").await);
        }
        let body: MessageBody = resp.json().await.unwrap_or_default();
        Ok(body.message.unwrap_or_else(|| "User Registered Successfully".into()))
    }

    pub async fn chat(&self, bearer: Option<&str>, req: &ChatRequest) -> Result<ChatResponse, ApiError> {
        let rb = self.http.post(self.endpoint("rag/chat/")?).json(req);
        let resp = Self::authorized(rb, bearer).send().await?;
        if !resp.status().is_success() {
            return Err(rejected(resp, "chat request failed").await);
        }
        resp.json::<ChatResponse>().await.map_err(|e| ApiError::Malformed(e.to_string()))
    }

    /// Submits a data source for embedding into `collection` and returns the
    /// collection name the server created.
    pub async fn ingest(
        &self,
        bearer: Option<&str>,
        collection: &str,
        source: &DataSourceConfig,
    ) -> Result<String, ApiError> {
        let form = Form::new().text("chroma_collection", collection.to_string());
        let form = match source {
            DataSourceConfig::Upload(file) => {
                let bytes = tokio::fs::read(&file.path).await?;
                let part = Part::bytes(bytes)
                    .file_name(file.file_name.clone())
                    .mime_str(&file.content_type)?;
                form.text("source_type", "file").part("doc", part)
            }
            DataSourceConfig::MongoQuery(q) => form
                .text("source_type", "mongodb")
                .text("mongo_uri", q.connection_uri.clone())
                .text("db_name", q.database_name.clone())
                .text("collection_name", q.collection_name.clone())
                .text("query", q.query.to_string()),
            DataSourceConfig::Endpoint { url } => form
                .text("source_type", "api")
                .text("endpoint_url", url.to_string()),
        };

        let rb = self.http.post(self.endpoint("rag/upload/")?).multipart(form);
        let resp = Self::authorized(rb, bearer).send().await?;
        if !resp.status().is_success() {
            return Err(rejected(resp, "Something went wrong").await);
        }
        let http_status = resp.status().as_u16();
        let body: IngestResponse = resp.json().await.map_err(|e| ApiError::Malformed(e.to_string()))?;
        if body.status != "200" {
            return Err(ApiError::Rejected {
                status: body.status.parse().unwrap_or(http_status),
                message: body.message.unwrap_or_else(|| "Something went wrong".into()),
            });
        }
        body.data
            .and_then(|d| d.collection_name)
            .ok_or_else(|| ApiError::Malformed("missing data.collection_name".into()))
    }
}

async fn rejected(resp: Response, fallback: &str) -> ApiError {
    let status = resp.status().as_u16();
    let body: MessageBody = resp.json().await.unwrap_or_default();
    let message = body.message.or(body.error).unwrap_or_else(|| fallback.to_string());
    ApiError::Rejected { status, message }
}

#[async_trait]
impl ChatBackend for ApiClient {
    async fn chat(&self, bearer: Option<&str>, req: &ChatRequest) -> Result<ChatResponse, ApiError> {
        ApiClient::chat(self, bearer, req).await
    }
}

#[async_trait]
impl DocumentIngestor for ApiClient {
    async fn ingest(
        &self,
        bearer: Option<&str>,
        collection: &str,
        source: &DataSourceConfig,
    ) -> Result<String, ApiError> {
        ApiClient::ingest(self, bearer, collection, source).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::workflow::{MongoQuery, UploadedFile};
    use axum::extract::{Multipart, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    pub(crate) async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client(base: &str) -> ApiClient {
        ApiClient::new(base, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn login_returns_tokens_and_rejects_bad_credentials() {
        let app = Router::new().route(
            "/auth/login/",
            post(|Json(body): Json<Value>| async move {
                if body["password"] == "secret" {
                    (StatusCode::OK, Json(json!({"access": "acc", "refresh": "ref", "message": "Login Successful"})))
                } else {
                    (StatusCode::UNAUTHORIZED, Json(json!({"message": "Invalid email or password"})))
                }
            }),
        );
        let api = client(&spawn(app).await);

        let ok = api.login("a@b.c", "secret").await.unwrap();
        assert_eq!(ok.access, "acc");
        assert_eq!(ok.refresh, "ref");
        assert_eq!(ok.message.as_deref(), Some("Login Successful"));

        match api.login("a@b.c", "wrong").await {
            Err(ApiError::Rejected { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid email or password");
            }
            other => panic!("expected rejection, got {:?}", other.map(|r| r.access)),
        }
    }

    #[tokio::test]
    async fn register_reports_server_message() {
        let app = Router::new().route(
            "/auth/register/",
            post(|| async { (StatusCode::CREATED, Json(json!({"message": "User Registered Successfully"}))) }),
        );
        let api = client(&spawn(app).await);
        assert_eq!(api.register("a@b.c", "pw").await.unwrap(), "User Registered Successfully");
    }

    #[tokio::test]
    async fn chat_sends_bearer_and_history() {
        let seen: Arc<Mutex<Option<(String, Value)>>> = Arc::default();
        let app = Router::new()
            .route(
                "/rag/chat/",
                post(|State(seen): State<Arc<Mutex<Option<(String, Value)>>>>, headers: HeaderMap, Json(body): Json<Value>| async move {
                    let auth = headers.get("authorization").and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
                    *seen.lock().unwrap() = Some((auth, body));
                    Json(json!({"answer": "hi"}))
                }),
            )
            .with_state(seen.clone());
        let api = client(&spawn(app).await);

        let req = ChatRequest {
            question: "hello".into(),
            history: vec![ChatTurn { role: ChatRole::Ai, content: "earlier".into() }],
        };
        let resp = api.chat(Some("tok"), &req).await.unwrap();
        assert_eq!(resp.answer, "hi");

        let (auth, body) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(auth, "Bearer tok");
        assert_eq!(body, json!({"question": "hello", "history": [{"role": "ai", "content": "earlier"}]}));
    }

    #[tokio::test]
    async fn chat_without_answer_is_malformed() {
        let app = Router::new().route("/rag/chat/", post(|| async { Json(json!({"reply": "nope"})) }));
        let api = client(&spawn(app).await);
        let req = ChatRequest { question: "q".into(), history: vec![] };
        assert!(matches!(api.chat(None, &req).await, Err(ApiError::Malformed(_))));
    }

    type Fields = Arc<Mutex<BTreeMap<String, String>>>;

    async fn record_fields(State(fields): State<Fields>, mut multipart: Multipart) -> Json<Value> {
        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);
            let value = match file_name {
                Some(file) => format!("file:{}", file),
                None => field.text().await.unwrap(),
            };
            fields.lock().unwrap().insert(name, value);
        }
        let collection = fields.lock().unwrap().get("chroma_collection").cloned().unwrap_or_default();
        Json(json!({"status": "200", "message": "ok", "data": {"collection_name": collection, "ids": []}}))
    }

    #[tokio::test]
    async fn ingest_upload_posts_multipart_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"retrieval content").unwrap();

        let fields: Fields = Arc::default();
        let app = Router::new().route("/rag/upload/", post(record_fields)).with_state(fields.clone());
        let api = client(&spawn(app).await);

        let source = DataSourceConfig::Upload(UploadedFile::from_path(&path).unwrap());
        let collection = api.ingest(Some("tok"), "handbook", &source).await.unwrap();
        assert_eq!(collection, "handbook");

        let fields = fields.lock().unwrap().clone();
        assert_eq!(fields["source_type"], "file");
        assert_eq!(fields["chroma_collection"], "handbook");
        assert_eq!(fields["doc"], "file:notes.txt");
    }

    #[tokio::test]
    async fn ingest_mongo_posts_query_fields() {
        let fields: Fields = Arc::default();
        let app = Router::new().route("/rag/upload/", post(record_fields)).with_state(fields.clone());
        let api = client(&spawn(app).await);

        let source = DataSourceConfig::MongoQuery(MongoQuery {
            connection_uri: "mongodb://localhost:27017".into(),
            database_name: "shop".into(),
            collection_name: "orders".into(),
            query: json!({"status": "open"}),
        });
        api.ingest(None, "orders-wf", &source).await.unwrap();

        let fields = fields.lock().unwrap().clone();
        assert_eq!(fields["source_type"], "mongodb");
        assert_eq!(fields["mongo_uri"], "mongodb://localhost:27017");
        assert_eq!(fields["db_name"], "shop");
        assert_eq!(fields["collection_name"], "orders");
        assert_eq!(serde_json::from_str::<Value>(&fields["query"]).unwrap(), json!({"status": "open"}));
    }

    #[tokio::test]
    async fn ingest_status_other_than_200_is_rejected() {
        let app = Router::new().route(
            "/rag/upload/",
            post(|| async { Json(json!({"status": "400", "message": "Invalid source_type or missing parameters", "data": {}})) }),
        );
        let api = client(&spawn(app).await);
        let source = DataSourceConfig::Endpoint { url: Url::parse("https://example.com/feed").unwrap() };
        match api.ingest(None, "feed", &source).await {
            Err(ApiError::Rejected { status, message }) => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid source_type or missing parameters");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn ingest_unauthorized_reports_the_auth_error() {
        let app = Router::new().route(
            "/rag/upload/",
            post(|| async { (StatusCode::UNAUTHORIZED, Json(json!({"error": "Token expired"}))) }),
        );
        let api = client(&spawn(app).await);
        let source = DataSourceConfig::Endpoint { url: Url::parse("https://example.com/feed").unwrap() };
        match api.ingest(Some("stale"), "feed", &source).await {
            Err(ApiError::Rejected { status, message }) => {
                assert_eq!(status, 401);
                assert_eq!(message, "Token expired");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn base_url_keeps_its_path_prefix() {
        let api = ApiClient::new("http://localhost:8000/api", Duration::from_secs(1)).unwrap();
        assert_eq!(api.endpoint("rag/chat/").unwrap().as_str(), "http://localhost:8000/api/rag/chat/");
    }
}
