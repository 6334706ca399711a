use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use url::Url;

use crate::api::ApiError;
use crate::credentials::CredentialManager;
use crate::session::Category;

/// Document formats accepted for upload.
pub const ACCEPTED_EXTENSIONS: [&str; 5] = ["pdf", "doc", "docx", "txt", "md"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelId {
    #[serde(rename = "gpt-4")]
    Gpt4,
    #[serde(rename = "gpt-3.5-turbo")]
    Gpt35Turbo,
    #[serde(rename = "claude-3")]
    Claude3,
    #[serde(rename = "gemini-pro")]
    GeminiPro,
}

impl ModelId {
    pub const ALL: [ModelId; 4] = [ModelId::Gpt4, ModelId::Gpt35Turbo, ModelId::Claude3, ModelId::GeminiPro];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelId::Gpt4 => "gpt-4",
            ModelId::Gpt35Turbo => "gpt-3.5-turbo",
            ModelId::Claude3 => "claude-3",
            ModelId::GeminiPro => "gemini-pro",
        }
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown model: {0} (expected one of gpt-4, gpt-3.5-turbo, claude-3, gemini-pro)")]
pub struct UnknownModel(pub String);

impl FromStr for ModelId {
    type Err = UnknownModel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelId::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownModel(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFile {
    pub file_name: String,
    pub size: u64,
    pub content_type: String,
    pub path: PathBuf,
}

impl UploadedFile {
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path)?;
        if !meta.is_file() {
            return Err(std::io::Error::other(format!("{} is not a file", path.display())));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let content_type = content_type_for(extension_of(path).as_deref()).to_string();
        Ok(Self { file_name, size: meta.len(), content_type, path: path.to_path_buf() })
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
}

fn content_type_for(ext: Option<&str>) -> &'static str {
    match ext {
        Some("pdf") => "application/pdf",
        Some("doc") => "application/msword",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MongoQuery {
    pub connection_uri: String,
    pub database_name: String,
    pub collection_name: String,
    pub query: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataSourceConfig {
    Upload(UploadedFile),
    MongoQuery(MongoQuery),
    Endpoint { url: Url },
}

/// A data source that has been ingested into a server-side collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    pub config: DataSourceConfig,
    pub collection_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub u64);

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDescriptor {
    pub id: WorkflowId,
    pub name: String,
    pub category: Category,
    pub model: ModelId,
    pub instruction: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_source: Option<DataSource>,
    pub created_at: DateTime<Utc>,
}

/// Data-source choice as entered, possibly incomplete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSourceDraft {
    Upload { path: Option<PathBuf> },
    MongoQuery { connection_uri: String, database_name: String, collection_name: String, query: String },
    Endpoint { url: String },
}

/// Form state for a workflow that has not been created yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowDraft {
    pub name: String,
    pub category: Category,
    pub model: Option<ModelId>,
    pub instruction: String,
    pub data_source: Option<DataSourceDraft>,
}

impl Default for WorkflowDraft {
    fn default() -> Self {
        Self {
            name: String::new(),
            category: Category::Rag,
            model: None,
            instruction: String::new(),
            data_source: None,
        }
    }
}

#[derive(Debug)]
struct ValidDraft {
    name: String,
    category: Category,
    model: ModelId,
    instruction: String,
    data_source: Option<DataSourceConfig>,
}

impl WorkflowDraft {
    #[cfg(test)]
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn validate(&self) -> Result<ValidDraft, WorkflowError> {
        let mut missing = Vec::new();
        let name = self.name.trim();
        if name.is_empty() {
            missing.push("name");
        }
        if self.model.is_none() {
            missing.push("model");
        }
        let instruction = self.instruction.trim();
        if instruction.is_empty() {
            missing.push("instruction");
        }

        // only RAG workflows carry a data source; any other choice is dropped
        let data_source = if self.category == Category::Rag {
            match &self.data_source {
                None => {
                    missing.push("data_source");
                    None
                }
                Some(draft) => complete_data_source(draft, &mut missing),
            }
        } else {
            None
        };

        match self.model {
            Some(model) if missing.is_empty() => Ok(ValidDraft {
                name: name.to_string(),
                category: self.category,
                model,
                instruction: instruction.to_string(),
                data_source,
            }),
            _ => Err(WorkflowError::MissingFields(missing)),
        }
    }
}

fn complete_data_source(draft: &DataSourceDraft, missing: &mut Vec<&'static str>) -> Option<DataSourceConfig> {
    match draft {
        DataSourceDraft::Upload { path } => {
            let accepted = path
                .as_deref()
                .and_then(extension_of)
                .is_some_and(|ext| ACCEPTED_EXTENSIONS.contains(&ext.as_str()));
            let file = path.as_ref().filter(|_| accepted).and_then(|p| UploadedFile::from_path(p).ok());
            if file.is_none() {
                missing.push("data_source.file");
            }
            file.map(DataSourceConfig::Upload)
        }
        DataSourceDraft::MongoQuery { connection_uri, database_name, collection_name, query } => {
            let before = missing.len();
            for (field, value) in [
                ("data_source.connection_uri", connection_uri),
                ("data_source.database_name", database_name),
                ("data_source.collection_name", collection_name),
            ] {
                if value.trim().is_empty() {
                    missing.push(field);
                }
            }
            let raw = if query.trim().is_empty() { "{}" } else { query.as_str() };
            let parsed = serde_json::from_str::<serde_json::Value>(raw).ok().filter(|v| v.is_object());
            if parsed.is_none() {
                missing.push("data_source.query");
            }
            match parsed {
                Some(query) if missing.len() == before => Some(DataSourceConfig::MongoQuery(MongoQuery {
                    connection_uri: connection_uri.trim().to_string(),
                    database_name: database_name.trim().to_string(),
                    collection_name: collection_name.trim().to_string(),
                    query,
                })),
                _ => None,
            }
        }
        DataSourceDraft::Endpoint { url } => {
            let parsed = Url::parse(url.trim()).ok().filter(|u| matches!(u.scheme(), "http" | "https"));
            if parsed.is_none() {
                missing.push("data_source.url");
            }
            parsed.map(|url| DataSourceConfig::Endpoint { url })
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("missing fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),
    #[error("another workflow is being created")]
    Busy,
    #[error("ingestion failed: {0}")]
    Ingest(#[from] ApiError),
}

/// Remote collaborator that embeds a data source into a named collection.
#[async_trait]
pub trait DocumentIngestor: Send + Sync {
    async fn ingest(
        &self,
        bearer: Option<&str>,
        collection: &str,
        source: &DataSourceConfig,
    ) -> Result<String, ApiError>;
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Append-only, in-memory list of the workflows created this session.
pub struct WorkflowRegistry {
    workflows: RwLock<Vec<WorkflowDescriptor>>,
    ingestor: Arc<dyn DocumentIngestor>,
    credentials: Arc<CredentialManager>,
    busy: AtomicBool,
}

impl WorkflowRegistry {
    pub fn new(ingestor: Arc<dyn DocumentIngestor>, credentials: Arc<CredentialManager>) -> Self {
        Self {
            workflows: RwLock::new(Vec::new()),
            ingestor,
            credentials,
            busy: AtomicBool::new(false),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub async fn create(&self, draft: &WorkflowDraft) -> Result<WorkflowDescriptor, WorkflowError> {
        if self.is_busy() {
            return Err(WorkflowError::Busy);
        }
        let valid = draft.validate()?;

        let data_source = match valid.data_source {
            Some(config) => Some(self.ingest(&valid.name, config).await?),
            None => None,
        };

        let mut workflows = self.workflows.write().await;
        let now = Utc::now();
        let millis = u64::try_from(now.timestamp_millis()).unwrap_or_default();
        let id = match workflows.last() {
            Some(last) if last.id.0 >= millis => WorkflowId(last.id.0 + 1),
            _ => WorkflowId(millis),
        };
        let descriptor = WorkflowDescriptor {
            id,
            name: valid.name,
            category: valid.category,
            model: valid.model,
            instruction: valid.instruction,
            data_source,
            created_at: now,
        };
        workflows.push(descriptor.clone());
        info!(%id, name = %descriptor.name, category = %descriptor.category, "workflow created");
        Ok(descriptor)
    }

    async fn ingest(&self, name: &str, config: DataSourceConfig) -> Result<DataSource, WorkflowError> {
        if self.busy.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            return Err(WorkflowError::Busy);
        }
        let _busy = BusyGuard(&self.busy);
        let bearer = self.credentials.bearer().await;
        match self.ingestor.ingest(bearer.as_deref(), name, &config).await {
            Ok(collection_name) => {
                info!(%name, %collection_name, "data source ingested");
                Ok(DataSource { config, collection_name })
            }
            Err(e) => {
                warn!(%name, error = %e, "data source ingestion failed");
                Err(e.into())
            }
        }
    }

    #[cfg(test)]
    pub async fn list(&self) -> Vec<WorkflowDescriptor> {
        self.workflows.read().await.clone()
    }

    #[cfg(test)]
    pub async fn get(&self, id: WorkflowId) -> Option<WorkflowDescriptor> {
        self.workflows.read().await.iter().find(|w| w.id == id).cloned()
    }
}
