use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::storage::KeyValueStore;

/// Record holding the whole per-category mapping.
pub const MESSAGES_KEY: &str = "chatMessages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "RAG")]
    Rag,
    #[serde(rename = "CAG")]
    Cag,
    Agentic,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Rag, Category::Cag, Category::Agentic];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Rag => "RAG",
            Category::Cag => "CAG",
            Category::Agentic => "Agentic",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown category: {0} (expected RAG, CAG or Agentic)")]
pub struct UnknownCategory(pub String);

impl FromStr for Category {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownCategory(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Author {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub content: String,
    pub author: Author,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(author: Author, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            content: content.into(),
            author,
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Author::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Author::Assistant, content)
    }
}

pub type History = BTreeMap<Category, Vec<Message>>;

#[derive(Debug, Clone)]
pub enum StoreEvent {
    Appended { category: Category, message: Message },
    Cleared,
}

fn empty_history() -> History {
    Category::ALL.into_iter().map(|c| (c, Vec::new())).collect()
}

/// Per-category append-only chat log, written through to a [`KeyValueStore`]
/// after every mutation.
///
/// Every category is present at all times. Persistence is best effort: a failed
/// write is logged and the in-memory log stays authoritative.
pub struct SessionStore {
    logs: RwLock<History>,
    kv: Arc<dyn KeyValueStore>,
    events: broadcast::Sender<StoreEvent>,
}

impl SessionStore {
    /// Restores the persisted mapping. Missing, unreadable or malformed data
    /// yields three empty categories.
    pub async fn load(kv: Arc<dyn KeyValueStore>) -> Self {
        let mut logs = empty_history();
        match kv.get(MESSAGES_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<History>(&raw) {
                Ok(stored) => logs.extend(stored),
                Err(e) => warn!(error = %e, "discarding malformed chat history"),
            },
            Ok(None) => {}
            Err(e) => warn!(error = %e, "chat history unavailable, starting empty"),
        }
        let (events, _) = broadcast::channel(64);
        Self { logs: RwLock::new(logs), kv, events }
    }

    /// Appends `message` to `category` and returns the updated sequence.
    pub async fn append(&self, category: Category, message: Message) -> Vec<Message> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(category).or_default();
        log.push(message.clone());
        let updated = log.clone();
        // written under the lock so the stored blob never lags an older snapshot
        self.write_through(&logs).await;
        drop(logs);
        self.events.send(StoreEvent::Appended { category, message }).ok();
        updated
    }

    pub async fn get(&self, category: Category) -> Vec<Message> {
        self.logs.read().await.get(&category).cloned().unwrap_or_default()
    }

    pub async fn snapshot(&self) -> History {
        self.logs.read().await.clone()
    }

    pub async fn persist(&self) {
        let logs = self.logs.read().await;
        self.write_through(&logs).await;
    }

    pub async fn clear(&self) {
        let mut logs = self.logs.write().await;
        *logs = empty_history();
        self.write_through(&logs).await;
        drop(logs);
        self.events.send(StoreEvent::Cleared).ok();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    async fn write_through(&self, logs: &History) {
        let raw = match serde_json::to_string(logs) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "failed to serialize chat history");
                return;
            }
        };
        if let Err(e) = self.kv.set(MESSAGES_KEY, &raw).await {
            warn!(error = %e, "failed to persist chat history");
        }
    }
}
