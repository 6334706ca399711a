use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::{ApiError, ChatRequest, ChatResponse, ChatRole, ChatTurn};
use crate::credentials::CredentialManager;
use crate::session::{Author, Category, Message, SessionStore};

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, bearer: Option<&str>, req: &ChatRequest) -> Result<ChatResponse, ApiError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    /// Blank input; nothing appended, nothing sent.
    Ignored,
    Answered(Message),
    Fallback(Message),
}

impl From<&Message> for ChatTurn {
    fn from(m: &Message) -> Self {
        let role = match m.author {
            Author::User => ChatRole::User,
            Author::Assistant => ChatRole::Ai,
        };
        ChatTurn { role, content: m.content.clone() }
    }
}

pub fn fallback_reply(category: Category) -> String {
    format!("✨ Simulated {} response due to error.", category)
}

/// Sends chat messages for one category at a time.
///
/// Sends to the same category queue behind a fair lock held for the whole
/// exchange, so each user message is followed by its own reply and later
/// requests carry the earlier exchanges as history. Categories do not block
/// each other.
///
/// Request and fallback counts go to the `metrics` facade. The binary installs
/// no recorder, so the counters are no-ops until one is installed.
pub struct ChatDispatcher {
    store: Arc<SessionStore>,
    backend: Arc<dyn ChatBackend>,
    credentials: Arc<CredentialManager>,
    lanes: [Mutex<()>; 3],
}

impl ChatDispatcher {
    pub fn new(store: Arc<SessionStore>, backend: Arc<dyn ChatBackend>, credentials: Arc<CredentialManager>) -> Self {
        Self {
            store,
            backend,
            credentials,
            lanes: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
        }
    }

    fn lane(&self, category: Category) -> &Mutex<()> {
        match category {
            Category::Rag => &self.lanes[0],
            Category::Cag => &self.lanes[1],
            Category::Agentic => &self.lanes[2],
        }
    }

    pub async fn send(&self, category: Category, text: &str) -> SendOutcome {
        if text.trim().is_empty() {
            debug!(%category, "ignoring blank message");
            return SendOutcome::Ignored;
        }
        let _lane = self.lane(category).lock().await;

        let prior = self.store.get(category).await;
        self.store.append(category, Message::user(text)).await;

        let request = ChatRequest {
            question: text.to_string(),
            history: prior.iter().map(ChatTurn::from).collect(),
        };
        let bearer = self.credentials.bearer().await;
        metrics::counter!("workflow_hub_chat_requests_total", "category" => category.as_str()).increment(1);

        match self.backend.chat(bearer.as_deref(), &request).await {
            Ok(resp) => {
                info!(%category, history = request.history.len(), "chat answered");
                let reply = Message::assistant(resp.answer);
                self.store.append(category, reply.clone()).await;
                SendOutcome::Answered(reply)
            }
            Err(e) => {
                warn!(%category, error = %e, "chat request failed, using simulated reply");
                metrics::counter!("workflow_hub_chat_fallbacks_total", "category" => category.as_str()).increment(1);
                let reply = Message::assistant(fallback_reply(category));
                self.store.append(category, reply.clone()).await;
                SendOutcome::Fallback(reply)
            }
        }
    }
}
