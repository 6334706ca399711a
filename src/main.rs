use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

mod api;
mod credentials;
mod dispatcher;
mod session;
mod settings;
mod shell;
mod storage;
mod workflow;

use api::ApiClient;
use credentials::CredentialManager;
use dispatcher::{ChatDispatcher, SendOutcome};
use session::{Category, SessionStore};
use settings::{resolve_effective_settings, EffectiveSettings, SettingsLayer};
use storage::{KeyValueStore, SqliteKeyValueStore};
use workflow::{DataSourceDraft, ModelId, WorkflowDraft, WorkflowRegistry};

#[derive(Debug, Parser)]
#[command(name = "workflow_hub")]
#[command(about = "Chat client for RAG, CAG and agentic workflows", long_about = None)]
struct Cli {
    /// Base URL of the workflow hub API
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// SQLite database holding chat history and credentials
    #[arg(long, global = true)]
    database_url: Option<String>,
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    Logout,
    /// Send one message and print the reply
    Send {
        category: Category,
        text: String,
    },
    /// Print one category's messages, or every category when none is given
    History {
        category: Option<Category>,
    },
    ClearHistory,
    /// Create a workflow and print it as JSON
    Workflow(WorkflowArgs),
    /// Interactive chat
    Shell {
        #[arg(long, default_value = "RAG")]
        category: Category,
    },
}

#[derive(Debug, Args)]
struct WorkflowArgs {
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long, default_value = "RAG")]
    category: Category,
    #[arg(long)]
    model: Option<ModelId>,
    #[arg(long, default_value = "")]
    instruction: String,
    /// Document to upload (pdf, doc, docx, txt, md)
    #[arg(long, conflicts_with_all = ["mongo_uri", "endpoint"])]
    file: Option<PathBuf>,
    #[arg(long, conflicts_with = "endpoint")]
    mongo_uri: Option<String>,
    #[arg(long, default_value = "")]
    mongo_db: String,
    #[arg(long, default_value = "")]
    mongo_collection: String,
    #[arg(long, default_value = "{}")]
    mongo_query: String,
    #[arg(long)]
    endpoint: Option<String>,
}

impl WorkflowArgs {
    fn into_draft(self) -> WorkflowDraft {
        let data_source = if let Some(path) = self.file {
            Some(DataSourceDraft::Upload { path: Some(path) })
        } else if let Some(connection_uri) = self.mongo_uri {
            Some(DataSourceDraft::MongoQuery {
                connection_uri,
                database_name: self.mongo_db,
                collection_name: self.mongo_collection,
                query: self.mongo_query,
            })
        } else {
            self.endpoint.map(|url| DataSourceDraft::Endpoint { url })
        };
        WorkflowDraft {
            name: self.name,
            category: self.category,
            model: self.model,
            instruction: self.instruction,
            data_source,
        }
    }
}

struct Hub {
    api: Arc<ApiClient>,
    store: Arc<SessionStore>,
    credentials: Arc<CredentialManager>,
    dispatcher: Arc<ChatDispatcher>,
    registry: WorkflowRegistry,
}

impl Hub {
    async fn open(settings: &EffectiveSettings) -> anyhow::Result<Self> {
        let kv: Arc<dyn KeyValueStore> = Arc::new(
            SqliteKeyValueStore::initialize(settings.database_url.clone())
                .await
                .context("opening local database")?,
        );
        let api = Arc::new(ApiClient::new(&settings.api_base_url, settings.request_timeout)?);
        let credentials = Arc::new(CredentialManager::new(kv.clone(), settings.token_ttl));
        let store = Arc::new(SessionStore::load(kv).await);
        let dispatcher = Arc::new(ChatDispatcher::new(store.clone(), api.clone(), credentials.clone()));
        let registry = WorkflowRegistry::new(api.clone(), credentials.clone());
        Ok(Self { api, store, credentials, dispatcher, registry })
    }
}

async fn warn_if_signed_out(hub: &Hub) {
    if hub.credentials.is_expired().await {
        eprintln!("Not signed in or session expired; replies will be simulated until you log in.");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let overrides = SettingsLayer {
        api_base_url: cli.api_url,
        database_url: cli.database_url,
        request_timeout_secs: cli.timeout_secs,
        token_ttl_secs: None,
    };
    let settings = resolve_effective_settings(&SettingsLayer::from_env(), &overrides);
    let hub = Hub::open(&settings).await?;

    match cli.command {
        Commands::Login { email, password } => {
            let resp = hub.api.login(&email, &password).await.context("login failed")?;
            hub.credentials.issue(&resp.access, &resp.refresh).await?;
            println!("{}", resp.message.unwrap_or_else(|| "Welcome to Workflow Hub!".into()));
        }
        Commands::Register { email, password } => {
            let message = hub.api.register(&email, &password).await.context("registration failed")?;
            println!("{}", message);
        }
        Commands::Logout => {
            hub.credentials.clear().await?;
            println!("Logged out");
        }
        Commands::Send { category, text } => {
            warn_if_signed_out(&hub).await;
            match hub.dispatcher.send(category, &text).await {
                SendOutcome::Ignored => eprintln!("nothing to send"),
                SendOutcome::Answered(reply) | SendOutcome::Fallback(reply) => println!("{}", reply.content),
            }
        }
        Commands::History { category: Some(category) } => {
            for message in hub.store.get(category).await {
                println!("{}", shell::render(category, &message));
            }
        }
        Commands::History { category: None } => {
            for (category, log) in hub.store.snapshot().await {
                for message in &log {
                    println!("{}", shell::render(category, message));
                }
            }
        }
        Commands::ClearHistory => hub.store.clear().await,
        Commands::Workflow(args) => {
            let workflow = hub.registry.create(&args.into_draft()).await?;
            println!("{}", serde_json::to_string_pretty(&workflow)?);
        }
        Commands::Shell { category } => {
            warn_if_signed_out(&hub).await;
            shell::run(hub.store.clone(), hub.dispatcher.clone(), category).await?;
        }
    }
    Ok(())
}
