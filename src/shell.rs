use std::sync::Arc;

use chrono::Local;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::warn;

use crate::dispatcher::{ChatDispatcher, SendOutcome};
use crate::session::{Author, Category, Message, SessionStore, StoreEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Send(String),
    Tab(Category),
    History,
    Clear,
    Help,
    Quit,
    Invalid(String),
}

/// Lines starting with ':' are commands; anything else is chat input.
pub fn parse_line(line: &str) -> ShellCommand {
    let trimmed = line.trim();
    let Some(rest) = trimmed.strip_prefix(':') else {
        return ShellCommand::Send(line.to_string());
    };
    let mut parts = rest.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some("tab"), Some(name)) => match name.parse() {
            Ok(category) => ShellCommand::Tab(category),
            Err(e) => ShellCommand::Invalid(e.to_string()),
        },
        (Some("tab"), None) => ShellCommand::Invalid("usage: :tab <RAG|CAG|Agentic>".into()),
        (Some("history"), None) => ShellCommand::History,
        (Some("clear"), None) => ShellCommand::Clear,
        (Some("help"), None) => ShellCommand::Help,
        (Some("quit" | "q"), None) => ShellCommand::Quit,
        _ => ShellCommand::Invalid(format!("unknown command: {}", trimmed)),
    }
}

pub fn render(category: Category, message: &Message) -> String {
    let who = match message.author {
        Author::User => "you",
        Author::Assistant => "ai",
    };
    format!(
        "[{} {}] {}: {}",
        category,
        message.created_at.with_timezone(&Local).format("%H:%M:%S"),
        who,
        message.content
    )
}

const HELP: &str = ":tab <RAG|CAG|Agentic>  switch category\n\
                    :history                 show this category's messages\n\
                    :clear                   clear all chat history\n\
                    :quit                    leave";

/// Takes the store events already broadcast and turns them into output lines.
/// `send` and `clear` broadcast before returning, so draining after each
/// command prints its effect ahead of the next prompt.
pub fn drain_events(events: &mut broadcast::Receiver<StoreEvent>) -> Vec<String> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(StoreEvent::Appended { category, message }) if message.author == Author::Assistant => {
                out.push(render(category, &message));
            }
            Ok(StoreEvent::Cleared) => out.push("(history cleared)".to_string()),
            Ok(_) => {}
            Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "shell fell behind the session store"),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    out
}

/// Interactive chat. Replies come from the session store's event stream, so
/// anything appended to the store during a command is shown.
pub async fn run(store: Arc<SessionStore>, dispatcher: Arc<ChatDispatcher>, mut category: Category) -> anyhow::Result<()> {
    let mut events = store.subscribe();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        stdout.write_all(format!("{}> ", category).as_bytes()).await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };

        match parse_line(&line) {
            ShellCommand::Send(text) => {
                if dispatcher.send(category, &text).await == SendOutcome::Ignored {
                    continue;
                }
            }
            ShellCommand::Tab(next) => category = next,
            ShellCommand::History => {
                for message in store.get(category).await {
                    println!("{}", render(category, &message));
                }
            }
            ShellCommand::Clear => store.clear().await,
            ShellCommand::Help => println!("{}", HELP),
            ShellCommand::Quit => break,
            ShellCommand::Invalid(reason) => eprintln!("{}", reason),
        }
        for out in drain_events(&mut events) {
            println!("{}", out);
        }
    }

    store.persist().await;
    Ok(())
}
