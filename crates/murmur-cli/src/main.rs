//! murmur - terminal chat client for a streaming assistant backend

mod commands;
mod config;

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use murmur_chat::{ChatEvent, ChatOrchestrator};
use murmur_store::{
    Conversation, ConversationApi, FileKv, LocalCache, RemoteClient, Role, Synchronizer,
};
use murmur_stream::{SessionEventKind, SseTransport, StreamController};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing_subscriber::EnvFilter;

use commands::Command;

/// murmur - chat with a streaming assistant backend
#[derive(Parser, Debug)]
#[command(name = "murmur")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Backend base URL (default: http://localhost:8081)
    #[arg(short, long)]
    server: Option<String>,

    /// Send a single message, print the reply, and exit
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Continue an existing conversation by id
    #[arg(long)]
    conversation: Option<String>,

    /// List conversations
    #[arg(long)]
    list: bool,

    /// Probe the backend health endpoint
    #[arg(long)]
    health: bool,

    /// Delete a conversation by id
    #[arg(long, value_name = "ID")]
    delete: Option<String>,

    /// Rename a conversation
    #[arg(long, num_args = 2, value_names = ["ID", "TITLE"])]
    rename: Option<Vec<String>>,

    /// Local cache directory
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Initialize config file
    #[arg(long)]
    init_config: bool,
}

type Chat = ChatOrchestrator<RemoteClient>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so streamed replies on stdout stay clean
    if args.verbose {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("murmur=debug")),
            )
            .with_writer(io::stderr)
            .init();
    }

    if args.init_config {
        match config::Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = config::Config::load();
    let server_url = args.server.clone().unwrap_or_else(|| cfg.server_url());
    let cache_dir = args.cache_dir.clone().unwrap_or_else(|| cfg.cache_dir());
    tracing::debug!("Backend {}, cache {}", server_url, cache_dir.display());

    let transport = Arc::new(SseTransport::new(server_url.clone()));

    if args.health {
        if transport.check_health().await {
            println!("{} is healthy", server_url);
            return Ok(());
        }
        eprintln!("{} is unreachable or unhealthy", server_url);
        std::process::exit(1);
    }

    let sync = Synchronizer::new(
        RemoteClient::new(cfg.remote_config(server_url)),
        LocalCache::new(FileKv::new(cache_dir)),
    );

    if args.list {
        print_conversations(&sync.list().await, None);
        report_offline(&sync);
        return Ok(());
    }

    if let Some(id) = args.delete.as_deref() {
        sync.delete(id).await;
        println!("Deleted {}", id);
        report_offline(&sync);
        return Ok(());
    }

    let controller = StreamController::new(transport, cfg.stream_config());
    let mut chat = ChatOrchestrator::new(cfg.chat_config(), sync, controller);

    if let Some(rename) = args.rename.as_deref() {
        let [id, title] = rename else {
            bail!("--rename takes an id and a title");
        };
        match chat.rename_conversation(id, title).await? {
            Some(conversation) => println!("Renamed {} to {}", conversation.id, conversation.title),
            None => bail!("no conversation with id {}", id),
        }
        return Ok(());
    }

    let mut events = chat.subscribe();

    if let Some(id) = args.conversation.as_deref() {
        chat.select_conversation(id).await;
    } else if args.command.is_none() {
        chat.load().await;
    }

    if let Some(message) = args.command.as_deref() {
        if !chat.send_message(message).await? {
            bail!("nothing to send");
        }
        stream_turn(&mut chat, &mut events).await?;
        return Ok(());
    }

    run_interactive(&mut chat, &mut events).await
}

async fn run_interactive(
    chat: &mut Chat,
    events: &mut broadcast::Receiver<ChatEvent>,
) -> anyhow::Result<()> {
    if io::IsTerminal::is_terminal(&io::stderr()) {
        eprintln!("murmur  (/help for commands)");
        eprintln!();
    }
    print_history(chat);

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if io::stdin().read_line(&mut input)? == 0 {
            // EOF
            break;
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        let Some(command) = commands::parse(input) else {
            if chat.send_message(input).await? {
                stream_turn(chat, events).await?;
            }
            continue;
        };

        match command {
            Command::Help => println!("{}", commands::help_message()),
            Command::Quit => break,
            Command::New => {
                let conversation = chat.new_conversation().await;
                println!("Started {}", conversation.id);
                print_history(chat);
            }
            Command::List => {
                print_conversations(chat.conversations(), chat.current_conversation_id())
            }
            Command::Open(prefix) => match resolve(chat.conversations(), &prefix) {
                Ok(id) => {
                    chat.select_conversation(&id).await;
                    print_history(chat);
                }
                Err(e) => println!("{}", e),
            },
            Command::Delete(prefix) => match resolve(chat.conversations(), &prefix) {
                Ok(id) => {
                    let was_current = chat.current_conversation_id() == Some(id.as_str());
                    chat.delete_conversation(&id).await;
                    println!("Deleted {}", id);
                    if was_current {
                        print_history(chat);
                    }
                }
                Err(e) => println!("{}", e),
            },
            Command::Rename(title) => {
                let Some(id) = chat.current_conversation_id().map(str::to_string) else {
                    println!("No active conversation.");
                    continue;
                };
                match chat.rename_conversation(&id, &title).await {
                    Ok(Some(conversation)) => println!("Renamed to {}", conversation.title),
                    Ok(None) => println!("Conversation {} no longer exists.", id),
                    Err(e) => println!("{}", e),
                }
            }
            Command::Retry => {
                if chat.force_reconnect() {
                    stream_turn(chat, events).await?;
                } else {
                    println!("Nothing to retry.");
                }
            }
            Command::Usage(usage) => println!("Usage: {}", usage),
            Command::Unknown(cmd) => {
                println!("Unknown command: /{}", cmd);
                println!("Type /help for available commands.");
            }
        }
    }

    Ok(())
}

/// Drive the live turn to completion, printing deltas as they arrive
async fn stream_turn(
    chat: &mut Chat,
    events: &mut broadcast::Receiver<ChatEvent>,
) -> anyhow::Result<()> {
    while chat.is_loading() {
        let Some(event) = chat.next_session_event().await else {
            break;
        };
        let is_current = chat.active_session() == Some(event.session);
        let kind = event.kind.clone();
        chat.handle_session_event(event).await?;

        if is_current {
            match kind {
                SessionEventKind::Error { user_message, .. } => eprintln!("\n[{}]", user_message),
                SessionEventKind::Timeout => eprintln!("\n[timed out]"),
                SessionEventKind::Reconnecting {
                    attempt,
                    max_attempts,
                } => eprintln!("[reconnecting {}/{}]", attempt, max_attempts),
                _ => {}
            }
        }

        loop {
            match events.try_recv() {
                Ok(ChatEvent::Delta { text, .. }) => {
                    print!("{}", text);
                    io::stdout().flush().ok();
                }
                Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
    }
    println!();

    if chat.can_retry() {
        println!("The reply failed. Type /retry to try again.");
    }
    report_offline(chat.synchronizer());
    Ok(())
}

fn print_history(chat: &Chat) {
    for message in chat.messages() {
        let who = match message.role {
            Role::User => "you",
            Role::Assistant => "assistant",
        };
        println!("{}: {}", who, message.text);
    }
}

fn print_conversations(conversations: &[Conversation], current: Option<&str>) {
    if conversations.is_empty() {
        println!("No conversations.");
        return;
    }
    for c in conversations {
        let marker = if Some(c.id.as_str()) == current { "*" } else { " " };
        let local = if c.local_only { " (local only)" } else { "" };
        println!(
            "{} {}  {}  {}{}",
            marker,
            c.id,
            c.updated_at.format("%Y-%m-%d %H:%M"),
            c.title,
            local
        );
    }
}

/// Find the conversation whose id equals or uniquely starts with `prefix`
fn resolve(conversations: &[Conversation], prefix: &str) -> anyhow::Result<String> {
    if let Some(c) = conversations.iter().find(|c| c.id == prefix) {
        return Ok(c.id.clone());
    }
    let mut matches = conversations.iter().filter(|c| c.id.starts_with(prefix));
    let first = matches
        .next()
        .with_context(|| format!("No conversation matches {}", prefix))?;
    if matches.next().is_some() {
        bail!("{} matches more than one conversation", prefix);
    }
    Ok(first.id.clone())
}

fn report_offline<R: ConversationApi>(sync: &Synchronizer<R>) {
    if let Some(error) = sync.last_remote_error() {
        tracing::warn!("Working from the local cache: {}", error);
    }
}
