use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Parser, Subcommand};
use copycat_client::{
    ClientError,
    clipboard::SystemClipboard,
    ingest::{RelayClient, save_to_dir},
    preview::{PREVIEW_UNAVAILABLE, PreviewDispatcher, PreviewOutcome},
    realtime::{Channel, RealtimeFeed},
    session::SessionView,
    status::StatusSink,
    storage::SupabaseStore,
    sync::{SessionCommand, SyncCoordinator, now_unix_ms},
    upload_queue::QueueItem,
};
use copycat_core::ingest::is_data_url;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug, Clone)]
#[command(name = "copycat")]
struct ClientArgs {
    #[arg(long, env = "COPYCAT_RELAY_URL", default_value = "http://127.0.0.1:8080")]
    relay_url: String,

    #[command(subcommand)]
    command: ClientCommand,
}

#[derive(Subcommand, Debug, Clone)]
enum ClientCommand {
    /// Download a URL (or decode a data URL) through the relay into a directory.
    Fetch {
        url: String,
        #[arg(long, default_value = ".")]
        out: PathBuf,
    },
    /// Render the preview for a stored file.
    Preview {
        name: String,
        url: String,
        /// Write the HTML document here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Follow the shared message and file lists, reading commands from stdin.
    Watch,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = ClientArgs::parse();
    let relay = match RelayClient::new(&args.relay_url) {
        Ok(relay) => relay,
        Err(err) => {
            error!(relay_url = %args.relay_url, "invalid relay url: {err}");
            std::process::exit(2);
        }
    };

    let result = match args.command {
        ClientCommand::Fetch { url, out } => fetch(&relay, &url, &out).await,
        ClientCommand::Preview { name, url, out } => preview(&name, &url, out.as_deref()).await,
        ClientCommand::Watch => watch(relay).await,
    };

    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }
}

async fn fetch(relay: &RelayClient, url: &str, out: &Path) -> Result<(), ClientError> {
    let item = relay.ingest_url(url, now_unix_ms()).await?;
    let path = save_to_dir(&item, out).await?;
    info!(path = %path.display(), bytes = item.payload.len(), "saved");
    println!("{}", path.display());
    Ok(())
}

async fn preview(name: &str, url: &str, out: Option<&Path>) -> Result<(), ClientError> {
    let dispatcher = PreviewDispatcher::new(reqwest::Client::new());
    match dispatcher.preview(name, url).await? {
        PreviewOutcome::Redirect(target) => println!("{target}"),
        PreviewOutcome::Unavailable => println!("{PREVIEW_UNAVAILABLE}"),
        PreviewOutcome::Document(html) => match out {
            Some(path) => tokio::fs::write(path, html).await.map_err(|err| {
                ClientError::Storage(format!("failed to write {}: {err}", path.display()))
            })?,
            None => println!("{html}"),
        },
    }
    Ok(())
}

async fn watch(relay: RelayClient) -> Result<(), ClientError> {
    let config = relay.fetch_config().await?;
    let store = Arc::new(SupabaseStore::new(&config)?);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let feed = RealtimeFeed::new(config).spawn(Channel::ALL.to_vec(), event_tx);

    let status = StatusSink::new();
    let coordinator = SyncCoordinator::new(
        Arc::clone(&store),
        store,
        SystemClipboard::new(),
        status.clone(),
    );

    let mut status_rx = status.subscribe();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let line = status_rx.borrow_and_update().clone();
            if line.text.is_empty() {
                continue;
            }
            if line.is_error {
                eprintln!("! {}", line.text);
            } else {
                println!("* {}", line.text);
            }
        }
    });

    let mut view_rx = coordinator.subscribe_view();
    tokio::spawn(async move {
        while view_rx.changed().await.is_ok() {
            let view = view_rx.borrow_and_update().clone();
            print_view(&view);
        }
    });

    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let ctrl_c_tx = command_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_c_tx.send(SessionCommand::Shutdown);
        }
    });

    tokio::spawn(read_commands(relay, command_tx, status));

    let context = coordinator.run(event_rx, command_rx).await;
    feed.abort();
    info!(pending_uploads = context.queue.len(), "watch finished");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Session(SessionCommandLine),
    Url(String),
    File(PathBuf),
    Help,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionCommandLine {
    Paste,
    Confirm(String),
    Cancel,
    Share { title: String, content: String },
    DeleteMessage(i64),
    CopyMessage(i64),
    Search(String),
    NextMessage,
    ClearMessages,
    DeleteFile(String),
    ClearFiles,
    Refresh,
    Quit,
}

fn parse_input(line: &str) -> Result<Input, String> {
    let line = line.trim();
    let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    let command = match verb {
        "" | "help" => return Ok(Input::Help),
        "url" if !rest.is_empty() => return Ok(Input::Url(rest.to_owned())),
        "file" if !rest.is_empty() => return Ok(Input::File(PathBuf::from(rest))),
        "paste" => SessionCommandLine::Paste,
        "confirm" => SessionCommandLine::Confirm(rest.to_owned()),
        "cancel" => SessionCommandLine::Cancel,
        "share" => {
            let (title, content) = split_title(rest)?;
            SessionCommandLine::Share { title, content }
        }
        "delete" => SessionCommandLine::DeleteMessage(parse_message_id(rest)?),
        "copy" => SessionCommandLine::CopyMessage(parse_message_id(rest)?),
        "search" => SessionCommandLine::Search(rest.to_owned()),
        "next" => SessionCommandLine::NextMessage,
        "clear-messages" => SessionCommandLine::ClearMessages,
        "rm" if !rest.is_empty() => SessionCommandLine::DeleteFile(rest.to_owned()),
        "clear-files" => SessionCommandLine::ClearFiles,
        "refresh" => SessionCommandLine::Refresh,
        "quit" | "exit" => SessionCommandLine::Quit,
        other => return Err(format!("unknown command {other:?}, try `help`")),
    };
    Ok(Input::Session(command))
}

fn parse_message_id(rest: &str) -> Result<i64, String> {
    rest.parse()
        .map_err(|_| format!("expected a message id, got {rest:?}"))
}

/// Splits `--title <title> <text>` into its parts. A multi-word title is quoted.
fn split_title(rest: &str) -> Result<(String, String), String> {
    let Some(after_flag) = rest.strip_prefix("--title ") else {
        return Ok((String::new(), rest.to_owned()));
    };
    let after_flag = after_flag.trim_start();
    let (title, content) = match after_flag.strip_prefix('"') {
        Some(quoted) => quoted
            .split_once('"')
            .ok_or_else(|| "unterminated quoted title".to_owned())?,
        None => after_flag.split_once(' ').unwrap_or((after_flag, "")),
    };
    Ok((title.to_owned(), content.trim().to_owned()))
}

const HELP: &str = "commands: url <url>, file <path>, confirm <name>, cancel, \
share [--title <title>] <text>, copy <id>, delete <id>, search <text>, next, clear-messages, \
rm <name>, clear-files, paste, refresh, quit";

async fn read_commands(
    relay: RelayClient,
    commands: mpsc::UnboundedSender<SessionCommand>,
    status: StatusSink,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("stdin read failed: {err}");
                break;
            }
        };

        let input = match parse_input(&line) {
            Ok(input) => input,
            Err(message) => {
                status.error(message);
                continue;
            }
        };

        let command = match input {
            Input::Help => {
                status.info(HELP);
                continue;
            }
            Input::Url(url) if is_data_url(&url) => SessionCommand::PasteDataUrl(url),
            Input::Url(url) => {
                let relay = relay.clone();
                let commands = commands.clone();
                let status = status.clone();
                status.info("Fetching file from URL...");
                tokio::spawn(async move {
                    match relay.ingest_url(&url, now_unix_ms()).await {
                        Ok(item) => {
                            let _ = commands.send(SessionCommand::Enqueue(item));
                        }
                        Err(err) => {
                            warn!(url = %url, "url fetch failed: {err}");
                            status.error(format!("Failed to fetch from URL. {err}"));
                        }
                    }
                });
                continue;
            }
            Input::File(path) => match read_local_file(&path).await {
                Ok(item) => SessionCommand::Enqueue(item),
                Err(err) => {
                    status.error(err.to_string());
                    continue;
                }
            },
            Input::Session(command) => match command {
                SessionCommandLine::Paste => SessionCommand::FocusCompose,
                SessionCommandLine::Confirm(name) => SessionCommand::Confirm(name),
                SessionCommandLine::Cancel => SessionCommand::Cancel,
                SessionCommandLine::Share { title, content } => {
                    SessionCommand::Share { content, title }
                }
                SessionCommandLine::DeleteMessage(id) => SessionCommand::DeleteMessage(id),
                SessionCommandLine::CopyMessage(id) => SessionCommand::CopyMessage(id),
                SessionCommandLine::Search(term) => SessionCommand::Search(term),
                SessionCommandLine::NextMessage => SessionCommand::SelectNextMessage,
                SessionCommandLine::ClearMessages => SessionCommand::ClearMessages,
                SessionCommandLine::DeleteFile(name) => SessionCommand::DeleteFile(name),
                SessionCommandLine::ClearFiles => SessionCommand::ClearFiles,
                SessionCommandLine::Refresh => {
                    let _ = commands.send(SessionCommand::Refresh(Channel::Messages));
                    SessionCommand::Refresh(Channel::FileNotifications)
                }
                SessionCommandLine::Quit => SessionCommand::Shutdown,
            },
        };

        if commands.send(command).is_err() {
            break;
        }
    }
}

async fn read_local_file(path: &Path) -> Result<QueueItem, ClientError> {
    let payload = tokio::fs::read(path)
        .await
        .map_err(|err| ClientError::Storage(format!("failed to read {}: {err}", path.display())))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("file-{}", now_unix_ms()));
    Ok(QueueItem::new(payload, name, None))
}

fn print_view(view: &SessionView) {
    println!(
        "-- {} messages, {} files --",
        view.messages.len(),
        view.files.len()
    );
    if !view.search.is_empty() {
        println!("  search: {}", view.search);
    }
    for message in view.visible_messages().take(5) {
        let marker = if view.selected == Some(message.id) { '>' } else { ' ' };
        match message.title.as_deref() {
            Some(title) => println!(" {marker}#{} [{}] {}", message.id, title, message.content),
            None => println!(" {marker}#{} {}", message.id, message.content),
        }
    }
    for file in view.files.iter().take(5) {
        println!("  {} {}", file.name, file.url);
    }
    if !view.compose.is_empty() {
        println!("  compose: {}", view.compose);
    }
    if let Some(name) = &view.upload_prompt {
        println!("  waiting to upload {name}: `confirm <name>` or `cancel`");
    }
}
