use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chat_tree_sync::chat::ChatSession;
use chat_tree_sync::config::Config;
use chat_tree_sync::snapshot::TreeSnapshot;
use chat_tree_sync::summary::render_summary;
use chat_tree_sync::transcript::{Role, TranscriptError, TranscriptStore};
use chat_tree_sync::{GitHubGateway, RepositoryGateway};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tracing::{error, info, warn, Level};

const SEND: &str = "/send";
const TREE: &str = "/tree";
const QUIT: &str = "/quit";

/// Chat-driven file tree editor mirrored to a GitHub repository
#[derive(Parser, Debug)]
#[command(name = "chat-tree-sync", version, about)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the tree snapshot and transcript
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply one instruction read from FILE, or from stdin
    Send { file: Option<PathBuf> },
    /// Interactive chat; finish each message with a `/send` line
    Chat,
    /// Replace the local tree with the remote repository tree
    Fetch,
    /// Print the conversation so far
    History,
    /// Forget the local tree
    Reset,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(dir) = args.state_dir {
        config.session.state_dir = dir;
    }
    let state_dir = config.session.state_dir.clone();
    let transcript = TranscriptStore::new(state_dir.join("transcript.jsonl"));
    let snapshot = TreeSnapshot::open(&state_dir)?;

    match args.command {
        Command::History => print_history(&transcript)?,
        Command::Reset => {
            snapshot.clear()?;
            info!(path = %snapshot.path().display(), "local tree cleared");
        }
        Command::Send { file } => {
            let input = read_input(file).await?;
            let mut session = open_session(&config, transcript, snapshot)?;
            send_cancellable(&mut session, &input).await;
        }
        Command::Chat => {
            let mut session = open_session(&config, transcript, snapshot)?;
            chat_loop(&mut session).await?;
        }
        Command::Fetch => {
            let mut session = open_session(&config, transcript, snapshot)?;
            match session.refresh_from_remote().await {
                Ok(tree) => println!("{}", render_summary(tree)),
                Err(e) => {
                    error!(error = %e, "fetch failed");
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

fn open_session(
    config: &Config,
    transcript: TranscriptStore,
    snapshot: TreeSnapshot,
) -> Result<ChatSession, TranscriptError> {
    let gateway = GitHubGateway::from_config(&config.github)
        .map(|gw| Arc::new(gw) as Arc<dyn RepositoryGateway>);
    match &gateway {
        Some(_) => info!(
            owner = %config.github.owner,
            repo = %config.github.repo,
            branch = %config.github.branch,
            "mirroring to GitHub"
        ),
        None => info!("GitHub not configured, working locally"),
    }

    ChatSession::new(gateway)
        .with_call_timeout(Duration::from_secs(config.session.call_timeout_secs))
        .with_persistence(transcript, snapshot)
}

async fn read_input(file: Option<PathBuf>) -> std::io::Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path).await,
        None => {
            let mut input = String::new();
            tokio::io::stdin().read_to_string(&mut input).await?;
            Ok(input)
        }
    }
}

/// Send one message; Ctrl-C abandons it and leaves the tree as it was.
async fn send_cancellable(session: &mut ChatSession, input: &str) {
    tokio::select! {
        reply = session.send(input) => {
            if let Some(reply) = reply {
                println!("{}", reply.content);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("instruction cancelled");
        }
    }
}

async fn chat_loop(session: &mut ChatSession) -> std::io::Result<()> {
    eprintln!(
        "Finish each message with a line containing {}. {} shows the tree, {} exits.",
        SEND, TREE, QUIT
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buffer = String::new();

    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            SEND => {
                send_cancellable(session, &buffer).await;
                buffer.clear();
            }
            TREE => match session.tree() {
                Some(tree) => println!("{}", render_summary(tree)),
                None => println!("(no local tree)"),
            },
            QUIT => return Ok(()),
            _ => {
                buffer.push_str(&line);
                buffer.push('\n');
            }
        }
    }

    if !buffer.trim().is_empty() {
        send_cancellable(session, &buffer).await;
    }
    Ok(())
}

fn print_history(transcript: &TranscriptStore) -> Result<(), TranscriptError> {
    for message in transcript.load_all()? {
        let when = chrono::DateTime::from_timestamp(message.ts, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        let who = match message.role {
            Role::User => "user",
            Role::System => "system",
        };
        println!("[{}] {}:\n{}\n", when, who, message.content);
    }
    Ok(())
}
