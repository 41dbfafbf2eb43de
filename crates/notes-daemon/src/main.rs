//! notes-daemon: room relay and headless note editor.
//!
//! `relay` runs the WebSocket relay that collaborative sessions join.
//! `edit` opens an editing session backed by a SQLite store, reading note
//! text from stdin. `history` and `delete` work on persisted notes.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use note_sync::{
    DeleteError, EventBus, NoteContext, NoteId, NoteKind, NoteLifecycle, NoteWorkspace,
    Participant, RoomTransport, SessionDeps, SessionEvent, SyncConfig, UserId,
};
use notes_daemon::{ConsoleCommand, Flow, RelayServer, SqliteStore, WsTransport, console};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "notes-daemon")]
#[command(about = "Collaborative note relay and headless editor")]
struct Cli {
    /// Session configuration file (JSON, created with defaults if missing)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the WebSocket room relay
    Relay {
        /// Address to listen on
        #[arg(short, long, default_value = "0.0.0.0:9427")]
        listen: String,
    },

    /// Edit a note. Each stdin line replaces the note text (`\n` for a line
    /// break); `:new` saves and starts a new note, `:show` prints the text,
    /// `:quit` saves and exits.
    Edit {
        #[command(flatten)]
        note: NoteArgs,

        /// Your user id
        #[arg(long)]
        user: String,

        /// Display name shown to other participants
        #[arg(long)]
        name: Option<String>,

        /// Relay URL (overrides the config file)
        #[arg(long)]
        relay: Option<String>,

        #[command(flatten)]
        db: DbArgs,
    },

    /// List the notes of an entity, newest first
    History {
        #[command(flatten)]
        note: NoteArgs,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Delete one of your notes
    Delete {
        #[command(flatten)]
        note: NoteArgs,

        /// Id of the note to delete
        #[arg(long)]
        note_id: NoteId,

        /// Your user id
        #[arg(long)]
        user: String,

        #[command(flatten)]
        db: DbArgs,
    },
}

#[derive(Args, Debug)]
struct NoteArgs {
    /// What the note is about: application, investment, person or meeting
    #[arg(long)]
    kind: NoteKind,

    /// Id of the application, investment, person or meeting
    #[arg(long)]
    id: String,
}

impl NoteArgs {
    fn context(&self) -> Result<NoteContext> {
        NoteContext::new(self.kind, self.id.clone()).context("Invalid note context")
    }
}

#[derive(Args, Debug)]
struct DbArgs {
    /// SQLite database holding the notes
    #[arg(long, default_value = "notes.db")]
    db: PathBuf,
}

impl DbArgs {
    fn open(&self) -> Result<Arc<SqliteStore>> {
        let store = SqliteStore::open(&self.db)
            .with_context(|| format!("Failed to open note store {:?}", self.db))?;
        Ok(Arc::new(store))
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::load(path).context("Failed to load config"),
        None => Ok(SyncConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,notes_daemon=debug,note_sync=debug"
    } else {
        "info,notes_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Relay { listen } => run_relay(&listen).await,
        Command::Edit {
            note,
            user,
            name,
            relay,
            db,
        } => {
            let mut config = config;
            if relay.is_some() {
                config.relay_url = relay;
            }
            let display_name = name.unwrap_or_else(|| user.clone());
            run_edit(
                note.context()?,
                Participant::new(user, display_name),
                db.open()?,
                config,
            )
            .await
        }
        Command::History { note, db } => run_history(note.context()?, db.open()?).await,
        Command::Delete {
            note,
            note_id,
            user,
            db,
        } => run_delete(note.context()?, note_id, UserId::new(user), db.open()?).await,
    }
}

async fn run_relay(listen: &str) -> Result<ExitCode> {
    info!("Starting notes relay");
    let listener = RelayServer::bind(listen)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;

    info!("Relay running. Press Ctrl+C to stop.");
    tokio::select! {
        _ = RelayServer::new().run(listener) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down");
    Ok(ExitCode::SUCCESS)
}

async fn run_edit(
    ctx: NoteContext,
    participant: Participant,
    store: Arc<SqliteStore>,
    config: SyncConfig,
) -> Result<ExitCode> {
    let transport = config
        .relay_url
        .as_ref()
        .map(|url| Arc::new(WsTransport::new(url.clone())) as Arc<dyn RoomTransport>);
    let deps = SessionDeps {
        store,
        transport,
        config,
    };

    let events = Arc::new(EventBus::new());
    let _printer = events.subscribe(|event| match event {
        SessionEvent::BufferChanged {
            local: false,
            content,
        } => println!("<< {}", content.replace('\n', "\\n")),
        SessionEvent::PresenceChanged { participants } => {
            let names: Vec<String> = participants
                .iter()
                .map(|p| {
                    if p.is_typing {
                        format!("{} (typing)", p.display_name)
                    } else {
                        p.display_name.clone()
                    }
                })
                .collect();
            eprintln!("-- here: {}", names.join(", "));
        }
        SessionEvent::StatusChanged { status } => debug!("Save status: {:?}", status),
        SessionEvent::HistoryChanged { deleted_id } => {
            eprintln!("-- note {} was deleted", deleted_id)
        }
        _ => {}
    });

    let mut workspace = NoteWorkspace::new(deps, participant, Arc::clone(&events));
    let session = workspace
        .switch_to(ctx)
        .await
        .context("Failed to open editing session")?;
    println!("{}", console::escape(&session.content()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = tokio::signal::ctrl_c() => Ok(None),
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("Failed to read stdin, closing the note: {}", e);
                break;
            }
        };
        let Some(session) = workspace.current() else {
            break;
        };
        if console::apply(session, ConsoleCommand::parse(&line)).await == Flow::Quit {
            break;
        }
    }

    workspace.close().await.context("Failed to save note")?;
    Ok(ExitCode::SUCCESS)
}

async fn run_history(ctx: NoteContext, store: Arc<SqliteStore>) -> Result<ExitCode> {
    let notes = NoteLifecycle::new(store)
        .history(&ctx, None)
        .await
        .with_context(|| format!("Failed to list notes for {}", ctx))?;

    for note in notes {
        let date = note
            .meeting_date
            .map_or_else(|| "-".to_string(), |d| d.to_string());
        let preview = note.content.lines().next().unwrap_or("");
        println!(
            "{}  {}  {}  {}  {}",
            note.id,
            note.created_at.format("%Y-%m-%d %H:%M"),
            note.user_id,
            date,
            preview
        );
    }
    Ok(ExitCode::SUCCESS)
}

async fn run_delete(
    ctx: NoteContext,
    id: NoteId,
    user: UserId,
    store: Arc<SqliteStore>,
) -> Result<ExitCode> {
    match NoteLifecycle::new(store).delete(&ctx, id, &user).await {
        Ok(()) => {
            println!("Deleted {}", id);
            Ok(ExitCode::SUCCESS)
        }
        Err(DeleteError::PermissionDenied(_)) => {
            eprintln!("You do not have permission to delete note {}", id);
            Ok(ExitCode::from(2))
        }
        Err(e) => Err(e).with_context(|| format!("Failed to delete note {}, try again", id)),
    }
}
