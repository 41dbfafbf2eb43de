//! Line commands of the `edit` subcommand.
//!
//! Each stdin line is a command (`:quit`, `:show`, `:new`) or the full new
//! note text with `\n` escapes. Save and replication errors are reported and
//! editing carries on with the text kept in the session.

use note_sync::{EditingSession, NoteStore};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Quit,
    Show,
    /// Save the note and start a fresh one
    New,
    /// Replace the note text
    Replace(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Self {
        match line.trim() {
            ":quit" => Self::Quit,
            ":show" => Self::Show,
            ":new" => Self::New,
            _ => Self::Replace(line.replace("\\n", "\n")),
        }
    }
}

/// Whether the edit loop keeps reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Note text on one line
pub fn escape(content: &str) -> String {
    content.replace('\n', "\\n")
}

/// Run one command against the open session.
pub async fn apply<S: NoteStore + 'static>(
    session: &EditingSession<S>,
    command: ConsoleCommand,
) -> Flow {
    match command {
        ConsoleCommand::Quit => return Flow::Quit,
        ConsoleCommand::Show => println!("{}", escape(&session.content())),
        ConsoleCommand::New => match session.save_and_start_new().await {
            Ok(Some(id)) => eprintln!("-- saved {}", id),
            Ok(None) => eprintln!("-- nothing to save"),
            Err(e) => {
                warn!("Save & start new failed for {}: {}", session.context(), e);
                eprintln!("-- could not save, the note is kept: {}", e);
            }
        },
        ConsoleCommand::Replace(text) => {
            if let Err(e) = session.type_text(&text) {
                warn!("Edit of {} not applied: {}", session.context(), e);
                eprintln!("-- edit not applied: {}", e);
            }
        }
    }
    Flow::Continue
}
