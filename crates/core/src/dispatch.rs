//! Bot command routing.
//!
//! Inbound bot updates are parsed into a [`Command`] and routed by
//! [`dispatch`], which returns the [`Reply`] to send. Parsing never touches
//! the store; dispatch has no side effects beyond the service calls it makes.

use std::fmt::Write as _;

use checkpoint_storage::StorageBackend;
use chrono::{DateTime, Utc};

use crate::{
    error::{CheckpointError, ErrorKind},
    ledger::{Action, Event, EventJournal},
    service::{CheckInService, OFFICE_LOCATION, REMOTE_LOCATION},
};

const CHECKIN_PREFIX: &str = "checkin:";
const CHECKOUT_PREFIX: &str = "checkout:";
const REMOTE_START: &str = "remote_start";
const REMOTE_END: &str = "remote_end";

const HELP: &str = "Scan the QR code at the terminal to check in or out.\n\
                    /status - where you are checked in\n\
                    /who - who is here now\n\
                    /my_last - your last event\n\
                    /remote_start - start remote work\n\
                    /remote_end - end remote work";

/// A parsed bot request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// A scanned token link was opened.
    Start {
        /// Token id from the link.
        token: String,
    },
    /// Check in with a scanned token.
    Enter {
        /// Token id.
        token: String,
        /// Where.
        location: String,
    },
    /// Check out with a scanned token.
    Exit {
        /// Token id.
        token: String,
        /// Where.
        location: String,
    },
    /// List the sender's open sessions.
    Status,
    /// List everyone checked in.
    WhoIsHere,
    /// Show the sender's last event.
    LastEvent,
    /// Start remote work.
    RemoteStart,
    /// End remote work.
    RemoteEnd,
    /// Show usage.
    Help,
}

impl Command {
    /// Parses an inline button payload.
    #[must_use]
    pub fn parse_callback(data: &str) -> Option<Self> {
        let token = |rest: &str| (!rest.is_empty()).then(|| rest.to_owned());

        if let Some(rest) = data.strip_prefix(CHECKIN_PREFIX) {
            return token(rest).map(|token| Self::Enter { token, location: OFFICE_LOCATION.into() });
        }
        if let Some(rest) = data.strip_prefix(CHECKOUT_PREFIX) {
            return token(rest).map(|token| Self::Exit { token, location: OFFICE_LOCATION.into() });
        }
        match data {
            REMOTE_START => Some(Self::RemoteStart),
            REMOTE_END => Some(Self::RemoteEnd),
            _ => None,
        }
    }

    /// Parses a text message.
    #[must_use]
    pub fn parse_text(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let command = parts.next()?;
        // Group chats address commands as `/cmd@bot_name`.
        let command = command.split('@').next().unwrap_or(command);

        match command {
            "/start" => Some(match parts.next() {
                Some(token) => Self::Start { token: token.to_owned() },
                None => Self::Help,
            }),
            "/help" => Some(Self::Help),
            "/status" => Some(Self::Status),
            "/who" | "/who_here" => Some(Self::WhoIsHere),
            "/my_last" => Some(Self::LastEvent),
            "/remote_start" => Some(Self::RemoteStart),
            "/remote_end" => Some(Self::RemoteEnd),
            _ => None,
        }
    }
}

/// An inline button attached to a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    /// Label shown to the user.
    pub label: String,
    /// Payload returned through [`Command::parse_callback`].
    pub callback: String,
}

impl Button {
    fn new(label: &str, callback: String) -> Self {
        Self { label: label.to_owned(), callback }
    }
}

/// Message to send back to the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Message body.
    pub text: String,
    /// Inline buttons, possibly none.
    pub buttons: Vec<Button>,
}

impl Reply {
    /// A reply without buttons.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: text.into(), buttons: Vec::new() }
    }

    fn failure(err: &CheckpointError) -> Self {
        if err.kind() == ErrorKind::Internal {
            tracing::error!(error = %err, "Bot command failed");
        }
        Self::text(err.user_message())
    }
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn location_label(location: &str) -> &str {
    match location {
        OFFICE_LOCATION => "office",
        REMOTE_LOCATION => "remote",
        other => other,
    }
}

fn confirmation(event: &Event) -> Reply {
    let verb = match event.action {
        Action::Enter => "Checked in",
        Action::Exit => "Checked out",
    };
    Reply::text(format!(
        "{verb} ({}) at {}",
        location_label(&event.location),
        format_time(event.timestamp)
    ))
}

/// Routes `command` from `sender` and returns the reply.
///
/// `sender` is the bot's stable user id. It is both the person recorded in
/// the ledger and the client key for rate limiting.
#[tracing::instrument(skip(service))]
pub async fn dispatch<S, J>(service: &CheckInService<S, J>, sender: &str, command: Command) -> Reply
where
    S: StorageBackend,
    J: EventJournal,
{
    match command {
        Command::Start { token } => match service.inspect_token(&token).await {
            Ok(_) => Reply {
                text: "Token accepted. Choose an action:".to_owned(),
                buttons: vec![
                    Button::new("Check in", format!("{CHECKIN_PREFIX}{token}")),
                    Button::new("Check out", format!("{CHECKOUT_PREFIX}{token}")),
                ],
            },
            Err(e) => Reply::failure(&e),
        },
        Command::Enter { token, location } => {
            submit(service, sender, &token, &location, Action::Enter).await
        },
        Command::Exit { token, location } => {
            submit(service, sender, &token, &location, Action::Exit).await
        },
        Command::Status => match service.status(sender).await {
            Ok(open) if open.is_empty() => Reply::text("You are not checked in anywhere."),
            Ok(open) => {
                let places: Vec<&str> = open.iter().map(|l| location_label(l)).collect();
                Reply::text(format!("Checked in: {}", places.join(", ")))
            },
            Err(e) => Reply::failure(&e),
        },
        Command::WhoIsHere => match service.who_is_here().await {
            Ok(present) if present.is_empty() => Reply::text("Nobody is checked in right now."),
            Ok(present) => {
                let mut text = String::from("Checked in now:\n");
                for p in present {
                    let _ = writeln!(
                        text,
                        "{} ({}) since {}",
                        p.person,
                        location_label(&p.location),
                        format_time(p.since)
                    );
                }
                Reply::text(text.trim_end())
            },
            Err(e) => Reply::failure(&e),
        },
        Command::LastEvent => match service.last_event(sender).await {
            Ok(Some(event)) => confirmation(&event),
            Ok(None) => Reply::text("You have no events yet."),
            Err(e) => Reply::failure(&e),
        },
        Command::RemoteStart => match service.remote_start(sender).await {
            Ok(event) => confirmation(&event),
            Err(e) if e.kind() == ErrorKind::EventConflict => {
                Reply::text("Finish your current session before starting remote work.")
            },
            Err(e) => Reply::failure(&e),
        },
        Command::RemoteEnd => match service.remote_end(sender).await {
            Ok(event) => confirmation(&event),
            Err(e) if e.kind() == ErrorKind::EventConflict => {
                Reply::text("You have no open remote session.")
            },
            Err(e) => Reply::failure(&e),
        },
        Command::Help => Reply::text(HELP),
    }
}

async fn submit<S, J>(
    service: &CheckInService<S, J>,
    sender: &str,
    token: &str,
    location: &str,
    action: Action,
) -> Reply
where
    S: StorageBackend,
    J: EventJournal,
{
    match service.submit_with_token(sender, token, sender, location, action).await {
        Ok(event) => confirmation(&event),
        Err(e) => Reply::failure(&e),
    }
}
