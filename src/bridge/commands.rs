//! Telegram bot commands.
//!
//! Commands are honored only in one-to-one chats and only for users admitted by the
//! [`AccessPolicy`]. Group-chat messages are ignored without a reply.
//!
//! Supported commands:
//!
//! - `/start` - welcome text
//! - `/help` - command list
//! - `/status` - live state of the source broker and each proxy target, plus counters
//! - `/info` - configured group chat, allow-list and proxy target names

use log::{debug, info, trace, warn};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

use super::access::AccessPolicy;
use crate::mesh::NodeCache;
use crate::metrics;
use crate::mqtt::proxy::ProxyHandle;
use crate::mqtt::ConnectionState;

pub const DENIED_TEXT: &str =
    "Access denied. You are not on this bot's allow-list; ask the administrator for access.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    Start,
    Help,
    Status,
    Info,
    /// Looks like a command but is not one we know.
    Unknown(String),
}

/// Recognizes `/command` and `/command@botname` at the start of a message.
#[derive(Debug, Clone, Default)]
pub struct BotCommandParser {
    bot_username: Option<String>,
}

impl BotCommandParser {
    pub fn new(bot_username: Option<String>) -> Self {
        Self {
            bot_username: bot_username.map(|u| u.trim_start_matches('@').to_ascii_lowercase()),
        }
    }

    /// `None` for plain text or commands addressed to another bot.
    pub fn parse(&self, raw: &str) -> Option<BotCommand> {
        let word = raw.split_whitespace().next()?;
        let body = word.strip_prefix('/')?;
        if body.is_empty() {
            return None;
        }
        let name = match body.split_once('@') {
            Some((name, target)) => {
                if let Some(me) = &self.bot_username {
                    if !target.eq_ignore_ascii_case(me) {
                        trace!("ignoring command for @{}", target);
                        return None;
                    }
                }
                name
            }
            None => body,
        };
        Some(match name.to_ascii_lowercase().as_str() {
            "start" => BotCommand::Start,
            "help" => BotCommand::Help,
            "status" => BotCommand::Status,
            "info" => BotCommand::Info,
            other => BotCommand::Unknown(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatKind {
    Private,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Response(String),
    Denied(String),
}

impl CommandOutcome {
    pub fn text(&self) -> &str {
        match self {
            CommandOutcome::Response(t) | CommandOutcome::Denied(t) => t,
        }
    }
}

/// Live state the `/status` command reports on.
#[derive(Clone)]
pub struct StatusProbe {
    pub source: watch::Receiver<ConnectionState>,
    pub proxy: ProxyHandle,
    pub cache: Arc<NodeCache>,
    pub stale_after: chrono::Duration,
    pub started: Instant,
}

pub struct CommandDispatcher {
    policy: AccessPolicy,
    parser: BotCommandParser,
    group_chat_id: Option<i64>,
    probe: StatusProbe,
}

impl CommandDispatcher {
    pub fn new(
        policy: AccessPolicy,
        parser: BotCommandParser,
        group_chat_id: Option<i64>,
        probe: StatusProbe,
    ) -> Self {
        Self {
            policy,
            parser,
            group_chat_id,
            probe,
        }
    }

    /// Evaluate one incoming message. `None` means "stay silent".
    pub fn handle(&self, user_id: i64, chat: ChatKind, text: &str) -> Option<CommandOutcome> {
        if chat == ChatKind::Group {
            return None;
        }
        let command = self.parser.parse(text)?;
        if !self.policy.is_allowed(user_id) {
            warn!("command {:?} denied for user_id={}", command, user_id);
            return Some(CommandOutcome::Denied(DENIED_TEXT.to_string()));
        }
        info!("command {:?} from user_id={}", command, user_id);
        let reply = match command {
            BotCommand::Start => self.start_text(),
            BotCommand::Help => help_text(),
            BotCommand::Status => self.status_text(),
            BotCommand::Info => self.info_text(),
            BotCommand::Unknown(name) => {
                debug!("unknown command /{} from user_id={}", name, user_id);
                format!("Unknown command /{}. Send /help for the list of commands.", name)
            }
        };
        Some(CommandOutcome::Response(reply))
    }

    fn start_text(&self) -> String {
        let mut out = String::from(
            "Meshgram bridges a Meshtastic mesh to Telegram.\n\
             Mesh text messages and node updates are relayed here as they arrive.",
        );
        if self.group_chat_id.is_some() {
            out.push_str("\nNotifications are also posted to the configured group chat.");
        }
        out.push_str("\n\nSend /help for the list of commands.");
        out
    }

    fn status_text(&self) -> String {
        let probe = &self.probe;
        let mut out = String::from("Status\n");
        let _ = writeln!(out, "Source broker: {}", *probe.source.borrow());

        let targets = probe.proxy.targets();
        if targets.is_empty() {
            out.push_str("Proxy targets: none configured\n");
        } else {
            let enabled = targets.iter().filter(|t| t.enabled()).count();
            let _ = writeln!(
                out,
                "Proxy targets: {} connected of {} enabled",
                probe.proxy.connected_count(),
                enabled
            );
            for t in targets {
                let state = if t.enabled() {
                    t.state().to_string()
                } else {
                    "disabled".to_string()
                };
                let _ = writeln!(out, "  {}: {}", t.name(), state);
            }
        }

        let now = chrono::Utc::now();
        let _ = writeln!(
            out,
            "Known nodes: {} ({} stale)",
            probe.cache.len(),
            probe.cache.stale_count(probe.stale_after, now)
        );
        let m = metrics::snapshot();
        let _ = writeln!(
            out,
            "MQTT received: {} (parse errors: {})",
            m.mqtt_received, m.parse_errors
        );
        let _ = writeln!(
            out,
            "Telegram sent: {} (edited: {}, failed: {}, dropped: {})",
            m.telegram_sent, m.telegram_edited, m.telegram_failed, m.telegram_dropped
        );
        let _ = writeln!(
            out,
            "Proxy forwarded: {} (dropped: {})",
            m.proxy_forwarded, m.proxy_dropped
        );
        let _ = write!(out, "Uptime: {}s", probe.started.elapsed().as_secs());
        out
    }

    fn info_text(&self) -> String {
        let mut out = String::from("Configuration\n");
        match self.group_chat_id {
            Some(id) => {
                let _ = writeln!(out, "Group chat: {}", id);
            }
            None => out.push_str("Group chat: not configured\n"),
        }
        if self.policy.is_unrestricted() {
            out.push_str("Allowed users: everyone\n");
        } else {
            let ids: Vec<String> = self
                .policy
                .allowed_ids()
                .iter()
                .map(|id| id.to_string())
                .collect();
            let _ = writeln!(out, "Allowed users: {}", ids.join(", "));
        }
        let targets = self.probe.proxy.targets();
        if targets.is_empty() {
            out.push_str("Proxy targets: none");
        } else {
            let names: Vec<String> = targets
                .iter()
                .map(|t| {
                    if t.enabled() {
                        t.name().to_string()
                    } else {
                        format!("{} (disabled)", t.name())
                    }
                })
                .collect();
            let _ = write!(out, "Proxy targets: {}", names.join(", "));
        }
        out
    }
}

fn help_text() -> String {
    "Commands:\n\
     /start - about this bot\n\
     /help - this list\n\
     /status - broker connections and counters\n\
     /info - group chat, allowed users and proxy targets"
        .to_string()
}
