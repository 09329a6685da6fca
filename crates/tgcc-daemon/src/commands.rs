//! Chat command surface: the closed command set plus the inline-button
//! callback ids that mirror it.

use std::sync::Arc;

use tgcc_agent::process::ResumeMode;
use tgcc_core::types::PermissionMode;
use tgcc_telegram::html::escape_html;

use crate::bridge::AgentBridge;

/// Everything a user can type at the bot, parsed from `/cmd args`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Start,
    Help,
    Ping,
    Status,
    Cost,
    New,
    Continue,
    Sessions,
    Resume(String),
    Session,
    Model(Option<String>),
    Repo(Vec<String>),
    Cancel,
    Compact(Option<String>),
    Catchup,
    Permissions(Option<String>),
}

/// Menu published via `setMyCommands` and printed by /help.
pub const COMMAND_MENU: &[(&str, &str)] = &[
    ("start", "Greeting and current session summary"),
    ("help", "Show this help"),
    ("ping", "Check the daemon and process state"),
    ("status", "Agent, session, model, repo, cost"),
    ("cost", "Accumulated session cost"),
    ("new", "Start a fresh session"),
    ("continue", "Restart keeping the current session"),
    ("sessions", "List recent sessions with resume buttons"),
    ("resume", "Resume a session by id"),
    ("session", "Show current session info"),
    ("model", "Show or switch the model"),
    ("repo", "Manage or switch the working repo"),
    ("cancel", "Interrupt the current turn"),
    ("compact", "Compact the conversation context"),
    ("catchup", "Where to find past sessions"),
    ("permissions", "Set the permission mode"),
];

/// Parse `/cmd[@botname] args`. Returns `None` for non-commands and
/// unknown commands (which fall through to the assistant).
pub fn parse(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    let rest = trimmed.strip_prefix('/')?;
    let (head, args) = match rest.split_once(char::is_whitespace) {
        Some((head, args)) => (head, args.trim()),
        None => (rest, ""),
    };
    // `/status@mybot` in groups.
    let name = head.split('@').next().unwrap_or(head).to_lowercase();

    let command = match name.as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "ping" => Command::Ping,
        "status" => Command::Status,
        "cost" => Command::Cost,
        "new" => Command::New,
        "continue" => Command::Continue,
        "sessions" => Command::Sessions,
        "resume" => {
            if args.is_empty() {
                Command::Sessions
            } else {
                Command::Resume(args.to_string())
            }
        }
        "session" => Command::Session,
        "model" => Command::Model((!args.is_empty()).then(|| args.to_string())),
        "repo" => Command::Repo(args.split_whitespace().map(String::from).collect()),
        "cancel" => Command::Cancel,
        "compact" => Command::Compact((!args.is_empty()).then(|| args.to_string())),
        "catchup" => Command::Catchup,
        "permissions" => Command::Permissions((!args.is_empty()).then(|| args.to_string())),
        _ => return None,
    };
    Some(command)
}

/// Models offered by the chooser. The CLI accepts aliases directly.
const MODEL_CHOICES: &[&str] = &["opus", "sonnet", "haiku"];

pub async fn execute(bridge: &Arc<AgentBridge>, chat_id: i64, user_id: i64, command: Command) {
    let sink = bridge.sink();
    match command {
        Command::Start => {
            let status = bridge.status_text(user_id).await;
            let text = format!("👋 This bridge relays your messages to the assistant.\n\n{status}\n\nSee /help for commands.");
            let _ = sink.send_message(chat_id, &text).await;
        }
        Command::Help => {
            let mut text = String::from("<b>Commands</b>\n");
            for (name, description) in COMMAND_MENU {
                text.push_str(&format!("/{name} — {description}\n"));
            }
            let _ = sink.send_message(chat_id, &text).await;
        }
        Command::Ping => {
            let _ = sink.send_message(chat_id, &bridge.ping_text().await).await;
        }
        Command::Status => {
            let _ = sink
                .send_message(chat_id, &bridge.status_text(user_id).await)
                .await;
        }
        Command::Cost => {
            let _ = sink.send_message(chat_id, &bridge.cost_text().await).await;
        }
        Command::New => {
            bridge.new_session().await;
            let _ = sink
                .send_message(chat_id, "🆕 Session cleared. Your next message starts fresh.")
                .await;
        }
        Command::Continue => {
            bridge.continue_session().await;
            let _ = sink
                .send_message(
                    chat_id,
                    "🔄 Process stopped; the next message resumes the same session.",
                )
                .await;
        }
        Command::Sessions => {
            let sessions = bridge.discover_sessions(user_id, 5).await;
            if sessions.is_empty() {
                let _ = sink
                    .send_message(chat_id, "No sessions found for the current repo.")
                    .await;
                return;
            }
            let mut text = String::from("<b>Recent sessions</b>\n");
            let mut buttons = Vec::new();
            for session in &sessions {
                let title = session.title.as_deref().unwrap_or("(untitled)");
                let fill = session
                    .context_pct
                    .map(|p| format!(" · {p}% ctx"))
                    .unwrap_or_default();
                text.push_str(&format!(
                    "<code>{}</code> — {}{fill}\n",
                    session.short_id(),
                    escape_html(title)
                ));
                buttons.push((
                    format!("↩ {}", session.short_id()),
                    format!("resume:{}", session.id),
                ));
            }
            let _ = sink.send_with_buttons(chat_id, &text, &buttons).await;
        }
        Command::Resume(id) => {
            bridge
                .set_pending_resume(Some(ResumeMode::SessionId(id.clone())))
                .await;
            bridge.kill_process().await;
            let _ = sink
                .send_message(
                    chat_id,
                    &format!(
                        "↩ Will resume <code>{}</code> on your next message.",
                        escape_html(&id)
                    ),
                )
                .await;
        }
        Command::Session => {
            let status = bridge.process_status().await;
            let text = match status.and_then(|s| s.session_id) {
                Some(session) => format!("Current session: <code>{}</code>", escape_html(&session)),
                None => match bridge.pending_resume().await {
                    Some(ResumeMode::SessionId(id)) => {
                        format!("Pending resume: <code>{}</code>", escape_html(&id))
                    }
                    Some(ResumeMode::Continue) => "Pending: continue most recent session.".into(),
                    None => "No active session.".into(),
                },
            };
            let _ = sink.send_message(chat_id, &text).await;
        }
        Command::Model(None) => {
            let (model, _, _) = bridge.session_settings().await;
            let current = model.unwrap_or_else(|| "default".to_string());
            let buttons: Vec<(String, String)> = MODEL_CHOICES
                .iter()
                .map(|m| (m.to_string(), format!("model:{m}")))
                .collect();
            let _ = sink
                .send_with_buttons(
                    chat_id,
                    &format!("Current model: <b>{}</b>. Pick one:", escape_html(&current)),
                    &buttons,
                )
                .await;
        }
        Command::Model(Some(model)) => {
            bridge.set_model(Some(model.clone())).await;
            let _ = sink
                .send_message(
                    chat_id,
                    &format!(
                        "Model set to <b>{}</b>; takes effect on the next message.",
                        escape_html(&model)
                    ),
                )
                .await;
        }
        Command::Repo(args) => {
            handle_repo(bridge, chat_id, user_id, &args).await;
        }
        Command::Cancel => {
            if bridge.is_active().await {
                bridge.cancel().await;
                let _ = sink.send_message(chat_id, "⏹ Interrupted.").await;
            } else {
                let _ = sink.send_message(chat_id, "Nothing to cancel.").await;
            }
        }
        Command::Compact(hint) => {
            bridge.compact(hint.as_deref()).await;
        }
        Command::Catchup => {
            let _ = sink
                .send_message(chat_id, "Use /sessions to browse and resume past sessions.")
                .await;
        }
        Command::Permissions(None) => {
            let buttons: Vec<(String, String)> = ["default", "accept-edits", "plan", "skip"]
                .iter()
                .map(|m| (m.to_string(), format!("permissions:{m}")))
                .collect();
            let _ = sink
                .send_with_buttons(chat_id, "Pick a permission mode:", &buttons)
                .await;
        }
        Command::Permissions(Some(mode)) => match PermissionMode::parse(&mode) {
            Some(mode) => {
                bridge.set_permission_mode(Some(mode)).await;
                let _ = sink
                    .send_message(
                        chat_id,
                        &format!(
                            "Permission mode <b>{}</b>; takes effect on the next message.",
                            mode.as_str()
                        ),
                    )
                    .await;
            }
            None => {
                let _ = sink
                    .send_message(chat_id, "Unknown mode. Use default, accept-edits, plan or skip.")
                    .await;
            }
        },
    }
}

/// `/repo` subcommands: bare = show, `list`, `add <name> <path>`,
/// `remove <name>`, `<name-or-path>` = switch.
async fn handle_repo(bridge: &Arc<AgentBridge>, chat_id: i64, user_id: i64, args: &[String]) {
    let sink = bridge.sink();
    match args.first().map(String::as_str) {
        None => {
            let current = bridge
                .resolve_workdir(user_id)
                .await
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "unset".to_string());
            let _ = sink
                .send_message(
                    chat_id,
                    &format!(
                        "Current repo: <code>{}</code>\nSwitch with /repo &lt;name-or-path&gt;.",
                        escape_html(&current)
                    ),
                )
                .await;
        }
        Some("list") => {
            // The named registry is config-owned; show what this bridge
            // resolved at startup.
            let config = bridge.config();
            let text = format!(
                "Configured repo: <code>{}</code>\nNamed repos come from the config file.",
                escape_html(config.repo.as_deref().unwrap_or("unset"))
            );
            let _ = sink.send_message(chat_id, &text).await;
        }
        Some("clear") => {
            bridge.set_repo(None).await;
            let _ = sink
                .send_message(chat_id, "Repo override cleared; back to the configured default.")
                .await;
        }
        Some("add") | Some("remove") | Some("assign") => {
            // The named registry lives in the config file; the daemon only
            // consumes the validated snapshot.
            let _ = sink
                .send_message(
                    chat_id,
                    "The named-repo registry is managed in the config file; edit it and reload.",
                )
                .await;
        }
        Some(reference) => {
            bridge.set_repo(Some(reference.to_string())).await;
            let _ = sink
                .send_message(
                    chat_id,
                    &format!(
                        "Repo switched to <code>{}</code>; the process was stopped and respawns on the next message.",
                        escape_html(reference)
                    ),
                )
                .await;
        }
    }
}

/// Inline button callbacks: `resume:<id>`, `repo:<name>`, `model:<name>`,
/// `permissions:<mode>`, `perm_allow:<reqId>`, `perm_deny:<reqId>`,
/// `perm_allow_all:<agentId>`.
pub async fn handle_callback(bridge: &Arc<AgentBridge>, chat_id: i64, user_id: i64, data: &str) {
    let sink = bridge.sink();
    let Some((kind, value)) = data.split_once(':') else {
        return;
    };
    match kind {
        "resume" => {
            execute(bridge, chat_id, user_id, Command::Resume(value.to_string())).await;
        }
        "repo" => {
            execute(
                bridge,
                chat_id,
                user_id,
                Command::Repo(vec![value.to_string()]),
            )
            .await;
        }
        "model" => {
            execute(bridge, chat_id, user_id, Command::Model(Some(value.to_string()))).await;
        }
        "permissions" => {
            execute(
                bridge,
                chat_id,
                user_id,
                Command::Permissions(Some(value.to_string())),
            )
            .await;
        }
        "perm_allow" => {
            if bridge.answer_permission(value, true).await {
                let _ = sink.send_message(chat_id, "✅ Allowed.").await;
            }
        }
        "perm_deny" => {
            if bridge.answer_permission(value, false).await {
                let _ = sink.send_message(chat_id, "❌ Denied.").await;
            }
        }
        "perm_allow_all" => {
            let count = bridge.answer_all_permissions().await;
            let _ = sink
                .send_message(chat_id, &format!("✅ Allowed {count} pending request(s)."))
                .await;
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_commands() {
        assert_eq!(parse("/status"), Some(Command::Status));
        assert_eq!(parse("/new"), Some(Command::New));
        assert_eq!(parse("/cancel"), Some(Command::Cancel));
    }

    #[test]
    fn parses_bot_suffix() {
        assert_eq!(parse("/status@tgcc_bot"), Some(Command::Status));
    }

    #[test]
    fn parses_arguments() {
        assert_eq!(
            parse("/resume abc-123"),
            Some(Command::Resume("abc-123".to_string()))
        );
        assert_eq!(parse("/model opus"), Some(Command::Model(Some("opus".into()))));
        assert_eq!(parse("/model"), Some(Command::Model(None)));
        assert_eq!(
            parse("/compact keep the DB schema details"),
            Some(Command::Compact(Some("keep the DB schema details".into())))
        );
        assert_eq!(
            parse("/repo add work /srv/work"),
            Some(Command::Repo(vec![
                "add".into(),
                "work".into(),
                "/srv/work".into()
            ]))
        );
    }

    #[test]
    fn resume_without_id_lists_sessions() {
        assert_eq!(parse("/resume"), Some(Command::Sessions));
    }

    #[test]
    fn non_commands_fall_through() {
        assert_eq!(parse("hello"), None);
        assert_eq!(parse("/unknowncmd"), None);
        assert_eq!(parse("//weird"), None);
    }
}
