//! Console chat client.
//!
//! Joins a project, runs the polling synchronizer in a background task, and
//! interleaves its updates with a stdin command loop. Messages typed here are
//! NOT echoed locally before the server round-trip — the sync loop is the
//! single source of message state, which keeps duplicates out.
//!
//! Commands: `/doc` print the plan, `/save [file]` export it, `/status`
//! project status, `/users` active users, `/quit` leave and exit.

use std::sync::Arc;

use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;

use crate::client::{ApiClient, ChatSender, SessionContext};
use crate::config::Config;
use crate::error::{PlanroomError, Result};
use crate::sync::{new_shared_state, SharedClientState, SyncOutcome, Synchronizer};

const DEFAULT_EXPORT_FILE: &str = "project_plan.md";

/// Run the interactive console client until `/quit` or stdin closes.
pub async fn run(config: &Config, project_id: &str, user_name: Option<String>) -> Result<()> {
    let client = Arc::new(ApiClient::new(&config.server_url));
    let ctx = SessionContext::new(project_id, user_name);

    let joined = client.join(&ctx).await?;
    println!("{}", "PLANROOM".bright_cyan().bold());
    println!(
        "{}: {}  {}: {}",
        "Project".bright_yellow(),
        joined.project_id.bright_white(),
        "Session".bright_yellow(),
        &joined.session_id[..8]
    );
    println!("{}", "Type a message, or /doc /save /status /users /quit".bright_blue());
    println!("{}", "=".repeat(50).bright_blue());

    let state = new_shared_state();
    let (outcome_tx, mut outcome_rx) = mpsc::unbounded_channel();
    let (nudge_tx, nudge_rx) = mpsc::unbounded_channel();
    let synchronizer = Synchronizer::builder(Arc::clone(&client), project_id)
        .poll_interval(std::time::Duration::from_millis(config.poll_interval_ms))
        .build();
    let sync_task = tokio::spawn(synchronizer.run(state.clone(), outcome_tx, nudge_rx));

    let sender = ChatSender::new();
    let mut printed = 0usize;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            outcome = outcome_rx.recv() => {
                match outcome {
                    Some(outcome) => printed = render_outcome(&state, &outcome, printed, &ctx.session_id),
                    None => break,
                }
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line == "/quit" {
                    break;
                }
                if let Some(rest) = line.strip_prefix('/') {
                    handle_command(&client, &state, project_id, rest).await;
                    continue;
                }

                match sender.send(&client, &ctx, &line).await {
                    Ok(_) => {
                        // The reply lands via the sync loop; nudge it so the
                        // next poll runs right after the send settles.
                        let _ = nudge_tx.send(());
                    }
                    Err(PlanroomError::SendInFlight) => {
                        println!("{}", "Still waiting on the previous message...".bright_yellow());
                    }
                    Err(e) => {
                        warn!(error = %e, "chat send failed");
                        println!(
                            "{} {}",
                            "assistant:".bright_green(),
                            "Sorry, I encountered an error processing your message. Please try again."
                        );
                    }
                }
            }
        }
    }

    // Best-effort sign-out: failures are logged and swallowed, local state is
    // dropped regardless.
    if let Err(e) = client.leave(&ctx).await {
        warn!(error = %e, "leave failed during sign-out");
    }
    sync_task.abort();
    println!("{}", "Left project. Goodbye!".bright_blue());
    Ok(())
}

/// Print whatever the reconciliation pass changed. Returns the new count of
/// printed messages.
fn render_outcome(
    state: &SharedClientState,
    outcome: &SyncOutcome,
    mut printed: usize,
    own_session_id: &str,
) -> usize {
    let Ok(guard) = state.lock() else {
        return printed;
    };
    match outcome {
        SyncOutcome::Replaced { .. } => {
            // Wholesale replacement can shrink the list (project cleared);
            // start over in that case.
            if guard.messages.len() < printed {
                printed = 0;
            }
            for msg in &guard.messages[printed..] {
                let label = match msg.role.as_str() {
                    "assistant" => "assistant:".bright_green(),
                    _ => {
                        let name = msg.user_name.as_deref().unwrap_or("user");
                        if msg.session_id.as_deref() == Some(own_session_id) {
                            format!("{} (you):", name).bright_cyan()
                        } else {
                            format!("{}:", name).bright_cyan()
                        }
                    }
                };
                println!("{} {}", label, msg.content);
            }
            guard.messages.len()
        }
        SyncOutcome::DocumentChanged => {
            println!(
                "{}",
                format!(
                    "[project plan updated, {} chars — /doc to view]",
                    guard.document.len()
                )
                .bright_magenta()
            );
            printed
        }
        SyncOutcome::ActiveUsersChanged => {
            let names: Vec<String> = guard
                .active_users
                .iter()
                .map(|u| {
                    u.user_name
                        .clone()
                        .unwrap_or_else(|| u.session_id[..8.min(u.session_id.len())].to_string())
                })
                .collect();
            println!(
                "{}",
                format!("[{} active: {}]", names.len(), names.join(", ")).bright_blue()
            );
            printed
        }
        SyncOutcome::Unchanged => printed,
    }
}

async fn handle_command(
    client: &ApiClient,
    state: &SharedClientState,
    project_id: &str,
    command: &str,
) {
    let mut parts = command.splitn(2, ' ');
    let name = parts.next().unwrap_or("");
    let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match name {
        "doc" => {
            let document = state.lock().map(|s| s.document.clone()).unwrap_or_default();
            println!("{}", "=".repeat(50).bright_blue());
            println!("{}", document);
            println!("{}", "=".repeat(50).bright_blue());
        }
        "save" => {
            // Client-side export; no server endpoint is involved.
            let path = arg.unwrap_or(DEFAULT_EXPORT_FILE);
            let document = state.lock().map(|s| s.document.clone()).unwrap_or_default();
            match std::fs::write(path, &document) {
                Ok(()) => println!("{}", format!("Saved document to {}", path).bright_green()),
                Err(e) => println!("{}", format!("Could not save document: {}", e).bright_red()),
            }
        }
        "status" => match client.project_status(project_id).await {
            Ok(status) => {
                println!(
                    "{}: {} active, document {} chars",
                    status.project_id.bright_white(),
                    status.active_users.len(),
                    status.document_length
                );
            }
            Err(e) => println!("{}", format!("Status unavailable: {}", e).bright_red()),
        },
        "users" => {
            let users = state.lock().map(|s| s.active_users.clone()).unwrap_or_default();
            for user in &users {
                println!(
                    "  {} {}",
                    user.session_id[..8.min(user.session_id.len())].bright_yellow(),
                    user.user_name.as_deref().unwrap_or("(anonymous)")
                );
            }
            if users.is_empty() {
                println!("  (no active users)");
            }
        }
        _ => {
            println!(
                "{}",
                "Commands: /doc /save [file] /status /users /quit".bright_yellow()
            );
        }
    }
}
