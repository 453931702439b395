use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

use client_core::{
    AuthState, DurableDocumentStore, DurableIdentityProvider, EventSynchronizer, OperationOutcome,
    SessionManager,
};
use shared::domain::EventId;
use storage::Storage;

mod config;

/// How long a Succeeded outcome stays on screen before it is reset. A
/// presentation-layer convention only; the synchronizer itself has no timers.
const SUCCESS_DISPLAY: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
struct Args {
    /// Overrides the configured database URL.
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(url) = args.database_url {
        settings.database_url = url;
    }

    let storage = Storage::new(&settings.database_url)
        .await
        .with_context(|| format!("failed to open {}", settings.database_url))?;
    storage.health_check().await.context("database health check")?;

    let manager =
        SessionManager::initialize(Arc::new(DurableIdentityProvider::new(storage.clone()))).await;
    let store: Arc<dyn client_core::DocumentStore> =
        Arc::new(DurableDocumentStore::new(storage.clone()));
    let sync = EventSynchronizer::new(store, manager.identity());

    // Initial route: a restored session goes straight to the event view.
    match manager.current_identity() {
        Some(user) => {
            let email = storage
                .email_for_user(&user)
                .await?
                .unwrap_or_else(|| user.to_string());
            println!("signed in as {email}");
            sync.start().await;
        }
        None => println!("not signed in - use `login` or `register` (type `help` for commands)"),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    print!("> ");
    use std::io::Write as _;
    std::io::stdout().flush().ok();
    while let Some(line) = lines.next_line().await? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [] => {}
            ["help"] => print_help(),
            ["quit"] | ["exit"] => break,
            ["register", email, password, confirm] => {
                manager.register(email, password, confirm).await;
                if render_auth_state(&manager) {
                    sync.reinitialize_listener().await;
                }
            }
            ["login", email, password] => {
                manager.login(email, password).await;
                if render_auth_state(&manager) {
                    sync.reinitialize_listener().await;
                }
            }
            ["logout"] => {
                manager.logout().await;
                sync.reinitialize_listener().await;
                println!("signed out");
            }
            ["list"] => render_events(&sync),
            ["reload"] => {
                sync.reload_events().await;
                println!("reloading...");
            }
            ["add", date, rest @ ..] if !rest.is_empty() => match parse_date(date) {
                Ok(date) => {
                    let (title, description) = split_title_description(rest);
                    sync.create_event(&title, date, &description).await;
                    render_outcome(&sync);
                }
                Err(err) => println!("bad date: {err}"),
            },
            ["edit", id, date, rest @ ..] if !rest.is_empty() => match parse_date(date) {
                Ok(date) => {
                    let (title, description) = split_title_description(rest);
                    sync.update_event(&EventId::new(*id), &title, date, &description)
                        .await;
                    render_outcome(&sync);
                }
                Err(err) => println!("bad date: {err}"),
            },
            ["rm", id] => {
                sync.delete_event(&EventId::new(*id)).await;
                render_outcome(&sync);
            }
            _ => println!("unrecognized command (type `help`)"),
        }
        print!("> ");
        std::io::stdout().flush().ok();
    }

    sync.shutdown().await;
    info!("desktop: shutting down");
    Ok(())
}

fn print_help() {
    println!("commands:");
    println!("  register <email> <password> <confirm>");
    println!("  login <email> <password>");
    println!("  logout");
    println!("  list");
    println!("  add <date> <title words...> [-- description words...]");
    println!("  edit <id> <date> <title words...> [-- description words...]");
    println!("  rm <id>");
    println!("  reload");
    println!("  quit");
    println!("dates: 2026-09-01T18:00:00Z, '2026-09-01', or unix seconds");
}

/// Prints the current auth state; returns true when authenticated so the
/// caller can re-scope the event listener to the new identity.
fn render_auth_state(manager: &SessionManager) -> bool {
    let state = manager.auth_state().borrow().clone();
    match state {
        AuthState::Idle => {
            println!("signed out");
            false
        }
        AuthState::Loading => {
            println!("...");
            false
        }
        AuthState::Authenticated => {
            println!("signed in");
            true
        }
        AuthState::Error(message) => {
            println!("error: {message}");
            // Navigating on: the stale error must not reappear.
            manager.reset_auth_state();
            false
        }
    }
}

fn render_events(sync: &Arc<EventSynchronizer>) {
    if *sync.is_loading().borrow() {
        println!("(loading...)");
        return;
    }
    let events = sync.events().borrow().clone();
    if events.is_empty() {
        println!("no events");
        return;
    }
    for event in &events {
        println!(
            "{}  {}  {}{}",
            event.id,
            event.date.format("%Y-%m-%d %H:%M"),
            event.title,
            if event.description.is_empty() {
                String::new()
            } else {
                format!("  - {}", event.description)
            }
        );
    }
}

fn render_outcome(sync: &Arc<EventSynchronizer>) {
    let outcome = sync.operation_state().borrow().clone();
    match outcome {
        OperationOutcome::Idle => {}
        OperationOutcome::InProgress => println!("working..."),
        OperationOutcome::Succeeded(message) => {
            println!("ok: {message}");
            let sync = Arc::clone(sync);
            tokio::spawn(async move {
                tokio::time::sleep(SUCCESS_DISPLAY).await;
                sync.reset_operation_state();
            });
        }
        OperationOutcome::Failed(message) => {
            println!("failed: {message}");
            sync.reset_operation_state();
        }
    }
}

fn split_title_description(words: &[&str]) -> (String, String) {
    match words.iter().position(|word| *word == "--") {
        Some(split) => (words[..split].join(" "), words[split + 1..].join(" ")),
        None => (words.join(" "), String::new()),
    }
}

fn parse_date(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M") {
        return Ok(Utc.from_utc_datetime(&parsed));
    }
    if let Ok(parsed) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let midnight = parsed.and_hms_opt(0, 0, 0).context("invalid date")?;
        return Ok(Utc.from_utc_datetime(&midnight));
    }
    if let Ok(seconds) = raw.parse::<i64>() {
        return Utc
            .timestamp_opt(seconds, 0)
            .single()
            .context("timestamp out of range");
    }
    anyhow::bail!("expected RFC 3339, YYYY-MM-DD, or unix seconds: {raw}")
}
