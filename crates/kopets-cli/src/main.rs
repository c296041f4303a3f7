//! kopets - terminal host for the kopets foundation dashboard API.
//!
//! Logs identities in (password + emailed code), keeps several of them side
//! by side, switches between them, and issues raw authenticated requests
//! through the refreshing client.

mod app;

use std::io;

use anyhow::{bail, Result};
use serde_json::Value;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use app::App;
use kopets_core::Method;

const USAGE: &str = "\
Usage: kopets <command> [args]

Commands:
  login [email]                  Log in (password + verification code)
  sessions                       List logged-in sessions (* = active)
  switch <key>                   Activate another session, e.g. REFUGIO_1
  logout [key]                   Log out one session (default: active)
  logout --all                   Log out every session
  whoami                         Show the active session's profile
  request <method> <path> [json] Send an authenticated request

Environment:
  KOPETS_API_URL   API base URL (default http://localhost:8000/api)
  KOPETS_EMAIL     Default login email
  KOPETS_LOG_DIR   Also write daily log files to this directory
  RUST_LOG         Log filter (default warn)";

enum Command {
    Login(Option<String>),
    Sessions,
    Switch(String),
    Logout(Option<String>),
    LogoutAll,
    WhoAmI,
    Request {
        method: Method,
        path: String,
        body: Option<Value>,
    },
}

impl Command {
    fn parse(args: &[String]) -> Result<Self> {
        let arg = |i: usize| args.get(i).map(String::as_str);
        let command = match arg(1) {
            Some("login") => Command::Login(arg(2).map(str::to_string)),
            Some("sessions") => Command::Sessions,
            Some("switch") => match arg(2) {
                Some(key) => Command::Switch(key.to_string()),
                None => bail!("switch needs a session key"),
            },
            Some("logout") => match arg(2) {
                Some("--all") => Command::LogoutAll,
                key => Command::Logout(key.map(str::to_string)),
            },
            Some("whoami") => Command::WhoAmI,
            Some("request") => {
                let (Some(method), Some(path)) = (arg(2), arg(3)) else {
                    bail!("request needs a method and a path");
                };
                let Some(method) = Method::parse(method) else {
                    bail!("unknown HTTP method: {}", method);
                };
                let body = match arg(4) {
                    Some(json) => Some(serde_json::from_str(json)?),
                    None => None,
                };
                Command::Request {
                    method,
                    path: path.to_string(),
                    body,
                }
            }
            _ => bail!("{}", USAGE),
        };
        Ok(command)
    }
}

/// Initialize the tracing subscriber for logging.
///
/// The returned guard must live until exit so file logs get flushed.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var("KOPETS_LOG_DIR") {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "kopets.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().collect();
    let command = Command::parse(&args)?;

    let mut app = App::new()?;
    info!(base_url = %app.base_url(), "kopets starting");

    let result = match command {
        Command::Login(email) => app.login(email).await,
        Command::Sessions => {
            app.print_sessions();
            Ok(())
        }
        Command::Switch(key) => app.switch(&key),
        Command::Logout(key) => {
            app.logout(key.as_deref());
            Ok(())
        }
        Command::LogoutAll => {
            app.logout_all();
            Ok(())
        }
        Command::WhoAmI => app.whoami().await,
        Command::Request { method, path, body } => app.request(method, &path, body).await,
    };

    // Report session expiry even when the command itself failed
    app.report_navigation();
    result
}
