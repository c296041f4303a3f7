//! Command handlers for the terminal host.
//!
//! `App` owns the configuration, the session store and the API client, and
//! realizes the client's navigation signals as terminal messages.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use kopets_core::auth::CredentialStore;
use kopets_core::{ApiClient, Config, Method, Navigation, Session, SessionStore};

pub struct App {
    config: Config,
    client: ApiClient,
    navigation: broadcast::Receiver<Navigation>,
}

impl App {
    pub fn new() -> Result<Self> {
        let mut config = match Config::load() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to load config, using defaults");
                Config::default()
            }
        };

        if let Ok(url) = std::env::var("KOPETS_API_URL") {
            config.api_base_url = Some(url);
        }

        let cache_dir = config.cache_dir()?;
        debug!(?cache_dir, "Cache directory configured");

        let store = Arc::new(SessionStore::open_in_dir(&cache_dir));
        let client = ApiClient::new(&config, store)?;
        let navigation = client.subscribe();

        Ok(Self {
            config,
            client,
            navigation,
        })
    }

    pub fn base_url(&self) -> String {
        self.config.base_url()
    }

    /// Interactive login: password, then the emailed verification code
    pub async fn login(&mut self, email: Option<String>) -> Result<()> {
        let default_email = std::env::var("KOPETS_EMAIL")
            .ok()
            .or_else(|| self.config.last_email.clone());

        let email = match email {
            Some(email) => email,
            None => Self::prompt_email(default_email.as_deref())?,
        };
        if email.is_empty() {
            bail!("Email required");
        }

        let password = if CredentialStore::has_credentials(&email) {
            let answer = Self::prompt("Use stored password? [Y/n]: ")?;
            if answer.to_lowercase() != "n" {
                CredentialStore::get_password(&email)?
            } else {
                Self::prompt_password()?
            }
        } else {
            Self::prompt_password()?
        };

        println!("\nAuthenticating...");
        let outcome = self.client.login(&email, &password).await?;
        let Some(user_id) = outcome.user_id.filter(|_| outcome.success) else {
            bail!("Login failed: {}", outcome.message);
        };
        println!("{}", outcome.message);

        let code = Self::prompt("Verification code: ")?;
        let verified = self.client.verify_code(user_id, &code).await?;
        if !verified.success {
            bail!("Verification failed: {}", verified.message);
        }

        if let Err(e) = CredentialStore::store(&email, &password) {
            warn!(error = %e, "Failed to store credentials");
        }

        self.config.last_email = Some(email);
        if let Err(e) = self.config.save() {
            warn!(error = %e, "Failed to save config");
        }

        let name = verified
            .user
            .as_ref()
            .map(|u| format!("{} ({})", u.display_name(), u.kind.label()))
            .unwrap_or_default();
        println!(
            "Login successful: {} [{}]\n",
            name,
            verified.session_key.unwrap_or_default()
        );
        Ok(())
    }

    pub fn print_sessions(&self) {
        let sessions = self.client.sessions().summaries();
        if sessions.is_empty() {
            println!("No sessions. Run `kopets login`.");
            return;
        }

        for s in sessions {
            println!(
                "{} {:<16} {:<24} {:<10} last active {}",
                if s.is_active { "*" } else { " " },
                s.key,
                s.user.display_name(),
                s.user.kind.label(),
                s.last_activity.format("%Y-%m-%d %H:%M"),
            );
        }
    }

    pub fn switch(&self, key: &str) -> Result<()> {
        if !self.client.switch_session(key) {
            bail!("No session named {}. Run `kopets sessions` to list them.", key);
        }
        println!("Active session: {}", key);
        Ok(())
    }

    pub fn logout(&self, key: Option<&str>) {
        match self.client.logout(key) {
            Some(removed) => {
                println!("Logged out {}", removed.key);
                let remaining = self.client.sessions().list();
                Self::forget_passwords(&orphaned_emails(&[removed], &remaining));
                if let Some(active) = self.client.sessions().get_active() {
                    println!("Active session: {}", active.key);
                }
            }
            None => println!("No matching session"),
        }
    }

    pub fn logout_all(&self) {
        let removed = self.client.sessions().list();
        self.client.logout_all();
        Self::forget_passwords(&orphaned_emails(&removed, &[]));
        println!("Logged out of every session");
    }

    fn forget_passwords(emails: &[String]) {
        for email in emails {
            if !CredentialStore::has_credentials(email) {
                continue;
            }
            match CredentialStore::delete(email) {
                Ok(()) => debug!(email = %email, "Stored password removed"),
                Err(e) => warn!(error = %e, "Failed to remove stored password"),
            }
        }
    }

    pub async fn whoami(&self) -> Result<()> {
        let user = self.client.profile().await?;
        println!("{} <{}> {} #{}", user.display_name(), user.email, user.kind.label(), user.id);
        Ok(())
    }

    pub async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<()> {
        let value = self
            .client
            .request(method, path, body)
            .await
            .with_context(|| format!("{} {} failed", method, path))?;
        println!("{}", serde_json::to_string_pretty(&value)?);
        Ok(())
    }

    /// Tell the user what an expired session means for them
    pub fn report_navigation(&mut self) {
        while let Ok(navigation) = self.navigation.try_recv() {
            match navigation {
                Navigation::NavigateToLogin => {
                    eprintln!("Session expired and no sessions remain. Run `kopets login`.");
                }
                Navigation::ReloadForSession => {
                    eprintln!(
                        "Session expired. Other sessions remain; pick one with `kopets switch <key>`:"
                    );
                    self.print_sessions();
                }
                Navigation::Continue => {}
            }
        }
    }

    fn prompt(label: &str) -> Result<String> {
        print!("{}", label);
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        Ok(input.trim().to_string())
    }

    fn prompt_email(default: Option<&str>) -> Result<String> {
        match default {
            Some(last) => {
                let input = Self::prompt(&format!("Email [{}]: ", last))?;
                Ok(if input.is_empty() { last.to_string() } else { input })
            }
            None => Self::prompt("Email: "),
        }
    }

    fn prompt_password() -> Result<String> {
        let password = rpassword::prompt_password("Password: ")?;
        Ok(password)
    }
}

/// Emails of logged-out sessions that no remaining session still uses
fn orphaned_emails(removed: &[Session], remaining: &[Session]) -> Vec<String> {
    let mut emails: Vec<String> = removed
        .iter()
        .map(|s| s.user.email.trim().to_lowercase())
        .filter(|email| !email.is_empty())
        .filter(|email| {
            !remaining
                .iter()
                .any(|s| s.user.email.trim().eq_ignore_ascii_case(email))
        })
        .collect();
    emails.sort();
    emails.dedup();
    emails
}
