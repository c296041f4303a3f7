use anyhow::{Context, Result};
use keyring::Entry;

const SERVICE_NAME: &str = "kopets";

/// Login passwords kept in the OS keychain, keyed by account email.
///
/// Only the terminal host uses this, to offer re-login without retyping.
/// Tokens never go here; they live in the session store.
pub struct CredentialStore;

impl CredentialStore {
    /// Store the password for an email in the OS keychain
    pub fn store(email: &str, password: &str) -> Result<()> {
        let entry = Self::entry(email)?;
        entry
            .set_password(password)
            .context("Failed to store password in keychain")?;
        Ok(())
    }

    /// Retrieve the password stored for an email
    pub fn get_password(email: &str) -> Result<String> {
        Self::entry(email)?
            .get_password()
            .context("Failed to retrieve password from keychain")
    }

    /// Forget the password stored for an email
    pub fn delete(email: &str) -> Result<()> {
        Self::entry(email)?
            .delete_credential()
            .context("Failed to delete credential from keychain")?;
        Ok(())
    }

    pub fn has_credentials(email: &str) -> bool {
        Self::entry(email)
            .and_then(|entry| entry.get_password().map_err(Into::into))
            .is_ok()
    }

    fn entry(email: &str) -> Result<Entry> {
        Entry::new(SERVICE_NAME, &email.trim().to_lowercase())
            .context("Failed to create keyring entry")
    }
}
