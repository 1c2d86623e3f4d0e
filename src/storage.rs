//! Secrets kept in the OS credential store.
//!
//! On Windows this uses the Credential Manager (via the `keyring` crate), on
//! macOS Keychain, and on Linux the Secret Service API. Environment variables
//! override these values at load time (see `config`).

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::error::AppResult;

const SERVICE_NAME: &str = "bellaflor-dashboard";

// Credential keys
pub const KEY_SUPABASE_URL: &str = "supabase_url";
pub const KEY_SUPABASE_ANON_KEY: &str = "supabase_anon_key";
pub const KEY_AI_API_KEY: &str = "ai_api_key";
pub const KEY_REFRESH_TOKEN: &str = "session_refresh_token";
pub const KEY_SESSION_EMAIL: &str = "session_email";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[
    KEY_SUPABASE_URL,
    KEY_SUPABASE_ANON_KEY,
    KEY_AI_API_KEY,
    KEY_REFRESH_TOKEN,
    KEY_SESSION_EMAIL,
];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential. Returns `None` when the entry does not exist
/// (or the platform store is unavailable).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> AppResult<()> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    entry.set_password(value)?;
    Ok(())
}

/// Delete a credential. Succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> AppResult<()> {
    let entry = Entry::new(SERVICE_NAME, key)?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// The backend is usable once both the project URL and the anon key exist.
pub fn is_configured() -> bool {
    has_credential(KEY_SUPABASE_URL) && has_credential(KEY_SUPABASE_ANON_KEY)
}

/// Store backend credentials entered on the setup screen.
///
/// Expected JSON shape (camelCase, snake_case accepted):
/// ```json
/// { "supabaseUrl": "...", "supabaseAnonKey": "...", "aiApiKey": "..." }
/// ```
pub fn save_backend_credentials(payload: &Value) -> AppResult<()> {
    let field = |camel: &str, snake: &str| {
        payload
            .get(camel)
            .or_else(|| payload.get(snake))
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };

    let url = field("supabaseUrl", "supabase_url").ok_or_else(|| {
        crate::error::AppError::Validation("Missing required field: supabaseUrl".into())
    })?;
    let anon_key = Zeroizing::new(field("supabaseAnonKey", "supabase_anon_key").ok_or_else(
        || crate::error::AppError::Validation("Missing required field: supabaseAnonKey".into()),
    )?);

    set_credential(KEY_SUPABASE_URL, &crate::config::normalize_base_url(&url))?;
    set_credential(KEY_SUPABASE_ANON_KEY, &anon_key)?;
    if let Some(ai_key) = field("aiApiKey", "ai_api_key").map(Zeroizing::new) {
        set_credential(KEY_AI_API_KEY, &ai_key)?;
    }

    info!(supabase_url = %url, "backend credentials updated");
    Ok(())
}

/// Remember the signed-in session so it can be restored on next start.
pub fn save_session(email: &str, refresh_token: &str) -> AppResult<()> {
    set_credential(KEY_SESSION_EMAIL, email)?;
    set_credential(KEY_REFRESH_TOKEN, refresh_token)
}

/// `(email, refresh_token)` of the last session, if any.
pub fn load_session() -> Option<(String, Zeroizing<String>)> {
    let email = get_credential(KEY_SESSION_EMAIL)?;
    let token = get_credential(KEY_REFRESH_TOKEN)?;
    Some((email, Zeroizing::new(token)))
}

pub fn clear_session() -> AppResult<()> {
    delete_credential(KEY_REFRESH_TOKEN)?;
    delete_credential(KEY_SESSION_EMAIL)
}

/// Delete every stored credential.
pub fn factory_reset() -> AppResult<()> {
    info!("performing factory reset: deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
