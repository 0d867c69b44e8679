//! Caller identity helpers.
//!
//! The limiter never sees raw credentials: it is keyed by [`hash_identity`], and
//! anything shown to operators goes through [`mask_identity`].

use sha2::{Digest, Sha256};

/// Display name for requests without credentials.
pub const ANONYMOUS: &str = "anonymous";

const BEARER_PREFIX: &str = "Bearer ";

/// Hash a credential into the opaque key used for spend accounting.
///
/// Returns the hex-encoded SHA-256 digest. The empty credential stays empty so
/// that anonymous traffic keeps its bypass semantics.
pub fn hash_identity(raw: &str) -> String {
    if raw.is_empty() {
        return String::new();
    }
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex::encode(hasher.finalize())
}

/// Render a credential for humans: a short prefix and suffix, never the full token.
///
/// A leading `Bearer ` scheme is kept as-is. Tokens up to eight characters only
/// reveal their first two characters, tokens up to four reveal nothing.
pub fn mask_identity(raw: &str) -> String {
    if raw.is_empty() || raw == ANONYMOUS {
        return raw.to_string();
    }

    match raw.strip_prefix(BEARER_PREFIX) {
        Some(token) if !token.is_empty() => format!("{BEARER_PREFIX}{}", mask_token(token)),
        _ => mask_token(raw),
    }
}

fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    match chars.len() {
        0..=4 => "...".to_string(),
        5..=8 => format!("{}...", chars[..2].iter().collect::<String>()),
        n => format!(
            "{}...{}",
            chars[..4].iter().collect::<String>(),
            chars[n - 4..].iter().collect::<String>()
        ),
    }
}
