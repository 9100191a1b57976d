//! Addresses a stored blob: the upload token (namespace) plus a sanitized
//! file name inside it.

use base64::{Engine as _, engine::general_purpose};
use std::fmt;
use uuid::Uuid;

/// Suffix of the sibling record holding an object's expiry policy.
pub const METADATA_SUFFIX: &str = ".metadata";

const MAX_TOKEN_LEN: usize = 64;
const MAX_NAME_LEN: usize = 255;
const TOKEN_BYTES: usize = 8;

/// Reasons a token or name is refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRejection {
    EmptyToken,
    InvalidToken(String),
    InvalidName(String),
    MalformedReference(String),
}

impl fmt::Display for KeyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyRejection::EmptyToken => write!(f, "token is empty"),
            KeyRejection::InvalidToken(token) => write!(f, "token `{}` is invalid", token),
            KeyRejection::InvalidName(name) => write!(f, "file name `{}` is invalid", name),
            KeyRejection::MalformedReference(reference) => {
                write!(f, "`{}` is not of the form token/name", reference)
            }
        }
    }
}

/// Composite `(token, name)` key of one stored object.
///
/// Construction always goes through [`ObjectKey::new`], which validates the
/// token alphabet and sanitizes the name, so a key can be joined onto a base
/// directory without escaping its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    token: String,
    name: String,
}

impl ObjectKey {
    /// Build a key from an untrusted token and file name.
    pub fn new(token: &str, name: &str) -> Result<Self, KeyRejection> {
        ensure_token_safe(token)?;
        let name = sanitize_name(name)?;
        Ok(Self {
            token: token.to_string(),
            name,
        })
    }

    /// Parse a `token/name` reference as it appears in archive paths.
    ///
    /// A leading `/` is ignored and backslashes count as separators.
    pub fn parse_reference(reference: &str) -> Result<Self, KeyRejection> {
        let normalized = reference.trim().replace('\\', "/");
        let normalized = normalized.strip_prefix('/').unwrap_or(&normalized);
        let (token, name) = normalized
            .split_once('/')
            .ok_or_else(|| KeyRejection::MalformedReference(reference.to_string()))?;
        Self::new(token, name)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of the sibling metadata record (`{name}.metadata`).
    pub fn metadata_key(&self) -> ObjectKey {
        ObjectKey {
            token: self.token.clone(),
            name: format!("{}{}", self.name, METADATA_SUFFIX),
        }
    }

    /// String used to serialize access to this key.
    pub fn lock_key(&self) -> String {
        format!("{}/{}", self.token, self.name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.token, self.name)
    }
}

/// Generate a fresh namespace token.
///
/// Eight random bytes from a v4 UUID, URL-safe base64 without padding
/// (11 characters).
pub fn generate_token() -> String {
    let random = Uuid::new_v4();
    general_purpose::URL_SAFE_NO_PAD.encode(&random.as_bytes()[..TOKEN_BYTES])
}

/// Reduce an untrusted file name to its last path component.
///
/// Directory parts (either separator) are dropped; empty names, `.`, `..`,
/// control characters and names that would collide with metadata records
/// are rejected.
pub fn sanitize_name(raw: &str) -> Result<String, KeyRejection> {
    let base = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if base.is_empty() || base == "." || base == ".." {
        return Err(KeyRejection::InvalidName(raw.to_string()));
    }
    if base.len() > MAX_NAME_LEN {
        return Err(KeyRejection::InvalidName(raw.to_string()));
    }
    if base.chars().any(|c| c.is_control()) {
        return Err(KeyRejection::InvalidName(raw.to_string()));
    }
    if base.ends_with(METADATA_SUFFIX) {
        return Err(KeyRejection::InvalidName(raw.to_string()));
    }
    Ok(base.to_string())
}

fn ensure_token_safe(token: &str) -> Result<(), KeyRejection> {
    if token.is_empty() {
        return Err(KeyRejection::EmptyToken);
    }
    if token.len() > MAX_TOKEN_LEN
        || !token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(KeyRejection::InvalidToken(token.to_string()));
    }
    Ok(())
}
