use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::IdentityConfig;

/// Chat platform a contact or conversation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Whatsapp,
    Instagram,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Whatsapp => "WHATSAPP",
            Platform::Instagram => "INSTAGRAM",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WHATSAPP" => Ok(Platform::Whatsapp),
            "INSTAGRAM" => Ok(Platform::Instagram),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// Classification of a raw sender identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SenderKind {
    /// A 1:1 counterparty with a phone-shaped identifier.
    Individual,
    /// Group chat (`@g.us`).
    Group,
    /// Newsletter/channel feed (`@newsletter`).
    Channel,
    /// Broadcast list (`@broadcast`).
    Broadcast,
    /// Provider-internal id that exposes no phone (`@lid` and friends).
    Opaque,
    /// Unusable input (empty identifier).
    Invalid,
}

/// Result of normalizing a provider-specific sender identifier.
///
/// `fallback_key` is always the raw identifier, so a contact can be keyed
/// even when no phone could be derived. Callers must treat a `None` phone
/// as "unknown, reconcile later", never as "absent by design".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIdentity {
    pub kind: SenderKind,
    pub canonical_phone: Option<String>,
    pub fallback_key: String,
}

impl NormalizedIdentity {
    fn phoneless(kind: SenderKind, raw: &str) -> Self {
        Self {
            kind,
            canonical_phone: None,
            fallback_key: raw.to_string(),
        }
    }
}

/// Normalize a raw provider sender identifier into a canonical contact key.
///
/// Pure function: no I/O, total over arbitrary input. Malformed input comes
/// back as `SenderKind::Invalid` rather than an error so the dispatcher can
/// decide to drop or log.
pub fn normalize(_platform: Platform, raw: &str, cfg: &IdentityConfig) -> NormalizedIdentity {
    let raw = raw.trim();
    if raw.is_empty() {
        return NormalizedIdentity::phoneless(SenderKind::Invalid, raw);
    }

    let (local, suffix) = match raw.split_once('@') {
        Some((local, suffix)) => (local, Some(suffix)),
        None => (raw, None),
    };

    // Linked devices append ":<device>" to the local part; the device id
    // never participates in identity.
    let local = local.split(':').next().unwrap_or(local);

    let kind = match suffix {
        Some("s.whatsapp.net" | "c.us") => SenderKind::Individual,
        Some("g.us") => SenderKind::Group,
        Some("newsletter") => SenderKind::Channel,
        Some("broadcast") => SenderKind::Broadcast,
        Some(_) => SenderKind::Opaque,
        None => {
            if local.chars().any(|c| c.is_ascii_alphabetic()) {
                SenderKind::Opaque
            } else {
                SenderKind::Individual
            }
        }
    };

    if kind != SenderKind::Individual {
        return NormalizedIdentity::phoneless(kind, raw);
    }

    NormalizedIdentity {
        kind,
        canonical_phone: canonical_phone(local, cfg),
        fallback_key: raw.to_string(),
    }
}

/// Derive a digits-only, country-code-normalized phone from the local part
/// of an individual identifier. Returns `None` when the digit run falls
/// outside the configured bounds (corrupted identifiers with concatenated
/// session suffixes must not become phones).
fn canonical_phone(local: &str, cfg: &IdentityConfig) -> Option<String> {
    let mut digits: String = local.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }

    // National-format numbers from providers that omit the country code.
    if (10..=11).contains(&digits.len()) {
        if let Some(cc) = cfg.default_country_code.as_deref() {
            digits.insert_str(0, cc);
        }
    }

    if digits.len() < cfg.min_phone_digits || digits.len() > cfg.max_phone_digits {
        return None;
    }
    Some(digits)
}
