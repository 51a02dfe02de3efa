//! Protocol Recognition
//!
//! Maps the declared `app`/`type` markers of a transaction onto the closed set
//! of protocol variants and transaction types this ingestor understands.

use std::collections::HashMap;
use std::sync::LazyLock;

use crate::content::find_field;
use crate::error::ParseError;

/// Key declaring the producing application
pub const APP_KEY: &str = "app";

/// Key declaring the transaction type
pub const TYPE_KEY: &str = "type";

/// Key declaring the protocol version
pub const VERSION_KEY: &str = "version";

/// Protocol tag used when no application is declared
pub const UNKNOWN_PROTOCOL: &str = "unknown";

/// Application names emitted by known producers over time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVariant {
    /// lockd.app - current producer
    LockdApp,
    /// lockd - early producer name without the domain suffix
    LockdLegacy,
}

impl ProtocolVariant {
    /// Canonical application name
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolVariant::LockdApp => "lockd.app",
            ProtocolVariant::LockdLegacy => "lockd",
        }
    }
}

/// Static lookup table of lower-cased application names
static KNOWN_APPS: LazyLock<HashMap<&'static str, ProtocolVariant>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert("lockd.app", ProtocolVariant::LockdApp);
    map.insert("lockdapp", ProtocolVariant::LockdApp);
    map.insert("lockd", ProtocolVariant::LockdLegacy);
    map
});

/// Resolve a declared application name, ignoring case and surrounding space
///
/// # Returns
/// The protocol variant, or `UnrecognizedProtocol` for anything else
pub fn resolve_app(app: &str) -> Result<ProtocolVariant, ParseError> {
    KNOWN_APPS
        .get(app.trim().to_ascii_lowercase().as_str())
        .copied()
        .ok_or_else(|| ParseError::UnrecognizedProtocol(app.to_string()))
}

/// Returns `true` if the application name is recognized
pub fn is_known_app(app: &str) -> bool {
    resolve_app(app).is_ok()
}

/// Transaction type declared by the `type` marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclaredType {
    Content,
    Vote,
    Lock,
    /// Any other or missing value
    Other,
}

impl DeclaredType {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "content" | "post" | "reply" => DeclaredType::Content,
            "vote" | "vote_question" => DeclaredType::Vote,
            "lock" | "commitment" => DeclaredType::Lock,
            _ => DeclaredType::Other,
        }
    }
}

/// The protocol markers declared by a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredProtocol {
    pub app: Option<String>,
    pub version: Option<String>,
    pub declared_type: DeclaredType,
}

impl DeclaredProtocol {
    /// Read the `app`, `version` and `type` markers from the pairs
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let non_empty = |key: &str| {
            find_field(pairs, key)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        Self {
            app: non_empty(APP_KEY),
            version: non_empty(VERSION_KEY),
            declared_type: find_field(pairs, TYPE_KEY)
                .map(DeclaredType::parse)
                .unwrap_or(DeclaredType::Other),
        }
    }

    /// The recognized variant, if the declared application is known
    pub fn variant(&self) -> Result<ProtocolVariant, ParseError> {
        match &self.app {
            Some(app) => resolve_app(app),
            None => Err(ParseError::UnrecognizedProtocol(String::new())),
        }
    }

    /// Protocol tag for the parsed record: `app`, or `app@version`
    pub fn tag(&self) -> String {
        match (&self.app, &self.version) {
            (Some(app), Some(version)) => format!("{app}@{version}"),
            (Some(app), None) => app.clone(),
            (None, _) => UNKNOWN_PROTOCOL.to_string(),
        }
    }
}
