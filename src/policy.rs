//! Command policy: the verb allowlist and pre-spawn validation
//!
//! Nothing in this module performs I/O except [`Allowlist::load`]. Every
//! check is deterministic for a given input and allowlist, so validating the
//! same string twice always yields the same verdict.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// Maximum command length, in characters, after trimming
pub const MAX_COMMAND_CHARS: usize = 1024;

/// Maximum number of whitespace-separated tokens, verb included
pub const MAX_TOKENS: usize = 10;

/// Log line count used when the caller does not ask for one
pub const DEFAULT_LOG_LINES: u32 = 100;

/// Upper bound for a requested log line count
pub const MAX_LOG_LINES: u32 = 1000;

/// Shell metacharacters that enable chaining, substitution, redirection or escaping
static UNSAFE_CHARACTERS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[;&|<>$(){}\[\]!\\]").expect("unsafe character pattern compiles"));

/// Why a command or parameter was refused before reaching a process
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("Command cannot be empty")]
    EmptyCommand,

    #[error("Command exceeds maximum length of 1024 characters")]
    TooLong,

    #[error("Command contains unsafe characters")]
    UnsafeCharacters,

    #[error("Invalid command format")]
    MalformedCommand,

    #[error("Command not allowed")]
    VerbNotAllowed,

    #[error("Too many arguments (max 10)")]
    TooManyArguments,

    #[error("Invalid lines parameter (expected 1-1000)")]
    InvalidLineCount,
}

impl RejectionReason {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::EmptyCommand => "empty_command",
            RejectionReason::TooLong => "too_long",
            RejectionReason::UnsafeCharacters => "unsafe_characters",
            RejectionReason::MalformedCommand => "malformed_command",
            RejectionReason::VerbNotAllowed => "verb_not_allowed",
            RejectionReason::TooManyArguments => "too_many_arguments",
            RejectionReason::InvalidLineCount => "invalid_line_count",
        }
    }
}

/// Allowlist loading errors
#[derive(Error, Debug)]
pub enum AllowlistError {
    #[error("Failed to load allowlist: {0}")]
    LoadFailed(String),

    #[error("Invalid allowlist format: {0}")]
    InvalidFormat(String),

    #[error("Invalid allowlist entry '{0}': verbs must be a single safe token")]
    InvalidEntry(String),
}

/// A permitted verb
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistEntry {
    /// Executable identity, matched against the first token
    pub verb: String,

    /// Description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AllowlistEntry {
    pub fn new(verb: &str, description: &str) -> Self {
        Self {
            verb: verb.to_string(),
            description: Some(description.to_string()),
        }
    }
}

/// Set of verbs permitted for ad-hoc execution.
///
/// Built once at startup and shared behind an `Arc`; there is no API to
/// change it afterwards.
#[derive(Debug, Clone)]
pub struct Allowlist {
    entries: BTreeMap<String, AllowlistEntry>,
}

impl Default for Allowlist {
    fn default() -> Self {
        Self::with_default_verbs()
    }
}

impl Allowlist {
    /// Build from explicit entries, rejecting verbs that could never validate
    pub fn from_entries<I>(entries: I) -> Result<Self, AllowlistError>
    where
        I: IntoIterator<Item = AllowlistEntry>,
    {
        let mut map = BTreeMap::new();
        for entry in entries {
            let verb = entry.verb.trim();
            if verb.is_empty()
                || verb.split_whitespace().count() != 1
                || UNSAFE_CHARACTERS.is_match(verb)
            {
                return Err(AllowlistError::InvalidEntry(entry.verb.clone()));
            }
            map.insert(
                verb.to_string(),
                AllowlistEntry {
                    verb: verb.to_string(),
                    description: entry.description,
                },
            );
        }

        if map.is_empty() {
            return Err(AllowlistError::InvalidFormat(
                "allowlist must contain at least one verb".to_string(),
            ));
        }

        Ok(Self { entries: map })
    }

    /// The built-in read-only/diagnostic verbs
    pub fn with_default_verbs() -> Self {
        let entries = [
            ("dir", "List directory contents (Windows built-in)"),
            ("echo", "Echo text"),
            ("ls", "List directory contents"),
            ("ping", "Check network reachability"),
        ]
        .into_iter()
        .map(|(verb, description)| (verb.to_string(), AllowlistEntry::new(verb, description)))
        .collect();

        Self { entries }
    }

    /// Check if a verb is allowed
    pub fn contains(&self, verb: &str) -> bool {
        self.entries.contains_key(verb)
    }

    /// Allowed verbs in sorted order
    pub fn verbs(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &AllowlistEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Load from YAML
    pub fn from_yaml(yaml: &str) -> Result<Self, AllowlistError> {
        let entries: Vec<AllowlistEntry> = serde_yaml::from_str(yaml)
            .map_err(|e| AllowlistError::InvalidFormat(e.to_string()))?;

        Self::from_entries(entries)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, AllowlistError> {
        let entries: Vec<AllowlistEntry> = serde_json::from_str(json)
            .map_err(|e| AllowlistError::InvalidFormat(e.to_string()))?;

        Self::from_entries(entries)
    }

    /// Export to YAML
    pub fn to_yaml(&self) -> Result<String, AllowlistError> {
        let entries: Vec<&AllowlistEntry> = self.entries.values().collect();
        serde_yaml::to_string(&entries).map_err(|e| AllowlistError::InvalidFormat(e.to_string()))
    }

    /// Load from a file; `.json` is parsed as JSON, anything else as YAML
    pub fn load(path: &Path) -> Result<Self, AllowlistError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AllowlistError::LoadFailed(format!("{}: {}", path.display(), e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(&contents),
            _ => Self::from_yaml(&contents),
        }
    }
}

/// A command that passed every policy check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedCommand {
    command: String,
    tokens: Vec<String>,
}

impl ValidatedCommand {
    /// The trimmed command string
    pub fn as_str(&self) -> &str {
        &self.command
    }

    pub fn verb(&self) -> &str {
        &self.tokens[0]
    }

    pub fn args(&self) -> &[String] {
        &self.tokens[1..]
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }
}

/// Validate a raw command string against the policy.
///
/// Checks run in a fixed order and stop at the first failure.
pub fn validate_command(
    raw: &str,
    allowlist: &Allowlist,
) -> Result<ValidatedCommand, RejectionReason> {
    let command = raw.trim();
    if command.is_empty() {
        return Err(RejectionReason::EmptyCommand);
    }

    if command.chars().count() > MAX_COMMAND_CHARS {
        return Err(RejectionReason::TooLong);
    }

    if contains_unsafe_characters(command) {
        return Err(RejectionReason::UnsafeCharacters);
    }

    let tokens: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    let Some(verb) = tokens.first() else {
        return Err(RejectionReason::MalformedCommand);
    };

    if !allowlist.contains(verb) {
        return Err(RejectionReason::VerbNotAllowed);
    }

    if tokens.len() > MAX_TOKENS {
        return Err(RejectionReason::TooManyArguments);
    }

    Ok(ValidatedCommand {
        command: command.to_string(),
        tokens,
    })
}

/// Validate a bare identifier (service name) with the unsafe-character check only
pub fn validate_name(name: &str) -> Result<&str, RejectionReason> {
    if contains_unsafe_characters(name) {
        return Err(RejectionReason::UnsafeCharacters);
    }
    Ok(name)
}

/// Parse the optional `lines` parameter of a log request
pub fn validate_line_count(raw: Option<&str>) -> Result<u32, RejectionReason> {
    let Some(raw) = raw else {
        return Ok(DEFAULT_LOG_LINES);
    };

    match raw.trim().parse::<u32>() {
        Ok(n) if (1..=MAX_LOG_LINES).contains(&n) => Ok(n),
        _ => Err(RejectionReason::InvalidLineCount),
    }
}

/// Check for shell metacharacters
pub fn contains_unsafe_characters(s: &str) -> bool {
    UNSAFE_CHARACTERS.is_match(s)
}
