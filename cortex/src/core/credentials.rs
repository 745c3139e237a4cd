//! Credential placeholder resolution and secret redaction.
//!
//! Tool arguments reference secrets as `<credential:NAME>`. Placeholders are
//! substituted only immediately before a tool executes, so persisted state
//! never holds plaintext secrets. Anything flowing back toward the model or
//! into persisted output passes through a [`Redactor`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::core::json_walk::{for_each_string, map_strings};

/// Replacement text for redacted secret values.
pub const REDACTION_MARKER: &str = "[REDACTED]";

/// Secrets shorter than this are not redacted, to avoid masking incidental text.
pub const DEFAULT_MIN_REDACTION_LEN: usize = 6;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<credential:([A-Za-z0-9_.\-]+)>").expect("placeholder regex should be valid")
});

/// Host-owned mapping from credential name to secret value.
///
/// Deliberately not serializable; `Debug` prints names only.
#[derive(Clone, Default)]
pub struct CredentialStore {
    secrets: BTreeMap<String, String>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.secrets.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.secrets.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Redactor masking every stored secret of at least `min_len` bytes.
    pub fn redactor(&self, min_len: usize) -> Redactor {
        Redactor::new(self.secrets.values().cloned(), min_len)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("names", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Outcome of resolving placeholders in an argument tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Argument tree with every known placeholder substituted.
    pub value: Value,
    /// Referenced names absent from the store (sorted, unique).
    pub missing: Vec<String>,
    /// Referenced names that were substituted (sorted, unique).
    pub used: Vec<String>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Resolve every `<credential:NAME>` placeholder in every string of `value`.
pub fn resolve_placeholders(value: &Value, store: &CredentialStore) -> Resolution {
    let mut missing = BTreeSet::new();
    let mut used = BTreeSet::new();
    let resolved = map_strings(value, &mut |s| {
        PLACEHOLDER_RE
            .replace_all(s, |caps: &Captures<'_>| {
                let name = &caps[1];
                match store.get(name) {
                    Some(secret) => {
                        used.insert(name.to_string());
                        secret.to_string()
                    }
                    None => {
                        missing.insert(name.to_string());
                        caps[0].to_string()
                    }
                }
            })
            .into_owned()
    });
    Resolution {
        value: resolved,
        missing: missing.into_iter().collect(),
        used: used.into_iter().collect(),
    }
}

/// Names referenced by placeholders anywhere in `value` (sorted, unique).
pub fn placeholder_names(value: &Value) -> Vec<String> {
    let mut names = BTreeSet::new();
    for_each_string(value, &mut |s| {
        for caps in PLACEHOLDER_RE.captures_iter(s) {
            names.insert(caps[1].to_string());
        }
    });
    names.into_iter().collect()
}

/// Message returned to the model when credentials are missing. Names only.
pub fn missing_credentials_message(missing: &[String]) -> String {
    let plural = if missing.len() == 1 { "" } else { "s" };
    format!(
        "Missing credential{plural}: {}. The call was not executed. \
         Ask the user (via ask_user) to register {} in the host credential store \
         (for example under [credentials] in the credentials file, or as CORTEX_CREDENTIAL_<NAME>), \
         then retry with the same <credential:NAME> placeholder.",
        missing.join(", "),
        if missing.len() == 1 { "it" } else { "them" },
    )
}

/// Masks secret values in free text and JSON trees.
#[derive(Clone, Default)]
pub struct Redactor {
    /// Longest first, so a secret containing another is masked whole.
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new(secrets: impl IntoIterator<Item = String>, min_len: usize) -> Self {
        let unique: BTreeSet<String> = secrets
            .into_iter()
            .filter(|s| s.len() >= min_len.max(1))
            .collect();
        let mut secrets: Vec<String> = unique.into_iter().collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Self { secrets }
    }

    pub fn is_noop(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTION_MARKER);
            }
        }
        out
    }

    /// Mask a secret prefix left dangling at the end of `kept` by a cut.
    ///
    /// Full secrets must already be redacted; this only handles the fragment a
    /// byte cap leaves behind when it falls inside a secret.
    pub fn mask_cut_tail(&self, kept: &str) -> String {
        let dangling = self
            .secrets
            .iter()
            .filter_map(|secret| {
                secret
                    .char_indices()
                    .map(|(idx, _)| idx)
                    .filter(|&idx| idx > 0)
                    .rev()
                    .find(|&idx| kept.ends_with(&secret[..idx]))
            })
            .max();
        match dangling {
            Some(len) => format!("{}{REDACTION_MARKER}", &kept[..kept.len() - len]),
            None => kept.to_string(),
        }
    }

    pub fn redact_value(&self, value: &Value) -> Value {
        if self.is_noop() {
            return value.clone();
        }
        map_strings(value, &mut |s| self.redact(s))
    }
}

impl fmt::Debug for Redactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redactor")
            .field("secrets", &self.secrets.len())
            .finish()
    }
}
