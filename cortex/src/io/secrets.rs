//! Loading the host credential store.
//!
//! Sources, later ones winning: the `[credentials]` table of a TOML file, then
//! `CORTEX_CREDENTIAL_<NAME>` environment variables.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::core::credentials::CredentialStore;

pub const ENV_PREFIX: &str = "CORTEX_CREDENTIAL_";

#[derive(Debug, Default, Deserialize)]
struct CredentialsFile {
    #[serde(default)]
    credentials: BTreeMap<String, String>,
}

/// Build the store from `file` (if present) and the process environment.
pub fn load_credentials(file: Option<&Path>) -> Result<CredentialStore> {
    load_credentials_from(file, std::env::vars())
}

/// Same as [`load_credentials`], with the environment supplied explicitly.
pub fn load_credentials_from(
    file: Option<&Path>,
    env: impl IntoIterator<Item = (String, String)>,
) -> Result<CredentialStore> {
    let mut store = CredentialStore::new();
    if let Some(path) = file.filter(|p| p.exists()) {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let parsed: CredentialsFile =
            toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
        for (name, value) in parsed.credentials {
            store.insert(name, value);
        }
    }
    for (key, value) in env {
        if let Some(name) = key.strip_prefix(ENV_PREFIX).filter(|n| !n.is_empty()) {
            store.insert(name, value);
        }
    }
    debug!(count = store.len(), "loaded credentials");
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merges_file_and_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("credentials.toml");
        fs::write(
            &path,
            "[credentials]\nGITHUB_TOKEN = \"from-file\"\nAPI_KEY = \"file-key\"\n",
        )
        .expect("write");
        let env = vec![
            ("CORTEX_CREDENTIAL_API_KEY".to_string(), "env-key".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let store = load_credentials_from(Some(&path), env).expect("load");
        assert_eq!(store.get("GITHUB_TOKEN"), Some("from-file"));
        assert_eq!(store.get("API_KEY"), Some("env-key"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn missing_file_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store =
            load_credentials_from(Some(&temp.path().join("none.toml")), Vec::new()).expect("load");
        assert!(store.is_empty());
    }
}
