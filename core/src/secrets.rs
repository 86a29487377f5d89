//! Per-provider API keys, persisted at `<agent-home>/.secrets.json`.
//!
//! The on-disk format is an opaque sealed envelope; real encryption at rest
//! is an external collaborator, so the seal/open pair is the single seam it
//! replaces. Whatever the envelope does, `open(seal(x)) == x` must hold.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use serde::Serialize;

use crate::error::AgentErr;
use crate::error::Result;

const SECRETS_FILENAME: &str = ".secrets.json";
const ENVELOPE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    payload: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecretStore {
    keys: BTreeMap<String, String>,
}

impl SecretStore {
    pub fn load(home: &Path) -> Result<Self> {
        let path = home.join(SECRETS_FILENAME);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|e| AgentErr::Config(format!("invalid {}: {e}", path.display())))?;
        let keys = open(&envelope)?;
        Ok(Self { keys })
    }

    pub fn save(&self, home: &Path) -> Result<()> {
        std::fs::create_dir_all(home)?;
        let path = home.join(SECRETS_FILENAME);
        let envelope = seal(&self.keys)?;
        let text = serde_json::to_string_pretty(&envelope)?;
        let mut tmp = tempfile::NamedTempFile::new_in(home)?;
        tmp.write_all(text.as_bytes())?;
        tmp.persist(&path).map_err(|e| AgentErr::Io(e.error))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }

    pub fn get(&self, provider: &str) -> Option<&str> {
        self.keys.get(provider).map(String::as_str)
    }

    pub fn set(&mut self, provider: impl Into<String>, key: impl Into<String>) {
        self.keys.insert(provider.into(), key.into());
    }

    pub fn remove(&mut self, provider: &str) -> bool {
        self.keys.remove(provider).is_some()
    }

    /// Apply `<PROV>_API_KEY` environment overrides for every provider
    /// named in the configuration.
    pub fn apply_env_overrides<'a>(&mut self, providers: impl Iterator<Item = &'a str>) {
        for name in providers {
            let var = format!("{}_API_KEY", name.to_ascii_uppercase().replace('-', "_"));
            if let Ok(key) = std::env::var(&var)
                && !key.trim().is_empty()
            {
                self.keys.insert(name.to_string(), key);
            }
        }
    }
}

fn seal(keys: &BTreeMap<String, String>) -> Result<Envelope> {
    let plaintext = serde_json::to_vec(keys)?;
    Ok(Envelope {
        version: ENVELOPE_VERSION,
        payload: BASE64.encode(plaintext),
    })
}

fn open(envelope: &Envelope) -> Result<BTreeMap<String, String>> {
    if envelope.version != ENVELOPE_VERSION {
        return Err(AgentErr::Config(format!(
            "unsupported secrets envelope version {}",
            envelope.version
        )));
    }
    let plaintext = BASE64
        .decode(&envelope.payload)
        .map_err(|e| AgentErr::Config(format!("corrupt secrets envelope: {e}")))?;
    Ok(serde_json::from_slice(&plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = SecretStore::default();
        store.set("openai", "sk-test-123");
        store.set("local", "unused");
        store.save(dir.path()).expect("save");

        let loaded = SecretStore::load(dir.path()).expect("load");
        assert_eq!(loaded, store);
        assert_eq!(loaded.get("openai"), Some("sk-test-123"));
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SecretStore::load(dir.path()).expect("load");
        assert_eq!(store.get("anything"), None);
    }

    #[test]
    fn envelope_is_opaque_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut store = SecretStore::default();
        store.set("openai", "sk-very-secret");
        store.save(dir.path()).expect("save");

        let raw = std::fs::read_to_string(dir.path().join(".secrets.json")).expect("read");
        assert!(!raw.contains("sk-very-secret"));
    }
}
