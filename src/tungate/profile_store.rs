use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Socks5,
    HttpConnect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub label: String,
    pub proxy_kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Primary DNS resolver the relay should query for this profile; falls back to a public
    /// default when unset.
    #[serde(default)]
    pub dns1: Option<String>,
    /// Secondary DNS resolver, tried if `dns1` times out.
    #[serde(default)]
    pub dns2: Option<String>,
    /// The proxy host's IP address, resolved and cached the last time a session came up, so
    /// later dials don't re-resolve the hostname.
    #[serde(default)]
    pub resolved_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct ProfilesFile {
    #[serde(default)]
    profiles: Vec<Profile>,
    #[serde(default)]
    selected_profile_id: Option<String>,
    #[serde(default)]
    last_connected_profile_id: Option<String>,
    #[serde(default)]
    auto_connect_enabled: bool,
    #[serde(default)]
    manually_disconnected: bool,
    #[serde(default)]
    automation_session_active: bool,
}

/// JSON-backed, process-local store for proxy profiles and a handful of session-continuity
/// flags. Every mutation is written back to disk synchronously before the call returns, so a
/// crash immediately after a successful API response never loses that write.
#[derive(Debug)]
pub struct ProfileStore {
    path: PathBuf,
    inner: RwLock<ProfilesFile>,
}

impl ProfileStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let inner = if let Ok(data) = fs::read(path) {
            serde_json::from_slice(&data)
                .with_context(|| format!("profile_store: parse {}", path.display()))?
        } else {
            ProfilesFile::default()
        };

        let store = ProfileStore {
            path: path.to_path_buf(),
            inner: RwLock::new(inner),
        };
        store.persist()?;
        Ok(store)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let guard = self.inner.read().expect("profile store lock poisoned");
        let data = serde_json::to_vec_pretty(&*guard).context("profile_store: serialize")?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("profile_store: mkdir {}", parent.display()))?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &data).with_context(|| format!("profile_store: write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("profile_store: rename into {}", self.path.display()))?;
        Ok(())
    }

    pub fn list(&self) -> Vec<Profile> {
        self.inner.read().expect("lock poisoned").profiles.clone()
    }

    pub fn get(&self, id: &str) -> Option<Profile> {
        self.inner
            .read()
            .expect("lock poisoned")
            .profiles
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    pub fn upsert(&self, profile: Profile) -> anyhow::Result<()> {
        {
            let mut guard = self.inner.write().expect("lock poisoned");
            if let Some(existing) = guard.profiles.iter_mut().find(|p| p.id == profile.id) {
                *existing = profile;
            } else {
                guard.profiles.push(profile);
            }
        }
        self.persist()
    }

    pub fn remove(&self, id: &str) -> anyhow::Result<bool> {
        let removed = {
            let mut guard = self.inner.write().expect("lock poisoned");
            let before = guard.profiles.len();
            guard.profiles.retain(|p| p.id != id);
            if guard.selected_profile_id.as_deref() == Some(id) {
                guard.selected_profile_id = None;
            }
            guard.profiles.len() != before
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn selected_profile_id(&self) -> Option<String> {
        self.inner.read().expect("lock poisoned").selected_profile_id.clone()
    }

    pub fn set_selected_profile_id(&self, id: Option<String>) -> anyhow::Result<()> {
        self.inner.write().expect("lock poisoned").selected_profile_id = id;
        self.persist()
    }

    pub fn last_connected_profile_id(&self) -> Option<String> {
        self.inner
            .read()
            .expect("lock poisoned")
            .last_connected_profile_id
            .clone()
    }

    pub fn set_last_connected_profile_id(&self, id: Option<String>) -> anyhow::Result<()> {
        self.inner
            .write()
            .expect("lock poisoned")
            .last_connected_profile_id = id;
        self.persist()
    }

    pub fn auto_connect_enabled(&self) -> bool {
        self.inner.read().expect("lock poisoned").auto_connect_enabled
    }

    pub fn set_auto_connect_enabled(&self, v: bool) -> anyhow::Result<()> {
        self.inner.write().expect("lock poisoned").auto_connect_enabled = v;
        self.persist()
    }

    pub fn manually_disconnected(&self) -> bool {
        self.inner.read().expect("lock poisoned").manually_disconnected
    }

    pub fn set_manually_disconnected(&self, v: bool) -> anyhow::Result<()> {
        self.inner.write().expect("lock poisoned").manually_disconnected = v;
        self.persist()
    }

    pub fn automation_session_active(&self) -> bool {
        self.inner
            .read()
            .expect("lock poisoned")
            .automation_session_active
    }

    pub fn set_automation_session_active(&self, v: bool) -> anyhow::Result<()> {
        self.inner
            .write()
            .expect("lock poisoned")
            .automation_session_active = v;
        self.persist()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tungate-profile-store-test-{name}-{}.json", std::process::id()))
    }

    #[test]
    fn upsert_get_remove_round_trip() {
        let path = tmp_path("roundtrip");
        let _ = fs::remove_file(&path);
        let store = ProfileStore::open(&path).expect("open");

        store
            .upsert(Profile {
                id: "p1".into(),
                label: "Home".into(),
                proxy_kind: ProxyKind::Socks5,
                host: "127.0.0.1".into(),
                port: 1080,
                username: None,
                password: None,
                dns1: None,
                dns2: None,
                resolved_host: None,
            })
            .expect("upsert");

        assert_eq!(store.list().len(), 1);
        assert!(store.get("p1").is_some());

        store.set_selected_profile_id(Some("p1".into())).expect("select");
        assert_eq!(store.selected_profile_id().as_deref(), Some("p1"));

        let removed = store.remove("p1").expect("remove");
        assert!(removed);
        assert!(store.selected_profile_id().is_none());

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn reopen_preserves_flags() {
        let path = tmp_path("reopen");
        let _ = fs::remove_file(&path);
        {
            let store = ProfileStore::open(&path).expect("open");
            store.set_auto_connect_enabled(true).expect("set");
        }
        let store = ProfileStore::open(&path).expect("reopen");
        assert!(store.auto_connect_enabled());
        let _ = fs::remove_file(&path);
    }
}
