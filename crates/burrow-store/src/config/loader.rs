//! Load/save cycle and the mutating operations
//!
//! All mutation goes through [`ConfigStore`], which holds the single config
//! mutex through the internal save so the on-disk JSON is never ahead of or
//! behind the in-memory state. Disk errors are logged, not propagated: the
//! in-memory config stays authoritative.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{error, warn};

use super::schema::{AppConfig, Config, Protocol};
use crate::{Result, StoreError};

/// Shared handle to the persisted configuration
pub struct ConfigStore {
    path: PathBuf,
    inner: Mutex<Config>,
}

impl ConfigStore {
    /// Open the store, loading `path` unless `fresh` asks for a clean slate.
    /// Derived defaults are applied either way.
    pub fn open(path: impl Into<PathBuf>, fresh: bool) -> Self {
        let path = path.into();
        let mut config = if fresh {
            Config::default()
        } else {
            match load_from(&path) {
                Ok(config) => config,
                Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    Config::default()
                }
                Err(e) => {
                    warn!("loading {} failed, starting empty: {}", path.display(), e);
                    Config::default()
                }
            }
        };
        config.apply_defaults();
        Self {
            path,
            inner: Mutex::new(config),
        }
    }

    /// Snapshot of the current config.
    pub fn snapshot(&self) -> Config {
        self.lock().clone()
    }

    /// Run a closure against the config under the mutex and save the result.
    pub fn update<T>(&self, mutate: impl FnOnce(&mut Config) -> T) -> T {
        let mut config = self.lock();
        let out = mutate(&mut config);
        self.save_locked(&config);
        out
    }

    /// Set the node token (0 is ignored; tokens are never cleared).
    pub fn set_token(&self, token: u64) {
        if token == 0 {
            return;
        }
        self.update(|c| c.network.token = token);
    }

    /// Set the node name and re-derive the default TCP port if unset.
    pub fn set_node(&self, node: &str) {
        self.update(|c| {
            c.network.node = node.to_string();
            if c.network.tcp_port == 0 {
                c.network.tcp_port = super::defaults::default_tcp_port(node);
            }
        });
    }

    /// Set the relay bandwidth share.
    pub fn set_share_bandwidth(&self, mbps: i32) {
        self.update(|c| c.network.share_bandwidth = mbps);
    }

    /// Record the facts the network probe learned (runtime-only, never
    /// persisted).
    pub fn set_net_info(
        &self,
        nat_type: burrow_net::NatType,
        public_ip: &str,
        has_ipv4: u8,
        has_upnp_or_natpmp: u8,
    ) {
        let mut config = self.lock();
        config.network.nat_type = Some(nat_type);
        config.network.public_ip = public_ip.to_string();
        config.network.has_ipv4 = has_ipv4;
        config.network.has_upnp_or_natpmp = has_upnp_or_natpmp;
    }

    /// Record the public IPv6 (runtime-only, no save needed).
    pub fn set_ipv6(&self, addr: &str) {
        self.lock().network.public_ipv6 = addr.to_lowercase();
    }

    /// Current public IPv6, if learned.
    pub fn ipv6(&self) -> String {
        self.lock().network.public_ipv6.clone()
    }

    /// Append an app, replacing any entry with the same `(protocol,
    /// src_port)` when `replace` is set.
    pub fn add_app(&self, app: AppConfig, replace: bool) {
        self.update(|c| {
            if replace {
                if let Some(existing) = c.apps.iter_mut().find(|a| a.key() == app.key()) {
                    *existing = app;
                    return;
                }
            }
            c.apps.push(app);
        });
    }

    /// Remove the app keyed by `(protocol, src_port)`.
    pub fn delete_app(&self, protocol: Protocol, src_port: u16) {
        self.update(|c| c.apps.retain(|a| a.key() != (protocol, src_port)));
    }

    /// Enable or disable an app, resetting its retry state.
    pub fn switch_app(&self, protocol: Protocol, src_port: u16, enabled: u8) {
        self.update(|c| {
            if let Some(app) = c.apps.iter_mut().find(|a| a.key() == (protocol, src_port)) {
                app.enabled = enabled;
                app.retry_num = 0;
                app.next_retry_time = None;
            }
        });
    }

    /// Mutate one app's runtime fields without touching the disk (runtime
    /// fields are never persisted, so there is nothing to save).
    pub fn with_app_mut(
        &self,
        protocol: Protocol,
        src_port: u16,
        mutate: impl FnOnce(&mut AppConfig),
    ) {
        let mut config = self.lock();
        if let Some(app) = config
            .apps
            .iter_mut()
            .find(|a| a.key() == (protocol, src_port))
        {
            mutate(app);
        }
    }

    /// Reset retry state for every app targeting `peer_node` (runtime-only).
    pub fn retry_apps_for(&self, peer_node: &str) {
        let mut config = self.lock();
        for app in config.apps.iter_mut().filter(|a| a.peer_node == peer_node) {
            app.retry_num = 0;
            app.next_retry_time = None;
        }
    }

    /// Persist the current state now.
    pub fn save(&self) {
        let config = self.lock();
        self.save_locked(&config);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Config> {
        self.inner.lock().expect("config mutex poisoned")
    }

    fn save_locked(&self, config: &Config) {
        if let Err(e) = write_atomic(&self.path, config) {
            error!("saving {} failed: {}", self.path.display(), e);
        }
    }
}

/// Parse a config file.
pub fn load_from(path: &Path) -> Result<Config> {
    let data = std::fs::read(path)?;
    serde_json::from_slice(&data).map_err(|e| StoreError::Parse(e.to_string()))
}

/// Write the config as 2-space-indented JSON via a temp file + rename so a
/// crash never leaves a torn file.
fn write_atomic(path: &Path, config: &Config) -> Result<()> {
    let data = serde_json::to_vec_pretty(config).map_err(|e| StoreError::Parse(e.to_string()))?;
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty());
    let mut tmp = match dir {
        Some(dir) => tempfile::NamedTempFile::new_in(dir)?,
        None => tempfile::NamedTempFile::new_in(".")?,
    };
    tmp.write_all(&data)?;
    tmp.flush()?;
    tmp.persist(path)
        .map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(dir: &Path) -> ConfigStore {
        ConfigStore::open(dir.join("config.json"), true)
    }

    fn sample_app(src_port: u16) -> AppConfig {
        AppConfig {
            protocol: Protocol::Tcp,
            src_port,
            peer_node: "peer-node-1".to_string(),
            dst_port: 80,
            dst_host: "127.0.0.1".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.set_node("n1-testnode");
        store.set_token(42);
        store.add_app(sample_app(8080), true);

        let loaded = ConfigStore::open(dir.path().join("config.json"), false).snapshot();
        assert_eq!(loaded.network.node, "n1-testnode");
        assert_eq!(loaded.network.token, 42);
        assert_eq!(loaded.apps.len(), 1);
        assert_eq!(loaded.apps[0].key(), (Protocol::Tcp, 8080));
        assert_eq!(loaded.apps[0].enabled, 1);
    }

    #[test]
    fn test_load_defaults_tcp_port_from_hash() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "network": { "Node": "n1-testnode", "Token": 42, "TCPPort": 0 },
                "apps": [ { "Protocol": "tcp", "SrcPort": 8080, "PeerNode": "p",
                            "DstPort": 80, "Enabled": 1 } ] }"#,
        )
        .unwrap();

        let store = ConfigStore::open(&path, false);
        let config = store.snapshot();
        assert_eq!(
            config.network.tcp_port,
            super::super::defaults::default_tcp_port("n1-testnode")
        );
        assert!((50000..65000).contains(&config.network.tcp_port));
        assert_eq!(config.apps[0].src_port, 8080);
    }

    #[test]
    fn test_saved_json_is_indented() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.set_node("indent-check");
        let raw = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(raw.contains("\n  \"network\""));
        assert!(raw.contains("\"Node\": \"indent-check\""));
    }

    #[test]
    fn test_add_app_replaces_same_key() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.add_app(sample_app(8080), true);
        let mut changed = sample_app(8080);
        changed.dst_port = 8443;
        store.add_app(changed, true);

        let config = store.snapshot();
        assert_eq!(config.apps.len(), 1);
        assert_eq!(config.apps[0].dst_port, 8443);
    }

    #[test]
    fn test_add_app_keeps_distinct_keys() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.add_app(sample_app(8080), true);
        store.add_app(sample_app(8081), true);
        assert_eq!(store.snapshot().apps.len(), 2);
    }

    #[test]
    fn test_delete_app() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.add_app(sample_app(8080), true);
        store.delete_app(Protocol::Tcp, 8080);
        assert!(store.snapshot().apps.is_empty());
    }

    #[test]
    fn test_switch_app_resets_retry_state(){
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let mut app = sample_app(8080);
        app.retry_num = 7;
        app.next_retry_time = Some(std::time::Instant::now());
        store.add_app(app, true);

        store.switch_app(Protocol::Tcp, 8080, 0);
        let config = store.snapshot();
        assert_eq!(config.apps[0].enabled, 0);
        assert_eq!(config.apps[0].retry_num, 0);
        assert!(config.apps[0].next_retry_time.is_none());
    }

    #[test]
    fn test_fresh_open_ignores_existing_file() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.add_app(sample_app(8080), true);

        let fresh = ConfigStore::open(dir.path().join("config.json"), true);
        assert!(fresh.snapshot().apps.is_empty());
    }

    #[test]
    fn test_ipv6_not_persisted() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.set_node("v6-check-node");
        store.set_ipv6("2001:DB8::1");
        assert_eq!(store.ipv6(), "2001:db8::1"); // lowercased

        let raw = std::fs::read_to_string(dir.path().join("config.json")).unwrap();
        assert!(!raw.to_lowercase().contains("2001:db8::1"));
    }
}
