//! Daemon-resident registry of live tunnels.
//!
//! A single mutex guards the name -> handle map. The lock is held only for
//! map operations; resolving, dialing and forwarding all happen outside it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Tunnel, TunnelDesc, TunnelState};

#[derive(Default)]
pub struct Registry {
    tunnels: Mutex<HashMap<String, Arc<Tunnel>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tunnels.lock().contains_key(name)
    }

    /// Insert a tunnel; returns false (and leaves the map unchanged) if the
    /// name is already taken.
    pub fn insert(&self, name: String, tunnel: Arc<Tunnel>) -> bool {
        let mut map = self.tunnels.lock();
        if map.contains_key(&name) {
            return false;
        }
        map.insert(name, tunnel);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.lock().remove(name)
    }

    /// Remove `name` only if it still maps to this exact tunnel, so a reaper
    /// for a dead tunnel cannot evict a newer one under the same name.
    pub fn remove_entry(&self, name: &str, tunnel: &Arc<Tunnel>) {
        let mut map = self.tunnels.lock();
        if map.get(name).is_some_and(|t| Arc::ptr_eq(t, tunnel)) {
            map.remove(name);
        }
    }

    /// Point-in-time snapshot of the running tunnels, taken under the lock.
    pub fn running(&self) -> HashMap<String, TunnelDesc> {
        self.tunnels
            .lock()
            .iter()
            .filter(|(_, t)| t.state() == TunnelState::Open)
            .map(|(name, t)| (name.clone(), t.desc().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::TunnelMode;

    fn stub(name: &str, state: TunnelState) -> Arc<Tunnel> {
        Arc::new(Tunnel::stub(
            TunnelDesc {
                name: name.to_string(),
                mode: TunnelMode::Local,
                local: Some("9000".to_string()),
                remote: Some("localhost:9000".to_string()),
                host: "dev".to_string(),
                user: None,
                identity: None,
            },
            state,
        ))
    }

    #[test]
    fn test_insert_rejects_duplicates() {
        let registry = Registry::new();
        assert!(registry.insert("dev".to_string(), stub("dev", TunnelState::Open)));
        assert!(!registry.insert("dev".to_string(), stub("dev", TunnelState::Open)));
        assert!(registry.contains("dev"));
    }

    #[test]
    fn test_running_lists_only_open_tunnels() {
        let registry = Registry::new();
        registry.insert("up".to_string(), stub("up", TunnelState::Open));
        registry.insert("down".to_string(), stub("down", TunnelState::Closing));
        let running = registry.running();
        assert_eq!(running.len(), 1);
        assert!(running.contains_key("up"));
    }

    #[test]
    fn test_remove_entry_is_identity_guarded() {
        let registry = Registry::new();
        let old = stub("dev", TunnelState::Failed);
        registry.insert("dev".to_string(), old.clone());
        let newer = stub("dev", TunnelState::Open);
        registry.remove("dev");
        registry.insert("dev".to_string(), newer.clone());

        // The old tunnel's reaper must not evict the replacement.
        registry.remove_entry("dev", &old);
        assert!(registry.contains("dev"));
        registry.remove_entry("dev", &newer);
        assert!(!registry.contains("dev"));
    }

    #[test]
    fn test_open_close_restores_prior_state() {
        let registry = Registry::new();
        assert!(registry.running().is_empty());
        let t = stub("dev", TunnelState::Open);
        registry.insert("dev".to_string(), t.clone());
        assert_eq!(registry.running().len(), 1);
        registry.remove_entry("dev", &t);
        assert!(registry.running().is_empty());
    }
}
