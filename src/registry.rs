//! Adapter registry: discovery and introspection bookkeeping.
//!
//! The registry exists for operators and UIs, not for correctness. The
//! decoder's own binding is the source of truth for what is active; the
//! registry mirrors it and may be rebuilt from disk at any time without
//! touching live adapter state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, trace};

use crate::resolve::{self, AdapterFormat};

/// One discovered or recorded adapter.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
    pub name: String,
    pub source_path: PathBuf,
    pub format: AdapterFormat,
    pub active: bool,
}

/// Read-only view of the registry, safe to hand to debug endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub initialized: bool,
    pub scan_root: Option<PathBuf>,
    pub entries: Vec<RegistryEntry>,
}

#[derive(Debug, Default)]
pub struct AdapterRegistry {
    initialized: bool,
    scan_root: Option<PathBuf>,
    entries: BTreeMap<String, RegistryEntry>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent initialization. The first call flips the registry to
    /// initialized; later calls are no-ops. Never touches entries.
    pub fn ensure(&mut self) {
        if !self.initialized {
            self.initialized = true;
            trace!("adapter registry initialized");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Drop all entries and rescan.
    ///
    /// `root` updates the remembered scan root when given; otherwise the
    /// previous root is rescanned. An entry for the currently active
    /// adapter survives the rebuild even when it lives outside the root,
    /// so introspection never loses sight of what is bound. Returns the
    /// entry count and the sorted entry names.
    pub fn rebuild(&mut self, root: Option<&Path>) -> (usize, Vec<String>) {
        self.ensure();
        if let Some(root) = root {
            self.scan_root = Some(root.to_path_buf());
        }

        let active = self.entries.values().find(|e| e.active).cloned();
        self.entries.clear();

        if let Some(root) = self.scan_root.clone() {
            self.scan(&root);
        }
        if let Some(active) = active {
            self.entries
                .entry(active.name.clone())
                .and_modify(|e| e.active = true)
                .or_insert(active);
        }

        let names = self.names();
        debug!(count = names.len(), "adapter registry rebuilt");
        (names.len(), names)
    }

    /// Record one pass over `root`: the root itself if it is an artifact,
    /// plus every direct child that is.
    fn scan(&mut self, root: &Path) {
        let mut candidates = vec![root.to_path_buf()];
        if let Ok(children) = std::fs::read_dir(root) {
            for child in children.flatten() {
                candidates.push(child.path());
            }
        }
        for candidate in candidates {
            let artifact = resolve::resolve(&candidate);
            if artifact.format == AdapterFormat::Unknown {
                continue;
            }
            let name = resolve::adapter_name(&artifact);
            self.entries.insert(
                name.clone(),
                RegistryEntry {
                    name,
                    source_path: artifact.path,
                    format: artifact.format,
                    active: false,
                },
            );
        }
    }

    /// Mark `name` as the single active adapter, inserting the entry when
    /// discovery never saw it.
    pub fn mark_active(&mut self, name: &str, source: &Path, format: AdapterFormat) {
        for entry in self.entries.values_mut() {
            entry.active = false;
        }
        self.entries
            .entry(name.to_string())
            .and_modify(|e| {
                e.active = true;
                e.source_path = source.to_path_buf();
                e.format = format;
            })
            .or_insert_with(|| RegistryEntry {
                name: name.to_string(),
                source_path: source.to_path_buf(),
                format,
                active: true,
            });
    }

    pub fn clear_active(&mut self) {
        for entry in self.entries.values_mut() {
            entry.active = false;
        }
    }

    pub fn active(&self) -> Option<&RegistryEntry> {
        self.entries.values().find(|e| e.active)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cheap copy of the current state; never scans.
    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            initialized: self.initialized,
            scan_root: self.scan_root.clone(),
            entries: self.entries.values().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::{ADAPTER_CONFIG_FILENAME, LOKR_WEIGHTS_FILENAME};

    fn make_standard(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir(&dir).unwrap();
        std::fs::write(dir.join(ADAPTER_CONFIG_FILENAME), "{}").unwrap();
        dir
    }

    fn make_kronecker(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        std::fs::create_dir(&dir).unwrap();
        let weights = dir.join(LOKR_WEIGHTS_FILENAME);
        std::fs::write(&weights, b"w").unwrap();
        weights
    }

    #[test]
    fn ensure_is_idempotent() {
        let mut registry = AdapterRegistry::new();
        assert!(!registry.is_initialized());
        registry.ensure();
        registry.ensure();
        assert!(registry.is_initialized());
        assert!(registry.is_empty());
    }

    #[test]
    fn rebuild_without_root_is_empty() {
        let mut registry = AdapterRegistry::new();
        let (count, names) = registry.rebuild(None);
        assert_eq!(count, 0);
        assert!(names.is_empty());
        assert!(registry.is_initialized());
    }

    #[test]
    fn rebuild_discovers_both_families_sorted() {
        let root = tempfile::tempdir().unwrap();
        make_standard(root.path(), "b-lora");
        make_kronecker(root.path(), "a-lokr");
        std::fs::create_dir(root.path().join("not-an-adapter")).unwrap();

        let mut registry = AdapterRegistry::new();
        let (count, names) = registry.rebuild(Some(root.path()));

        assert_eq!(count, 2);
        assert_eq!(names, vec!["a-lokr", "b-lora"]);
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.entries[0].format, AdapterFormat::Kronecker);
        assert_eq!(snapshot.entries[1].format, AdapterFormat::Standard);
        assert!(snapshot.entries.iter().all(|e| !e.active));
    }

    #[test]
    fn rebuild_registers_the_root_itself() {
        let root = tempfile::tempdir().unwrap();
        let adapter = root.path().join("solo");
        std::fs::create_dir(&adapter).unwrap();
        std::fs::write(adapter.join(ADAPTER_CONFIG_FILENAME), "{}").unwrap();

        let mut registry = AdapterRegistry::new();
        let (count, names) = registry.rebuild(Some(&adapter));
        assert_eq!(count, 1);
        assert_eq!(names, vec!["solo"]);
    }

    #[test]
    fn rebuild_remembers_the_scan_root() {
        let root = tempfile::tempdir().unwrap();
        make_standard(root.path(), "first");

        let mut registry = AdapterRegistry::new();
        registry.rebuild(Some(root.path()));
        make_standard(root.path(), "second");

        let (count, names) = registry.rebuild(None);
        assert_eq!(count, 2);
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn mark_active_keeps_a_single_active_entry() {
        let root = tempfile::tempdir().unwrap();
        let a = make_standard(root.path(), "a");
        let b = make_standard(root.path(), "b");

        let mut registry = AdapterRegistry::new();
        registry.rebuild(Some(root.path()));

        registry.mark_active("a", &a, AdapterFormat::Standard);
        registry.mark_active("b", &b, AdapterFormat::Standard);

        let active = registry.active().unwrap();
        assert_eq!(active.name, "b");
        assert_eq!(
            registry.snapshot().entries.iter().filter(|e| e.active).count(),
            1
        );
    }

    #[test]
    fn active_entry_survives_rebuild_of_another_root() {
        let outside = tempfile::tempdir().unwrap();
        let weights = make_kronecker(outside.path(), "live");

        let mut registry = AdapterRegistry::new();
        registry.mark_active("live", &weights, AdapterFormat::Kronecker);

        let elsewhere = tempfile::tempdir().unwrap();
        make_standard(elsewhere.path(), "idle");
        let (count, names) = registry.rebuild(Some(elsewhere.path()));

        assert_eq!(count, 2);
        assert_eq!(names, vec!["idle", "live"]);
        assert_eq!(registry.active().unwrap().name, "live");
    }

    #[test]
    fn clear_active_removes_the_mark_but_not_the_entry() {
        let root = tempfile::tempdir().unwrap();
        let a = make_standard(root.path(), "a");

        let mut registry = AdapterRegistry::new();
        registry.mark_active("a", &a, AdapterFormat::Standard);
        registry.clear_active();

        assert!(registry.active().is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn snapshot_serializes_to_json() {
        let root = tempfile::tempdir().unwrap();
        let a = make_standard(root.path(), "a");

        let mut registry = AdapterRegistry::new();
        registry.rebuild(Some(root.path()));
        registry.mark_active("a", &a, AdapterFormat::Standard);

        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json["initialized"], true);
        assert_eq!(json["entries"][0]["name"], "a");
        assert_eq!(json["entries"][0]["format"], "lora");
        assert_eq!(json["entries"][0]["active"], true);
    }
}
