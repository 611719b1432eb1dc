//! Entity registry: live entities of one build, in creation order

use std::collections::{BTreeMap, HashMap};

use super::store::{NodeKind, NodeRef};
use crate::error::{AppError, Result};

/// One registered entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub kind: NodeKind,
    pub name: String,
    pub node: NodeRef,
}

/// In-memory map from logical names to created store nodes
///
/// Names are unique per kind. Every registration gets a monotonically
/// increasing sequence number, so the creation order survives removals and
/// the unwinder can replay it backwards.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    index: HashMap<(NodeKind, String), u64>,
    entries: BTreeMap<u64, RegistryEntry>,
    next_seq: u64,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: NodeKind, name: impl Into<String>, node: NodeRef) -> Result<()> {
        let name = name.into();
        let key = (kind, name.clone());
        if self.index.contains_key(&key) {
            return Err(AppError::NameConflict { kind, name });
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(key, seq);
        self.entries.insert(seq, RegistryEntry { kind, name, node });
        Ok(())
    }

    /// Register a node under its own registry name
    pub fn register_node(&mut self, node: NodeRef) -> Result<()> {
        self.register(node.kind, node.registry_name(), node)
    }

    pub fn lookup(&self, kind: NodeKind, name: &str) -> Result<&NodeRef> {
        self.index
            .get(&(kind, name.to_string()))
            .and_then(|seq| self.entries.get(seq))
            .map(|entry| &entry.node)
            .ok_or_else(|| AppError::NotFound(format!("{} '{}' is not registered", kind, name)))
    }

    pub fn unregister(&mut self, kind: NodeKind, name: &str) -> Result<NodeRef> {
        let seq = self
            .index
            .remove(&(kind, name.to_string()))
            .ok_or_else(|| AppError::NotFound(format!("{} '{}' is not registered", kind, name)))?;
        self.entries
            .remove(&seq)
            .map(|entry| entry.node)
            .ok_or_else(|| AppError::Internal(format!("registry index out of sync for '{}'", name)))
    }

    /// (kind, name) pairs in insertion order
    pub fn list_created_in_order(&self) -> Vec<(NodeKind, String)> {
        self.entries
            .values()
            .map(|e| (e.kind, e.name.clone()))
            .collect()
    }

    /// Full entries in insertion order
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.entries.values().cloned().collect()
    }

    /// Adopt nodes that already exist in the store
    ///
    /// Nodes must be given parents first (as `scan_gadget` returns them).
    /// Nothing is registered if any name collides.
    pub fn import(&mut self, nodes: impl IntoIterator<Item = NodeRef>) -> Result<usize> {
        let nodes: Vec<NodeRef> = nodes.into_iter().collect();
        let mut seen = std::collections::HashSet::new();
        for node in &nodes {
            let key = (node.kind, node.registry_name());
            if self.index.contains_key(&key) || !seen.insert(key) {
                return Err(AppError::NameConflict {
                    kind: node.kind,
                    name: node.registry_name(),
                });
            }
        }

        let count = nodes.len();
        for node in nodes {
            self.register_node(node)?;
        }
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered nodes of one kind, in insertion order
    pub fn nodes_of(&self, kind: NodeKind) -> Vec<&NodeRef> {
        self.entries
            .values()
            .filter(|e| e.kind == kind)
            .map(|e| &e.node)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn node(kind: NodeKind, name: &str) -> NodeRef {
        NodeRef {
            kind,
            name: name.to_string(),
            path: PathBuf::from("/cfg/usb_gadget/g1").join(name),
            parent: Some("g1".to_string()),
            target: None,
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = EntityRegistry::new();
        registry
            .register(NodeKind::Function, "ffs.usb0", node(NodeKind::Function, "ffs.usb0"))
            .unwrap();

        assert_eq!(
            registry.lookup(NodeKind::Function, "ffs.usb0").unwrap().name,
            "ffs.usb0"
        );
        // Same name, different kind, is a different entity
        assert!(registry.lookup(NodeKind::Config, "ffs.usb0").is_err());

        let err = registry
            .register(NodeKind::Function, "ffs.usb0", node(NodeKind::Function, "ffs.usb0"))
            .unwrap_err();
        assert!(matches!(err, AppError::NameConflict { .. }));
    }

    #[test]
    fn test_order_survives_unregister() {
        let mut registry = EntityRegistry::new();
        for (kind, name) in [
            (NodeKind::Gadget, "g1"),
            (NodeKind::Function, "ffs.usb0"),
            (NodeKind::Function, "ncm.usb0"),
            (NodeKind::Config, "c.1"),
        ] {
            registry.register_node(node(kind, name)).unwrap();
        }

        registry.unregister(NodeKind::Function, "ffs.usb0").unwrap();
        registry.register_node(node(NodeKind::Function, "acm.usb0")).unwrap();

        let names: Vec<String> = registry
            .list_created_in_order()
            .into_iter()
            .map(|(_, n)| n)
            .collect();
        assert_eq!(names, vec!["g1", "ncm.usb0", "c.1", "acm.usb0"]);
        assert!(registry.unregister(NodeKind::Function, "ffs.usb0").is_err());
    }

    #[test]
    fn test_import_all_or_nothing() {
        let mut registry = EntityRegistry::new();
        registry.register_node(node(NodeKind::Function, "ncm.usb0")).unwrap();

        let err = registry
            .import(vec![
                node(NodeKind::Gadget, "g1"),
                node(NodeKind::Function, "ncm.usb0"),
            ])
            .unwrap_err();
        assert!(matches!(err, AppError::NameConflict { .. }));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.import(vec![node(NodeKind::Gadget, "g1")]).unwrap(), 1);
        assert_eq!(registry.nodes_of(NodeKind::Gadget).len(), 1);
    }
}
