//! In-memory gadget store
//!
//! Mirrors the configfs layout and rules without touching the filesystem.
//! Used for dry runs; every mutation is recorded as a [`StoreOp`] so the
//! planned sequence can be shown to the user.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use super::configfs::USB_GADGET_GROUP;
use super::store::{lang_dir, GadgetStore, NodeKind, NodeRef, NodeSpec, RootClaim};
use crate::error::{AppError, Result};

/// One mutation applied to a [`MemoryStore`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StoreOp {
    Create { kind: NodeKind, name: String },
    Delete { kind: NodeKind, name: String },
    Bind { name: String },
    Unbind { name: String },
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreOp::Create { kind, name } => write!(f, "create {} {}", kind, name),
            StoreOp::Delete { kind, name } => write!(f, "delete {} {}", kind, name),
            StoreOp::Bind { name } => write!(f, "bind {}", name),
            StoreOp::Unbind { name } => write!(f, "unbind {}", name),
        }
    }
}

#[derive(Debug, Clone)]
struct MemNode {
    kind: NodeKind,
    attrs: BTreeMap<String, String>,
    target: Option<PathBuf>,
}

/// Store held entirely in memory
#[derive(Debug)]
pub struct MemoryStore {
    root: PathBuf,
    gadgets_path: PathBuf,
    nodes: BTreeMap<PathBuf, MemNode>,
    owned: Vec<NodeRef>,
    ops: Vec<StoreOp>,
    _claim: RootClaim,
}

impl MemoryStore {
    /// Nodes currently present, by path
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a node of `kind` named `name` (registry name for bindings) exists
    pub fn contains(&self, kind: NodeKind, name: &str) -> bool {
        self.nodes
            .iter()
            .any(|(path, node)| node.kind == kind && registry_name_of(path, kind) == name)
    }

    /// Attribute value written to the node at `path`
    pub fn attr(&self, path: &Path, attr: &str) -> Option<&str> {
        self.nodes
            .get(path)
            .and_then(|n| n.attrs.get(attr))
            .map(String::as_str)
    }

    /// Mutations applied so far, oldest first
    pub fn ops(&self) -> &[StoreOp] {
        &self.ops
    }

    fn children(&self, parent: &Path, kind: NodeKind) -> Vec<&Path> {
        self.nodes
            .iter()
            .filter(|(path, node)| node.kind == kind && path.starts_with(parent) && *path != parent)
            .map(|(path, _)| path.as_path())
            .collect()
    }

    fn insert(&mut self, kind: NodeKind, path: PathBuf, attrs: BTreeMap<String, String>) -> Result<()> {
        if self.nodes.contains_key(&path) {
            return Err(AppError::NameConflict {
                kind,
                name: file_name(&path),
            });
        }
        self.nodes.insert(
            path,
            MemNode {
                kind,
                attrs,
                target: None,
            },
        );
        Ok(())
    }

    fn require_gadget<'a>(&self, parent: Option<&'a NodeRef>, spec: &NodeSpec<'_>) -> Result<&'a NodeRef> {
        match parent {
            Some(p) if p.kind == NodeKind::Gadget && self.nodes.contains_key(&p.path) => Ok(p),
            _ => Err(AppError::InvalidReference(format!(
                "{} '{}' must be created under an existing gadget",
                spec.kind(),
                spec.dir_name()
            ))),
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn registry_name_of(path: &Path, kind: NodeKind) -> String {
    match kind {
        NodeKind::Binding => {
            let config = path.parent().map(file_name).unwrap_or_default();
            format!("{}/{}", config, file_name(path))
        }
        _ => file_name(path),
    }
}

impl GadgetStore for MemoryStore {
    /// The root is only a namespace here; it need not exist on disk
    fn initialize(root: &Path) -> Result<Self> {
        let claim = RootClaim::acquire(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            gadgets_path: root.join(USB_GADGET_GROUP),
            nodes: BTreeMap::new(),
            owned: Vec::new(),
            ops: Vec::new(),
            _claim: claim,
        })
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn create_node(&mut self, parent: Option<&NodeRef>, spec: NodeSpec<'_>) -> Result<NodeRef> {
        let (path, parent_name, attrs) = match spec {
            NodeSpec::Gadget(gadget) => {
                if parent.is_some() {
                    return Err(AppError::InvalidReference(format!(
                        "gadget '{}' cannot have a parent node",
                        gadget.name
                    )));
                }
                let mut attrs: BTreeMap<String, String> = gadget
                    .attrs
                    .to_attr_files()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect();
                let lang = lang_dir(gadget.strings.lang());
                for (k, v) in gadget.strings.to_attr_files() {
                    attrs.insert(format!("strings/{}/{}", lang, k), v.to_string());
                }
                (self.gadgets_path.join(&gadget.name), None, attrs)
            }
            NodeSpec::Function(function) => {
                let gadget = self.require_gadget(parent, &spec)?;
                let attrs = function
                    .attrs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect();
                (
                    gadget.path.join("functions").join(function.id.dir_name()),
                    Some(gadget.name.clone()),
                    attrs,
                )
            }
            NodeSpec::Config(config) => {
                let gadget = self.require_gadget(parent, &spec)?;
                let suffix = format!(".{}", config.id);
                if let Some(existing) = self
                    .children(&gadget.path, NodeKind::Config)
                    .into_iter()
                    .map(file_name)
                    .find(|name| name.ends_with(&suffix))
                {
                    return Err(AppError::NameConflict {
                        kind: NodeKind::Config,
                        name: existing,
                    });
                }
                let mut attrs: BTreeMap<String, String> = config
                    .attrs
                    .to_attr_files()
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect();
                attrs.insert(
                    format!("strings/{}/configuration", lang_dir(config.strings.lang())),
                    config.strings.configuration().to_string(),
                );
                (
                    gadget.path.join("configs").join(config.dir_name()),
                    Some(gadget.name.clone()),
                    attrs,
                )
            }
        };

        let kind = spec.kind();
        self.insert(kind, path.clone(), attrs)?;

        let node = NodeRef {
            kind,
            name: file_name(&path),
            path,
            parent: parent_name,
            target: None,
        };
        debug!("Created {} in memory", node);
        self.ops.push(StoreOp::Create {
            kind,
            name: node.name.clone(),
        });
        self.owned.push(node.clone());
        Ok(node)
    }

    fn delete_node(&mut self, node: &NodeRef) -> Result<()> {
        if node.kind == NodeKind::Binding {
            return self.unbind(node);
        }
        if !self.nodes.contains_key(&node.path) {
            return Err(AppError::NotFound(node.to_string()));
        }

        let dependents: Vec<String> = match node.kind {
            NodeKind::Gadget => self
                .nodes
                .iter()
                .filter(|(path, _)| path.starts_with(&node.path) && *path != &node.path)
                .map(|(path, _)| file_name(path))
                .collect(),
            NodeKind::Function => self
                .nodes
                .iter()
                .filter(|(_, n)| n.target.as_deref() == Some(node.path.as_path()))
                .map(|(path, _)| registry_name_of(path, NodeKind::Binding))
                .collect(),
            NodeKind::Config => self
                .children(&node.path, NodeKind::Binding)
                .into_iter()
                .map(file_name)
                .collect(),
            NodeKind::Binding => Vec::new(),
        };
        if !dependents.is_empty() {
            return Err(AppError::HasDependents {
                node: node.to_string(),
                dependents,
            });
        }

        self.nodes.remove(&node.path);
        self.owned.retain(|n| n.path != node.path);
        self.ops.push(StoreOp::Delete {
            kind: node.kind,
            name: node.name.clone(),
        });
        Ok(())
    }

    fn bind(
        &mut self,
        config: &NodeRef,
        function: &NodeRef,
        binding_name: &str,
    ) -> Result<NodeRef> {
        if config.kind != NodeKind::Config || function.kind != NodeKind::Function {
            return Err(AppError::InvalidReference(format!(
                "cannot bind {} into {}",
                function, config
            )));
        }
        if !self.nodes.contains_key(&config.path) || !self.nodes.contains_key(&function.path) {
            return Err(AppError::InvalidReference(format!(
                "{} or {} is missing from the store",
                function, config
            )));
        }
        if config.parent != function.parent {
            return Err(AppError::InvalidReference(format!(
                "{} and {} belong to different gadgets",
                function, config
            )));
        }
        if binding_name.is_empty() || binding_name.contains('/') {
            return Err(AppError::InvalidAttrs(format!(
                "invalid binding name '{}'",
                binding_name
            )));
        }

        let link = config.path.join(binding_name);
        let duplicate_target = self.children(&config.path, NodeKind::Binding).into_iter().find(|p| {
            self.nodes
                .get(*p)
                .and_then(|n| n.target.as_deref())
                == Some(function.path.as_path())
        });
        if self.nodes.contains_key(&link) || duplicate_target.is_some() {
            let name = duplicate_target.map(file_name).unwrap_or_else(|| binding_name.to_string());
            return Err(AppError::NameConflict {
                kind: NodeKind::Binding,
                name: format!("{}/{}", config.name, name),
            });
        }

        self.nodes.insert(
            link.clone(),
            MemNode {
                kind: NodeKind::Binding,
                attrs: BTreeMap::new(),
                target: Some(function.path.clone()),
            },
        );

        let node = NodeRef {
            kind: NodeKind::Binding,
            name: binding_name.to_string(),
            path: link,
            parent: Some(config.name.clone()),
            target: Some(function.path.clone()),
        };
        self.ops.push(StoreOp::Bind {
            name: node.registry_name(),
        });
        self.owned.push(node.clone());
        Ok(node)
    }

    fn unbind(&mut self, binding: &NodeRef) -> Result<()> {
        match self.nodes.get(&binding.path) {
            Some(n) if n.kind == NodeKind::Binding => {}
            _ => return Err(AppError::NotFound(binding.to_string())),
        }
        self.nodes.remove(&binding.path);
        self.owned.retain(|n| n.path != binding.path);
        self.ops.push(StoreOp::Unbind {
            name: binding.registry_name(),
        });
        Ok(())
    }

    fn scan_gadget(&self, name: &str) -> Result<Vec<NodeRef>> {
        let gadget_path = self.gadgets_path.join(name);
        if !self.nodes.contains_key(&gadget_path) {
            return Err(AppError::NotFound(format!("gadget '{}'", name)));
        }

        let mut nodes = vec![NodeRef {
            kind: NodeKind::Gadget,
            name: name.to_string(),
            path: gadget_path.clone(),
            parent: None,
            target: None,
        }];
        for kind in [NodeKind::Function, NodeKind::Config, NodeKind::Binding] {
            for path in self.children(&gadget_path, kind) {
                let parent = match kind {
                    NodeKind::Binding => path.parent().map(file_name),
                    _ => Some(name.to_string()),
                };
                nodes.push(NodeRef {
                    kind,
                    name: file_name(path),
                    path: path.to_path_buf(),
                    parent,
                    target: self.nodes.get(path).and_then(|n| n.target.clone()),
                });
            }
        }
        Ok(nodes)
    }

    fn owned(&self) -> &[NodeRef] {
        &self.owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::attrs::{ConfigStrings, GadgetAttrs, GadgetStrings};
    use crate::gadget::function::{FunctionSpec, FunctionType};
    use crate::gadget::plan::{ConfigSpec, GadgetSpec};

    fn gadget_spec() -> GadgetSpec {
        GadgetSpec::new(
            "g1",
            GadgetAttrs::builder(0x0525, 0x0104).build().unwrap(),
            GadgetStrings::new("0123456789", "Linux Foundation", "Infotainment Unit").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn test_memory_store_tree() {
        let mut store = MemoryStore::initialize(Path::new("/mem/tree")).unwrap();
        let gadget = store.create_node(None, NodeSpec::Gadget(&gadget_spec())).unwrap();
        assert_eq!(store.attr(&gadget.path, "idVendor"), Some("0x0525"));
        assert_eq!(
            store.attr(&gadget.path, "strings/0x409/manufacturer"),
            Some("Linux Foundation")
        );

        let ncm = FunctionSpec::new(FunctionType::Ncm, "usb0").unwrap();
        let function = store.create_node(Some(&gadget), NodeSpec::Function(&ncm)).unwrap();
        let config_spec = ConfigSpec::new(1, ConfigStrings::new("NCM").unwrap()).unwrap();
        let config = store.create_node(Some(&gadget), NodeSpec::Config(&config_spec)).unwrap();
        store.bind(&config, &function, "ncm.usb0").unwrap();

        assert!(store.contains(NodeKind::Binding, "c.1/ncm.usb0"));
        assert_eq!(store.len(), 4);
        assert!(matches!(
            store.delete_node(&function),
            Err(AppError::HasDependents { .. })
        ));

        let scanned = store.scan_gadget("g1").unwrap();
        assert_eq!(scanned.len(), 4);
        assert_eq!(scanned[3].target.as_deref(), Some(function.path.as_path()));

        store.teardown().unwrap();
        assert!(store.is_empty());
        assert_eq!(
            store.ops().last(),
            Some(&StoreOp::Delete {
                kind: NodeKind::Gadget,
                name: "g1".to_string()
            })
        );
    }

    #[test]
    fn test_memory_store_conflicts() {
        let mut store = MemoryStore::initialize(Path::new("/mem/conflicts")).unwrap();
        let gadget = store.create_node(None, NodeSpec::Gadget(&gadget_spec())).unwrap();
        let ffs = FunctionSpec::new(FunctionType::Ffs, "usb0").unwrap();
        store.create_node(Some(&gadget), NodeSpec::Function(&ffs)).unwrap();

        let err = store
            .create_node(Some(&gadget), NodeSpec::Function(&ffs))
            .unwrap_err();
        assert!(matches!(err, AppError::NameConflict { kind: NodeKind::Function, .. }));
        assert_eq!(store.owned().len(), 2);
    }
}
