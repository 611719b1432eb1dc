//! Store adapter: the capability over the backing configfs hierarchy
//!
//! ```text
//! <root>/usb_gadget/<gadget>/
//!     idVendor, idProduct, ...        device descriptor attributes
//!     strings/0x409/{serialnumber, manufacturer, product}
//!     functions/<type>.<instance>/    function groups
//!     configs/<label>.<id>/           configuration groups
//!         strings/0x409/configuration
//!         <binding> -> ../../functions/<type>.<instance>
//! ```
//!
//! Every create call is all-or-nothing for the node it makes. Composing
//! several nodes atomically is left to the builder.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::configfs::{
    create_dir, create_dir_all, create_symlink, is_writable, list_dirs, list_symlinks, remove_dir,
    remove_file, write_file, USB_GADGET_GROUP,
};
use super::function::FunctionSpec;
use super::plan::{ConfigSpec, GadgetSpec};
use crate::error::{AppError, Result, UnavailableReason};

/// Kind of node living in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Gadget,
    Function,
    Config,
    Binding,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Gadget => write!(f, "gadget"),
            NodeKind::Function => write!(f, "function"),
            NodeKind::Config => write!(f, "config"),
            NodeKind::Binding => write!(f, "binding"),
        }
    }
}

/// Reference to a node created in (or imported from) a store
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRef {
    pub kind: NodeKind,
    /// Directory or link name ("g1", "ncm.usb0", "c.1")
    pub name: String,
    /// Location in the store
    pub path: PathBuf,
    /// Owning config for bindings, owning gadget otherwise
    pub parent: Option<String>,
    /// Function a binding points at
    pub target: Option<PathBuf>,
}

impl NodeRef {
    /// Name unique among all nodes of one gadget
    ///
    /// Binding names only need to be unique within their config, so they
    /// are qualified with it.
    pub fn registry_name(&self) -> String {
        match (self.kind, &self.parent) {
            (NodeKind::Binding, Some(config)) => format!("{}/{}", config, self.name),
            _ => self.name.clone(),
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.registry_name())
    }
}

/// What to create
#[derive(Debug, Clone, Copy)]
pub enum NodeSpec<'a> {
    Gadget(&'a GadgetSpec),
    Function(&'a FunctionSpec),
    Config(&'a ConfigSpec),
}

impl NodeSpec<'_> {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeSpec::Gadget(_) => NodeKind::Gadget,
            NodeSpec::Function(_) => NodeKind::Function,
            NodeSpec::Config(_) => NodeKind::Config,
        }
    }

    pub fn dir_name(&self) -> String {
        match self {
            NodeSpec::Gadget(g) => g.name.clone(),
            NodeSpec::Function(f) => f.id.dir_name(),
            NodeSpec::Config(c) => c.dir_name(),
        }
    }
}

/// Capability over a hierarchical gadget store
///
/// A value of an implementing type is the store handle: it is bound to one
/// root and owns every node created through it.
pub trait GadgetStore {
    /// Open a session on `root`
    fn initialize(root: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Root this handle is bound to
    fn root(&self) -> &Path;

    /// Create one node under `parent` (`None` for gadgets)
    fn create_node(&mut self, parent: Option<&NodeRef>, spec: NodeSpec<'_>) -> Result<NodeRef>;

    /// Delete a gadget, function or config node
    fn delete_node(&mut self, node: &NodeRef) -> Result<()>;

    /// Link `function` into `config` under `binding_name`
    fn bind(&mut self, config: &NodeRef, function: &NodeRef, binding_name: &str)
        -> Result<NodeRef>;

    /// Remove a binding link
    fn unbind(&mut self, binding: &NodeRef) -> Result<()>;

    /// Read back an existing gadget tree: gadget, functions, configs, bindings
    fn scan_gadget(&self, name: &str) -> Result<Vec<NodeRef>>;

    /// Nodes created through this handle and not yet removed, in creation order
    fn owned(&self) -> &[NodeRef];

    /// Remove a node of any kind
    fn remove(&mut self, node: &NodeRef) -> Result<()> {
        match node.kind {
            NodeKind::Binding => self.unbind(node),
            _ => self.delete_node(node),
        }
    }

    /// Remove everything this handle still owns, newest first
    ///
    /// Every node is attempted; failures are logged and the first one is
    /// returned. Calling it again after a clean run is a no-op.
    fn teardown(&mut self) -> Result<()> {
        let nodes = self.owned().to_vec();
        if nodes.is_empty() {
            return Ok(());
        }

        info!("Tearing down {} node(s) under {}", nodes.len(), self.root().display());
        let mut first_error = None;
        for node in nodes.iter().rev() {
            if let Err(e) = self.remove(node) {
                warn!("Teardown of {} failed: {}", node, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Roots currently held by a live store handle in this process
static CLAIMED_ROOTS: Mutex<BTreeSet<PathBuf>> = parking_lot::const_mutex(BTreeSet::new());

/// Exclusive claim on a store root, released on drop
#[derive(Debug)]
pub struct RootClaim {
    root: PathBuf,
}

impl RootClaim {
    pub fn acquire(root: &Path) -> Result<Self> {
        let key = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
        let mut claimed = CLAIMED_ROOTS.lock();
        if !claimed.insert(key.clone()) {
            return Err(AppError::StoreUnavailable {
                root: root.to_path_buf(),
                reason: UnavailableReason::AlreadyInitialized,
            });
        }
        Ok(Self { root: key })
    }
}

impl Drop for RootClaim {
    fn drop(&mut self) {
        CLAIMED_ROOTS.lock().remove(&self.root);
    }
}

/// Language directory name ("0x409")
pub fn lang_dir(lang: u16) -> String {
    format!("0x{:x}", lang)
}

/// Store backed by the kernel's configfs (or a plain directory mirroring it)
#[derive(Debug)]
pub struct ConfigFsStore {
    root: PathBuf,
    gadgets_path: PathBuf,
    owned: Vec<NodeRef>,
    _claim: RootClaim,
}

impl ConfigFsStore {
    /// Path of the `usb_gadget` group
    pub fn gadgets_path(&self) -> &Path {
        &self.gadgets_path
    }

    fn forget(&mut self, node: &NodeRef) {
        self.owned.retain(|n| n.path != node.path);
    }

    fn node_ref(kind: NodeKind, name: String, path: PathBuf, parent: Option<String>) -> NodeRef {
        NodeRef {
            kind,
            name,
            path,
            parent,
            target: None,
        }
    }

    fn expect_parent<'a>(parent: Option<&'a NodeRef>, spec: &NodeSpec<'_>) -> Result<&'a NodeRef> {
        match parent {
            Some(p) if p.kind == NodeKind::Gadget => {
                if !p.path.exists() {
                    return Err(AppError::InvalidReference(format!(
                        "gadget '{}' does not exist in the store",
                        p.name
                    )));
                }
                Ok(p)
            }
            _ => Err(AppError::InvalidReference(format!(
                "{} '{}' must be created under a gadget",
                spec.kind(),
                spec.dir_name()
            ))),
        }
    }

    /// Make the node directory, then fill it; on any failure the directory
    /// is removed again so no partial node is left behind.
    fn create_filled<F>(&self, kind: NodeKind, path: &Path, fill: F) -> Result<()>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        if path.exists() {
            return Err(AppError::NameConflict {
                kind,
                name: dir_file_name(path),
            });
        }
        create_dir(path).map_err(|e| match e {
            AppError::StoreIo { source, .. } if source.kind() == std::io::ErrorKind::AlreadyExists => {
                AppError::NameConflict {
                    kind,
                    name: dir_file_name(path),
                }
            }
            other => other,
        })?;

        if let Err(e) = fill(path) {
            warn!("Rolling back partially created {} at {}: {}", kind, path.display(), e);
            if let Err(rollback) = remove_node_dir(path) {
                warn!("Rollback of {} failed: {}", path.display(), rollback);
            }
            return Err(e);
        }
        Ok(())
    }

    fn create_gadget(&self, spec: &GadgetSpec) -> Result<NodeRef> {
        let path = self.gadgets_path.join(&spec.name);
        self.create_filled(NodeKind::Gadget, &path, |path| {
            for (attr, value) in spec.attrs.to_attr_files() {
                write_file(&path.join(attr), &value)?;
            }
            let strings_path = path.join("strings").join(lang_dir(spec.strings.lang()));
            create_dir_all(&strings_path)?;
            for (attr, value) in spec.strings.to_attr_files() {
                write_file(&strings_path.join(attr), value)?;
            }
            Ok(())
        })?;

        debug!("Created gadget {}", spec.name);
        Ok(Self::node_ref(NodeKind::Gadget, spec.name.clone(), path, None))
    }

    fn create_function(&self, gadget: &NodeRef, spec: &FunctionSpec) -> Result<NodeRef> {
        let functions_path = gadget.path.join("functions");
        create_dir_all(&functions_path)?;

        let name = spec.id.dir_name();
        let path = functions_path.join(&name);
        self.create_filled(NodeKind::Function, &path, |path| {
            for (attr, value) in spec.attrs.iter() {
                write_file(&path.join(attr), value)?;
            }
            Ok(())
        })?;

        debug!("Created function {}", name);
        Ok(Self::node_ref(
            NodeKind::Function,
            name,
            path,
            Some(gadget.name.clone()),
        ))
    }

    fn create_config(&self, gadget: &NodeRef, spec: &ConfigSpec) -> Result<NodeRef> {
        let configs_path = gadget.path.join("configs");
        create_dir_all(&configs_path)?;

        // bConfigurationValue must be unique whatever the label
        let suffix = format!(".{}", spec.id);
        if let Some(existing) = list_dirs(&configs_path)?
            .into_iter()
            .find(|d| d.ends_with(&suffix))
        {
            return Err(AppError::NameConflict {
                kind: NodeKind::Config,
                name: existing,
            });
        }

        let name = spec.dir_name();
        let path = configs_path.join(&name);
        self.create_filled(NodeKind::Config, &path, |path| {
            for (attr, value) in spec.attrs.to_attr_files() {
                write_file(&path.join(attr), &value)?;
            }
            let strings_path = path.join("strings").join(lang_dir(spec.strings.lang()));
            create_dir_all(&strings_path)?;
            write_file(&strings_path.join("configuration"), spec.strings.configuration())?;
            Ok(())
        })?;

        debug!("Created config {}", name);
        Ok(Self::node_ref(
            NodeKind::Config,
            name,
            path,
            Some(gadget.name.clone()),
        ))
    }

    /// Config links (config name, link name) that point at `function_path`
    fn links_to(&self, function_path: &Path) -> Result<Vec<String>> {
        let Some(configs_path) = function_path
            .parent()
            .and_then(Path::parent)
            .map(|g| g.join("configs"))
        else {
            return Ok(Vec::new());
        };

        let mut links = Vec::new();
        for config in list_dirs(&configs_path)? {
            for (link, target) in list_symlinks(&configs_path.join(&config))? {
                if same_node(&target, function_path) {
                    links.push(format!("{}/{}", config, link));
                }
            }
        }
        Ok(links)
    }
}

/// Compare a symlink target with a node path, tolerating relative links
fn same_node(target: &Path, node: &Path) -> bool {
    target == node || (target.file_name().is_some() && target.file_name() == node.file_name())
}

fn dir_file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Remove a gadget or config directory including its string groups
fn remove_node_dir(path: &Path) -> Result<()> {
    let strings_path = path.join("strings");
    for lang in list_dirs(&strings_path)? {
        remove_dir(&strings_path.join(lang))?;
    }
    remove_dir(path)
}

impl GadgetStore for ConfigFsStore {
    fn initialize(root: &Path) -> Result<Self> {
        let unavailable = |reason| AppError::StoreUnavailable {
            root: root.to_path_buf(),
            reason,
        };

        if !root.exists() {
            return Err(unavailable(UnavailableReason::NotFound));
        }
        let gadgets_path = root.join(USB_GADGET_GROUP);
        if !gadgets_path.exists() {
            // libcomposite not loaded
            return Err(unavailable(UnavailableReason::NotFound));
        }
        if !is_writable(&gadgets_path) {
            return Err(unavailable(UnavailableReason::PermissionDenied));
        }

        let claim = RootClaim::acquire(root)?;
        info!("Opened gadget store at {}", gadgets_path.display());

        Ok(Self {
            root: root.to_path_buf(),
            gadgets_path,
            owned: Vec::new(),
            _claim: claim,
        })
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn create_node(&mut self, parent: Option<&NodeRef>, spec: NodeSpec<'_>) -> Result<NodeRef> {
        let node = match spec {
            NodeSpec::Gadget(gadget) => {
                if parent.is_some() {
                    return Err(AppError::InvalidReference(format!(
                        "gadget '{}' cannot have a parent node",
                        gadget.name
                    )));
                }
                self.create_gadget(gadget)?
            }
            NodeSpec::Function(function) => {
                let gadget = Self::expect_parent(parent, &spec)?;
                self.create_function(gadget, function)?
            }
            NodeSpec::Config(config) => {
                let gadget = Self::expect_parent(parent, &spec)?;
                self.create_config(gadget, config)?
            }
        };

        self.owned.push(node.clone());
        Ok(node)
    }

    fn delete_node(&mut self, node: &NodeRef) -> Result<()> {
        if node.kind == NodeKind::Binding {
            return self.unbind(node);
        }
        if !node.path.exists() {
            return Err(AppError::NotFound(node.to_string()));
        }

        let dependents = match node.kind {
            NodeKind::Gadget => {
                let mut deps: Vec<String> = list_dirs(&node.path.join("functions"))?;
                deps.extend(list_dirs(&node.path.join("configs"))?);
                deps
            }
            NodeKind::Function => self.links_to(&node.path)?,
            NodeKind::Config => list_symlinks(&node.path)?
                .into_iter()
                .map(|(name, _)| name)
                .collect(),
            NodeKind::Binding => Vec::new(),
        };
        if !dependents.is_empty() {
            return Err(AppError::HasDependents {
                node: node.to_string(),
                dependents,
            });
        }

        match node.kind {
            NodeKind::Function => remove_dir(&node.path)?,
            _ => remove_node_dir(&node.path)?,
        }

        debug!("Deleted {}", node);
        self.forget(node);
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
        if !config.path.exists() || !function.path.exists() {
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

        let existing = list_symlinks(&config.path)?;
        if let Some((name, _)) = existing
            .iter()
            .find(|(name, target)| name == binding_name || same_node(target, &function.path))
        {
            return Err(AppError::NameConflict {
                kind: NodeKind::Binding,
                name: format!("{}/{}", config.name, name),
            });
        }

        let link = config.path.join(binding_name);
        create_symlink(&function.path, &link)?;
        debug!("Linked {} into {} as {}", function.name, config.name, binding_name);

        let node = NodeRef {
            kind: NodeKind::Binding,
            name: binding_name.to_string(),
            path: link,
            parent: Some(config.name.clone()),
            target: Some(function.path.clone()),
        };
        self.owned.push(node.clone());
        Ok(node)
    }

    fn unbind(&mut self, binding: &NodeRef) -> Result<()> {
        if std::fs::symlink_metadata(&binding.path).is_err() {
            return Err(AppError::NotFound(binding.to_string()));
        }
        remove_file(&binding.path)?;
        debug!("Unlinked {}", binding);
        self.forget(binding);
        Ok(())
    }

    fn scan_gadget(&self, name: &str) -> Result<Vec<NodeRef>> {
        let gadget_path = self.gadgets_path.join(name);
        if !gadget_path.is_dir() {
            return Err(AppError::NotFound(format!("gadget '{}'", name)));
        }

        let mut nodes = vec![Self::node_ref(
            NodeKind::Gadget,
            name.to_string(),
            gadget_path.clone(),
            None,
        )];

        let functions_path = gadget_path.join("functions");
        for function in list_dirs(&functions_path)? {
            let path = functions_path.join(&function);
            nodes.push(Self::node_ref(
                NodeKind::Function,
                function,
                path,
                Some(name.to_string()),
            ));
        }

        let configs_path = gadget_path.join("configs");
        let configs = list_dirs(&configs_path)?;
        for config in &configs {
            nodes.push(Self::node_ref(
                NodeKind::Config,
                config.clone(),
                configs_path.join(config),
                Some(name.to_string()),
            ));
        }
        for config in &configs {
            let config_path = configs_path.join(config);
            for (link, target) in list_symlinks(&config_path)? {
                nodes.push(NodeRef {
                    kind: NodeKind::Binding,
                    name: link.clone(),
                    path: config_path.join(&link),
                    parent: Some(config.clone()),
                    target: Some(target),
                });
            }
        }

        debug!("Scanned gadget {}: {} node(s)", name, nodes.len());
        Ok(nodes)
    }

    fn owned(&self) -> &[NodeRef] {
        &self.owned
    }
}
