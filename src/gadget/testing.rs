//! Test helpers: a sample plan and a store wrapper that injects failures

use std::io;
use std::path::Path;
use std::time::Duration;

use super::attrs::{ConfigStrings, GadgetAttrs, GadgetStrings};
use super::function::{FunctionSpec, FunctionType};
use super::plan::{BindingSpec, ConfigSpec, GadgetPlan, GadgetSpec};
use super::store::{GadgetStore, NodeRef, NodeSpec};
use crate::error::{AppError, Result};

/// g1 (0x0525:0x0104) with ffs.usb0 + ncm.usb0 bound into config 1
pub fn sample_plan() -> GadgetPlan {
    let gadget = GadgetSpec::new(
        "g1",
        GadgetAttrs::builder(0x0525, 0x0104).build().unwrap(),
        GadgetStrings::new("0123456789", "Linux Foundation", "Infotainment Unit").unwrap(),
    )
    .unwrap();
    let ffs = FunctionSpec::new(FunctionType::Ffs, "usb0").unwrap();
    let ncm = FunctionSpec::new(FunctionType::Ncm, "usb0").unwrap();
    let config = ConfigSpec::new(1, ConfigStrings::new("iAP2 / NCM Interface").unwrap()).unwrap();

    GadgetPlan::new(gadget)
        .binding(BindingSpec::new(ffs.id.clone(), 1))
        .binding(BindingSpec::new(ncm.id.clone(), 1))
        .function(ffs)
        .function(ncm)
        .config(config)
}

/// Operation to fail, matched by node or binding name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Create(&'static str),
    Delete(&'static str),
    Bind(&'static str),
    Unbind(&'static str),
}

impl Fault {
    fn hits(&self, op: &str, name: &str) -> bool {
        match self {
            Fault::Create(n) => op == "create" && *n == name,
            Fault::Delete(n) => op == "delete" && *n == name,
            Fault::Bind(n) => op == "bind" && *n == name,
            Fault::Unbind(n) => op == "unbind" && *n == name,
        }
    }
}

/// Wraps a store, fails selected operations with `StoreIo` and slows
/// down selected creates
pub struct FaultyStore<S> {
    inner: S,
    faults: Vec<Fault>,
    delays: Vec<(&'static str, Duration)>,
    calls: Vec<String>,
}

impl<S: GadgetStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Vec::new(),
            delays: Vec::new(),
            calls: Vec::new(),
        }
    }

    pub fn fail(&mut self, fault: Fault) {
        self.faults.push(fault);
    }

    /// Block for `duration` whenever a node named `name` is created
    pub fn delay(&mut self, name: &'static str, duration: Duration) {
        self.delays.push((name, duration));
    }

    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Every call seen, as "create ncm.usb0", "unbind c.1/ncm.usb0", ...
    pub fn calls(&self) -> &[String] {
        &self.calls
    }

    fn check(&mut self, op: &str, name: String) -> Result<()> {
        let call = format!("{} {}", op, name);
        self.calls.push(call.clone());
        if self.faults.iter().any(|f| f.hits(op, &name)) {
            return Err(AppError::store_io(
                call,
                io::Error::new(io::ErrorKind::Other, "injected failure"),
            ));
        }
        Ok(())
    }
}

impl<S: GadgetStore> GadgetStore for FaultyStore<S> {
    fn initialize(root: &Path) -> Result<Self> {
        S::initialize(root).map(Self::new)
    }

    fn root(&self) -> &Path {
        self.inner.root()
    }

    fn create_node(&mut self, parent: Option<&NodeRef>, spec: NodeSpec<'_>) -> Result<NodeRef> {
        let name = spec.dir_name();
        if let Some((_, duration)) = self.delays.iter().find(|(n, _)| *n == name) {
            std::thread::sleep(*duration);
        }
        self.check("create", name)?;
        self.inner.create_node(parent, spec)
    }

    fn delete_node(&mut self, node: &NodeRef) -> Result<()> {
        self.check("delete", node.registry_name())?;
        self.inner.delete_node(node)
    }

    fn bind(&mut self, config: &NodeRef, function: &NodeRef, binding_name: &str) -> Result<NodeRef> {
        self.check("bind", format!("{}/{}", config.name, binding_name))?;
        self.inner.bind(config, function, binding_name)
    }

    fn unbind(&mut self, binding: &NodeRef) -> Result<()> {
        self.check("unbind", binding.registry_name())?;
        self.inner.unbind(binding)
    }

    fn scan_gadget(&self, name: &str) -> Result<Vec<NodeRef>> {
        self.inner.scan_gadget(name)
    }

    fn owned(&self) -> &[NodeRef] {
        self.inner.owned()
    }
}
