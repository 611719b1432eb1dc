//! Gadget builder: ordered composition with unwind on failure
//!
//! ```text
//! Init -> GadgetCreated -> FunctionsCreated(N) -> ConfigsCreated(K)
//!      -> BindingsAdded(M) -> Done
//!                 any failure -> Failed (after unwinding)
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::configfs::UDC_CLASS_PATH;
use super::function::FunctionId;
use super::guidance::activation_guidance;
use super::plan::{BindingSpec, GadgetPlan};
use super::registry::EntityRegistry;
use super::store::{GadgetStore, NodeKind, NodeRef, NodeSpec};
use super::unwind::{UnwindPolicy, UnwindReport, Unwinder};
use crate::error::{AppError, Result};

/// Progress of one build attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildState {
    Init,
    GadgetCreated,
    FunctionsCreated(usize),
    ConfigsCreated(usize),
    BindingsAdded(usize),
    Done,
    Failed,
}

/// The step a build was executing when it stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStep {
    ValidatePlan,
    InitStore(PathBuf),
    CreateGadget(String),
    CreateFunction(FunctionId),
    CreateConfig(u8),
    AddBinding { binding: String, config_id: u8 },
    /// The blocking worker running the build went away
    Worker,
}

impl fmt::Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStep::ValidatePlan => write!(f, "validating plan"),
            BuildStep::InitStore(root) => write!(f, "initializing store at {}", root.display()),
            BuildStep::CreateGadget(name) => write!(f, "creating gadget '{}'", name),
            BuildStep::CreateFunction(id) => write!(f, "creating function '{}'", id),
            BuildStep::CreateConfig(id) => write!(f, "creating config {}", id),
            BuildStep::AddBinding { binding, config_id } => {
                write!(f, "binding '{}' into config {}", binding, config_id)
            }
            BuildStep::Worker => write!(f, "running build worker"),
        }
    }
}

/// A failed build: the step, the root cause, and what unwinding achieved
#[derive(Error, Debug)]
#[error("{step} failed: {source}")]
pub struct BuildError {
    pub step: BuildStep,
    /// Last state reached before the failing step
    pub reached: BuildState,
    #[source]
    pub source: AppError,
    pub unwind: UnwindReport,
}

impl BuildError {
    /// Terminal state of the attempt
    pub fn state(&self) -> BuildState {
        BuildState::Failed
    }

    fn without_unwind(step: BuildStep, source: AppError) -> Self {
        Self {
            step,
            reached: BuildState::Init,
            source,
            unwind: UnwindReport::default(),
        }
    }
}

/// Knobs for a build attempt
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Overall time budget, checked between steps
    pub deadline: Option<Duration>,
    pub unwind_policy: UnwindPolicy,
    /// Where to look for a UDC when writing activation guidance
    pub udc_class_path: PathBuf,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            deadline: None,
            unwind_policy: UnwindPolicy::BestEffort,
            udc_class_path: PathBuf::from(UDC_CLASS_PATH),
        }
    }
}

/// Fully composed tree, not activated
#[derive(Debug, Clone, Serialize)]
pub struct BuildResult {
    pub gadget: NodeRef,
    pub functions: Vec<NodeRef>,
    pub configs: Vec<NodeRef>,
    pub bindings: Vec<NodeRef>,
    /// What the operator still has to do before the gadget works
    pub guidance: Vec<String>,
}

/// Successful build: the store handle, its registry, and the result
#[derive(Debug)]
pub struct ComposedGadget<S> {
    store: S,
    registry: EntityRegistry,
    result: BuildResult,
    unwinder: Unwinder,
}

impl<S: GadgetStore> ComposedGadget<S> {
    pub fn result(&self) -> &BuildResult {
        &self.result
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    /// Release the handle, leaving the tree in the store
    pub fn into_parts(self) -> (S, EntityRegistry, BuildResult) {
        (self.store, self.registry, self.result)
    }

    /// Tear the whole tree down again
    pub fn dismantle(mut self) -> (S, UnwindReport) {
        info!("Dismantling gadget {}", self.result.gadget.name);
        let report = self.unwinder.unwind(&mut self.store, &mut self.registry);
        (self.store, report)
    }
}

/// Drives the ordered creation of a [`GadgetPlan`]
#[derive(Debug, Clone)]
pub struct GadgetBuilder {
    plan: GadgetPlan,
    options: BuildOptions,
}

impl GadgetBuilder {
    pub fn new(plan: GadgetPlan) -> Self {
        Self::with_options(plan, BuildOptions::default())
    }

    pub fn with_options(plan: GadgetPlan, options: BuildOptions) -> Self {
        Self { plan, options }
    }

    pub fn plan(&self) -> &GadgetPlan {
        &self.plan
    }

    /// Open a store on `root` and compose the plan into it
    pub fn build<S: GadgetStore>(&self, root: &Path) -> std::result::Result<ComposedGadget<S>, BuildError> {
        let started = Instant::now();
        info!("Building gadget '{}' under {}", self.plan.gadget.name, root.display());

        // Nothing exists yet, so there is nothing to unwind
        self.check_plan()
            .map_err(|e| BuildError::without_unwind(BuildStep::ValidatePlan, e))?;
        let mut store = S::initialize(root)
            .map_err(|e| BuildError::without_unwind(BuildStep::InitStore(root.to_path_buf()), e))?;

        let mut registry = EntityRegistry::new();
        let result = self.compose(&mut store, &mut registry, started)?;

        Ok(ComposedGadget {
            store,
            registry,
            result,
            unwinder: Unwinder::new(self.options.unwind_policy),
        })
    }

    /// Compose the plan into an already opened store
    ///
    /// On failure everything created by this call has been unwound.
    pub fn build_on<S>(
        &self,
        store: &mut S,
    ) -> std::result::Result<(EntityRegistry, BuildResult), BuildError>
    where
        S: GadgetStore + ?Sized,
    {
        self.check_plan()
            .map_err(|e| BuildError::without_unwind(BuildStep::ValidatePlan, e))?;
        let mut registry = EntityRegistry::new();
        let result = self.compose(store, &mut registry, Instant::now())?;
        Ok((registry, result))
    }

    /// Run [`build`](Self::build) on tokio's blocking pool
    pub async fn build_async<S>(
        self,
        root: PathBuf,
    ) -> std::result::Result<ComposedGadget<S>, BuildError>
    where
        S: GadgetStore + Send + 'static,
    {
        tokio::task::spawn_blocking(move || self.build::<S>(&root))
            .await
            .map_err(|e| {
                BuildError::without_unwind(
                    BuildStep::Worker,
                    AppError::Internal(format!("Task join error: {}", e)),
                )
            })?
    }

    fn compose<S>(
        &self,
        store: &mut S,
        registry: &mut EntityRegistry,
        started: Instant,
    ) -> std::result::Result<BuildResult, BuildError>
    where
        S: GadgetStore + ?Sized,
    {
        let mut state = BuildState::Init;
        match self.run_steps(store, registry, started, &mut state) {
            Ok(result) => Ok(result),
            Err((step, source)) => {
                error!("Gadget build failed while {}: {}", step, source);
                let unwind = Unwinder::new(self.options.unwind_policy).unwind(store, registry);
                unwind.log_residuals();
                Err(BuildError {
                    step,
                    reached: state,
                    source,
                    unwind,
                })
            }
        }
    }

    /// A gadget without any configuration can never enumerate
    fn check_plan(&self) -> Result<()> {
        if self.plan.configs.is_empty() {
            return Err(AppError::InvalidAttrs(format!(
                "gadget '{}' declares no configuration",
                self.plan.gadget.name
            )));
        }
        Ok(())
    }

    fn check_deadline(&self, started: Instant) -> Result<()> {
        match self.options.deadline {
            Some(limit) if started.elapsed() >= limit => Err(AppError::Timeout(limit)),
            _ => Ok(()),
        }
    }

    /// Create one node and record it; a node the registry refuses is
    /// removed again so it cannot escape the unwind log.
    fn create_registered<S>(
        store: &mut S,
        registry: &mut EntityRegistry,
        parent: Option<&NodeRef>,
        spec: NodeSpec<'_>,
    ) -> Result<NodeRef>
    where
        S: GadgetStore + ?Sized,
    {
        let name = spec.dir_name();
        if registry.lookup(spec.kind(), &name).is_ok() {
            return Err(AppError::NameConflict {
                kind: spec.kind(),
                name,
            });
        }

        let node = store.create_node(parent, spec)?;
        if let Err(e) = registry.register_node(node.clone()) {
            if let Err(rollback) = store.remove(&node) {
                warn!("Failed to remove unregistered {}: {}", node, rollback);
            }
            return Err(e);
        }
        Ok(node)
    }

    fn run_steps<S>(
        &self,
        store: &mut S,
        registry: &mut EntityRegistry,
        started: Instant,
        state: &mut BuildState,
    ) -> std::result::Result<BuildResult, (BuildStep, AppError)>
    where
        S: GadgetStore + ?Sized,
    {
        let plan = &self.plan;

        let step = BuildStep::CreateGadget(plan.gadget.name.clone());
        let gadget = self
            .check_deadline(started)
            .and_then(|_| {
                Self::create_registered(store, registry, None, NodeSpec::Gadget(&plan.gadget))
            })
            .map_err(|e| (step, e))?;
        *state = BuildState::GadgetCreated;
        info!("Created gadget {}", gadget.name);

        let mut functions = Vec::with_capacity(plan.functions.len());
        for function in &plan.functions {
            let step = BuildStep::CreateFunction(function.id.clone());
            let node = self
                .check_deadline(started)
                .and_then(|_| {
                    Self::create_registered(
                        store,
                        registry,
                        Some(&gadget),
                        NodeSpec::Function(function),
                    )
                })
                .map_err(|e| (step, e))?;
            functions.push(node);
            *state = BuildState::FunctionsCreated(functions.len());
            debug!(
                "Created function {} ({})",
                function.id,
                function.id.function_type.description()
            );
        }

        let mut configs = Vec::with_capacity(plan.configs.len());
        for config in &plan.configs {
            let step = BuildStep::CreateConfig(config.id);
            let node = self
                .check_deadline(started)
                .and_then(|_| {
                    Self::create_registered(store, registry, Some(&gadget), NodeSpec::Config(config))
                })
                .map_err(|e| (step, e))?;
            configs.push(node);
            *state = BuildState::ConfigsCreated(configs.len());
            debug!("Created config {}", config.dir_name());
        }

        let mut bindings = Vec::with_capacity(plan.bindings.len());
        for binding in &plan.bindings {
            let binding_name = binding.binding_name();
            let step = BuildStep::AddBinding {
                binding: binding_name.clone(),
                config_id: binding.config_id,
            };
            let node = self
                .check_deadline(started)
                .and_then(|_| self.add_binding(store, registry, binding, &binding_name))
                .map_err(|e| (step, e))?;
            bindings.push(node);
            *state = BuildState::BindingsAdded(bindings.len());
            debug!("Added binding {}", binding);
        }

        *state = BuildState::Done;
        info!(
            "Gadget {} composed: {} function(s), {} config(s), {} binding(s)",
            gadget.name,
            functions.len(),
            configs.len(),
            bindings.len()
        );

        let guidance = activation_guidance(&gadget, &functions, &self.options.udc_class_path);
        Ok(BuildResult {
            gadget,
            functions,
            configs,
            bindings,
            guidance,
        })
    }

    /// Resolve both ends in the registry before touching the store
    fn add_binding<S>(
        &self,
        store: &mut S,
        registry: &mut EntityRegistry,
        binding: &BindingSpec,
        binding_name: &str,
    ) -> Result<NodeRef>
    where
        S: GadgetStore + ?Sized,
    {
        let function = registry
            .lookup(NodeKind::Function, &binding.function.dir_name())
            .map_err(|_| {
                AppError::InvalidReference(format!(
                    "binding '{}' refers to function '{}' which was not created",
                    binding_name, binding.function
                ))
            })?
            .clone();

        let config_name = self
            .plan
            .configs
            .iter()
            .find(|c| c.id == binding.config_id)
            .map(|c| c.dir_name())
            .ok_or_else(|| {
                AppError::InvalidReference(format!(
                    "binding '{}' refers to config {} which was not declared",
                    binding_name, binding.config_id
                ))
            })?;
        let config = registry
            .lookup(NodeKind::Config, &config_name)
            .map_err(|_| {
                AppError::InvalidReference(format!(
                    "binding '{}' refers to config '{}' which was not created",
                    binding_name, config_name
                ))
            })?
            .clone();

        let qualified = format!("{}/{}", config.name, binding_name);
        if registry.lookup(NodeKind::Binding, &qualified).is_ok() {
            return Err(AppError::NameConflict {
                kind: NodeKind::Binding,
                name: qualified,
            });
        }

        let node = store.bind(&config, &function, binding_name)?;
        if let Err(e) = registry.register_node(node.clone()) {
            if let Err(rollback) = store.remove(&node) {
                warn!("Failed to remove unregistered {}: {}", node, rollback);
            }
            return Err(e);
        }
        Ok(node)
    }
}

/// Import an existing gadget from the store and unwind it completely
pub fn remove_gadget<S>(store: &mut S, name: &str, policy: UnwindPolicy) -> Result<UnwindReport>
where
    S: GadgetStore + ?Sized,
{
    let nodes = store.scan_gadget(name)?;
    info!("Removing gadget {} ({} node(s))", name, nodes.len());

    let mut registry = EntityRegistry::new();
    registry.import(nodes)?;

    let report = Unwinder::new(policy).unwind(store, &mut registry);
    report.log_residuals();
    Ok(report)
}
