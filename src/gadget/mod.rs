//! USB Gadget composition over configfs
//!
//! Builds a gadget tree (gadget, functions, configs, bindings) in a backing
//! store in a strict order and unwinds whatever was created when a step
//! fails.
//!
//! Architecture:
//! ```text
//! GadgetBuilder (ordered steps, state machine)
//!     ├── EntityRegistry (creation log, name uniqueness)
//!     ├── Unwinder (reverse replay of the log)
//!     └── GadgetStore (store adapter)
//!             ├── ConfigFsStore (/sys/kernel/config/usb_gadget)
//!             └── MemoryStore (dry runs)
//! ```
//!
//! The built tree is never bound to a UDC here; activation is left to the
//! operator (see [`guidance`]).

pub mod attrs;
pub mod builder;
pub mod configfs;
pub mod function;
pub mod guidance;
pub mod memory;
pub mod plan;
pub mod registry;
pub mod store;
pub mod unwind;

#[cfg(test)]
pub(crate) mod testing;

pub use attrs::{ConfigAttrs, ConfigStrings, GadgetAttrs, GadgetStrings, MaxPacketSize};
pub use builder::{
    remove_gadget, BuildError, BuildOptions, BuildResult, BuildState, BuildStep, ComposedGadget,
    GadgetBuilder,
};
pub use function::{FunctionAttrs, FunctionId, FunctionSpec, FunctionType};
pub use memory::{MemoryStore, StoreOp};
pub use plan::{BindingSpec, ConfigSpec, GadgetPlan, GadgetSpec};
pub use registry::{EntityRegistry, RegistryEntry};
pub use store::{ConfigFsStore, GadgetStore, NodeKind, NodeRef, NodeSpec};
pub use unwind::{UnwindPolicy, UnwindReport, Unwinder};
