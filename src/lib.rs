//! gadget-composer - USB gadget composition over configfs
//!
//! Builds a gadget tree (device, functions, configurations and bindings)
//! in strict creation order and removes everything it created, in reverse,
//! when any step fails.

pub mod config;
pub mod error;
pub mod gadget;

pub use error::{AppError, Result};
