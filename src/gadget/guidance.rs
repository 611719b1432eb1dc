//! Activation guidance printed after a successful build
//!
//! A composed tree is inert: FunctionFS instances need mounting and a
//! daemon, and the gadget only enumerates once it is written to a UDC.
//! None of that is done here; this only tells the operator what is left.

use std::path::Path;

use super::configfs::find_udc;
use super::function::FunctionType;
use super::store::NodeRef;

/// Placeholder used when no controller is visible
const UDC_PLACEHOLDER: &str = "<udc_name>";

/// Steps an operator still has to take, in order
pub fn activation_guidance(gadget: &NodeRef, functions: &[NodeRef], udc_class: &Path) -> Vec<String> {
    let mut steps = Vec::new();

    for function in functions {
        let Some((kind, instance)) = function.name.split_once('.') else {
            continue;
        };
        let needs_daemon = kind
            .parse::<FunctionType>()
            .map(|t| t.needs_daemon())
            .unwrap_or(false);
        if needs_daemon {
            steps.push(format!(
                "Mount FunctionFS instance '{}': mount -t functionfs {} /dev/ffs-{}",
                instance, instance, instance
            ));
            steps.push(format!(
                "Start the userspace daemon for '{}' on /dev/ffs-{} so it writes its descriptors",
                instance, instance
            ));
        }
    }

    let udc = find_udc(udc_class).unwrap_or_else(|| UDC_PLACEHOLDER.to_string());
    steps.push(format!(
        "Enable the gadget: echo {} > {}",
        udc,
        gadget.path.join("UDC").display()
    ));
    steps
}
