//! Build plan: the caller-declared gadget, functions, configs and bindings

use std::fmt;

use serde::Serialize;

use super::attrs::{check_node_name, ConfigAttrs, ConfigStrings, GadgetAttrs, GadgetStrings};
use super::function::{FunctionId, FunctionSpec};
use crate::error::{AppError, Result};

/// Default configuration label ("c" in "configs/c.1")
pub const DEFAULT_CONFIG_LABEL: &str = "c";

/// Gadget node request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GadgetSpec {
    pub name: String,
    pub attrs: GadgetAttrs,
    pub strings: GadgetStrings,
}

impl GadgetSpec {
    pub fn new(name: impl Into<String>, attrs: GadgetAttrs, strings: GadgetStrings) -> Result<Self> {
        let name = name.into();
        check_node_name("gadget name", &name)?;
        Ok(Self {
            name,
            attrs,
            strings,
        })
    }
}

/// Configuration node request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigSpec {
    pub id: u8,
    pub label: String,
    pub attrs: ConfigAttrs,
    pub strings: ConfigStrings,
}

impl ConfigSpec {
    pub fn new(id: u8, strings: ConfigStrings) -> Result<Self> {
        Self::with_label(DEFAULT_CONFIG_LABEL, id, ConfigAttrs::default(), strings)
    }

    pub fn with_label(
        label: impl Into<String>,
        id: u8,
        attrs: ConfigAttrs,
        strings: ConfigStrings,
    ) -> Result<Self> {
        if id == 0 {
            return Err(AppError::InvalidAttrs(
                "configuration id 0 is reserved for the unconfigured state".to_string(),
            ));
        }
        let label = label.into();
        check_node_name("config label", &label)?;
        Ok(Self {
            id,
            label,
            attrs,
            strings,
        })
    }

    /// configfs directory name (e.g. "c.1")
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.label, self.id)
    }
}

/// Function → config association request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BindingSpec {
    pub function: FunctionId,
    pub config_id: u8,
    /// Link name; defaults to the function's `<type>.<instance>`
    pub name: Option<String>,
}

impl BindingSpec {
    pub fn new(function: FunctionId, config_id: u8) -> Self {
        Self {
            function,
            config_id,
            name: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn binding_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.function.dir_name())
    }
}

impl fmt::Display for BindingSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> config {} as '{}'",
            self.function,
            self.config_id,
            self.binding_name()
        )
    }
}

/// Complete declaration of one composite gadget
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GadgetPlan {
    pub gadget: GadgetSpec,
    pub functions: Vec<FunctionSpec>,
    pub configs: Vec<ConfigSpec>,
    pub bindings: Vec<BindingSpec>,
}

impl GadgetPlan {
    pub fn new(gadget: GadgetSpec) -> Self {
        Self {
            gadget,
            functions: Vec::new(),
            configs: Vec::new(),
            bindings: Vec::new(),
        }
    }

    pub fn function(mut self, function: FunctionSpec) -> Self {
        self.functions.push(function);
        self
    }

    pub fn config(mut self, config: ConfigSpec) -> Self {
        self.configs.push(config);
        self
    }

    pub fn binding(mut self, binding: BindingSpec) -> Self {
        self.bindings.push(binding);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::function::FunctionType;

    #[test]
    fn test_config_dir_name() {
        let config = ConfigSpec::new(1, ConfigStrings::new("iAP2 / NCM Interface").unwrap()).unwrap();
        assert_eq!(config.dir_name(), "c.1");
        assert!(ConfigSpec::new(0, ConfigStrings::new("x").unwrap()).is_err());
    }

    #[test]
    fn test_binding_name_default() {
        let ncm = FunctionId::new(FunctionType::Ncm, "usb0").unwrap();
        assert_eq!(BindingSpec::new(ncm.clone(), 1).binding_name(), "ncm.usb0");
        assert_eq!(BindingSpec::new(ncm, 1).named("net").binding_name(), "net");
    }

    #[test]
    fn test_gadget_name_checked() {
        let attrs = GadgetAttrs::builder(0x0525, 0x0104).build().unwrap();
        let strings = GadgetStrings::new("0", "m", "p").unwrap();
        assert!(GadgetSpec::new("g1", attrs.clone(), strings.clone()).is_ok());
        assert!(GadgetSpec::new("g/1", attrs, strings).is_err());
    }
}
