use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::gadget::attrs::{
    ConfigAttrs, ConfigStrings, GadgetAttrs, GadgetStrings, BCD_USB_2_0, LANG_US_ENGLISH,
};
use crate::gadget::configfs::UDC_CLASS_PATH;
use crate::gadget::function::{FunctionId, FunctionSpec, FunctionType};
use crate::gadget::plan::{BindingSpec, ConfigSpec, GadgetPlan, GadgetSpec, DEFAULT_CONFIG_LABEL};
use crate::gadget::unwind::UnwindPolicy;

/// Main composer configuration
///
/// A missing file yields the iAP2 / NCM example gadget. In a file, omitted
/// function, config and binding lists are empty rather than defaulted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ComposerConfig {
    /// Backing store root (configfs mount)
    pub store_root: Option<String>,
    /// sysfs class directory listing UDCs
    pub udc_class_path: String,
    /// Overall build timeout in milliseconds
    pub timeout_ms: Option<u64>,
    /// Unwind behaviour on failure
    pub unwind_policy: UnwindPolicy,
    /// Gadget device settings
    pub gadget: GadgetConfig,
    /// Functions, in creation order
    #[serde(default)]
    pub functions: Vec<FunctionConfig>,
    /// Configurations, in creation order
    #[serde(default)]
    pub configs: Vec<ConfigEntry>,
    /// Function → config bindings, in creation order
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            store_root: None,
            udc_class_path: UDC_CLASS_PATH.to_string(),
            timeout_ms: None,
            unwind_policy: UnwindPolicy::BestEffort,
            gadget: GadgetConfig::default(),
            functions: vec![
                FunctionConfig::new("ffs", "usb0"),
                FunctionConfig::new("ncm", "usb0"),
            ],
            configs: vec![ConfigEntry::default()],
            bindings: vec![
                BindingConfig::new("ffs.usb0", 1),
                BindingConfig::new("ncm.usb0", 1),
            ],
        }
    }
}

impl ComposerConfig {
    /// Validate everything and produce the build plan
    pub fn to_plan(&self) -> Result<GadgetPlan> {
        let mut plan = GadgetPlan::new(self.gadget.to_spec()?);
        for function in &self.functions {
            plan = plan.function(function.to_spec()?);
        }
        if self.configs.is_empty() {
            return Err(AppError::Config(format!(
                "gadget '{}' needs at least one [[configs]] entry",
                self.gadget.name
            )));
        }
        for config in &self.configs {
            plan = plan.config(config.to_spec()?);
        }
        for binding in &self.bindings {
            plan = plan.binding(binding.to_spec()?);
        }
        Ok(plan)
    }
}

/// Gadget device descriptor and strings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GadgetConfig {
    /// Gadget directory name under usb_gadget
    pub name: String,
    /// USB Vendor ID (e.g., 0x0525)
    pub vendor_id: u16,
    /// USB Product ID (e.g., 0x0104)
    pub product_id: u16,
    /// Device release number (BCD)
    pub bcd_device: u16,
    /// USB spec version (BCD)
    pub bcd_usb: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    /// Endpoint zero max packet size (8, 16, 32 or 64)
    pub max_packet_size0: u8,
    /// String descriptor language id
    pub lang: u16,
    pub serial_number: String,
    pub manufacturer: String,
    pub product: String,
}

impl Default for GadgetConfig {
    fn default() -> Self {
        Self {
            name: "g1".to_string(),
            vendor_id: 0x0525,  // NetChip
            product_id: 0x0104, // Multifunction Composite Gadget
            bcd_device: 0x0001,
            bcd_usb: BCD_USB_2_0,
            device_class: 0x00, // Composite device
            device_subclass: 0x00,
            device_protocol: 0x00,
            max_packet_size0: 64,
            lang: LANG_US_ENGLISH,
            serial_number: "0123456789".to_string(),
            manufacturer: "Linux Foundation".to_string(),
            product: "Infotainment Unit".to_string(),
        }
    }
}

impl GadgetConfig {
    pub fn to_spec(&self) -> Result<GadgetSpec> {
        let attrs = GadgetAttrs::builder(self.vendor_id, self.product_id)
            .bcd_usb(self.bcd_usb)
            .bcd_device(self.bcd_device)
            .device_class(self.device_class, self.device_subclass, self.device_protocol)
            .max_packet_size0(self.max_packet_size0)
            .build()?;
        let strings = GadgetStrings::with_lang(
            self.lang,
            self.serial_number.as_str(),
            self.manufacturer.as_str(),
            self.product.as_str(),
        )?;
        GadgetSpec::new(self.name.as_str(), attrs, strings)
    }
}

/// One function entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionConfig {
    /// Function type (e.g., "ffs", "ncm", "acm")
    #[serde(rename = "type")]
    pub function_type: String,
    /// Instance name (e.g., "usb0")
    pub instance: String,
    /// Type-specific attributes; empty keeps kernel defaults
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl FunctionConfig {
    pub fn new(function_type: &str, instance: &str) -> Self {
        Self {
            function_type: function_type.to_string(),
            instance: instance.to_string(),
            attrs: BTreeMap::new(),
        }
    }

    pub fn to_spec(&self) -> Result<FunctionSpec> {
        let function_type: FunctionType = self.function_type.parse()?;
        FunctionSpec::new(function_type, self.instance.as_str())?.with_attrs(self.attrs.clone())
    }
}

/// One configuration entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConfigEntry {
    /// bConfigurationValue
    pub id: u8,
    /// Directory label ("c" in "c.1")
    pub label: String,
    /// Configuration string
    pub configuration: String,
    /// MaxPower in mA (store default if unset)
    pub max_power: Option<u16>,
    /// bmAttributes (store default if unset)
    pub bm_attributes: Option<u8>,
    /// String descriptor language id
    pub lang: u16,
}

impl Default for ConfigEntry {
    fn default() -> Self {
        Self {
            id: 1,
            label: DEFAULT_CONFIG_LABEL.to_string(),
            configuration: "iAP2 / NCM Interface".to_string(),
            max_power: None,
            bm_attributes: None,
            lang: LANG_US_ENGLISH,
        }
    }
}

impl ConfigEntry {
    pub fn to_spec(&self) -> Result<ConfigSpec> {
        let attrs = ConfigAttrs::new(self.bm_attributes, self.max_power)?;
        let strings = ConfigStrings::with_lang(self.lang, self.configuration.as_str())?;
        ConfigSpec::with_label(self.label.as_str(), self.id, attrs, strings)
    }
}

/// One binding entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BindingConfig {
    /// Function as "<type>.<instance>"
    pub function: String,
    /// Target configuration id
    pub config: u8,
    /// Link name (defaults to the function name)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl BindingConfig {
    pub fn new(function: &str, config: u8) -> Self {
        Self {
            function: function.to_string(),
            config,
            name: None,
        }
    }

    pub fn to_spec(&self) -> Result<BindingSpec> {
        let function: FunctionId = self.function.parse().map_err(|e| {
            AppError::Config(format!("binding '{}': {}", self.function, e))
        })?;
        let spec = BindingSpec::new(function, self.config);
        Ok(match &self.name {
            Some(name) => spec.named(name.as_str()),
            None => spec,
        })
    }
}
