//! USB Gadget function types and descriptors

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::attrs::check_node_name;
use crate::error::{AppError, Result};

/// Function type, as understood by the kernel's composite framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FunctionType {
    /// Generic serial
    Serial,
    /// CDC ACM serial
    Acm,
    /// OBEX
    Obex,
    /// CDC ECM ethernet
    Ecm,
    /// CDC subset ethernet
    Subset,
    /// CDC NCM network control model
    Ncm,
    /// CDC EEM ethernet emulation
    Eem,
    /// RNDIS ethernet
    Rndis,
    /// Phonet
    Phonet,
    /// FunctionFS, pass-through to a userspace daemon
    Ffs,
    /// Mass storage
    MassStorage,
    /// MIDI
    Midi,
    /// Loopback test function
    Loopback,
    /// HID
    Hid,
    /// USB Audio Class 2
    Uac2,
    /// USB Video Class
    Uvc,
    /// Printer
    Printer,
}

impl FunctionType {
    pub const ALL: [FunctionType; 17] = [
        FunctionType::Serial,
        FunctionType::Acm,
        FunctionType::Obex,
        FunctionType::Ecm,
        FunctionType::Subset,
        FunctionType::Ncm,
        FunctionType::Eem,
        FunctionType::Rndis,
        FunctionType::Phonet,
        FunctionType::Ffs,
        FunctionType::MassStorage,
        FunctionType::Midi,
        FunctionType::Loopback,
        FunctionType::Hid,
        FunctionType::Uac2,
        FunctionType::Uvc,
        FunctionType::Printer,
    ];

    /// Directory prefix under `functions/` (e.g. "ncm" in "ncm.usb0")
    pub fn configfs_name(&self) -> &'static str {
        match self {
            FunctionType::Serial => "gser",
            FunctionType::Acm => "acm",
            FunctionType::Obex => "obex",
            FunctionType::Ecm => "ecm",
            FunctionType::Subset => "geth",
            FunctionType::Ncm => "ncm",
            FunctionType::Eem => "eem",
            FunctionType::Rndis => "rndis",
            FunctionType::Phonet => "phonet",
            FunctionType::Ffs => "ffs",
            FunctionType::MassStorage => "mass_storage",
            FunctionType::Midi => "midi",
            FunctionType::Loopback => "Loopback",
            FunctionType::Hid => "hid",
            FunctionType::Uac2 => "uac2",
            FunctionType::Uvc => "uvc",
            FunctionType::Printer => "printer",
        }
    }

    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            FunctionType::Serial => "Generic Serial",
            FunctionType::Acm => "CDC ACM Serial",
            FunctionType::Obex => "OBEX",
            FunctionType::Ecm => "CDC ECM Ethernet",
            FunctionType::Subset => "CDC Subset Ethernet",
            FunctionType::Ncm => "CDC NCM Network",
            FunctionType::Eem => "CDC EEM Ethernet",
            FunctionType::Rndis => "RNDIS Ethernet",
            FunctionType::Phonet => "Phonet",
            FunctionType::Ffs => "FunctionFS (userspace)",
            FunctionType::MassStorage => "Mass Storage",
            FunctionType::Midi => "MIDI",
            FunctionType::Loopback => "Loopback",
            FunctionType::Hid => "HID",
            FunctionType::Uac2 => "USB Audio 2.0",
            FunctionType::Uvc => "USB Video",
            FunctionType::Printer => "Printer",
        }
    }

    /// Attributes this type accepts writes for
    pub fn writable_attrs(&self) -> &'static [&'static str] {
        match self {
            FunctionType::Ecm
            | FunctionType::Subset
            | FunctionType::Ncm
            | FunctionType::Eem
            | FunctionType::Rndis => &["dev_addr", "host_addr", "qmult"],
            FunctionType::MassStorage => &["stall"],
            FunctionType::Midi => &["index", "id", "buflen", "qlen", "in_ports", "out_ports"],
            FunctionType::Loopback => &["qlen", "bulk_buflen"],
            FunctionType::Hid => &["protocol", "subclass", "report_length"],
            FunctionType::Printer => &["pnp_string", "q_len"],
            FunctionType::Serial
            | FunctionType::Acm
            | FunctionType::Obex
            | FunctionType::Phonet
            | FunctionType::Ffs
            | FunctionType::Uac2
            | FunctionType::Uvc => &[],
        }
    }

    /// Whether the function needs a userspace daemon before it is operational
    pub fn needs_daemon(&self) -> bool {
        matches!(self, FunctionType::Ffs)
    }
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.configfs_name())
    }
}

impl FromStr for FunctionType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        FunctionType::ALL
            .iter()
            .copied()
            .find(|t| t.configfs_name().eq_ignore_ascii_case(s))
            .ok_or_else(|| AppError::InvalidAttrs(format!("unknown function type '{}'", s)))
    }
}

impl TryFrom<String> for FunctionType {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<FunctionType> for String {
    fn from(value: FunctionType) -> Self {
        value.configfs_name().to_string()
    }
}

/// (type, instance) pair naming a function inside one gadget
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FunctionId {
    pub function_type: FunctionType,
    pub instance: String,
}

impl FunctionId {
    pub fn new(function_type: FunctionType, instance: impl Into<String>) -> Result<Self> {
        let instance = instance.into();
        check_node_name("function instance", &instance)?;
        Ok(Self {
            function_type,
            instance,
        })
    }

    /// configfs directory name, also the default binding name
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.function_type.configfs_name(), self.instance)
    }
}

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.function_type, self.instance)
    }
}

impl FromStr for FunctionId {
    type Err = AppError;

    /// Parse "ncm.usb0"
    fn from_str(s: &str) -> Result<Self> {
        let (kind, instance) = s.split_once('.').ok_or_else(|| {
            AppError::InvalidAttrs(format!("function '{}' is not of the form <type>.<instance>", s))
        })?;
        FunctionId::new(kind.parse()?, instance)
    }
}

/// Type-specific attribute bundle; empty requests kernel defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FunctionAttrs {
    values: BTreeMap<String, String>,
}

impl FunctionAttrs {
    /// Validate attributes against what `function_type` accepts
    pub fn new(function_type: FunctionType, values: BTreeMap<String, String>) -> Result<Self> {
        let writable = function_type.writable_attrs();
        for (name, value) in &values {
            if !writable.contains(&name.as_str()) {
                return Err(AppError::InvalidAttrs(format!(
                    "{} does not accept attribute '{}'",
                    function_type, name
                )));
            }
            if matches!(name.as_str(), "dev_addr" | "host_addr") && !is_mac_address(value) {
                return Err(AppError::InvalidAttrs(format!(
                    "{} '{}' is not a MAC address",
                    name, value
                )));
            }
            if value.contains(['\0', '\n']) {
                return Err(AppError::InvalidAttrs(format!(
                    "attribute '{}' must be a single line",
                    name
                )));
            }
        }
        Ok(Self { values })
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn is_mac_address(value: &str) -> bool {
    let parts: Vec<&str> = value.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// One function requested by a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionSpec {
    pub id: FunctionId,
    pub attrs: FunctionAttrs,
}

impl FunctionSpec {
    pub fn new(function_type: FunctionType, instance: impl Into<String>) -> Result<Self> {
        Ok(Self {
            id: FunctionId::new(function_type, instance)?,
            attrs: FunctionAttrs::default(),
        })
    }

    /// Set type-specific attributes, validated against this function's type
    pub fn with_attrs(mut self, values: BTreeMap<String, String>) -> Result<Self> {
        self.attrs = FunctionAttrs::new(self.id.function_type, values)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_dir_name() {
        let ffs = FunctionId::new(FunctionType::Ffs, "usb0").unwrap();
        assert_eq!(ffs.dir_name(), "ffs.usb0");

        let parsed: FunctionId = "ncm.usb0".parse().unwrap();
        assert_eq!(parsed.function_type, FunctionType::Ncm);
        assert_eq!(parsed.instance, "usb0");

        let storage: FunctionId = "mass_storage.usb1".parse().unwrap();
        assert_eq!(storage.function_type, FunctionType::MassStorage);
    }

    #[test]
    fn test_unknown_type() {
        assert!("bogus.usb0".parse::<FunctionId>().is_err());
        assert!("ncm".parse::<FunctionId>().is_err());
        assert_eq!("loopback".parse::<FunctionType>().unwrap(), FunctionType::Loopback);
    }

    #[test]
    fn test_attrs_validation() {
        let mut values = BTreeMap::new();
        values.insert("dev_addr".to_string(), "02:00:00:00:00:01".to_string());
        assert!(FunctionAttrs::new(FunctionType::Ncm, values.clone()).is_ok());

        // ffs takes no attributes at all
        assert!(FunctionAttrs::new(FunctionType::Ffs, values).is_err());

        let mut bad_mac = BTreeMap::new();
        bad_mac.insert("host_addr".to_string(), "02:00:00:00:01".to_string());
        assert!(FunctionAttrs::new(FunctionType::Ecm, bad_mac).is_err());
    }

    #[test]
    fn test_spec_attrs_follow_own_type() {
        let mut values = BTreeMap::new();
        values.insert("dev_addr".to_string(), "02:00:00:00:00:01".to_string());

        let ncm = FunctionSpec::new(FunctionType::Ncm, "usb0")
            .unwrap()
            .with_attrs(values.clone())
            .unwrap();
        assert_eq!(ncm.attrs.iter().count(), 1);

        let err = FunctionSpec::new(FunctionType::Ffs, "usb0")
            .unwrap()
            .with_attrs(values)
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidAttrs(_)));
    }

    #[test]
    fn test_needs_daemon() {
        assert!(FunctionType::Ffs.needs_daemon());
        assert!(!FunctionType::Ncm.needs_daemon());
    }
}
