//! Validated attribute and string bundles for gadgets and configs
//!
//! Values are checked when the record is constructed, so anything that
//! reaches the store is already known to be representable there.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// US English, the language every host asks for first
pub const LANG_US_ENGLISH: u16 = 0x0409;

/// Longest string a USB string descriptor can carry (126 UTF-16 units)
pub const MAX_STRING_LEN: usize = 126;

/// Upper bound for MaxPower across USB 2.0 and SuperSpeed configs (mA)
pub const MAX_POWER_LIMIT_MA: u16 = 900;

/// USB 2.0 bcdUSB
pub const BCD_USB_2_0: u16 = 0x0200;

/// bmAttributes bit that must always be set
const BM_ATTRS_RESERVED_ONE: u8 = 0x80;
/// bmAttributes bits that must always be clear
const BM_ATTRS_RESERVED_ZERO: u8 = 0x1f;

/// Legal bMaxPacketSize0 values for endpoint zero
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MaxPacketSize {
    Size8,
    Size16,
    Size32,
    Size64,
}

impl MaxPacketSize {
    pub fn bytes(self) -> u8 {
        match self {
            MaxPacketSize::Size8 => 8,
            MaxPacketSize::Size16 => 16,
            MaxPacketSize::Size32 => 32,
            MaxPacketSize::Size64 => 64,
        }
    }
}

impl TryFrom<u8> for MaxPacketSize {
    type Error = AppError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            8 => Ok(MaxPacketSize::Size8),
            16 => Ok(MaxPacketSize::Size16),
            32 => Ok(MaxPacketSize::Size32),
            64 => Ok(MaxPacketSize::Size64),
            other => Err(AppError::InvalidAttrs(format!(
                "bMaxPacketSize0 must be one of 8, 16, 32, 64 (got {})",
                other
            ))),
        }
    }
}

impl From<MaxPacketSize> for u8 {
    fn from(value: MaxPacketSize) -> Self {
        value.bytes()
    }
}

fn check_bcd(field: &str, value: u16) -> Result<()> {
    let valid = (0..4).all(|shift| ((value >> (shift * 4)) & 0xf) <= 9);
    if valid {
        Ok(())
    } else {
        Err(AppError::InvalidAttrs(format!(
            "{} must be binary-coded decimal (got 0x{:04x})",
            field, value
        )))
    }
}

/// Check one string descriptor value against configfs encoding limits
pub fn check_descriptor_string(field: &str, value: &str) -> Result<()> {
    if value.chars().count() > MAX_STRING_LEN {
        return Err(AppError::InvalidAttrs(format!(
            "{} exceeds {} characters",
            field, MAX_STRING_LEN
        )));
    }
    if value.contains(['\0', '\n', '\r']) {
        return Err(AppError::InvalidAttrs(format!(
            "{} must be a single line without NUL bytes",
            field
        )));
    }
    Ok(())
}

/// Check a configfs group name component (gadget name, instance name, label)
pub fn check_node_name(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(AppError::InvalidAttrs(format!("{} must not be empty", field)));
    }
    if value.contains(['/', '.']) || value.chars().any(char::is_whitespace) {
        return Err(AppError::InvalidAttrs(format!(
            "{} '{}' may not contain '/', '.' or whitespace",
            field, value
        )));
    }
    Ok(())
}

/// Gadget device descriptor fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GadgetAttrs {
    bcd_usb: u16,
    device_class: u8,
    device_subclass: u8,
    device_protocol: u8,
    max_packet_size0: MaxPacketSize,
    vendor_id: u16,
    product_id: u16,
    bcd_device: u16,
}

impl GadgetAttrs {
    /// Start a builder for the given vendor/product pair
    pub fn builder(vendor_id: u16, product_id: u16) -> GadgetAttrsBuilder {
        GadgetAttrsBuilder {
            bcd_usb: BCD_USB_2_0,
            device_class: 0x00,
            device_subclass: 0x00,
            device_protocol: 0x00,
            max_packet_size0: 64,
            vendor_id,
            product_id,
            bcd_device: 0x0001,
        }
    }

    pub fn bcd_usb(&self) -> u16 {
        self.bcd_usb
    }

    pub fn device_class(&self) -> u8 {
        self.device_class
    }

    pub fn device_subclass(&self) -> u8 {
        self.device_subclass
    }

    pub fn device_protocol(&self) -> u8 {
        self.device_protocol
    }

    pub fn max_packet_size0(&self) -> MaxPacketSize {
        self.max_packet_size0
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn product_id(&self) -> u16 {
        self.product_id
    }

    pub fn bcd_device(&self) -> u16 {
        self.bcd_device
    }

    /// Attribute file name / formatted value pairs, in write order
    pub fn to_attr_files(&self) -> Vec<(&'static str, String)> {
        vec![
            ("bcdUSB", format!("0x{:04x}", self.bcd_usb)),
            ("bDeviceClass", format!("0x{:02x}", self.device_class)),
            ("bDeviceSubClass", format!("0x{:02x}", self.device_subclass)),
            ("bDeviceProtocol", format!("0x{:02x}", self.device_protocol)),
            (
                "bMaxPacketSize0",
                format!("0x{:02x}", self.max_packet_size0.bytes()),
            ),
            ("idVendor", format!("0x{:04x}", self.vendor_id)),
            ("idProduct", format!("0x{:04x}", self.product_id)),
            ("bcdDevice", format!("0x{:04x}", self.bcd_device)),
        ]
    }
}

/// Builder for [`GadgetAttrs`]; `build` runs the field checks
#[derive(Debug, Clone)]
pub struct GadgetAttrsBuilder {
    bcd_usb: u16,
    device_class: u8,
    device_subclass: u8,
    device_protocol: u8,
    max_packet_size0: u8,
    vendor_id: u16,
    product_id: u16,
    bcd_device: u16,
}

impl GadgetAttrsBuilder {
    pub fn bcd_usb(mut self, value: u16) -> Self {
        self.bcd_usb = value;
        self
    }

    pub fn device_class(mut self, class: u8, subclass: u8, protocol: u8) -> Self {
        self.device_class = class;
        self.device_subclass = subclass;
        self.device_protocol = protocol;
        self
    }

    pub fn max_packet_size0(mut self, value: u8) -> Self {
        self.max_packet_size0 = value;
        self
    }

    pub fn bcd_device(mut self, value: u16) -> Self {
        self.bcd_device = value;
        self
    }

    pub fn build(self) -> Result<GadgetAttrs> {
        check_bcd("bcdUSB", self.bcd_usb)?;
        check_bcd("bcdDevice", self.bcd_device)?;
        let max_packet_size0 = MaxPacketSize::try_from(self.max_packet_size0)?;

        Ok(GadgetAttrs {
            bcd_usb: self.bcd_usb,
            device_class: self.device_class,
            device_subclass: self.device_subclass,
            device_protocol: self.device_protocol,
            max_packet_size0,
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            bcd_device: self.bcd_device,
        })
    }
}

/// Gadget string descriptors for one language
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GadgetStrings {
    lang: u16,
    serial: String,
    manufacturer: String,
    product: String,
}

impl GadgetStrings {
    pub fn new(
        serial: impl Into<String>,
        manufacturer: impl Into<String>,
        product: impl Into<String>,
    ) -> Result<Self> {
        Self::with_lang(LANG_US_ENGLISH, serial, manufacturer, product)
    }

    pub fn with_lang(
        lang: u16,
        serial: impl Into<String>,
        manufacturer: impl Into<String>,
        product: impl Into<String>,
    ) -> Result<Self> {
        let strings = Self {
            lang,
            serial: serial.into(),
            manufacturer: manufacturer.into(),
            product: product.into(),
        };
        check_descriptor_string("serialnumber", &strings.serial)?;
        check_descriptor_string("manufacturer", &strings.manufacturer)?;
        check_descriptor_string("product", &strings.product)?;
        Ok(strings)
    }

    pub fn lang(&self) -> u16 {
        self.lang
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }

    pub fn product(&self) -> &str {
        &self.product
    }

    pub fn to_attr_files(&self) -> Vec<(&'static str, &str)> {
        vec![
            ("serialnumber", self.serial.as_str()),
            ("manufacturer", self.manufacturer.as_str()),
            ("product", self.product.as_str()),
        ]
    }
}

/// Optional configuration attributes; `None` keeps the store default
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConfigAttrs {
    bm_attributes: Option<u8>,
    max_power: Option<u16>,
}

impl ConfigAttrs {
    pub fn new(bm_attributes: Option<u8>, max_power: Option<u16>) -> Result<Self> {
        if let Some(bm) = bm_attributes {
            if bm & BM_ATTRS_RESERVED_ONE == 0 || bm & BM_ATTRS_RESERVED_ZERO != 0 {
                return Err(AppError::InvalidAttrs(format!(
                    "bmAttributes 0x{:02x} must set bit 7 and clear bits 0-4",
                    bm
                )));
            }
        }
        if let Some(ma) = max_power {
            if ma > MAX_POWER_LIMIT_MA {
                return Err(AppError::InvalidAttrs(format!(
                    "MaxPower {} mA exceeds {} mA",
                    ma, MAX_POWER_LIMIT_MA
                )));
            }
        }
        Ok(Self {
            bm_attributes,
            max_power,
        })
    }

    pub fn bm_attributes(&self) -> Option<u8> {
        self.bm_attributes
    }

    pub fn max_power(&self) -> Option<u16> {
        self.max_power
    }

    pub fn to_attr_files(&self) -> Vec<(&'static str, String)> {
        let mut files = Vec::with_capacity(2);
        if let Some(ma) = self.max_power {
            files.push(("MaxPower", ma.to_string()));
        }
        if let Some(bm) = self.bm_attributes {
            files.push(("bmAttributes", format!("0x{:02x}", bm)));
        }
        files
    }
}

/// Configuration string descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigStrings {
    lang: u16,
    configuration: String,
}

impl ConfigStrings {
    pub fn new(configuration: impl Into<String>) -> Result<Self> {
        Self::with_lang(LANG_US_ENGLISH, configuration)
    }

    pub fn with_lang(lang: u16, configuration: impl Into<String>) -> Result<Self> {
        let configuration = configuration.into();
        check_descriptor_string("configuration", &configuration)?;
        Ok(Self {
            lang,
            configuration,
        })
    }

    pub fn lang(&self) -> u16 {
        self.lang
    }

    pub fn configuration(&self) -> &str {
        &self.configuration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gadget_attrs_defaults() {
        let attrs = GadgetAttrs::builder(0x0525, 0x0104).build().unwrap();
        assert_eq!(attrs.bcd_usb(), 0x0200);
        assert_eq!(attrs.max_packet_size0(), MaxPacketSize::Size64);

        let files = attrs.to_attr_files();
        assert!(files.contains(&("idVendor", "0x0525".to_string())));
        assert!(files.contains(&("idProduct", "0x0104".to_string())));
        assert!(files.contains(&("bMaxPacketSize0", "0x40".to_string())));
    }

    #[test]
    fn test_illegal_max_packet_size() {
        let err = GadgetAttrs::builder(0x0525, 0x0104)
            .max_packet_size0(48)
            .build()
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidAttrs(_)));
    }

    #[test]
    fn test_non_bcd_rejected() {
        assert!(GadgetAttrs::builder(1, 2).bcd_device(0x001a).build().is_err());
        assert!(GadgetAttrs::builder(1, 2).bcd_usb(0x0310).build().is_ok());
    }

    #[test]
    fn test_strings_limits() {
        assert!(GadgetStrings::new("0123456789", "Linux Foundation", "Infotainment Unit").is_ok());
        assert!(GadgetStrings::new("a\nb", "m", "p").is_err());
        assert!(GadgetStrings::new("x".repeat(127), "m", "p").is_err());
        assert!(ConfigStrings::new("iAP2 / NCM Interface").is_ok());
    }

    #[test]
    fn test_config_attrs() {
        assert!(ConfigAttrs::new(Some(0x80), Some(500)).is_ok());
        assert!(ConfigAttrs::new(Some(0xc0), None).is_ok());
        assert!(ConfigAttrs::new(Some(0x40), None).is_err());
        assert!(ConfigAttrs::new(Some(0x81), None).is_err());
        assert!(ConfigAttrs::new(None, Some(1000)).is_err());
        assert!(ConfigAttrs::default().to_attr_files().is_empty());
    }

    #[test]
    fn test_node_names() {
        assert!(check_node_name("instance", "usb0").is_ok());
        assert!(check_node_name("instance", "").is_err());
        assert!(check_node_name("instance", "usb.0").is_err());
        assert!(check_node_name("instance", "a/b").is_err());
    }
}
