//! Composer configuration: TOML file describing one gadget build

mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{AppError, Result};
use crate::gadget::configfs::CONFIGFS_ROOT;

/// Environment variable overriding the store root
pub const STORE_ROOT_ENV: &str = "GADGET_COMPOSER_STORE_ROOT";

impl ComposerConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Load from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))
    }

    /// Store root: CLI flag, then environment, then file, then configfs
    pub fn resolve_store_root(&self, cli: Option<&Path>) -> PathBuf {
        if let Some(root) = cli {
            return root.to_path_buf();
        }
        if let Ok(root) = std::env::var(STORE_ROOT_ENV) {
            if !root.trim().is_empty() {
                return PathBuf::from(root);
            }
        }
        self.store_root
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(CONFIGFS_ROOT))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::function::FunctionType;
    use crate::gadget::unwind::UnwindPolicy;
    use tempfile::tempdir;

    #[test]
    fn test_default_plan() {
        let plan = ComposerConfig::default().to_plan().unwrap();
        assert_eq!(plan.gadget.name, "g1");
        assert_eq!(plan.gadget.attrs.vendor_id(), 0x0525);
        assert_eq!(plan.functions.len(), 2);
        assert_eq!(plan.functions[0].id.function_type, FunctionType::Ffs);
        assert_eq!(plan.configs[0].dir_name(), "c.1");
        assert_eq!(plan.bindings.len(), 2);
    }

    #[test]
    fn test_parse_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gadget.toml");
        std::fs::write(
            &path,
            r#"
store_root = "/tmp/cfg"
unwind_policy = "fail-fast"

[gadget]
name = "net"
vendor_id = 0x1d6b
product_id = 0x0104

[[functions]]
type = "ncm"
instance = "usb0"
attrs = { dev_addr = "02:00:00:00:00:01" }

[[configs]]
id = 1
configuration = "NCM"
max_power = 250

[[bindings]]
function = "ncm.usb0"
config = 1
"#,
        )
        .unwrap();

        let config = ComposerConfig::load(&path).unwrap();
        assert_eq!(config.unwind_policy, UnwindPolicy::FailFast);
        assert_eq!(config.gadget.name, "net");
        // Unset gadget fields fall back to defaults
        assert_eq!(config.gadget.max_packet_size0, 64);

        let plan = config.to_plan().unwrap();
        assert_eq!(plan.functions.len(), 1);
        assert_eq!(plan.configs[0].attrs.max_power(), Some(250));
        assert_eq!(config.resolve_store_root(Some(Path::new("/x"))), PathBuf::from("/x"));
    }

    #[test]
    fn test_missing_lists_are_empty() {
        let config = ComposerConfig::from_toml_str("[gadget]\nname = \"g2\"\n").unwrap();
        assert!(config.functions.is_empty());
        assert!(config.configs.is_empty());
        assert!(config.bindings.is_empty());
        assert!(matches!(config.to_plan(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ComposerConfig::default();
        config.gadget.max_packet_size0 = 48;
        assert!(config.to_plan().is_err());

        let mut config = ComposerConfig::default();
        config.functions[0].function_type = "bogus".to_string();
        assert!(config.to_plan().is_err());

        assert!(ComposerConfig::from_toml_str("gadget = 3").is_err());
    }

    #[test]
    fn test_toml_round_trip_of_default() {
        let config = ComposerConfig::default();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(ComposerConfig::from_toml_str(&rendered).unwrap(), config);
    }
}
