//! ConfigFS file operations for USB Gadget trees

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::unistd::{access, AccessFlags};
use tracing::trace;

use crate::error::{AppError, Result};

/// ConfigFS mount point
pub const CONFIGFS_ROOT: &str = "/sys/kernel/config";

/// Gadget group below the configfs mount (provided by libcomposite)
pub const USB_GADGET_GROUP: &str = "usb_gadget";

/// sysfs class listing USB Device Controllers
pub const UDC_CLASS_PATH: &str = "/sys/class/udc";

/// Check if a path is writable by the current process
pub fn is_writable(path: &Path) -> bool {
    access(path, AccessFlags::W_OK).is_ok()
}

/// Find available UDC (USB Device Controller) under a sysfs class directory
pub fn find_udc(class_path: &Path) -> Option<String> {
    if !class_path.exists() {
        return None;
    }

    let mut names: Vec<String> = fs::read_dir(class_path)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names.into_iter().next()
}

/// Write string content to an attribute file
///
/// configfs attributes take a single write() call, so the complete buffer
/// (newline included) is built before writing.
pub fn write_file(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .or_else(|e| {
            // Plain-directory mirrors have no pre-existing attribute files
            if path.exists() {
                Err(e)
            } else {
                File::create(path)
            }
        })
        .map_err(|e| AppError::store_io(format!("open {}", path.display()), e))?;

    let data: std::borrow::Cow<[u8]> = if content.ends_with('\n') {
        content.as_bytes().into()
    } else {
        let mut buf = content.as_bytes().to_vec();
        buf.push(b'\n');
        buf.into()
    };

    file.write_all(&data)
        .map_err(|e| AppError::store_io(format!("write {}", path.display()), e))?;
    file.flush()
        .map_err(|e| AppError::store_io(format!("flush {}", path.display()), e))?;

    trace!("wrote {} = {:?}", path.display(), content);
    Ok(())
}

/// Read string content from an attribute file
pub fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| AppError::store_io(format!("read {}", path.display()), e))
}

/// Create a single directory; an existing entry is a conflict
pub fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir(path)
        .map_err(|e| AppError::store_io(format!("mkdir {}", path.display()), e))
}

/// Create directory and any missing parents
pub fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| AppError::store_io(format!("mkdir -p {}", path.display()), e))
}

/// Remove a configfs directory
///
/// On real configfs the attribute files vanish together with the group. On
/// an ordinary directory tree `rmdir` reports ENOTEMPTY because attributes
/// are real files, so those are purged and the removal retried.
pub fn remove_dir(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if is_not_empty(&e) => {
            purge_plain_entries(path)?;
            fs::remove_dir(path)
                .map_err(|e| AppError::store_io(format!("rmdir {}", path.display()), e))
        }
        Err(e) => Err(AppError::store_io(format!("rmdir {}", path.display()), e)),
    }
}

fn is_not_empty(e: &std::io::Error) -> bool {
    e.raw_os_error() == Some(Errno::ENOTEMPTY as i32) || e.raw_os_error() == Some(Errno::EEXIST as i32)
}

/// Remove regular files and empty sub-directories; symlinks are left alone
fn purge_plain_entries(path: &Path) -> Result<()> {
    let entries =
        fs::read_dir(path).map_err(|e| AppError::store_io(format!("read {}", path.display()), e))?;

    for entry in entries.flatten() {
        let entry_path = entry.path();
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        if file_type.is_symlink() {
            continue;
        }
        if file_type.is_dir() {
            purge_plain_entries(&entry_path)?;
            fs::remove_dir(&entry_path).map_err(|e| {
                AppError::store_io(format!("rmdir {}", entry_path.display()), e)
            })?;
        } else {
            fs::remove_file(&entry_path).map_err(|e| {
                AppError::store_io(format!("unlink {}", entry_path.display()), e)
            })?;
        }
    }
    Ok(())
}

/// Remove file or symlink
pub fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(AppError::store_io(format!("unlink {}", path.display()), e)),
    }
}

/// Create symlink
pub fn create_symlink(src: &Path, dest: &Path) -> Result<()> {
    std::os::unix::fs::symlink(src, dest).map_err(|e| {
        AppError::store_io(
            format!("symlink {} -> {}", dest.display(), src.display()),
            e,
        )
    })
}

/// List entry names of a directory, sorted; a missing directory is empty
pub fn list_entries(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let mut names: Vec<String> = fs::read_dir(path)
        .map_err(|e| AppError::store_io(format!("read {}", path.display()), e))?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect();
    names.sort();
    Ok(names)
}

/// Symlinks directly inside a directory, with their targets
pub fn list_symlinks(path: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut links = Vec::new();
    for name in list_entries(path)? {
        let entry = path.join(&name);
        let is_link = fs::symlink_metadata(&entry)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if is_link {
            let target = fs::read_link(&entry)
                .map_err(|e| AppError::store_io(format!("readlink {}", entry.display()), e))?;
            links.push((name, target));
        }
    }
    Ok(links)
}

/// Sub-directories directly inside a directory
pub fn list_dirs(path: &Path) -> Result<Vec<String>> {
    Ok(list_entries(path)?
        .into_iter()
        .filter(|name| {
            fs::symlink_metadata(path.join(name))
                .map(|m| m.file_type().is_dir())
                .unwrap_or(false)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_file_appends_newline() {
        let dir = TempDir::new().unwrap();
        let attr = dir.path().join("idVendor");

        write_file(&attr, "0x0525").unwrap();
        assert_eq!(fs::read_to_string(&attr).unwrap(), "0x0525\n");
        assert_eq!(read_file(&attr).unwrap(), "0x0525");
    }

    #[test]
    fn test_remove_dir_purges_plain_attributes() {
        let dir = TempDir::new().unwrap();
        let gadget = dir.path().join("g1");
        create_dir(&gadget).unwrap();
        create_dir_all(&gadget.join("strings/0x409")).unwrap();
        write_file(&gadget.join("idVendor"), "0x0525").unwrap();
        write_file(&gadget.join("strings/0x409/product"), "x").unwrap();

        remove_dir(&gadget).unwrap();
        assert!(!gadget.exists());
    }

    #[test]
    fn test_remove_dir_keeps_linked_groups() {
        let dir = TempDir::new().unwrap();
        let func = dir.path().join("ncm.usb0");
        let config = dir.path().join("c.1");
        create_dir(&func).unwrap();
        create_dir(&config).unwrap();
        create_symlink(&func, &config.join("ncm.usb0")).unwrap();

        assert!(remove_dir(&config).is_err());
        assert!(config.join("ncm.usb0").exists());
    }

    #[test]
    fn test_create_dir_conflict() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("g1");
        create_dir(&path).unwrap();

        let err = create_dir(&path).unwrap_err();
        assert!(matches!(err, AppError::StoreIo { .. }));
    }

    #[test]
    fn test_find_udc_sorted() {
        let dir = TempDir::new().unwrap();
        create_dir(&dir.path().join("musb-hdrc.1.auto")).unwrap();
        create_dir(&dir.path().join("fe980000.usb")).unwrap();

        assert_eq!(find_udc(dir.path()).as_deref(), Some("fe980000.usb"));
        assert_eq!(find_udc(&dir.path().join("missing")), None);
    }

    #[test]
    fn test_list_symlinks() {
        let dir = TempDir::new().unwrap();
        let func = dir.path().join("ffs.usb0");
        create_dir(&func).unwrap();
        create_symlink(&func, &dir.path().join("link")).unwrap();

        let links = list_symlinks(dir.path()).unwrap();
        assert_eq!(links, vec![("link".to_string(), func)]);
        assert_eq!(list_dirs(dir.path()).unwrap(), vec!["ffs.usb0".to_string()]);
    }
}
