use std::fs;
use std::io::ErrorKind as IoKind;
use std::path::{Path, PathBuf};

use log::debug;
use rustix::fs::{chmod, Mode};

use crate::errors::{AgentError, Result};

/// Port for all file access the core performs: config files, link
/// definition files, the termination log.
pub trait FileSystem: Send + Sync {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()>;
    fn remove(&self, path: &Path) -> Result<()>;
    /// Returns the file names (not full paths) inside the directory.
    fn list_files(&self, dir: &Path) -> Result<Vec<String>>;
}

pub struct RealFileSystem;

impl RealFileSystem {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RealFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn io_error(path: &Path, action: &str, e: std::io::Error) -> AgentError {
    let message = format!("unable to {} {}", action, path.display());
    match e.kind() {
        IoKind::NotFound => AgentError::not_found(message).with_cause(e),
        IoKind::PermissionDenied => AgentError::permission(message).with_cause(e),
        _ => AgentError::system(message).with_cause(e),
    }
}

impl FileSystem for RealFileSystem {
    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| io_error(path, "read", e))
    }

    fn write_file(&self, path: &Path, data: &[u8], mode: u32) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                self.mkdir_all(parent, 0o755)?;
            }
        }
        fs::write(path, data).map_err(|e| io_error(path, "write", e))?;
        chmod(path, Mode::from_bits_truncate(mode))
            .map_err(|e| AgentError::system(format!("unable to chmod {}", path.display())).with_cause(e))?;
        debug!("wrote {} ({} bytes, mode {:o})", path.display(), data.len(), mode);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn mkdir_all(&self, path: &Path, mode: u32) -> Result<()> {
        let mut stack = PathBuf::new();
        for component in path.components() {
            stack.push(component);
            if stack.as_os_str().is_empty() || stack == Path::new("/") {
                continue;
            }
            match fs::create_dir(&stack) {
                Ok(()) => {
                    chmod(&stack, Mode::from_bits_truncate(mode)).map_err(|e| {
                        AgentError::system(format!("unable to chmod {}", stack.display()))
                            .with_cause(e)
                    })?;
                }
                Err(e) if e.kind() == IoKind::AlreadyExists => {}
                Err(e) => return Err(io_error(&stack, "create directory", e)),
            }
        }
        Ok(())
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| io_error(path, "remove", e))
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<String>> {
        let entries = fs::read_dir(dir).map_err(|e| io_error(dir, "list", e))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_error(dir, "list", e))?;
            if entry.path().is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}
