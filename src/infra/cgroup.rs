//! Cpuset control-file writers.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::core::coresched::format_cpu_list;
use crate::core::CoreSchedError;

/// Default directory holding the node-wide default cpuset files.
pub const DEFAULT_DEFAULTS_DIR: &str = "/etc/vservers/.defaults/cgroup";

/// Destination for computed cpuset assignments.
pub trait CpusetSink: Send + Sync {
    /// Write the default pool used by new containers.
    ///
    /// # Errors
    ///
    /// `CoreSchedError::Io` on write failure.
    fn write_default(&self, cpus: &[u32], mems: &[u32]) -> Result<(), CoreSchedError>;

    /// Names of existing cpuset groups.
    ///
    /// # Errors
    ///
    /// `CoreSchedError::Io` if the groups cannot be listed.
    fn groups(&self) -> Result<Vec<String>, CoreSchedError>;

    /// Write one group's cpus and memory nodes.
    ///
    /// # Errors
    ///
    /// `CoreSchedError::Io` on write failure.
    fn write_group(&self, group: &str, cpus: &[u32], mems: &[u32]) -> Result<(), CoreSchedError>;
}

/// Cpuset sink over a cgroup filesystem: one subdirectory per group under
/// `root`, and default files under `defaults_dir`.
#[derive(Debug, Clone)]
pub struct CgroupFs {
    root: PathBuf,
    defaults_dir: PathBuf,
}

impl CgroupFs {
    /// Sink over `root` with defaults written to `defaults_dir`.
    pub fn new(root: impl AsRef<Path>, defaults_dir: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            defaults_dir: defaults_dir.as_ref().to_path_buf(),
        }
    }

    fn write_pair(dir: &Path, cpus: &[u32], mems: &[u32]) -> Result<(), CoreSchedError> {
        write_list(&dir.join("cpuset.cpus"), cpus)?;
        write_list(&dir.join("cpuset.mems"), mems)
    }
}

impl CpusetSink for CgroupFs {
    fn write_default(&self, cpus: &[u32], mems: &[u32]) -> Result<(), CoreSchedError> {
        fs::create_dir_all(&self.defaults_dir).map_err(|source| CoreSchedError::Io {
            path: self.defaults_dir.display().to_string(),
            source,
        })?;
        Self::write_pair(&self.defaults_dir, cpus, mems)
    }

    fn groups(&self) -> Result<Vec<String>, CoreSchedError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CoreSchedError::Io {
                    path: self.root.display().to_string(),
                    source,
                })
            }
        };
        let mut groups: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        groups.sort();
        Ok(groups)
    }

    fn write_group(&self, group: &str, cpus: &[u32], mems: &[u32]) -> Result<(), CoreSchedError> {
        Self::write_pair(&self.root.join(group), cpus, mems)
    }
}

fn write_list(path: &Path, list: &[u32]) -> Result<(), CoreSchedError> {
    let text = format!("{}\n", format_cpu_list(list));
    debug!(path = %path.display(), list = %text.trim_end(), "writing cpuset list");
    fs::write(path, text).map_err(|source| CoreSchedError::Io {
        path: path.display().to_string(),
        source,
    })
}
