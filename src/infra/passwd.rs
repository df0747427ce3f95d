//! Host account probe backed by a passwd(5) file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::core::account::AccountProbe;
use crate::core::AppResult;

/// Default host account database.
pub const DEFAULT_PASSWD_PATH: &str = "/etc/passwd";

/// Reads account names and login shells from a passwd file on every probe,
/// so accounts created or removed by backends are seen immediately.
#[derive(Debug, Clone)]
pub struct PasswdProbe {
    path: PathBuf,
}

impl PasswdProbe {
    /// Probe reading `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn entries(&self) -> AppResult<Vec<(String, String)>> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(parse_passwd(&text))
    }
}

impl Default for PasswdProbe {
    fn default() -> Self {
        Self::new(DEFAULT_PASSWD_PATH)
    }
}

impl AccountProbe for PasswdProbe {
    fn shell_of(&self, name: &str) -> AppResult<Option<String>> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|(n, _)| n == name)
            .map(|(_, shell)| shell))
    }

    fn accounts(&self) -> AppResult<Vec<(String, String)>> {
        self.entries()
    }
}

/// `(name, shell)` for every well-formed line; comments, blanks and short
/// lines are skipped.
pub fn parse_passwd(text: &str) -> Vec<(String, String)> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 || fields[0].is_empty() {
                return None;
            }
            Some((fields[0].to_owned(), fields[6].to_owned()))
        })
        .collect()
}
