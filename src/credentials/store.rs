//! Credential store implementations

use crate::credentials::{
    Credential, CredentialError, CredentialFilter, CredentialResult, CredentialSource,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Append-only JSON-lines credential file, one credential per line
#[derive(Debug, Clone)]
pub struct JsonLinesCredentialStore {
    path: PathBuf,
}

impl JsonLinesCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Creates the file (and its parent directory) if it does not exist yet
    pub fn create(&self) -> CredentialResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_all(&self, credentials: &[Credential]) -> CredentialResult<()> {
        let mut content = String::new();
        for credential in credentials {
            content.push_str(&serde_json::to_string(credential)?);
            content.push('\n');
        }
        // Write next to the target then rename so a crash never truncates the file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, content)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl CredentialSource for JsonLinesCredentialStore {
    fn iter_credentials(&self) -> CredentialResult<Vec<Credential>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str(line).map_err(|e| CredentialError::Malformed {
                    line: i + 1,
                    message: e.to_string(),
                })
            })
            .collect()
    }

    fn add(&mut self, credential: Credential) -> CredentialResult<bool> {
        let existing = self.iter_credentials()?;
        if existing.iter().any(|c| c.user == credential.user) {
            tracing::debug!("Credential for {} already stored", credential.user);
            return Ok(false);
        }

        self.create()?;
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&credential)?)?;
        Ok(true)
    }

    fn remove(&mut self, filter: &CredentialFilter) -> CredentialResult<usize> {
        let existing = self.iter_credentials()?;
        let total = existing.len();
        let kept: Vec<Credential> = existing
            .into_iter()
            .filter(|c| !filter.matches(c))
            .collect();

        let removed = total - kept.len();
        if removed > 0 {
            self.write_all(&kept)?;
        }
        Ok(removed)
    }
}

/// Credentials held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryCredentialStore {
    credentials: Vec<Credential>,
}

impl MemoryCredentialStore {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self { credentials }
    }
}

impl CredentialSource for MemoryCredentialStore {
    fn iter_credentials(&self) -> CredentialResult<Vec<Credential>> {
        Ok(self.credentials.clone())
    }

    fn add(&mut self, credential: Credential) -> CredentialResult<bool> {
        if self.credentials.iter().any(|c| c.user == credential.user) {
            return Ok(false);
        }
        self.credentials.push(credential);
        Ok(true)
    }

    fn remove(&mut self, filter: &CredentialFilter) -> CredentialResult<usize> {
        let before = self.credentials.len();
        self.credentials.retain(|c| !filter.matches(c));
        Ok(before - self.credentials.len())
    }
}
