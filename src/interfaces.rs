//! External collaborator interfaces. Each concern this crate treats as
//! out-of-scope (config generation, GPU/RAM probing, binary resolution,
//! model download) is represented as a narrow trait with one default
//! implementation sufficient to run standalone.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sysinfo::System;

/// Regenerates a config document from a set of model folders. Out of scope
/// for this crate's own logic; the default implementation simply reports
/// that it cannot help, so the scheduler's self-heal retry fails over to
/// aborting rather than hanging.
#[async_trait]
pub trait ConfigProducer: Send + Sync {
    async fn regenerate(&self, folders: &[PathBuf]) -> anyhow::Result<PathBuf>;
}

pub struct UnsupportedConfigProducer;

#[async_trait]
impl ConfigProducer for UnsupportedConfigProducer {
    async fn regenerate(&self, _folders: &[PathBuf]) -> anyhow::Result<PathBuf> {
        anyhow::bail!("no config producer configured")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MemoryTotals {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl MemoryTotals {
    pub fn free_percent(&self) -> f32 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.free_bytes as f64 / self.total_bytes as f64 * 100.0) as f32
    }
}

/// Reads host memory totals. Backs the Memory Guard.
pub trait SystemProbe: Send + Sync {
    fn memory_totals(&self) -> MemoryTotals;
}

pub struct SysinfoProbe {
    system: std::sync::Mutex<System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self { system: std::sync::Mutex::new(system) }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn memory_totals(&self) -> MemoryTotals {
        let mut system = self.system.lock().expect("sysinfo mutex poisoned");
        system.refresh_memory();
        MemoryTotals {
            total_bytes: system.total_memory(),
            free_bytes: system.available_memory(),
        }
    }
}

/// Resolves a backend-binary spec (e.g. a model card's declared runtime) to
/// an executable path on disk.
#[async_trait]
pub trait BinaryProvider: Send + Sync {
    async fn resolve(&self, spec: &str) -> anyhow::Result<PathBuf>;
}

pub struct PathBinaryProvider;

#[async_trait]
impl BinaryProvider for PathBinaryProvider {
    async fn resolve(&self, spec: &str) -> anyhow::Result<PathBuf> {
        let path = Path::new(spec);
        if !path.exists() {
            anyhow::bail!("binary '{spec}' does not exist");
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = path.metadata()?.permissions().mode();
            if mode & 0o111 == 0 {
                anyhow::bail!("binary '{spec}' is not executable");
            }
        }
        Ok(path.to_path_buf())
    }
}

/// Ensures a model's weight file is present on disk, downloading it if
/// necessary. Out of scope; the default implementation assumes the file
/// named in the command template already exists.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn ensure_present(&self, model_id: &str) -> anyhow::Result<PathBuf>;
}

pub struct NoopBlobFetcher;

#[async_trait]
impl BlobFetcher for NoopBlobFetcher {
    async fn ensure_present(&self, model_id: &str) -> anyhow::Result<PathBuf> {
        Ok(PathBuf::from(model_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_percent_handles_zero_total() {
        let totals = MemoryTotals { total_bytes: 0, free_bytes: 0 };
        assert_eq!(totals.free_percent(), 100.0);
    }

    #[test]
    fn sysinfo_probe_reports_nonzero_total_on_a_real_host() {
        let probe = SysinfoProbe::new();
        let totals = probe.memory_totals();
        assert!(totals.total_bytes > 0);
    }

    #[tokio::test]
    async fn path_binary_provider_rejects_missing_file() {
        let provider = PathBinaryProvider;
        let result = provider.resolve("/nonexistent/path/to/binary").await;
        assert!(result.is_err());
    }
}
