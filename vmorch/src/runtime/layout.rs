//! On-disk layout under the orchestrator home directory.
//!
//! ```text
//! <home>/
//!   logs/vmorch.log
//!   db/vmorch.db
//!   sockets/<instance-id>.sock
//!   vmm/<instance-id>.log
//! ```

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }

    pub fn db_dir(&self) -> PathBuf {
        self.home_dir.join("db")
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_dir().join("vmorch.db")
    }

    pub fn sockets_dir(&self) -> PathBuf {
        self.home_dir.join("sockets")
    }

    /// Default control socket of an instance.
    pub fn socket_path(&self, instance_id: &str) -> PathBuf {
        self.sockets_dir().join(format!("{}.sock", instance_id))
    }

    pub fn vmm_logs_dir(&self) -> PathBuf {
        self.home_dir.join("vmm")
    }

    pub fn vmm_log_path(&self, instance_id: &str) -> PathBuf {
        self.vmm_logs_dir().join(format!("{}.log", instance_id))
    }

    /// Create every directory of the layout.
    pub fn prepare(&self) -> std::io::Result<()> {
        for dir in [
            self.home_dir.clone(),
            self.logs_dir(),
            self.db_dir(),
            self.sockets_dir(),
            self.vmm_logs_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = FilesystemLayout::new(dir.path().join("home"));
        layout.prepare().unwrap();

        assert!(layout.logs_dir().is_dir());
        assert!(layout.db_dir().is_dir());
        assert!(layout.sockets_dir().is_dir());
        assert_eq!(
            layout.socket_path("01J"),
            dir.path().join("home/sockets/01J.sock")
        );

        // Idempotent.
        layout.prepare().unwrap();
    }
}
