use std::fs;
use std::path::Path;

use sysinfo::Disks;
use tempfile::NamedTempFile;

/// Storage permission and free-space provider for a destination directory.
pub trait VolumeProbe: Send + Sync {
    fn is_writable(&self, dir: &Path) -> bool;
    /// Bytes available to an unprivileged writer; `None` when unknown.
    fn available_bytes(&self, dir: &Path) -> Option<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemVolume;

impl VolumeProbe for SystemVolume {
    fn is_writable(&self, dir: &Path) -> bool {
        if fs::create_dir_all(dir).is_err() {
            return false;
        }
        NamedTempFile::new_in(dir).is_ok()
    }

    fn available_bytes(&self, dir: &Path) -> Option<u64> {
        let existing = dir.ancestors().find(|path| path.exists())?;
        let target = fs::canonicalize(existing).unwrap_or_else(|_| existing.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        // Deepest mount point containing the target.
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Fixed answers, for embedding and tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedVolume {
    pub writable: bool,
    pub available: Option<u64>,
}

impl VolumeProbe for FixedVolume {
    fn is_writable(&self, _dir: &Path) -> bool {
        self.writable
    }

    fn available_bytes(&self, _dir: &Path) -> Option<u64> {
        self.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn system_volume_reports_temp_dir() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("not").join("yet");
        if let Some(available) = SystemVolume.available_bytes(&nested) {
            assert!(available > 0);
        }
        assert!(!nested.exists());
        assert!(SystemVolume.is_writable(&nested));
        assert!(nested.is_dir());
    }
}
