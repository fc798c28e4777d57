use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Bytes stored under each root
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct DiskUsage {
    pub images: u64,
    pub meta: u64,
    pub total: u64,
}

/// Sum of regular file sizes under `root`; a missing root counts as empty
///
/// Walks the whole tree, so cost grows with the number of stored files.
pub fn directory_size(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

/// Measure both trees on the blocking pool
pub async fn measure(image_dir: PathBuf, meta_dir: PathBuf) -> DiskUsage {
    let result = tokio::task::spawn_blocking(move || {
        let images = directory_size(&image_dir);
        let meta = directory_size(&meta_dir);
        DiskUsage {
            images,
            meta,
            total: images + meta,
        }
    })
    .await;

    match result {
        Ok(usage) => usage,
        Err(e) => {
            warn!(error = %e, "Disk usage walk failed");
            DiskUsage {
                images: 0,
                meta: 0,
                total: 0,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_root_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(directory_size(&dir.path().join("absent")), 0);
    }

    #[test]
    fn test_nested_files_are_summed() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("dev1/2024");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("a.bin"), [0u8; 10]).unwrap();
        std::fs::write(nested.join("b.bin"), [0u8; 32]).unwrap();

        assert_eq!(directory_size(dir.path()), 42);
    }

    #[tokio::test]
    async fn test_measure_totals() {
        let images = tempfile::tempdir().unwrap();
        let meta = tempfile::tempdir().unwrap();
        std::fs::write(images.path().join("frame.jpg"), [1u8; 100]).unwrap();
        std::fs::write(meta.path().join("result.json"), b"{}").unwrap();

        let usage = measure(images.path().to_path_buf(), meta.path().to_path_buf()).await;
        assert_eq!(usage.images, 100);
        assert_eq!(usage.meta, 2);
        assert_eq!(usage.total, 102);
    }
}
