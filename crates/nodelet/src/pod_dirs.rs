//! Per-pod data directories under the node root directory.

use std::io;
use std::path::{Path, PathBuf};

use nodelet_core::PodUid;
use tracing::debug;

/// Layout of `<root>/pods/<uid>/{volumes,plugins}`.
#[derive(Debug, Clone)]
pub struct PodDirs {
    root: PathBuf,
}

impl PodDirs {
    /// Create the layout under `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding every pod directory.
    #[must_use]
    pub fn pods_dir(&self) -> PathBuf {
        self.root.join("pods")
    }

    /// Directory of one pod.
    #[must_use]
    pub fn pod_dir(&self, uid: &PodUid) -> PathBuf {
        self.pods_dir().join(uid.as_str())
    }

    /// Volume directory of one pod.
    #[must_use]
    pub fn pod_volumes_dir(&self, uid: &PodUid) -> PathBuf {
        self.pod_dir(uid).join("volumes")
    }

    /// Plugin directory of one pod.
    #[must_use]
    pub fn pod_plugins_dir(&self, uid: &PodUid) -> PathBuf {
        self.pod_dir(uid).join("plugins")
    }

    /// Create the pod's directories if missing.
    ///
    /// # Errors
    ///
    /// Returns the first filesystem error.
    pub async fn make_pod_data_dirs(&self, uid: &PodUid) -> io::Result<()> {
        for dir in [
            self.pod_dir(uid),
            self.pod_volumes_dir(uid),
            self.pod_plugins_dir(uid),
        ] {
            ensure_dir(&dir).await?;
        }
        Ok(())
    }

    /// UIDs of every pod directory on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the pods directory cannot be read.
    pub async fn list_pods(&self) -> io::Result<Vec<PodUid>> {
        let mut uids = Vec::new();
        let mut entries = match tokio::fs::read_dir(self.pods_dir()).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(uids),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match entry.file_name().to_str().map(PodUid::new) {
                Some(Ok(uid)) => uids.push(uid),
                _ => debug!(path = %entry.path().display(), "Skipping unrecognised pod directory"),
            }
        }
        Ok(uids)
    }

    /// Remove a pod directory and everything below it.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal fails for any reason but absence.
    pub async fn remove_pod_dir(&self, uid: &PodUid) -> io::Result<()> {
        match tokio::fs::remove_dir_all(self.pod_dir(uid)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

async fn ensure_dir(dir: &Path) -> io::Result<()> {
    match tokio::fs::metadata(dir).await {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a directory", dir.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => tokio::fs::create_dir_all(dir).await,
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn make_list_and_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = PodDirs::new(tmp.path());
        let uid = PodUid::new("pod-1").unwrap();

        assert!(dirs.list_pods().await.unwrap().is_empty());

        dirs.make_pod_data_dirs(&uid).await.unwrap();
        dirs.make_pod_data_dirs(&uid).await.unwrap();
        assert!(dirs.pod_volumes_dir(&uid).is_dir());
        assert!(dirs.pod_plugins_dir(&uid).is_dir());
        assert_eq!(dirs.list_pods().await.unwrap(), vec![uid.clone()]);

        dirs.remove_pod_dir(&uid).await.unwrap();
        dirs.remove_pod_dir(&uid).await.unwrap();
        assert!(dirs.list_pods().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_in_the_way_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = PodDirs::new(tmp.path());
        let uid = PodUid::new("pod-1").unwrap();
        std::fs::create_dir_all(dirs.pods_dir()).unwrap();
        std::fs::write(dirs.pod_dir(&uid), b"not a dir").unwrap();

        assert!(dirs.make_pod_data_dirs(&uid).await.is_err());
        // Stray files are not pods.
        assert!(dirs.list_pods().await.unwrap().is_empty());
    }
}
