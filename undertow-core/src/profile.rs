//! Profile directory layout and the single-instance lockfile.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::config::ConfigError;
use crate::torrent::InfoHash;

/// Paths under the profile directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    root: PathBuf,
}

impl Profile {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the profile tree.
    ///
    /// # Errors
    ///
    /// - `ConfigError::Profile` - A directory could not be created
    pub fn ensure(&self) -> Result<(), ConfigError> {
        for dir in [
            self.root.clone(),
            self.downloads_dir(),
            self.torrents_dir(),
            self.logs_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| ConfigError::Profile { path: dir, source })?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn app_db(&self) -> PathBuf {
        self.root.join("app.db")
    }

    pub fn cache_db(&self) -> PathBuf {
        self.root.join("cache.db")
    }

    pub fn library_db(&self) -> PathBuf {
        self.root.join("library.db")
    }

    pub fn lockfile(&self) -> PathBuf {
        self.root.join(".lockfile")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.root.join("downloads")
    }

    pub fn torrents_dir(&self) -> PathBuf {
        self.root.join("torrents")
    }

    /// Retained `.torrent` for resume.
    pub fn torrent_file(&self, info_hash: InfoHash) -> PathBuf {
        self.torrents_dir().join(format!("{info_hash}.torrent"))
    }

    /// Payload tree of a file-backed torrent under `downloads`.
    pub fn payload_dir(&self, downloads: &Path, info_hash: InfoHash) -> PathBuf {
        downloads.join(info_hash.to_string())
    }

    /// Resume bitfield sidecar.
    pub fn resume_file(&self, downloads: &Path, info_hash: InfoHash) -> PathBuf {
        downloads.join(format!("{info_hash}.resume"))
    }
}

/// Errors acquiring the lockfile.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Instance {pid} still holds {path} after termination request")]
    Held { pid: i32, path: PathBuf },

    #[error("Lockfile {path} unusable")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

const TERMINATION_WAIT: Duration = Duration::from_secs(5);
const SIGTERM: i32 = 15;

#[cfg(unix)]
unsafe extern "C" {
    fn kill(pid: i32, sig: i32) -> i32;
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    pid > 0 && unsafe { kill(pid, 0) } == 0
}

#[cfg(unix)]
fn terminate(pid: i32) {
    unsafe {
        kill(pid, SIGTERM);
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

#[cfg(not(unix))]
fn terminate(_pid: i32) {}

/// Held `.lockfile`; removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
    pid: u32,
}

impl InstanceLock {
    /// Takes over the profile. A live previous owner is sent SIGTERM and
    /// given a few seconds to exit.
    ///
    /// # Errors
    ///
    /// - `LockError::Held` - Previous owner survived the termination request
    /// - `LockError::Io` - Lockfile could not be written
    pub async fn acquire(path: &Path) -> Result<Self, LockError> {
        let own = std::process::id();
        let previous = std::fs::read_to_string(path)
            .ok()
            .and_then(|contents| contents.trim().parse::<i32>().ok())
            .filter(|pid| *pid != own as i32);

        if let Some(pid) = previous {
            if process_alive(pid) {
                tracing::warn!(pid, "Previous instance still running, terminating it");
                terminate(pid);
                let started = Instant::now();
                while process_alive(pid) {
                    if started.elapsed() > TERMINATION_WAIT {
                        return Err(LockError::Held {
                            pid,
                            path: path.to_path_buf(),
                        });
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            } else {
                tracing::debug!(pid, "Stale lockfile found");
            }
        }

        std::fs::write(path, format!("{own}\n")).map_err(|source| LockError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            pid: own,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let ours = std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|contents| contents.trim().parse::<u32>().ok())
            == Some(self.pid);
        if ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), "Failed to release lockfile: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_layout() {
        let dir = tempfile::tempdir().unwrap();
        let profile = Profile::new(dir.path());
        profile.ensure().unwrap();
        assert!(profile.downloads_dir().is_dir());
        assert!(profile.torrents_dir().is_dir());
        assert_eq!(profile.app_db(), dir.path().join("app.db"));
        assert_eq!(profile.lockfile(), dir.path().join(".lockfile"));

        let ih = InfoHash::new([0xab; 20]);
        assert_eq!(
            profile.torrent_file(ih),
            dir.path().join("torrents").join(format!("{ih}.torrent"))
        );
        let downloads = profile.downloads_dir();
        assert_eq!(profile.resume_file(&downloads, ih), downloads.join(format!("{ih}.resume")));
    }

    #[tokio::test]
    async fn test_stale_lockfile_is_taken_over_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lockfile");
        // Pid far above any default pid_max.
        std::fs::write(&path, "999999999\n").unwrap();

        let lock = InstanceLock::acquire(&path).await.unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());

        drop(lock);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_own_pid_in_lockfile_is_not_killed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".lockfile");
        std::fs::write(&path, format!("{}\n", std::process::id())).unwrap();
        let lock = InstanceLock::acquire(&path).await.unwrap();
        assert_eq!(lock.pid(), std::process::id());
    }
}
