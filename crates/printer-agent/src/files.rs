use crate::config::FileManagementConfig;
use crate::transport::{HttpBackend, HttpRequest, Method, RetryPolicy, TransportError};
use async_trait::async_trait;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::AsyncReadExt;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug)]
pub enum DownloadError {
    InvalidName(String),
    Transport(TransportError),
    Io(io::Error),
    ChecksumMismatch { expected: String, actual: String },
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidName(name) => write!(f, "invalid file name {name:?}"),
            Self::Transport(err) => write!(f, "download failed: {err}"),
            Self::Io(err) => write!(f, "file error: {err}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
        }
    }
}

impl std::error::Error for DownloadError {}

impl From<io::Error> for DownloadError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

/// Where print jobs live on the printer host.
#[async_trait]
pub trait GcodeStore: Send + Sync {
    fn contains(&self, name: &str) -> bool;

    async fn download(
        &self,
        name: &str,
        url: &str,
        checksum: Option<&str>,
    ) -> Result<PathBuf, DownloadError>;

    /// Removes `.gcode` files older than the configured age. Returns how many
    /// were deleted.
    fn cleanup_old_files(&self) -> usize;
}

pub struct FileManager {
    dir: PathBuf,
    config: FileManagementConfig,
    backend: Arc<dyn HttpBackend>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl FileManager {
    pub fn new(
        config: &FileManagementConfig,
        backend: Arc<dyn HttpBackend>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let dir = config.gcode_directory.clone();
        fs::create_dir_all(&dir)
            .map_err(|err| anyhow::anyhow!("failed to create {}: {err}", dir.display()))?;
        Ok(Self {
            dir,
            config: config.clone(),
            backend,
            policy,
            timeout,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn local_path(&self, name: &str) -> Result<PathBuf, DownloadError> {
        if !is_safe_name(name) {
            return Err(DownloadError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }
}

#[async_trait]
impl GcodeStore for FileManager {
    fn contains(&self, name: &str) -> bool {
        self.local_path(name)
            .map(|path| path.is_file())
            .unwrap_or(false)
    }

    async fn download(
        &self,
        name: &str,
        url: &str,
        checksum: Option<&str>,
    ) -> Result<PathBuf, DownloadError> {
        let dest = self.local_path(name)?;
        let partial = self.dir.join(format!("{name}.part"));
        let request = HttpRequest {
            method: Method::Get,
            url: url.to_string(),
            payload: None,
            timeout: self.timeout,
        };
        tracing::info!(file = name, url, "downloading gcode");
        let label = format!("download {name}");
        let size = self
            .policy
            .run(&label, |_| self.backend.download_to(&request, &partial))
            .await
            .map_err(|err| {
                fs::remove_file(&partial).ok();
                DownloadError::Transport(err)
            })?;

        if self.config.verify_checksums {
            if let Some(expected) = checksum.map(str::trim).filter(|value| !value.is_empty()) {
                let actual = md5_file(&partial).await.inspect_err(|_| {
                    fs::remove_file(&partial).ok();
                })?;
                if !actual.eq_ignore_ascii_case(expected) {
                    fs::remove_file(&partial).ok();
                    return Err(DownloadError::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
        }

        fs::rename(&partial, &dest)?;
        tracing::info!(file = name, size = %format_bytes(size), "download complete");
        Ok(dest)
    }

    fn cleanup_old_files(&self) -> usize {
        if !self.config.auto_cleanup {
            return 0;
        }
        let max_age = Duration::from_secs(self.config.max_age_days.saturating_mul(SECONDS_PER_DAY));
        let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
            return 0;
        };
        match remove_older_than(&self.dir, cutoff) {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, dir = %self.dir.display(), "removed old gcode files");
                }
                removed
            }
            Err(err) => {
                tracing::warn!(error = %err, dir = %self.dir.display(), "gcode cleanup failed");
                0
            }
        }
    }
}

fn is_safe_name(name: &str) -> bool {
    !name.trim().is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && name != "."
        && name != ".."
}

fn remove_older_than(dir: &Path, cutoff: SystemTime) -> io::Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("gcode") {
            continue;
        }
        let modified = fs::metadata(&path)?.modified()?;
        if modified < cutoff {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

async fn md5_file(path: &Path) -> Result<String, DownloadError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 8192];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        context.consume(&buffer[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}

pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if value < 1024.0 {
            return format!("{value:.1} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1} TB")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{json_response, status_response, temp_dir, FakeBackend};
    use crate::transport::HttpResponse;
    use bytes::Bytes;

    fn manager(dir: &Path, backend: Arc<FakeBackend>, verify: bool) -> FileManager {
        let config = FileManagementConfig {
            auto_cleanup: true,
            max_age_days: 30,
            verify_checksums: verify,
            gcode_directory: dir.join("gcodes"),
        };
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            exponential: true,
        };
        FileManager::new(&config, backend, policy, Duration::from_secs(60)).expect("manager")
    }

    fn body(content: &'static str) -> HttpResponse {
        HttpResponse {
            status: 200,
            body: Bytes::from_static(content.as_bytes()),
        }
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(512), "512.0 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 * 1024), "3.0 TB");
    }

    #[test]
    fn rejects_path_like_names() {
        assert!(is_safe_name("cube.gcode"));
        assert!(!is_safe_name("../etc/passwd"));
        assert!(!is_safe_name("dir/cube.gcode"));
        assert!(!is_safe_name(""));
    }

    #[tokio::test(start_paused = true)]
    async fn downloads_and_verifies_checksum() {
        let dir = temp_dir("printhub-files-ok");
        let backend = Arc::new(FakeBackend::new(|_, _| Ok(body("G28\nG1 X10\n"))));
        let manager = manager(&dir, backend, true);
        let expected = format!("{:x}", md5::compute(b"G28\nG1 X10\n"));
        let path = manager
            .download("cube.gcode", "http://hub/cube.gcode", Some(&expected))
            .await
            .expect("download");
        assert_eq!(fs::read_to_string(&path).expect("read"), "G28\nG1 X10\n");
        assert!(manager.contains("cube.gcode"));
        assert!(!manager.dir().join("cube.gcode.part").exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn checksum_mismatch_leaves_nothing_behind() {
        let dir = temp_dir("printhub-files-md5");
        let backend = Arc::new(FakeBackend::new(|_, _| Ok(body("G28\n"))));
        let manager = manager(&dir, backend, true);
        let err = manager
            .download("cube.gcode", "http://hub/cube.gcode", Some("deadbeef"))
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::ChecksumMismatch { .. }));
        assert!(!manager.contains("cube.gcode"));
        assert!(!manager.dir().join("cube.gcode.part").exists());
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn checksum_ignored_when_verification_disabled() {
        let dir = temp_dir("printhub-files-noverify");
        let backend = Arc::new(FakeBackend::new(|_, _| Ok(body("G28\n"))));
        let manager = manager(&dir, backend, false);
        manager
            .download("cube.gcode", "http://hub/cube.gcode", Some("deadbeef"))
            .await
            .expect("download");
        assert!(manager.contains("cube.gcode"));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn download_retries_then_gives_up() {
        let dir = temp_dir("printhub-files-retry");
        let backend = Arc::new(FakeBackend::new(|_, _| Ok(status_response(404))));
        let manager = manager(&dir, backend.clone(), false);
        let err = manager
            .download("cube.gcode", "http://hub/cube.gcode", None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Transport(TransportError::Status(404))
        ));
        assert_eq!(backend.call_count(), 3);
        assert!(!manager.contains("cube.gcode"));
        fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test(start_paused = true)]
    async fn unsafe_name_never_hits_network() {
        let dir = temp_dir("printhub-files-name");
        let backend = Arc::new(FakeBackend::new(|_, _| Ok(json_response(serde_json::json!({})))));
        let manager = manager(&dir, backend.clone(), false);
        let err = manager
            .download("../escape.gcode", "http://hub/x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, DownloadError::InvalidName(_)));
        assert_eq!(backend.call_count(), 0);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn cleanup_removes_only_old_gcode() {
        let dir = temp_dir("printhub-files-cleanup");
        let gcodes = dir.join("gcodes");
        fs::create_dir_all(&gcodes).expect("mkdir");
        let old = gcodes.join("old.gcode");
        let fresh = gcodes.join("fresh.gcode");
        let other = gcodes.join("notes.txt");
        for path in [&old, &fresh, &other] {
            fs::write(path, b"x").expect("write");
        }
        let now = SystemTime::now();
        let cutoff = now - Duration::from_secs(60);
        let stale = now - Duration::from_secs(3600);
        fs::File::options()
            .write(true)
            .open(&old)
            .and_then(|file| file.set_modified(stale))
            .expect("set mtime");
        fs::File::options()
            .write(true)
            .open(&other)
            .and_then(|file| file.set_modified(stale))
            .expect("set mtime");
        assert_eq!(remove_older_than(&gcodes, cutoff).expect("cleanup"), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
        fs::remove_dir_all(&dir).ok();
    }
}
