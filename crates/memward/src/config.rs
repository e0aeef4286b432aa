use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory where saved snaps are written.
    pub snap_dir: PathBuf,
    /// Base URL of the recognition service.
    pub matcher_url: String,
    /// Timeout in seconds for one matcher request.
    pub matcher_timeout_secs: u64,
    /// Frames discarded after opening the camera (auto exposure settling).
    pub warmup_frames: usize,
    /// Frames tried per capture before giving up on dark images.
    pub capture_attempts: usize,
    /// JPEG quality of captured stills.
    pub jpeg_quality: u8,
    /// Authenticated user id. `None` means nobody is signed in.
    pub user: Option<String>,
    /// Location recorded when a save does not name one.
    pub default_location: Option<String>,
}

impl Config {
    /// Load configuration from `MEMWAR_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let data_dir = get("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = get("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("memwar");

        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        Self {
            camera_device: non_empty("MEMWAR_CAMERA_DEVICE").unwrap_or_else(|| "/dev/video0".to_string()),
            db_path: non_empty("MEMWAR_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("memwar.db")),
            snap_dir: non_empty("MEMWAR_SNAP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("snaps")),
            matcher_url: non_empty("MEMWAR_MATCHER_URL").unwrap_or_else(|| "http://127.0.0.1:3000".to_string()),
            matcher_timeout_secs: parse_or(&get, "MEMWAR_MATCHER_TIMEOUT_SECS", 10),
            warmup_frames: parse_or(&get, "MEMWAR_WARMUP_FRAMES", 4),
            capture_attempts: parse_or(&get, "MEMWAR_CAPTURE_ATTEMPTS", 6),
            jpeg_quality: parse_or(&get, "MEMWAR_JPEG_QUALITY", 85),
            user: non_empty("MEMWAR_USER").or_else(|| non_empty("USER")),
            default_location: non_empty("MEMWAR_DEFAULT_LOCATION"),
        }
    }

    pub fn matcher_timeout(&self) -> Duration {
        Duration::from_secs(self.matcher_timeout_secs)
    }

    /// Storage scope for the roster: the signed-in user, or a shared local scope.
    pub fn store_scope(&self) -> &str {
        self.user.as_deref().unwrap_or("local")
    }
}

fn parse_or<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    get(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}
