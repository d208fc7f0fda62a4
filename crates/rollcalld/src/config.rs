use rollcall_core::{RecognitionConfig, SmoothingKey};
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Detector/encoder helper program and its arguments.
    pub encoder_command: Vec<String>,
    /// How long to wait for the helper's reply before restarting it.
    pub encoder_timeout: Duration,
    /// Number of warmup frames to discard at startup (camera AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Consecutive failed reads that end the monitoring session.
    pub max_camera_failures: u32,
    pub recognition: RecognitionConfig,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        let db_path = std::env::var("ROLLCALL_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let encoder_command = std::env::var("ROLLCALL_ENCODER_CMD")
            .unwrap_or_else(|_| "rollcall-encoder".to_string())
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let defaults = RecognitionConfig::default();
        let recognition = RecognitionConfig {
            match_threshold: env_parse("ROLLCALL_MATCH_THRESHOLD", defaults.match_threshold),
            attendance_threshold: env_parse(
                "ROLLCALL_ATTENDANCE_THRESHOLD",
                defaults.attendance_threshold,
            ),
            frame_skip: env_parse("ROLLCALL_FRAME_SKIP", defaults.frame_skip),
            smoothing_key: env_parse::<SmoothingKey>("ROLLCALL_SMOOTHING_KEY", defaults.smoothing_key),
            history_len: env_parse("ROLLCALL_HISTORY_LEN", defaults.history_len),
            stale_secs: env_parse("ROLLCALL_STALE_SECS", defaults.stale_secs),
            min_observations: defaults.min_observations,
        };

        Self {
            camera_device: std::env::var("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            frame_width: env_parse("ROLLCALL_FRAME_WIDTH", 640),
            frame_height: env_parse("ROLLCALL_FRAME_HEIGHT", 480),
            db_path,
            encoder_command,
            encoder_timeout: Duration::from_millis(env_parse("ROLLCALL_ENCODER_TIMEOUT_MS", 5000)),
            warmup_frames: env_parse("ROLLCALL_WARMUP_FRAMES", 4),
            max_camera_failures: env_parse("ROLLCALL_MAX_CAMERA_FAILURES", 3),
            recognition,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(v) => v.parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %v, "ignoring unparseable setting");
            default
        }),
        Err(_) => default,
    }
}
