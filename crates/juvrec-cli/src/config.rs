use juvrec_core::detector::{LocatorConfig, DEFAULT_MIN_FACE_SIZE, DEFAULT_MIN_NEIGHBORS};
use juvrec_core::matcher::DEFAULT_MATCH_THRESHOLD;
use juvrec_core::scan::ScannerConfig;
use juvrec_hw::CameraConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Station configuration: defaults, then the TOML file named by
/// `JUVREC_CONFIG`, then `JUVREC_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// `/dev/videoN` indices in preference order.
    pub camera_indices: Vec<usize>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub fps: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub encoder_model: String,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Euclidean distance below which two faces are the same person.
    pub match_threshold: f32,
    /// Seconds a face must stay centered before an enrollment capture.
    pub enroll_hold_secs: f32,
    /// Same for recognition; 0 captures on the first centered frame.
    pub recognize_hold_secs: f32,
    /// Fraction of the half-frame the face center may stray on each axis.
    pub center_tolerance: f32,
    pub tick_ms: u64,
    pub min_face_size: f32,
    pub min_neighbors: usize,
    /// Recorded as `enrolled_by` on new enrollments.
    pub operator: String,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("juvrec");

        Self {
            camera_indices: vec![1, 2, 0],
            frame_width: 640,
            frame_height: 480,
            fps: 30,
            model_dir: data_dir.join("models"),
            detector_model: "det_10g.onnx".to_string(),
            encoder_model: "face_encoder_128.onnx".to_string(),
            db_path: data_dir.join("juvrec.db"),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            enroll_hold_secs: 3.0,
            recognize_hold_secs: 3.0,
            center_tolerance: 0.2,
            tick_ms: 30,
            min_face_size: DEFAULT_MIN_FACE_SIZE,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
            operator: "unknown".to_string(),
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("JUVREC_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Overlay `JUVREC_*` variables; unparsable values keep the current setting.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(list) = lookup("JUVREC_CAMERA_INDICES") {
            match parse_indices(&list) {
                Some(indices) => self.camera_indices = indices,
                None => tracing::warn!(value = %list, "ignoring malformed JUVREC_CAMERA_INDICES"),
            }
        }
        if let Some(dir) = lookup("JUVREC_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("JUVREC_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(operator) = lookup("JUVREC_OPERATOR") {
            self.operator = operator;
        }

        self.frame_width = env_parse(&lookup, "JUVREC_FRAME_WIDTH", self.frame_width);
        self.frame_height = env_parse(&lookup, "JUVREC_FRAME_HEIGHT", self.frame_height);
        self.fps = env_parse(&lookup, "JUVREC_FPS", self.fps);
        self.match_threshold = env_parse(&lookup, "JUVREC_MATCH_THRESHOLD", self.match_threshold);
        self.enroll_hold_secs = env_parse(&lookup, "JUVREC_ENROLL_HOLD_SECS", self.enroll_hold_secs);
        self.recognize_hold_secs = env_parse(&lookup, "JUVREC_RECOGNIZE_HOLD_SECS", self.recognize_hold_secs);
        self.center_tolerance = env_parse(&lookup, "JUVREC_CENTER_TOLERANCE", self.center_tolerance);
        self.tick_ms = env_parse(&lookup, "JUVREC_TICK_MS", self.tick_ms);
        self.min_face_size = env_parse(&lookup, "JUVREC_MIN_FACE_SIZE", self.min_face_size);
        self.min_neighbors = env_parse(&lookup, "JUVREC_MIN_NEIGHBORS", self.min_neighbors);
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the 128-d face encoder model.
    pub fn encoder_model_path(&self) -> String {
        self.model_dir
            .join(&self.encoder_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn camera_config(&self) -> CameraConfig {
        CameraConfig {
            indices: self.camera_indices.clone(),
            width: self.frame_width,
            height: self.frame_height,
            fps: self.fps,
        }
    }

    pub fn locator_config(&self) -> LocatorConfig {
        LocatorConfig {
            min_size: self.min_face_size,
            min_neighbors: self.min_neighbors,
        }
    }

    /// Landmark detection on the captured frame. The per-tick locator has
    /// already accepted the face, so only the size floor applies.
    pub fn extraction_locator_config(&self) -> LocatorConfig {
        LocatorConfig {
            min_size: self.min_face_size,
            min_neighbors: 0,
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            enroll_hold: secs(self.enroll_hold_secs),
            recognize_hold: secs(self.recognize_hold_secs),
            center_tolerance: self.center_tolerance,
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

fn secs(value: f32) -> Duration {
    Duration::try_from_secs_f32(value.max(0.0)).unwrap_or(Duration::ZERO)
}

fn env_parse<T, F>(lookup: &F, key: &str, current: T) -> T
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(current)
}

fn parse_indices(list: &str) -> Option<Vec<usize>> {
    let indices: Option<Vec<usize>> = list
        .split(',')
        .map(|s| s.trim().parse().ok())
        .collect();
    indices.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_indices, vec![1, 2, 0]);
        assert_eq!((config.frame_width, config.frame_height, config.fps), (640, 480, 30));
        assert!((config.match_threshold - 0.4).abs() < 1e-6);
        assert_eq!(config.scanner_config().enroll_hold, Duration::from_secs(3));
        assert_eq!(config.tick(), Duration::from_millis(30));
        assert_eq!(config.locator_config().min_neighbors, 5);
    }

    #[test]
    fn test_extraction_locator_skips_neighbor_filter() {
        let mut config = Config::default();
        config.apply_env(lookup(&[("JUVREC_MIN_NEIGHBORS", "7"), ("JUVREC_MIN_FACE_SIZE", "40")]));
        assert_eq!(config.locator_config().min_neighbors, 7);

        let extraction = config.extraction_locator_config();
        assert_eq!(extraction.min_neighbors, 0);
        assert!((extraction.min_size - 40.0).abs() < 1e-6);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            camera_indices = [0]
            match_threshold = 0.35
            recognize_hold_secs = 0.0
            operator = "intake-desk-2"
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_indices, vec![0]);
        assert!((config.match_threshold - 0.35).abs() < 1e-6);
        assert_eq!(config.scanner_config().recognize_hold, Duration::ZERO);
        assert_eq!(config.operator, "intake-desk-2");
        assert_eq!(config.frame_width, 640);
    }

    #[test]
    fn test_unknown_toml_type_is_error() {
        let parsed: Result<Config, _> = toml::from_str("fps = \"fast\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(lookup(&[
            ("JUVREC_CAMERA_INDICES", "2, 0"),
            ("JUVREC_DB_PATH", "/var/lib/juvrec/faces.db"),
            ("JUVREC_MATCH_THRESHOLD", "0.45"),
            ("JUVREC_TICK_MS", "50"),
            ("JUVREC_OPERATOR", "officer.reyes"),
        ]));
        assert_eq!(config.camera_indices, vec![2, 0]);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/juvrec/faces.db"));
        assert!((config.match_threshold - 0.45).abs() < 1e-6);
        assert_eq!(config.tick_ms, 50);
        assert_eq!(config.operator, "officer.reyes");
    }

    #[test]
    fn test_malformed_env_keeps_current() {
        let mut config = Config::default();
        config.apply_env(lookup(&[
            ("JUVREC_CAMERA_INDICES", "one,two"),
            ("JUVREC_FPS", "fast"),
            ("JUVREC_CENTER_TOLERANCE", ""),
        ]));
        assert_eq!(config.camera_indices, vec![1, 2, 0]);
        assert_eq!(config.fps, 30);
        assert!((config.center_tolerance - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_model_paths() {
        let config = Config {
            model_dir: PathBuf::from("/opt/juvrec/models"),
            ..Default::default()
        };
        assert_eq!(config.detector_model_path(), "/opt/juvrec/models/det_10g.onnx");
        assert_eq!(config.encoder_model_path(), "/opt/juvrec/models/face_encoder_128.onnx");
    }

    #[test]
    fn test_negative_hold_clamps_to_zero() {
        let config = Config {
            enroll_hold_secs: -1.0,
            ..Default::default()
        };
        assert_eq!(config.scanner_config().enroll_hold, Duration::ZERO);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = Config::from_file(Path::new("/nonexistent/juvrec.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
