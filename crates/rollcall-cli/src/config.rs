use anyhow::{Context, Result};
use rollcall_core::detector::DetectionPolicy;
use rollcall_core::enroll::{EnrollOptions, DEFAULT_TARGET_COUNT};
use rollcall_core::recognizer::{
    ThresholdPolicy, DEFAULT_ATTENDANCE_THRESHOLD, DEFAULT_DISPLAY_THRESHOLD,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// CLI configuration: defaults, then the TOML file named by `ROLLCALL_CONFIG`,
/// then `ROLLCALL_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Frames discarded after the stream starts.
    pub warmup_frames: usize,
    /// SCRFD ONNX model.
    pub detector_model: PathBuf,
    /// Root for the identity store, samples, artifact and attendance record.
    pub data_dir: PathBuf,
    pub display_threshold: f64,
    pub attendance_threshold: f64,
    pub target_count: usize,
    pub sample_interval_ms: u64,
    pub min_confidence: f32,
    pub nms_iou: f32,
    pub min_face_size: f32,
}

/// Every key optional; absent keys keep the previous layer's value.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    camera_width: Option<u32>,
    camera_height: Option<u32>,
    warmup_frames: Option<usize>,
    detector_model: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    display_threshold: Option<f64>,
    attendance_threshold: Option<f64>,
    target_count: Option<usize>,
    sample_interval_ms: Option<u64>,
    min_confidence: Option<f32>,
    nms_iou: Option<f32>,
    min_face_size: Option<f32>,
}

impl Config {
    /// Defaults, rooted at `data_dir`.
    pub fn defaults(data_dir: PathBuf) -> Self {
        let detection = DetectionPolicy::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            warmup_frames: 4,
            detector_model: data_dir.join("models").join("det_10g.onnx"),
            data_dir,
            display_threshold: DEFAULT_DISPLAY_THRESHOLD,
            attendance_threshold: DEFAULT_ATTENDANCE_THRESHOLD,
            target_count: DEFAULT_TARGET_COUNT,
            sample_interval_ms: 50,
            min_confidence: detection.min_confidence,
            nms_iou: detection.nms_iou,
            min_face_size: detection.min_face_size,
        }
    }

    /// Load from the process environment.
    pub fn load() -> Result<Self> {
        let env = |key: &str| std::env::var(key).ok();

        let file = match env("ROLLCALL_CONFIG") {
            Some(path) => Some(
                std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {path}"))?,
            ),
            None => None,
        };

        Self::from_sources(file.as_deref(), env)
    }

    /// Layer an optional TOML document and an environment lookup over the
    /// defaults.
    pub fn from_sources(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let file: FileConfig = match file {
            Some(text) => toml::from_str(text).context("parsing config file")?,
            None => FileConfig::default(),
        };

        let data_dir = env("ROLLCALL_DATA_DIR")
            .map(PathBuf::from)
            .or(file.data_dir.clone())
            .unwrap_or_else(|| default_data_dir(&env));

        let mut config = Self::defaults(data_dir);
        config.apply_file(file);
        config.apply_env(&env);
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        let FileConfig {
            camera_device,
            camera_width,
            camera_height,
            warmup_frames,
            detector_model,
            data_dir: _,
            display_threshold,
            attendance_threshold,
            target_count,
            sample_interval_ms,
            min_confidence,
            nms_iou,
            min_face_size,
        } = file;

        if let Some(device) = camera_device {
            self.camera_device = device;
        }
        self.camera_width = camera_width.unwrap_or(self.camera_width);
        self.camera_height = camera_height.unwrap_or(self.camera_height);
        self.warmup_frames = warmup_frames.unwrap_or(self.warmup_frames);
        if let Some(path) = detector_model {
            self.detector_model = path;
        }
        self.display_threshold = display_threshold.unwrap_or(self.display_threshold);
        self.attendance_threshold = attendance_threshold.unwrap_or(self.attendance_threshold);
        self.target_count = target_count.unwrap_or(self.target_count);
        self.sample_interval_ms = sample_interval_ms.unwrap_or(self.sample_interval_ms);
        self.min_confidence = min_confidence.unwrap_or(self.min_confidence);
        self.nms_iou = nms_iou.unwrap_or(self.nms_iou);
        self.min_face_size = min_face_size.unwrap_or(self.min_face_size);
    }

    fn apply_env(&mut self, env: &impl Fn(&str) -> Option<String>) {
        if let Some(device) = env("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        if let Some(path) = env("ROLLCALL_DETECTOR_MODEL") {
            self.detector_model = PathBuf::from(path);
        }
        self.camera_width = env_parse(env, "ROLLCALL_CAMERA_WIDTH", self.camera_width);
        self.camera_height = env_parse(env, "ROLLCALL_CAMERA_HEIGHT", self.camera_height);
        self.warmup_frames = env_parse(env, "ROLLCALL_WARMUP_FRAMES", self.warmup_frames);
        self.display_threshold = env_parse(env, "ROLLCALL_DISPLAY_THRESHOLD", self.display_threshold);
        self.attendance_threshold =
            env_parse(env, "ROLLCALL_ATTENDANCE_THRESHOLD", self.attendance_threshold);
        self.target_count = env_parse(env, "ROLLCALL_TARGET_COUNT", self.target_count);
        self.sample_interval_ms =
            env_parse(env, "ROLLCALL_SAMPLE_INTERVAL_MS", self.sample_interval_ms);
        self.min_confidence = env_parse(env, "ROLLCALL_MIN_CONFIDENCE", self.min_confidence);
        self.nms_iou = env_parse(env, "ROLLCALL_NMS_IOU", self.nms_iou);
        self.min_face_size = env_parse(env, "ROLLCALL_MIN_FACE_SIZE", self.min_face_size);
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("identities.db")
    }

    pub fn samples_dir(&self) -> PathBuf {
        self.data_dir.join("samples")
    }

    pub fn artifact_path(&self) -> PathBuf {
        self.data_dir.join("trainer").join("model.json")
    }

    pub fn attendance_path(&self) -> PathBuf {
        self.data_dir.join("attendance").join("session.db")
    }

    pub fn threshold_policy(&self) -> Result<ThresholdPolicy> {
        Ok(ThresholdPolicy::new(
            self.display_threshold,
            self.attendance_threshold,
        )?)
    }

    pub fn detection_policy(&self) -> DetectionPolicy {
        DetectionPolicy {
            min_confidence: self.min_confidence,
            nms_iou: self.nms_iou,
            min_face_size: self.min_face_size,
        }
    }

    pub fn enroll_options(&self, target_count: Option<usize>) -> EnrollOptions {
        EnrollOptions {
            target_count: target_count.unwrap_or(self.target_count),
            sample_interval: Duration::from_millis(self.sample_interval_ms),
        }
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            Path::new(&home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_under_xdg_data_home() {
        let config = Config::from_sources(None, lookup(&[("XDG_DATA_HOME", "/data")])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/data/rollcall"));
        assert_eq!(config.db_path(), PathBuf::from("/data/rollcall/identities.db"));
        assert_eq!(
            config.artifact_path(),
            PathBuf::from("/data/rollcall/trainer/model.json")
        );
        assert_eq!(config.display_threshold, DEFAULT_DISPLAY_THRESHOLD);
        assert_eq!(config.attendance_threshold, DEFAULT_ATTENDANCE_THRESHOLD);
        assert_eq!(config.target_count, 100);
        assert!(config.threshold_policy().is_ok());
    }

    #[test]
    fn test_home_fallback() {
        let config = Config::from_sources(None, lookup(&[("HOME", "/home/ann")])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/home/ann/.local/share/rollcall"));
    }

    #[test]
    fn test_file_then_env_precedence() {
        let file = r#"
            camera_device = "/dev/video4"
            data_dir = "/srv/rollcall"
            attendance_threshold = 40.0
            target_count = 20
        "#;
        let env = lookup(&[
            ("ROLLCALL_TARGET_COUNT", "30"),
            ("ROLLCALL_SAMPLE_INTERVAL_MS", "0"),
        ]);
        let config = Config::from_sources(Some(file), env).unwrap();

        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.data_dir, PathBuf::from("/srv/rollcall"));
        assert_eq!(
            config.detector_model,
            PathBuf::from("/srv/rollcall/models/det_10g.onnx")
        );
        assert!((config.attendance_threshold - 40.0).abs() < 1e-9);
        assert_eq!(config.target_count, 30);
        assert_eq!(config.enroll_options(None).sample_interval, Duration::ZERO);
        assert_eq!(config.enroll_options(Some(5)).target_count, 5);
    }

    #[test]
    fn test_env_data_dir_wins_over_file() {
        let config = Config::from_sources(
            Some("data_dir = \"/srv/a\""),
            lookup(&[("ROLLCALL_DATA_DIR", "/srv/b")]),
        )
        .unwrap();
        assert_eq!(config.samples_dir(), PathBuf::from("/srv/b/samples"));
    }

    #[test]
    fn test_unparseable_env_keeps_previous_value() {
        let config =
            Config::from_sources(None, lookup(&[("ROLLCALL_NMS_IOU", "lots")])).unwrap();
        assert!((config.nms_iou - DetectionPolicy::default().nms_iou).abs() < 1e-6);
    }

    #[test]
    fn test_unknown_file_key_rejected() {
        assert!(Config::from_sources(Some("threshold = 3"), lookup(&[])).is_err());
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let config = Config::from_sources(
            None,
            lookup(&[
                ("ROLLCALL_DISPLAY_THRESHOLD", "50"),
                ("ROLLCALL_ATTENDANCE_THRESHOLD", "80"),
            ]),
        )
        .unwrap();
        assert!(config.threshold_policy().is_err());
    }
}
