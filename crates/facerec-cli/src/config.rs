use facerec_core::{BuildOptions, SamplePolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// SFace's L2 acceptance distance for normalized features; equivalent to a
/// cosine similarity of 0.363.
pub const DEFAULT_MATCH_DISTANCE: f64 = 1.128;

/// Example application configuration.
///
/// Sources, later ones winning: built-in defaults, the TOML file given with
/// `--config`, `FACEREC_*` environment variables, command-line flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing the ONNX model files.
    pub models_dir: PathBuf,
    /// Directory with one subdirectory of sample images per person.
    pub persons_dir: PathBuf,
    /// V4L2 device path.
    pub camera_device: String,
    /// Margin added around the aligned face, as a fraction of its size.
    pub padding: f64,
    /// Number of jittered chips averaged per descriptor.
    pub jitter: u32,
    /// Maximum Euclidean distance between unit-length descriptors accepted
    /// as a match.
    pub match_distance: f64,
    /// What to do with gallery samples that fail detection or recognition.
    pub sample_policy: SamplePolicy,
    /// Minimum detector score for a face.
    pub detector_confidence: f32,
    /// Stop the live loop after this many frames; 0 runs until interrupted.
    pub max_frames: u64,
    /// Scan the gallery with the rayon matcher.
    pub parallel_match: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("./models"),
            persons_dir: PathBuf::from("./persons"),
            camera_device: "/dev/video0".to_string(),
            padding: 0.0,
            jitter: 30,
            match_distance: DEFAULT_MATCH_DISTANCE,
            sample_policy: SamplePolicy::Abort,
            detector_confidence: 0.5,
            max_frames: 0,
            parallel_match: false,
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply `FACEREC_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from environment-style lookups. Unparseable values are
    /// logged and ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("FACEREC_MODELS_DIR") {
            self.models_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEREC_PERSONS_DIR") {
            self.persons_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("FACEREC_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        env_parse(&lookup, "FACEREC_PADDING", &mut self.padding);
        env_parse(&lookup, "FACEREC_JITTER", &mut self.jitter);
        env_parse(&lookup, "FACEREC_MATCH_DISTANCE", &mut self.match_distance);
        env_parse(&lookup, "FACEREC_DETECTOR_CONFIDENCE", &mut self.detector_confidence);
        env_parse(&lookup, "FACEREC_MAX_FRAMES", &mut self.max_frames);
        if let Some(v) = lookup("FACEREC_SAMPLE_POLICY") {
            match v.as_str() {
                "abort" => self.sample_policy = SamplePolicy::Abort,
                "skip" => self.sample_policy = SamplePolicy::Skip,
                other => tracing::warn!(value = other, "ignoring FACEREC_SAMPLE_POLICY"),
            }
        }
        if let Some(v) = lookup("FACEREC_PARALLEL_MATCH") {
            self.parallel_match = v != "0";
        }
    }

    /// Path to the SCRFD detection model.
    pub fn detector_model_path(&self) -> String {
        self.models_dir
            .join(facerec_core::DETECTOR_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the SFace descriptor model.
    pub fn recognizer_model_path(&self) -> String {
        self.models_dir
            .join(facerec_core::RECOGNIZER_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    pub fn build_options(&self) -> BuildOptions {
        BuildOptions {
            padding: self.padding,
            jitter: self.jitter,
            policy: self.sample_policy,
        }
    }
}

fn env_parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.padding, 0.0);
        assert_eq!(cfg.jitter, 30);
        assert_eq!(cfg.match_distance, DEFAULT_MATCH_DISTANCE);
        assert_eq!(cfg.sample_policy, SamplePolicy::Abort);
        assert!(cfg.detector_model_path().ends_with("det_10g.onnx"));
        assert!(cfg
            .recognizer_model_path()
            .ends_with("face_recognition_sface_2021dec.onnx"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("facerec.toml");
        std::fs::write(
            &path,
            "persons_dir = \"/srv/persons\"\nmatch_distance = 0.45\nsample_policy = \"skip\"\n",
        )
        .unwrap();

        let cfg = Config::from_file(&path).unwrap();
        assert_eq!(cfg.persons_dir, PathBuf::from("/srv/persons"));
        assert_eq!(cfg.match_distance, 0.45);
        assert_eq!(cfg.sample_policy, SamplePolicy::Skip);
        assert_eq!(cfg.jitter, 30);
        assert_eq!(cfg.camera_device, "/dev/video0");
    }

    #[test]
    fn test_bad_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "jitter = \"lots\"").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FACEREC_MODELS_DIR", "/opt/models"),
            ("FACEREC_JITTER", "5"),
            ("FACEREC_MATCH_DISTANCE", "0.6"),
            ("FACEREC_PADDING", "not-a-number"),
            ("FACEREC_SAMPLE_POLICY", "skip"),
            ("FACEREC_PARALLEL_MATCH", "1"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.models_dir, PathBuf::from("/opt/models"));
        assert_eq!(cfg.jitter, 5);
        assert_eq!(cfg.match_distance, 0.6);
        assert_eq!(cfg.padding, 0.0);
        assert_eq!(cfg.sample_policy, SamplePolicy::Skip);
        assert!(cfg.parallel_match);
    }

    #[test]
    fn test_build_options_follow_config() {
        let cfg = Config { jitter: 1, padding: 0.1, ..Config::default() };
        let opts = cfg.build_options();
        assert_eq!(opts.jitter, 1);
        assert_eq!(opts.padding, 0.1);
        assert_eq!(opts.policy, SamplePolicy::Abort);
    }
}
