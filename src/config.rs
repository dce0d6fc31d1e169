use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// Stable defaults shared by training and inference. These are deliberately
// not part of the config surface.
pub const SIGMA_KP: f32 = 3.0;
pub const KP_CONF_THRESHOLD: f32 = 0.4;
pub const CNN_OUT: usize = 256;
pub const LSTM_LAYERS: usize = 2;
pub const WEIGHT_DECAY: f32 = 1e-4;
pub const GRAD_CLIP: f32 = 1.0;
pub const EARLY_STOP_PATIENCE: usize = 10;
pub const SAVE_TOP_K: usize = 3;
pub const FOCAL_GAMMA: f64 = 2.0;
pub const VAL_RATIO: f64 = 0.2;
pub const SEED: u64 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemporalPool {
    Last,
    Mean,
    Attn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossKind {
    Focal,
    Ce,
}

/// Full training configuration. Defaults match the canonical settings the
/// model ships with; a JSON file overrides any subset of fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub pose_root: PathBuf,
    pub obj_root: Option<PathBuf>,
    pub out_dir: PathBuf,

    pub use_objects: bool,
    pub object_classes: Vec<String>,

    pub window: usize,
    pub stride: usize,

    #[serde(alias = "H")]
    pub grid_h: usize,
    #[serde(alias = "W")]
    pub grid_w: usize,
    pub include_bone_lines: bool,

    pub lstm_hidden: usize,
    pub bidirectional: bool,
    pub temporal_pool: TemporalPool,
    pub dropout: f64,

    pub epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    pub use_sampler: bool,
    pub loss: LossKind,

    pub enable_kalman: bool,
    pub kalman_half_slide: bool,
    /// Override for the online half-window length; defaults to window / 2.
    pub half_len_override: Option<usize>,
    /// Reset filter state at each slide boundary instead of carrying it
    /// through the whole window.
    pub kalman_reset_at_slide: bool,

    pub require_full_first_frame: bool,
    pub require_full_skeleton_all: bool,
    pub full_kp_min: usize,
    pub bbox_required: bool,

    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            pose_root: PathBuf::from("outputs/skeletons/pose"),
            obj_root: Some(PathBuf::from("outputs/skeletons/detect")),
            out_dir: PathBuf::from("outputs/models"),
            use_objects: true,
            object_classes: vec!["bed".to_string(), "chair".to_string()],
            window: 20,
            stride: 5,
            grid_h: 64,
            grid_w: 64,
            include_bone_lines: true,
            lstm_hidden: 256,
            bidirectional: false,
            temporal_pool: TemporalPool::Attn,
            dropout: 0.3,
            epochs: 30,
            batch_size: 8,
            learning_rate: 1e-3,
            use_sampler: true,
            loss: LossKind::Focal,
            enable_kalman: true,
            kalman_half_slide: true,
            half_len_override: None,
            kalman_reset_at_slide: false,
            require_full_first_frame: true,
            require_full_skeleton_all: false,
            full_kp_min: 17,
            bbox_required: true,
            seed: SEED,
        }
    }
}

impl TrainConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Effective half-window length for the online Kalman variant.
    pub fn half_len(&self) -> usize {
        match self.half_len_override {
            Some(n) if n > 0 => n,
            _ => (self.window / 2).max(1),
        }
    }
}

/// Inference configuration. Model/stream paths usually come from the CLI;
/// the relation-map and model fields must match the training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferConfig {
    pub model_path: PathBuf,
    pub classes_path: Option<PathBuf>,
    pub pose_json: PathBuf,
    pub object_json: Option<PathBuf>,
    pub out_csv: Option<PathBuf>,

    pub object_classes: Vec<String>,
    #[serde(alias = "H")]
    pub grid_h: usize,
    #[serde(alias = "W")]
    pub grid_w: usize,
    pub include_bone_lines: bool,

    pub lstm_hidden: usize,
    pub bidirectional: bool,
    pub temporal_pool: TemporalPool,
    pub dropout: f64,

    pub window: usize,
    pub stride: usize,
}

impl Default for InferConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("outputs/models/best"),
            classes_path: None,
            pose_json: PathBuf::new(),
            object_json: None,
            out_csv: None,
            object_classes: vec!["bed".to_string(), "chair".to_string()],
            grid_h: 64,
            grid_w: 64,
            include_bone_lines: true,
            lstm_hidden: 256,
            bidirectional: false,
            temporal_pool: TemporalPool::Attn,
            dropout: 0.3,
            window: 20,
            stride: 5,
        }
    }
}

impl InferConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_canonical_settings() {
        let cfg = TrainConfig::default();
        assert_eq!(cfg.window, 20);
        assert_eq!(cfg.stride, 5);
        assert_eq!(cfg.grid_h, 64);
        assert_eq!(cfg.temporal_pool, TemporalPool::Attn);
        assert_eq!(cfg.half_len(), 10);
    }

    #[test]
    fn test_partial_json_overrides() {
        let cfg: TrainConfig =
            serde_json::from_str(r#"{"window": 16, "H": 32, "W": 32, "loss": "ce"}"#).unwrap();
        assert_eq!(cfg.window, 16);
        assert_eq!(cfg.grid_h, 32);
        assert_eq!(cfg.grid_w, 32);
        assert_eq!(cfg.loss, LossKind::Ce);
        // untouched fields keep their defaults
        assert_eq!(cfg.stride, 5);
    }

    #[test]
    fn test_half_len_override() {
        let mut cfg = TrainConfig::default();
        cfg.half_len_override = Some(7);
        assert_eq!(cfg.half_len(), 7);
        cfg.half_len_override = Some(0);
        assert_eq!(cfg.half_len(), 10);
    }
}
