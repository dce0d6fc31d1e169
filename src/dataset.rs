use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{KP_CONF_THRESHOLD, TrainConfig};
use crate::error::PipelineError;
use crate::extract::{self, Keypoint};
use crate::kalman::{self, SmoothMode, SmootherConfig};
use crate::records;
use crate::relation_map::{rasterize_frame, RelationMapConfig};

/// Everything the sampler needs to gate and materialize windows.
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub window: usize,
    pub stride: usize,
    pub use_objects: bool,
    pub map: RelationMapConfig,
    pub enable_kalman: bool,
    pub smoother: SmootherConfig,
    pub require_full_first: bool,
    pub require_full_all: bool,
    pub full_kp_min: usize,
    pub bbox_required: bool,
}

impl DatasetOptions {
    pub fn from_train_config(cfg: &TrainConfig) -> Self {
        let mut map = RelationMapConfig {
            grid_h: cfg.grid_h,
            grid_w: cfg.grid_w,
            include_bone_lines: cfg.include_bone_lines,
            ..Default::default()
        };
        if cfg.use_objects {
            map.set_object_classes(&cfg.object_classes);
        }
        let mode = if cfg.kalman_half_slide {
            SmoothMode::HalfSlide {
                half_len: cfg.half_len(),
                slide_step: cfg.stride,
                reset_at_slide: cfg.kalman_reset_at_slide,
            }
        } else {
            SmoothMode::FullWindow
        };
        Self {
            window: cfg.window,
            stride: cfg.stride,
            use_objects: cfg.use_objects && !map.object_classes.is_empty(),
            map,
            enable_kalman: cfg.enable_kalman,
            smoother: SmootherConfig {
                confidence_threshold: KP_CONF_THRESHOLD,
                require_full_first: cfg.require_full_first_frame,
                mode,
            },
            require_full_first: cfg.require_full_first_frame,
            require_full_all: cfg.require_full_skeleton_all,
            full_kp_min: cfg.full_kp_min,
            bbox_required: cfg.bbox_required,
        }
    }
}

/// One aligned recording: pose stream plus (optionally) the object stream.
#[derive(Debug)]
struct SequenceData {
    poses: BTreeMap<i64, Value>,
    objects: BTreeMap<i64, Value>,
}

/// One accepted training sample: a class label and the frame ids of the
/// window inside its sequence.
#[derive(Debug, Clone)]
pub struct WindowSample {
    pub label: usize,
    seq: usize,
    pub frames: Vec<i64>,
}

#[derive(Debug)]
pub struct WindowDataset {
    pub class_names: Vec<String>,
    sequences: Vec<Arc<SequenceData>>,
    pub windows: Vec<WindowSample>,
    opts: DatasetOptions,
}

/// Number of windows a sequence of `total` frames yields.
pub fn window_count(total: usize, window: usize, stride: usize) -> usize {
    if total < window {
        0
    } else {
        (total - window) / stride + 1
    }
}

fn class_subdirs(root: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(root)
        .with_context(|| format!("reading class root {}", root.display()))?
    {
        let entry = entry?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

/// Pair each pose file with the object file at the same relative path.
/// Falls back to pairing singletons when the layouts do not mirror.
fn discover_sequences(
    pose_dir: &Path,
    obj_dir: Option<&Path>,
) -> Result<Vec<(PathBuf, Option<PathBuf>)>> {
    let pose_files = records::list_json_files_recursive(pose_dir)?;
    if pose_files.is_empty() {
        return Ok(Vec::new());
    }
    let Some(obj_dir) = obj_dir else {
        return Ok(pose_files.into_iter().map(|p| (p, None)).collect());
    };

    let mut pairs = Vec::new();
    for pose_file in &pose_files {
        let rel = pose_file.strip_prefix(pose_dir).unwrap_or(pose_file);
        let candidate = obj_dir.join(rel);
        if candidate.is_file() {
            pairs.push((pose_file.clone(), Some(candidate)));
        }
    }
    if pairs.is_empty() {
        let obj_files = records::list_json_files_recursive(obj_dir)?;
        if pose_files.len() == 1 && obj_files.len() == 1 {
            pairs.push((pose_files[0].clone(), Some(obj_files[0].clone())));
        }
    }
    Ok(pairs)
}

impl WindowDataset {
    /// Discover classes and sequences under the configured roots, slide
    /// windows over each sequence's aligned frame ids, and keep the windows
    /// that pass the active completeness policy. Zero windows overall is
    /// fatal, with a per-class diagnostic first.
    pub fn build(
        pose_root: &Path,
        obj_root: Option<&Path>,
        opts: DatasetOptions,
    ) -> Result<Self> {
        if !pose_root.is_dir() {
            bail!("pose_root not found: {}", pose_root.display());
        }
        let obj_root = if opts.use_objects {
            match obj_root {
                Some(dir) if dir.is_dir() => Some(dir),
                _ => bail!("use_objects is set but obj_root is missing or not a directory"),
            }
        } else {
            None
        };

        let mut class_names = class_subdirs(pose_root)?;
        if let Some(obj_root) = obj_root {
            let obj_classes = class_subdirs(obj_root)?;
            class_names.retain(|c| obj_classes.contains(c));
        }

        let mut sequences: Vec<Arc<SequenceData>> = Vec::new();
        let mut windows = Vec::new();
        let mut total_seqs = 0usize;

        for (label, class) in class_names.iter().enumerate() {
            let pose_dir = pose_root.join(class);
            let obj_dir = obj_root.map(|r| r.join(class));
            let seq_paths = discover_sequences(&pose_dir, obj_dir.as_deref())?;
            total_seqs += seq_paths.len();
            if seq_paths.is_empty() {
                warn!(
                    class,
                    pose_dir = %pose_dir.display(),
                    pose_files = records::list_json_files(&pose_dir).map(|f| f.len()).unwrap_or(0),
                    "no aligned sequences discovered for class"
                );
                continue;
            }

            for (pose_path, obj_path) in seq_paths {
                let poses = records::load_sequence(&pose_path, Some("pose"))?;
                let objects = match (&obj_path, opts.use_objects) {
                    (Some(path), true) => records::load_sequence(path, Some("object"))?,
                    _ => BTreeMap::new(),
                };

                let frames: Vec<i64> = if opts.use_objects {
                    poses.keys().filter(|fid| objects.contains_key(fid)).copied().collect()
                } else {
                    poses.keys().copied().collect()
                };
                if frames.len() < opts.window {
                    continue;
                }

                let seq_idx = sequences.len();
                sequences.push(Arc::new(SequenceData { poses, objects }));
                let seq = &sequences[seq_idx];

                let mut start = 0;
                while start + opts.window <= frames.len() {
                    let win = &frames[start..start + opts.window];
                    if Self::accept_window(seq, win, &opts) {
                        windows.push(WindowSample {
                            label,
                            seq: seq_idx,
                            frames: win.to_vec(),
                        });
                    }
                    start += opts.stride;
                }
            }
        }

        if windows.is_empty() {
            warn!(
                classes = ?class_names,
                discovered_sequences = total_seqs,
                window = opts.window,
                "no windows; check frame-id alignment between pose and object \
                 streams, whether window exceeds the sequence lengths, and the \
                 class directory nesting"
            );
            return Err(PipelineError::NoWindows.into());
        }

        let mut per_class = vec![0usize; class_names.len()];
        for w in &windows {
            per_class[w.label] += 1;
        }
        info!(classes = ?class_names, sequences = total_seqs, windows = ?per_class, "dataset ready");

        Ok(Self { class_names, sequences, windows, opts })
    }

    fn frame_is_full(seq: &SequenceData, fid: i64, opts: &DatasetOptions) -> bool {
        let Some(record) = seq.poses.get(&fid) else {
            return false;
        };
        let frame = extract::extract_pose(record);
        extract::has_full_skeleton(&frame, opts.full_kp_min, opts.bbox_required, KP_CONF_THRESHOLD)
    }

    fn accept_window(seq: &SequenceData, frames: &[i64], opts: &DatasetOptions) -> bool {
        if opts.require_full_all {
            frames.iter().all(|&fid| Self::frame_is_full(seq, fid, opts))
        } else if opts.require_full_first {
            Self::frame_is_full(seq, frames[0], opts)
        } else {
            true
        }
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn channel_count(&self) -> usize {
        self.opts.map.channel_count()
    }

    /// Flat tensor shape of one materialized window.
    pub fn sample_shape(&self) -> [usize; 4] {
        [self.opts.window, self.channel_count(), self.opts.map.grid_h, self.opts.map.grid_w]
    }

    /// Materialize one window into a flat (T, C, H, W) buffer plus its label.
    /// Extraction, optional Kalman smoothing, then per-frame rasterization.
    pub fn materialize(&self, idx: usize) -> (Vec<f32>, usize) {
        let sample = &self.windows[idx];
        let seq = &self.sequences[sample.seq];

        let mut parsed = Vec::with_capacity(sample.frames.len());
        for fid in &sample.frames {
            let frame = seq
                .poses
                .get(fid)
                .map(extract::extract_pose)
                .unwrap_or_else(|| extract::extract_pose(&Value::Null));
            let detections = if self.opts.use_objects {
                seq.objects.get(fid).map(|r| extract::extract_objects(r)).unwrap_or_default()
            } else {
                Vec::new()
            };
            parsed.push((frame, detections));
        }

        if self.opts.enable_kalman && !parsed.is_empty() {
            let tracks: Vec<Vec<Keypoint>> =
                parsed.iter().map(|(f, _)| f.keypoints.clone()).collect();
            let smoothed = kalman::smooth_window(&tracks, &self.opts.smoother);
            for ((frame, _), kps) in parsed.iter_mut().zip(smoothed) {
                frame.keypoints = kps;
            }
        }

        let [t, c, h, w] = self.sample_shape();
        let mut buffer = Vec::with_capacity(t * c * h * w);
        for (frame, detections) in &parsed {
            let map = rasterize_frame(
                frame.bbox,
                &frame.keypoints,
                detections,
                frame.image_w,
                frame.image_h,
                &self.opts.map,
            );
            buffer.extend(map.iter());
        }
        (buffer, sample.label)
    }

    /// Per-class window counts over a subset of indices.
    pub fn class_counts(&self, indices: &[usize]) -> Vec<usize> {
        let mut counts = vec![0usize; self.num_classes()];
        for &i in indices {
            counts[self.windows[i].label] += 1;
        }
        counts
    }
}

/// Inverse-frequency weights: drawing probability of class k is proportional
/// to total / count_k. Empty classes get weight as if they had one sample.
pub fn inverse_frequency_weights(counts: &[usize]) -> Vec<f64> {
    let total: usize = counts.iter().sum();
    let total = total.max(1) as f64;
    counts.iter().map(|&c| total / c.max(1) as f64).collect()
}

/// Draw an epoch's worth of training indices, with replacement, weighted by
/// inverse class frequency.
pub fn sample_epoch_indices(
    dataset: &WindowDataset,
    train_indices: &[usize],
    rng: &mut StdRng,
) -> Result<Vec<usize>> {
    let counts = dataset.class_counts(train_indices);
    let class_weights = inverse_frequency_weights(&counts);
    let weights: Vec<f64> = train_indices
        .iter()
        .map(|&i| class_weights[dataset.windows[i].label])
        .collect();
    let dist = WeightedIndex::new(&weights).context("building weighted sampler")?;
    Ok((0..train_indices.len())
        .map(|_| train_indices[dist.sample(rng)])
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::fs;

    fn write_sequence(
        dir: &Path,
        class: &str,
        name: &str,
        frames: usize,
        skip_first_bbox: bool,
    ) {
        let class_dir = dir.join(class);
        fs::create_dir_all(&class_dir).unwrap();
        let mut lines = Vec::new();
        for fid in 0..frames {
            let kps: Vec<Vec<f64>> =
                (0..17).map(|i| vec![100.0 + i as f64, 150.0 + i as f64, 0.9]).collect();
            let boxes = if skip_first_bbox && fid == 0 {
                serde_json::json!([])
            } else {
                serde_json::json!([[50.0, 50.0, 400.0, 440.0]])
            };
            lines.push(
                serde_json::json!({
                    "frame_id": fid,
                    "boxes": boxes,
                    "keypoints": [kps],
                })
                .to_string(),
            );
        }
        fs::write(class_dir.join(name), lines.join("\n")).unwrap();
    }

    fn write_object_sequence(dir: &Path, class: &str, name: &str, frames: usize) {
        let class_dir = dir.join(class);
        fs::create_dir_all(&class_dir).unwrap();
        let mut lines = Vec::new();
        for fid in 0..frames {
            lines.push(
                serde_json::json!({
                    "frame_id": fid,
                    "detections": [
                        {"class_name": "bed", "bbox": [10.0, 10.0, 200.0, 200.0]}
                    ],
                })
                .to_string(),
            );
        }
        fs::write(class_dir.join(name), lines.join("\n")).unwrap();
    }

    fn pose_only_opts() -> DatasetOptions {
        let mut cfg = TrainConfig::default();
        cfg.use_objects = false;
        cfg.enable_kalman = false;
        DatasetOptions::from_train_config(&cfg)
    }

    #[test]
    fn test_window_count_formula() {
        assert_eq!(window_count(100, 20, 5), 17);
        assert_eq!(window_count(19, 20, 5), 0);
        assert_eq!(window_count(20, 20, 5), 1);
        assert_eq!(window_count(25, 20, 5), 2);
    }

    #[test]
    fn test_sampler_matches_formula_end_to_end() {
        let dir = std::env::temp_dir().join(format!("fw-ds-{}", std::process::id()));
        let pose_root = dir.join("pose-a");
        write_sequence(&pose_root, "fall", "seq.jsonl", 25, false);
        let ds = WindowDataset::build(&pose_root, None, pose_only_opts()).unwrap();
        // 25 frames, window 20, stride 5: windows [0..19] and [5..24]
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.windows[0].frames[0], 0);
        assert_eq!(ds.windows[1].frames[0], 5);
        assert_eq!(ds.windows[1].frames[19], 24);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_first_bbox_rejects_all_windows() {
        let dir = std::env::temp_dir().join(format!("fw-ds-bbox-{}", std::process::id()));
        let pose_root = dir.join("pose");
        // 20 frames yield a single candidate window starting at frame 0,
        // which fails require_full_first because that frame has no bbox
        write_sequence(&pose_root, "fall", "seq.jsonl", 20, true);
        let err = WindowDataset::build(&pose_root, None, pose_only_opts()).unwrap_err();
        assert!(err.downcast_ref::<PipelineError>().is_some());
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_object_stream_intersection_gates_frames() {
        let dir = std::env::temp_dir().join(format!("fw-ds-obj-{}", std::process::id()));
        let pose_root = dir.join("pose");
        let obj_root = dir.join("obj");
        write_sequence(&pose_root, "fall", "seq.jsonl", 30, false);
        // object stream only covers the first 22 frames
        write_object_sequence(&obj_root, "fall", "seq.jsonl", 22);
        let mut cfg = TrainConfig::default();
        cfg.enable_kalman = false;
        let opts = DatasetOptions::from_train_config(&cfg);
        let ds = WindowDataset::build(&pose_root, Some(&obj_root), opts).unwrap();
        // 22 aligned frames -> exactly one window
        assert_eq!(ds.len(), 1);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_materialized_shape_and_label() {
        let dir = std::env::temp_dir().join(format!("fw-ds-mat-{}", std::process::id()));
        let pose_root = dir.join("pose");
        write_sequence(&pose_root, "fall", "a.jsonl", 20, false);
        write_sequence(&pose_root, "normal", "b.jsonl", 20, false);
        let ds = WindowDataset::build(&pose_root, None, pose_only_opts()).unwrap();
        assert_eq!(ds.class_names, vec!["fall", "normal"]);
        let [t, c, h, w] = ds.sample_shape();
        let (buf, label) = ds.materialize(0);
        assert_eq!(buf.len(), t * c * h * w);
        assert_eq!(label, 0);
        let (_, label1) = ds.materialize(1);
        assert_eq!(label1, 1);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_bone_line_flag_reaches_the_rasterizer() {
        let mut cfg = TrainConfig::default();
        cfg.include_bone_lines = false;
        let opts = DatasetOptions::from_train_config(&cfg);
        assert!(!opts.map.include_bone_lines);
        // 1 bbox + 1 distance + 17 keypoints + 2 object classes + 2 coords
        assert_eq!(opts.map.channel_count(), 23);
    }

    #[test]
    fn test_materialize_with_smoothing_enabled() {
        let dir = std::env::temp_dir().join(format!("fw-ds-kal-{}", std::process::id()));
        let pose_root = dir.join("pose");
        write_sequence(&pose_root, "fall", "a.jsonl", 20, false);
        let mut cfg = TrainConfig::default();
        cfg.use_objects = false;
        assert!(cfg.enable_kalman);
        let opts = DatasetOptions::from_train_config(&cfg);
        let ds = WindowDataset::build(&pose_root, None, opts).unwrap();
        let [t, c, h, w] = ds.sample_shape();
        let (buf, label) = ds.materialize(0);
        assert_eq!(buf.len(), t * c * h * w);
        assert_eq!(label, 0);
        assert!(buf.iter().all(|v| v.is_finite()));
        // static skeleton: the smoothed heatmaps still peak near confidence
        assert!(buf.iter().any(|v| *v > 0.5));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_inverse_frequency_weights() {
        let w = inverse_frequency_weights(&[90, 10]);
        assert!((w[0] - 100.0 / 90.0).abs() < 1e-9);
        assert!((w[1] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_sampling_rebalances() {
        let dir = std::env::temp_dir().join(format!("fw-ds-sam-{}", std::process::id()));
        let pose_root = dir.join("pose");
        write_sequence(&pose_root, "fall", "a.jsonl", 20, false);
        write_sequence(&pose_root, "normal", "b.jsonl", 120, false);
        let ds = WindowDataset::build(&pose_root, None, pose_only_opts()).unwrap();
        let all: Vec<usize> = (0..ds.len()).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let mut drawn = vec![0usize; 2];
        for _ in 0..200 {
            for &i in &sample_epoch_indices(&ds, &all, &mut rng).unwrap() {
                drawn[ds.windows[i].label] += 1;
            }
        }
        // minority class is drawn roughly as often as the majority
        let ratio = drawn[0] as f64 / drawn[1] as f64;
        assert!(ratio > 0.6 && ratio < 1.6, "ratio {ratio}");
        fs::remove_dir_all(&dir).ok();
    }
}
