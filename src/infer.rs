use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::{InferConfig, CNN_OUT, LSTM_LAYERS};
use crate::error::PipelineError;
use crate::extract;
use crate::model::{FallNet, FallNetConfig};
use crate::records;
use crate::relation_map::{rasterize_frame, RelationMapConfig};
use crate::train::{sibling, CheckpointMeta};
use crate::NdBackend;

/// Classification of one window of the input stream, with the full softmax
/// distribution in training class order.
#[derive(Debug, Clone, Serialize)]
pub struct WindowPrediction {
    pub start_frame: i64,
    pub end_frame: i64,
    pub predicted_class: String,
    pub predicted_index: usize,
    pub probabilities: Vec<f32>,
}

/// Strip the recorder's `.bin` extension and the `_model` suffix so that
/// `best`, `best.bin` and `ckpt_ep003_f10.8123_model.bin` all resolve to the
/// stem the sidecar files hang off.
fn checkpoint_stem(path: &Path) -> PathBuf {
    let mut stem = path.to_path_buf();
    if stem.extension().is_some_and(|e| e == "bin") {
        stem.set_extension("");
    }
    if let Some(name) = stem.file_name().and_then(|n| n.to_str()) {
        if let Some(trimmed) = name.strip_suffix("_model") {
            let trimmed = trimmed.to_owned();
            stem.set_file_name(trimmed);
        }
    }
    stem
}

fn read_meta(stem: &Path) -> Option<CheckpointMeta> {
    let path = sibling(stem, "_meta.json");
    let contents = fs::read_to_string(&path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(meta) => Some(meta),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint metadata");
            None
        }
    }
}

/// A class list file is either a JSON string array or one name per line.
fn parse_class_list(contents: &str) -> Vec<String> {
    if let Ok(names) = serde_json::from_str::<Vec<String>>(contents) {
        return names;
    }
    contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// The ordered class list is the label contract: checkpoint metadata first,
/// then a `classes.json` next to the checkpoint, then an explicit file.
fn resolve_class_names(
    stem: &Path,
    meta: Option<&CheckpointMeta>,
    explicit: Option<&Path>,
) -> Result<Vec<String>> {
    if let Some(meta) = meta {
        if !meta.class_names.is_empty() {
            return Ok(meta.class_names.clone());
        }
    }
    let sidecar = stem.parent().unwrap_or(Path::new(".")).join("classes.json");
    if sidecar.is_file() {
        let contents = fs::read_to_string(&sidecar)
            .with_context(|| format!("reading {}", sidecar.display()))?;
        let names: Vec<String> = serde_json::from_str(&contents)
            .with_context(|| format!("parsing {}", sidecar.display()))?;
        if !names.is_empty() {
            return Ok(names);
        }
    }
    if let Some(path) = explicit {
        let contents =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let names = parse_class_list(&contents);
        if !names.is_empty() {
            return Ok(names);
        }
    }
    Err(PipelineError::MissingClassNames.into())
}

/// Run the classifier over a recorded stream: load the checkpoint and its
/// class list, slide windows over the aligned frame ids, and emit one
/// prediction per window. Kalman smoothing is a training-time concern and is
/// not applied here.
pub fn run(cfg: &InferConfig) -> Result<Vec<WindowPrediction>> {
    let mut load_path = cfg.model_path.clone();
    if load_path.extension().is_some_and(|e| e == "bin") {
        load_path.set_extension("");
    }
    let stem = checkpoint_stem(&cfg.model_path);
    let meta = read_meta(&stem);
    let class_names = resolve_class_names(&stem, meta.as_ref(), cfg.classes_path.as_deref())?;

    let mut map = RelationMapConfig {
        grid_h: cfg.grid_h,
        grid_w: cfg.grid_w,
        include_bone_lines: cfg.include_bone_lines,
        ..Default::default()
    };
    map.set_object_classes(&cfg.object_classes);

    let model_cfg = match meta {
        Some(meta) => {
            let expected = meta.model.in_channels;
            let actual = map.channel_count();
            if expected != actual {
                return Err(PipelineError::ChannelMismatch { expected, actual }.into());
            }
            meta.model
        }
        None => {
            warn!(
                model = %cfg.model_path.display(),
                "no checkpoint metadata found, rebuilding the model from the inference config"
            );
            FallNetConfig::new(map.channel_count(), class_names.len(), cfg.temporal_pool)
                .with_cnn_out(CNN_OUT)
                .with_lstm_hidden(cfg.lstm_hidden)
                .with_lstm_layers(LSTM_LAYERS)
                .with_bidirectional(cfg.bidirectional)
                .with_dropout(cfg.dropout)
        }
    };

    let device = <NdBackend as Backend>::Device::default();
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let record = recorder.load(load_path, &device).map_err(|e| {
        warn!(model = %cfg.model_path.display(), error = %e, "checkpoint record rejected");
        PipelineError::UnsupportedCheckpoint { path: cfg.model_path.clone() }
    })?;
    let model: FallNet<NdBackend> = model_cfg.init(&device).load_record(record);

    let poses = records::load_sequence(&cfg.pose_json, Some("pose"))?;
    let objects = match &cfg.object_json {
        Some(path) => Some(records::load_sequence(path, Some("object"))?),
        None => None,
    };
    let frames: Vec<i64> = match &objects {
        Some(objects) => poses.keys().filter(|f| objects.contains_key(f)).copied().collect(),
        None => poses.keys().copied().collect(),
    };

    if frames.len() < cfg.window {
        warn!(
            frames = frames.len(),
            window = cfg.window,
            "stream shorter than one window, nothing to classify"
        );
        return Ok(Vec::new());
    }

    let [c, h, w] = [map.channel_count(), map.grid_h, map.grid_w];
    let mut predictions = Vec::new();
    let mut start = 0usize;
    while start + cfg.window <= frames.len() {
        let ids = &frames[start..start + cfg.window];
        let mut buf: Vec<f32> = Vec::with_capacity(cfg.window * c * h * w);
        for fid in ids {
            let frame = poses
                .get(fid)
                .map(extract::extract_pose)
                .unwrap_or_else(|| extract::extract_pose(&Value::Null));
            let detections = objects
                .as_ref()
                .and_then(|o| o.get(fid))
                .map(|r| extract::extract_objects(r))
                .unwrap_or_default();
            let raster = rasterize_frame(
                frame.bbox,
                &frame.keypoints,
                &detections,
                frame.image_w,
                frame.image_h,
                &map,
            );
            buf.extend(raster.iter());
        }

        let x = Tensor::<NdBackend, 1>::from_floats(buf.as_slice(), &device)
            .reshape([1, cfg.window, c, h, w]);
        let probs: Tensor<NdBackend, 1> =
            softmax(model.forward(x), 1).reshape([class_names.len()]);
        let probabilities = probs
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow!("reading probabilities: {e:?}"))?;
        let (predicted_index, confidence) = probabilities
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, p)| (i, *p))
            .unwrap_or((0, 0.0));
        let predicted_class = class_names[predicted_index].clone();

        info!(
            start_frame = ids[0],
            end_frame = ids[cfg.window - 1],
            class = %predicted_class,
            confidence,
            "window classified"
        );
        predictions.push(WindowPrediction {
            start_frame: ids[0],
            end_frame: ids[cfg.window - 1],
            predicted_class,
            predicted_index,
            probabilities,
        });
        start += cfg.stride.max(1);
    }

    if let Some(out) = &cfg.out_csv {
        write_csv(out, &class_names, &predictions)?;
        info!(out = %out.display(), windows = predictions.len(), "predictions written");
    }
    Ok(predictions)
}

/// One row per window; probability columns are named after the classes.
pub fn write_csv(path: &Path, class_names: &[String], preds: &[WindowPrediction]) -> Result<()> {
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    let mut header = vec![
        "start_frame".to_string(),
        "end_frame".to_string(),
        "pred".to_string(),
        "pred_idx".to_string(),
    ];
    header.extend(class_names.iter().map(|c| format!("p_{c}")));
    writer.write_record(&header)?;
    for p in preds {
        let mut row = vec![
            p.start_frame.to_string(),
            p.end_frame.to_string(),
            p.predicted_class.clone(),
            p.predicted_index.to_string(),
        ];
        row.extend(p.probabilities.iter().map(|v| format!("{v:.6}")));
        writer.write_record(&row)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TemporalPool;

    #[test]
    fn test_checkpoint_stem_normalization() {
        assert_eq!(checkpoint_stem(Path::new("m/best")), PathBuf::from("m/best"));
        assert_eq!(checkpoint_stem(Path::new("m/best.bin")), PathBuf::from("m/best"));
        assert_eq!(
            checkpoint_stem(Path::new("m/ckpt_ep003_f10.8123_model.bin")),
            PathBuf::from("m/ckpt_ep003_f10.8123")
        );
        // a dotted score without the recorder extension is left alone
        assert_eq!(
            checkpoint_stem(Path::new("m/ckpt_ep003_f10.8123")),
            PathBuf::from("m/ckpt_ep003_f10.8123")
        );
    }

    #[test]
    fn test_parse_class_list_formats() {
        assert_eq!(parse_class_list(r#"["fall","normal"]"#), vec!["fall", "normal"]);
        assert_eq!(parse_class_list("fall\n\n normal \n"), vec!["fall", "normal"]);
    }

    #[test]
    fn test_resolve_class_names_prefers_meta() {
        let dir = std::env::temp_dir().join(format!("fw-cls-meta-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let stem = dir.join("best");
        let meta = CheckpointMeta {
            epoch: 3,
            score: 0.9,
            created_at: String::new(),
            class_names: vec!["fall".into(), "normal".into()],
            model: FallNetConfig::new(33, 2, TemporalPool::Attn),
        };
        fs::write(dir.join("classes.json"), r#"["wrong"]"#).unwrap();
        let names = resolve_class_names(&stem, Some(&meta), None).unwrap();
        assert_eq!(names, vec!["fall", "normal"]);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_resolve_class_names_falls_back_to_sidecar_then_file() {
        let dir = std::env::temp_dir().join(format!("fw-cls-side-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let stem = dir.join("best");
        fs::write(dir.join("classes.json"), r#"["fall","normal"]"#).unwrap();
        assert_eq!(
            resolve_class_names(&stem, None, None).unwrap(),
            vec!["fall", "normal"]
        );
        fs::remove_file(dir.join("classes.json")).unwrap();
        let explicit = dir.join("names.txt");
        fs::write(&explicit, "fall\nnormal\n").unwrap();
        assert_eq!(
            resolve_class_names(&stem, None, Some(&explicit)).unwrap(),
            vec!["fall", "normal"]
        );
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_resolve_class_names_missing_everywhere() {
        let dir = std::env::temp_dir().join(format!("fw-cls-none-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let err = resolve_class_names(&dir.join("best"), None, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::MissingClassNames)
        ));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_channel_mismatch_detected_before_loading() {
        let dir = std::env::temp_dir().join(format!("fw-chmm-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let meta = CheckpointMeta {
            epoch: 1,
            score: 0.5,
            created_at: String::new(),
            class_names: vec!["fall".into(), "normal".into()],
            model: FallNetConfig::new(99, 2, TemporalPool::Attn),
        };
        fs::write(dir.join("best_meta.json"), serde_json::to_string_pretty(&meta).unwrap())
            .unwrap();
        let cfg = InferConfig { model_path: dir.join("best"), ..Default::default() };
        // default layout: 1 bbox + 1 distance + 17 keypoints + 12 bones
        // + 2 object classes + 2 coords = 35
        let err = run(&cfg).unwrap_err();
        match err.downcast_ref::<PipelineError>() {
            Some(PipelineError::ChannelMismatch { expected, actual }) => {
                assert_eq!(*expected, 99);
                assert_eq!(*actual, 35);
            }
            other => panic!("expected a channel mismatch, got {other:?}"),
        }
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_csv_layout() {
        let dir = std::env::temp_dir().join(format!("fw-csv-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let out = dir.join("preds.csv");
        let preds = vec![WindowPrediction {
            start_frame: 0,
            end_frame: 19,
            predicted_class: "fall".into(),
            predicted_index: 0,
            probabilities: vec![0.75, 0.25],
        }];
        write_csv(&out, &["fall".to_string(), "normal".to_string()], &preds).unwrap();
        let contents = fs::read_to_string(&out).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "start_frame,end_frame,pred,pred_idx,p_fall,p_normal"
        );
        assert_eq!(lines.next().unwrap(), "0,19,fall,0,0.750000,0.250000");
        fs::remove_dir_all(&dir).ok();
    }
}
