use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use burn::module::{AutodiffModule, Module};
use burn::grad_clipping::GradientClippingConfig;
use burn::optim::{AdamWConfig, GradientsParams, Optimizer};
use burn::record::{BinFileRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{
    LossKind, TrainConfig, CNN_OUT, EARLY_STOP_PATIENCE, FOCAL_GAMMA, GRAD_CLIP, LSTM_LAYERS,
    SAVE_TOP_K, VAL_RATIO, WEIGHT_DECAY,
};
use crate::dataset::{self, DatasetOptions, WindowDataset};
use crate::model::{FallNet, FallNetConfig};
use crate::{NdBackend, TrainBackend};

/// Sidecar JSON written next to every checkpoint record. Carries everything
/// needed to rebuild the network and name its outputs at load time.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub score: f64,
    pub created_at: String,
    pub class_names: Vec<String>,
    pub model: FallNetConfig,
}

/// `stem` plus a suffix glued onto the file name, in the same directory.
pub fn sibling(stem: &Path, suffix: &str) -> PathBuf {
    let mut name = stem
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    stem.with_file_name(name)
}

/// Multi-class focal loss over raw logits. `gamma == 0` with no alpha is
/// plain cross-entropy; alpha applies a per-class weight gathered by target.
pub fn focal_loss<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    alpha: Option<Tensor<B, 1>>,
    gamma: f64,
) -> Tensor<B, 1> {
    let [b, _] = logits.dims();
    let log_probs = log_softmax(logits, 1);
    let logpt: Tensor<B, 1> = log_probs
        .gather(1, targets.clone().reshape([b, 1]))
        .reshape([b]);
    let mut loss = logpt.clone().neg();
    if gamma > 0.0 {
        let pt = logpt.exp();
        loss = loss * pt.neg().add_scalar(1.0).powf_scalar(gamma as f32);
    }
    if let Some(alpha) = alpha {
        loss = loss * alpha.gather(0, targets);
    }
    loss.mean()
}

/// Materialize a batch of windows into a (B, T, C, H, W) tensor plus labels.
pub fn make_batch<B: Backend>(
    dataset: &WindowDataset,
    indices: &[usize],
    device: &B::Device,
) -> (Tensor<B, 5>, Tensor<B, 1, Int>) {
    let [t, c, h, w] = dataset.sample_shape();
    let mut flat = Vec::with_capacity(indices.len() * t * c * h * w);
    let mut labels = Vec::with_capacity(indices.len());
    for &i in indices {
        let (buf, label) = dataset.materialize(i);
        flat.extend(buf);
        labels.push(label as i32);
    }
    let x = Tensor::<B, 1>::from_floats(flat.as_slice(), device)
        .reshape([indices.len(), t, c, h, w]);
    let y = Tensor::<B, 1, Int>::from_ints(labels.as_slice(), device);
    (x, y)
}

/// Shuffled train/validation split. Validation gets `val_ratio` of the
/// samples, rounded, but never the whole set.
pub fn split_indices(n: usize, val_ratio: f64, rng: &mut StdRng) -> (Vec<usize>, Vec<usize>) {
    let mut idx: Vec<usize> = (0..n).collect();
    idx.shuffle(rng);
    let val_len = ((n as f64 * val_ratio).round() as usize)
        .min(n.saturating_sub(1))
        .max(usize::from(n > 1));
    let val = idx.split_off(n - val_len);
    (idx, val)
}

/// Macro-averaged F1 from a row=truth, column=prediction confusion matrix.
/// Classes with no true or predicted samples contribute zero.
pub fn macro_f1(confusion: &[Vec<usize>]) -> f64 {
    let k = confusion.len();
    if k == 0 {
        return 0.0;
    }
    let mut sum = 0.0;
    for i in 0..k {
        let tp = confusion[i][i] as f64;
        let false_neg = confusion[i].iter().sum::<usize>() as f64 - tp;
        let false_pos = (0..k).map(|r| confusion[r][i]).sum::<usize>() as f64 - tp;
        let denom = 2.0 * tp + false_pos + false_neg;
        if denom > 0.0 {
            sum += 2.0 * tp / denom;
        }
    }
    sum / k as f64
}

pub struct EvalReport {
    pub accuracy: f64,
    pub macro_f1: f64,
    pub confusion: Vec<Vec<usize>>,
}

/// Run the model over a subset of the dataset and tally the confusion matrix.
pub fn evaluate<B: Backend>(
    model: &FallNet<B>,
    dataset: &WindowDataset,
    indices: &[usize],
    batch_size: usize,
    device: &B::Device,
) -> Result<EvalReport> {
    let k = dataset.num_classes();
    let mut confusion = vec![vec![0usize; k]; k];
    for chunk in indices.chunks(batch_size.max(1)) {
        let (x, targets) = make_batch::<B>(dataset, chunk, device);
        let preds: Tensor<B, 1, Int> = model.forward(x).argmax(1).reshape([chunk.len()]);
        let preds = preds
            .into_data()
            .to_vec::<i64>()
            .map_err(|e| anyhow!("reading predictions: {e:?}"))?;
        let truth = targets
            .into_data()
            .to_vec::<i64>()
            .map_err(|e| anyhow!("reading targets: {e:?}"))?;
        for (p, t) in preds.iter().zip(&truth) {
            confusion[*t as usize][*p as usize] += 1;
        }
    }
    let correct: usize = (0..k).map(|i| confusion[i][i]).sum();
    let accuracy = if indices.is_empty() {
        0.0
    } else {
        correct as f64 / indices.len() as f64
    };
    Ok(EvalReport { accuracy, macro_f1: macro_f1(&confusion), confusion })
}

/// Keeps the best `keep` per-epoch checkpoints on disk, deleting the files of
/// everything that falls off the list. The `best` pointer files live outside
/// the ledger and are never touched.
pub struct CheckpointLedger {
    keep: usize,
    entries: Vec<(f64, PathBuf)>,
}

impl CheckpointLedger {
    pub fn new(keep: usize) -> Self {
        Self { keep: keep.max(1), entries: Vec::new() }
    }

    pub fn admit(&mut self, score: f64, stem: PathBuf) {
        self.entries.push((score, stem));
        self.entries
            .sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        while self.entries.len() > self.keep {
            let (_, stem) = self.entries.pop().unwrap_or_default();
            for suffix in ["_model.bin", "_optim.bin", "_meta.json"] {
                fs::remove_file(sibling(&stem, suffix)).ok();
            }
        }
    }

    pub fn kept(&self) -> impl Iterator<Item = &Path> {
        self.entries.iter().map(|(_, p)| p.as_path())
    }
}

fn model_config(cfg: &TrainConfig, in_channels: usize, num_classes: usize) -> FallNetConfig {
    FallNetConfig::new(in_channels, num_classes, cfg.temporal_pool)
        .with_cnn_out(CNN_OUT)
        .with_lstm_hidden(cfg.lstm_hidden)
        .with_lstm_layers(LSTM_LAYERS)
        .with_bidirectional(cfg.bidirectional)
        .with_dropout(cfg.dropout)
}

/// Full training run: dataset build, seeded split, epoch loop with weighted
/// sampling and focal loss, per-epoch top-K checkpointing, best-pointer
/// tracking, early stopping, and a final report from the reloaded best model.
pub fn train(cfg: &TrainConfig) -> Result<()> {
    fs::create_dir_all(&cfg.out_dir)
        .map_err(|e| anyhow!("creating {}: {e}", cfg.out_dir.display()))?;

    let opts = DatasetOptions::from_train_config(cfg);
    let data = WindowDataset::build(&cfg.pose_root, cfg.obj_root.as_deref(), opts)?;
    if data.num_classes() < 2 {
        bail!("need at least two classes, found {:?}", data.class_names);
    }

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let (train_idx, val_idx) = split_indices(data.len(), VAL_RATIO, &mut rng);
    if train_idx.is_empty() || val_idx.is_empty() {
        bail!("dataset too small to split: {} windows", data.len());
    }
    let counts = data.class_counts(&train_idx);
    info!(
        train = train_idx.len(),
        val = val_idx.len(),
        counts = ?counts,
        channels = data.channel_count(),
        "split ready"
    );

    let device = <NdBackend as Backend>::Device::default();
    let model_cfg = model_config(cfg, data.channel_count(), data.num_classes());
    let mut model: FallNet<TrainBackend> = model_cfg.init(&device);
    let mut optim = AdamWConfig::new()
        .with_weight_decay(WEIGHT_DECAY)
        .with_grad_clipping(Some(GradientClippingConfig::Norm(GRAD_CLIP)))
        .init::<TrainBackend, FallNet<TrainBackend>>();

    let weights = dataset::inverse_frequency_weights(&counts);
    let sum: f64 = weights.iter().sum();
    let alpha_values: Vec<f32> = weights.iter().map(|w| (w / sum) as f32).collect();
    let alpha: Option<Tensor<TrainBackend, 1>> =
        Some(Tensor::from_floats(alpha_values.as_slice(), &device));
    let gamma = match cfg.loss {
        LossKind::Focal => FOCAL_GAMMA,
        LossKind::Ce => 0.0,
    };

    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    let mut ledger = CheckpointLedger::new(SAVE_TOP_K);
    let mut best_score = f64::NEG_INFINITY;
    let mut best_epoch = 0usize;
    let mut stall = 0usize;

    for epoch in 1..=cfg.epochs {
        let order = if cfg.use_sampler {
            dataset::sample_epoch_indices(&data, &train_idx, &mut rng)?
        } else {
            let mut order = train_idx.clone();
            order.shuffle(&mut rng);
            order
        };

        let mut loss_sum = 0.0f64;
        let mut batches = 0usize;
        for chunk in order.chunks(cfg.batch_size.max(1)) {
            let (x, targets) = make_batch::<TrainBackend>(&data, chunk, &device);
            let logits = model.forward(x);
            let loss = focal_loss(logits, targets, alpha.clone(), gamma);
            loss_sum += loss.clone().into_scalar() as f64;
            batches += 1;
            let grads = GradientsParams::from_grads(loss.backward(), &model);
            model = optim.step(cfg.learning_rate, model, grads);
        }

        let report = evaluate(&model.valid(), &data, &val_idx, cfg.batch_size, &device)?;
        let score = report.macro_f1;
        info!(
            epoch,
            loss = loss_sum / batches.max(1) as f64,
            accuracy = report.accuracy,
            macro_f1 = score,
            "epoch finished"
        );

        let stem = cfg.out_dir.join(format!("ckpt_ep{epoch:03}_f1{score:.4}"));
        recorder
            .record(model.clone().into_record(), sibling(&stem, "_model"))
            .map_err(|e| anyhow!("saving checkpoint {}: {e}", stem.display()))?;
        recorder
            .record(optim.to_record(), sibling(&stem, "_optim"))
            .map_err(|e| anyhow!("saving optimizer state {}: {e}", stem.display()))?;
        let meta = CheckpointMeta {
            epoch,
            score,
            created_at: Utc::now().to_rfc3339(),
            class_names: data.class_names.clone(),
            model: model_config(cfg, data.channel_count(), data.num_classes()),
        };
        fs::write(sibling(&stem, "_meta.json"), serde_json::to_string_pretty(&meta)?)?;
        ledger.admit(score, stem);

        if score > best_score {
            best_score = score;
            best_epoch = epoch;
            stall = 0;
            let best = cfg.out_dir.join("best");
            recorder
                .record(model.clone().into_record(), best.clone())
                .map_err(|e| anyhow!("saving best model {}: {e}", best.display()))?;
            fs::write(
                cfg.out_dir.join("best_meta.json"),
                serde_json::to_string_pretty(&meta)?,
            )?;
            fs::write(
                cfg.out_dir.join("classes.json"),
                serde_json::to_string_pretty(&data.class_names)?,
            )?;
        } else {
            stall += 1;
            if stall >= EARLY_STOP_PATIENCE {
                info!(epoch, best_epoch, "no improvement, stopping early");
                break;
            }
        }
    }

    // Reload the best checkpoint and report validation numbers from it, not
    // from whatever state the last epoch left behind.
    let best = cfg.out_dir.join("best");
    let record = recorder
        .load(best.clone().into(), &device)
        .map_err(|e| anyhow!("reloading best model {}: {e}", best.display()))?;
    let final_model: FallNet<NdBackend> = model_config(cfg, data.channel_count(), data.num_classes())
        .init(&device)
        .load_record(record);
    let report = evaluate(&final_model, &data, &val_idx, cfg.batch_size, &device)?;
    info!(
        best_epoch,
        macro_f1 = best_score,
        accuracy = report.accuracy,
        "final validation"
    );
    for (i, name) in data.class_names.iter().enumerate() {
        let tp = report.confusion[i][i] as f64;
        let support: usize = report.confusion[i].iter().sum();
        let predicted: usize = (0..data.class_names.len()).map(|r| report.confusion[r][i]).sum();
        let recall = if support > 0 { tp / support as f64 } else { 0.0 };
        let precision = if predicted > 0 { tp / predicted as f64 } else { 0.0 };
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        info!(
            class = %name,
            precision,
            recall,
            f1,
            support,
            row = ?report.confusion[i],
            "class report"
        );
    }
    Ok(())
}
