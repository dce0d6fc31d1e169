use ndarray::{Array2, Array3};

use crate::config::{KP_CONF_THRESHOLD, SIGMA_KP};
use crate::extract::{Keypoint, ObjectDetection, NUM_KEYPOINTS};

/// COCO 17-keypoint skeleton topology (12 edges, head joints excluded).
pub const COCO_EDGES: [(usize, usize); 12] = [
    (5, 6),
    (5, 7),
    (7, 9),
    (6, 8),
    (8, 10),
    (5, 11),
    (6, 12),
    (11, 12),
    (11, 13),
    (13, 15),
    (12, 14),
    (14, 16),
];

/// Fixes the channel layout of the rasterized frame:
/// bbox mask, distance transform, 17 keypoint heatmaps, optional 12 bone-line
/// channels, one channel per object class, two coordinate channels. The
/// resulting channel count must match the classifier's input channel count.
#[derive(Debug, Clone)]
pub struct RelationMapConfig {
    pub grid_h: usize,
    pub grid_w: usize,
    pub sigma_kp: f32,
    pub kp_confidence_threshold: f32,
    pub include_bone_lines: bool,
    pub object_classes: Vec<String>,
}

impl Default for RelationMapConfig {
    fn default() -> Self {
        Self {
            grid_h: 64,
            grid_w: 64,
            sigma_kp: SIGMA_KP,
            kp_confidence_threshold: KP_CONF_THRESHOLD,
            include_bone_lines: true,
            object_classes: Vec::new(),
        }
    }
}

impl RelationMapConfig {
    /// Normalize the class list: trimmed, empties dropped, first occurrence
    /// wins so the channel order is stable.
    pub fn set_object_classes<I, S>(&mut self, classes: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = Vec::new();
        for class in classes {
            let name = class.as_ref().trim();
            if !name.is_empty() && !seen.iter().any(|s| s == name) {
                seen.push(name.to_string());
            }
        }
        self.object_classes = seen;
    }

    pub fn channel_count(&self) -> usize {
        let edges = if self.include_bone_lines { COCO_EDGES.len() } else { 0 };
        1 + 1 + NUM_KEYPOINTS + edges + self.object_classes.len() + 2
    }
}

/// Map an image coordinate into the grid: scale, then clip to [0, dim-1].
fn scale_clip(coord: f32, img_dim: f32, grid_dim: usize) -> usize {
    let scaled = (coord / img_dim.max(1.0)) * grid_dim as f32;
    (scaled.max(0.0) as usize).min(grid_dim - 1)
}

fn scale_bbox(bbox: [f32; 4], img_w: f32, img_h: f32, h: usize, w: usize) -> [usize; 4] {
    [
        scale_clip(bbox[0], img_w, w),
        scale_clip(bbox[1], img_h, h),
        scale_clip(bbox[2], img_w, w),
        scale_clip(bbox[3], img_h, h),
    ]
}

fn fill_rect(channel: &mut ndarray::ArrayViewMut2<f32>, rect: [usize; 4]) {
    let [x1, y1, x2, y2] = rect;
    if x2 < x1 || y2 < y1 {
        return;
    }
    for y in y1..=y2 {
        for x in x1..=x2 {
            channel[(y, x)] = 1.0;
        }
    }
}

/// Additive isotropic Gaussian of magnitude `mag` centered at (x, y) in grid
/// coordinates.
fn draw_gaussian(channel: &mut ndarray::ArrayViewMut2<f32>, x: f32, y: f32, sigma: f32, mag: f32) {
    let denom = 2.0 * sigma * sigma;
    for (py, mut row) in channel.outer_iter_mut().enumerate() {
        let dy = py as f32 - y;
        for (px, cell) in row.iter_mut().enumerate() {
            let dx = px as f32 - x;
            *cell += (-(dx * dx + dy * dy) / denom).exp() * mag;
        }
    }
}

/// 1-pixel Bresenham line set to 1.0.
fn draw_line(channel: &mut ndarray::ArrayViewMut2<f32>, p0: (usize, usize), p1: (usize, usize)) {
    let (mut x0, mut y0) = (p0.0 as i64, p0.1 as i64);
    let (x1, y1) = (p1.0 as i64, p1.1 as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        channel[(y0 as usize, x0 as usize)] = 1.0;
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Two-pass chamfer approximation of the Euclidean distance transform:
/// distance of every cell to the nearest nonzero cell of `mask`, normalized
/// to [0, 1] by its own maximum. An empty mask yields all zeros.
fn distance_transform(mask: &ndarray::ArrayView2<f32>) -> Array2<f32> {
    let (h, w) = mask.dim();
    const FAR: f32 = f32::MAX / 4.0;
    const DIAG: f32 = std::f32::consts::SQRT_2;
    let mut dist = Array2::from_elem((h, w), FAR);
    let mut seeded = false;
    for ((y, x), &v) in mask.indexed_iter() {
        if v > 0.0 {
            dist[(y, x)] = 0.0;
            seeded = true;
        }
    }
    if !seeded {
        return Array2::zeros((h, w));
    }

    for y in 0..h {
        for x in 0..w {
            let mut d = dist[(y, x)];
            if x > 0 {
                d = d.min(dist[(y, x - 1)] + 1.0);
            }
            if y > 0 {
                d = d.min(dist[(y - 1, x)] + 1.0);
                if x > 0 {
                    d = d.min(dist[(y - 1, x - 1)] + DIAG);
                }
                if x + 1 < w {
                    d = d.min(dist[(y - 1, x + 1)] + DIAG);
                }
            }
            dist[(y, x)] = d;
        }
    }
    for y in (0..h).rev() {
        for x in (0..w).rev() {
            let mut d = dist[(y, x)];
            if x + 1 < w {
                d = d.min(dist[(y, x + 1)] + 1.0);
            }
            if y + 1 < h {
                d = d.min(dist[(y + 1, x)] + 1.0);
                if x + 1 < w {
                    d = d.min(dist[(y + 1, x + 1)] + DIAG);
                }
                if x > 0 {
                    d = d.min(dist[(y + 1, x - 1)] + DIAG);
                }
            }
            dist[(y, x)] = d;
        }
    }

    let max = dist.iter().cloned().fold(0.0f32, f32::max);
    if max > 0.0 {
        dist.mapv_inplace(|d| d / max);
    }
    dist
}

/// Render one frame into a (C, H, W) canvas with the fixed channel order.
pub fn rasterize_frame(
    bbox: Option<[f32; 4]>,
    keypoints: &[Keypoint],
    objects: &[ObjectDetection],
    img_w: f32,
    img_h: f32,
    cfg: &RelationMapConfig,
) -> Array3<f32> {
    let (h, w) = (cfg.grid_h, cfg.grid_w);
    let c = cfg.channel_count();
    let img_w = img_w.max(1.0);
    let img_h = img_h.max(1.0);
    let mut canvas = Array3::<f32>::zeros((c, h, w));
    let mut ch = 0;

    // 1) person bbox mask
    if let Some(bbox) = bbox {
        fill_rect(&mut canvas.index_axis_mut(ndarray::Axis(0), ch), scale_bbox(bbox, img_w, img_h, h, w));
    }
    ch += 1;

    // 2) distance to the subject silhouette
    let dist = distance_transform(&canvas.index_axis(ndarray::Axis(0), 0));
    canvas.index_axis_mut(ndarray::Axis(0), ch).assign(&dist);
    ch += 1;

    // 3) keypoint heatmaps, magnitude = confidence
    for (i, kp) in keypoints.iter().take(NUM_KEYPOINTS).enumerate() {
        if kp.confidence < cfg.kp_confidence_threshold || !kp.x.is_finite() || !kp.y.is_finite() {
            continue;
        }
        let gx = (kp.x / img_w) * w as f32;
        let gy = (kp.y / img_h) * h as f32;
        draw_gaussian(
            &mut canvas.index_axis_mut(ndarray::Axis(0), ch + i),
            gx,
            gy,
            cfg.sigma_kp,
            kp.confidence,
        );
    }
    ch += NUM_KEYPOINTS;

    // 4) bone lines, one edge per channel, both endpoints above threshold
    if cfg.include_bone_lines {
        if keypoints.len() >= NUM_KEYPOINTS {
            for (e_idx, &(a, b)) in COCO_EDGES.iter().enumerate() {
                let (ka, kb) = (&keypoints[a], &keypoints[b]);
                if ka.confidence.min(kb.confidence) < cfg.kp_confidence_threshold {
                    continue;
                }
                if !(ka.x.is_finite() && ka.y.is_finite() && kb.x.is_finite() && kb.y.is_finite()) {
                    continue;
                }
                let pa = (scale_clip(ka.x, img_w, w), scale_clip(ka.y, img_h, h));
                let pb = (scale_clip(kb.x, img_w, w), scale_clip(kb.y, img_h, h));
                draw_line(&mut canvas.index_axis_mut(ndarray::Axis(0), ch + e_idx), pa, pb);
            }
        }
        ch += COCO_EDGES.len();
    }

    // 5) object channels, one filled bbox per detection of a configured class
    for det in objects {
        let Some(idx) = cfg.object_classes.iter().position(|c| *c == det.class_name) else {
            continue;
        };
        fill_rect(
            &mut canvas.index_axis_mut(ndarray::Axis(0), ch + idx),
            scale_bbox(det.bbox, img_w, img_h, h, w),
        );
    }
    ch += cfg.object_classes.len();

    // 6) normalized coordinate grids in [-1, 1]
    {
        let mut xv = canvas.index_axis_mut(ndarray::Axis(0), ch);
        for (px, mut col) in xv.axis_iter_mut(ndarray::Axis(1)).enumerate() {
            let v = if w > 1 { -1.0 + 2.0 * px as f32 / (w - 1) as f32 } else { -1.0 };
            col.fill(v);
        }
        let mut yv = canvas.index_axis_mut(ndarray::Axis(0), ch + 1);
        for (py, mut row) in yv.outer_iter_mut().enumerate() {
            let v = if h > 1 { -1.0 + 2.0 * py as f32 / (h - 1) as f32 } else { -1.0 };
            row.fill(v);
        }
    }
    ch += 2;

    // A mismatch here means training and inference were configured with
    // different channel layouts; never tolerate it silently.
    assert_eq!(ch, c, "relation map channel cursor diverged from configured layout");
    canvas
}
