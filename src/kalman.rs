use nalgebra::{Matrix2, Matrix2x4, Matrix4, Vector2, Vector4};

use crate::extract::{Keypoint, NUM_KEYPOINTS};

/// Default process/measurement noise for joint tracks. Positions are trusted
/// more than velocities; the detector's pixel jitter dominates measurement
/// noise.
pub const VAR_POS: f32 = 1e-2;
pub const VAR_VEL: f32 = 1e-1;
pub const VAR_MEAS: f32 = 4.0;
const INITIAL_COVARIANCE: f32 = 10.0;

/// Discrete constant-velocity filter for a single 2D joint.
/// State is [x, y, vx, vy]; only position is observed.
pub struct Kalman2d {
    state: Vector4<f32>,
    covariance: Matrix4<f32>,
    transition: Matrix4<f32>,
    observation: Matrix2x4<f32>,
    process_noise: Matrix4<f32>,
    measurement_noise: Matrix2<f32>,
}

impl Kalman2d {
    pub fn new(x: f32, y: f32) -> Self {
        Self::with_noise(x, y, VAR_POS, VAR_VEL, VAR_MEAS)
    }

    pub fn with_noise(x: f32, y: f32, var_pos: f32, var_vel: f32, var_meas: f32) -> Self {
        let mut transition = Matrix4::identity();
        transition[(0, 2)] = 1.0;
        transition[(1, 3)] = 1.0;

        let mut observation = Matrix2x4::zeros();
        observation[(0, 0)] = 1.0;
        observation[(1, 1)] = 1.0;

        Self {
            state: Vector4::new(x, y, 0.0, 0.0),
            covariance: Matrix4::identity() * INITIAL_COVARIANCE,
            transition,
            observation,
            process_noise: Matrix4::from_diagonal(&Vector4::new(
                var_pos, var_pos, var_vel, var_vel,
            )),
            measurement_noise: Matrix2::identity() * var_meas,
        }
    }

    /// Advance one step: position moves by velocity, covariance grows by the
    /// process noise.
    pub fn predict(&mut self) {
        self.state = self.transition * self.state;
        self.covariance =
            self.transition * self.covariance * self.transition.transpose() + self.process_noise;
    }

    /// Fold in an [x, y] measurement. A numerically singular innovation
    /// covariance (degenerate noise config) skips the update and keeps the
    /// predicted state.
    pub fn update(&mut self, x: f32, y: f32) {
        let z = Vector2::new(x, y);
        let innovation = z - self.observation * self.state;
        let s = self.observation * self.covariance * self.observation.transpose()
            + self.measurement_noise;
        let Some(s_inv) = s.try_inverse() else {
            return;
        };
        let gain = self.covariance * self.observation.transpose() * s_inv;
        self.state += gain * innovation;
        self.covariance =
            (Matrix4::identity() - gain * self.observation) * self.covariance;
    }

    pub fn position(&self) -> (f32, f32) {
        (self.state[0], self.state[1])
    }

    pub fn velocity(&self) -> (f32, f32) {
        (self.state[2], self.state[3])
    }
}

/// How filter state is carried across a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmoothMode {
    /// Initialize from frame 0 and run sequentially to the end.
    FullWindow,
    /// Online variant approximating a system that re-anchors every
    /// `slide_step` frames after the first `half_len` frames. With
    /// `reset_at_slide` false the filters keep their state through the whole
    /// window (the shipped behavior); with it true they are rebuilt from the
    /// measurements at each slide boundary.
    HalfSlide {
        half_len: usize,
        slide_step: usize,
        reset_at_slide: bool,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct SmootherConfig {
    pub confidence_threshold: f32,
    pub require_full_first: bool,
    pub mode: SmoothMode,
}

impl Default for SmootherConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: crate::config::KP_CONF_THRESHOLD,
            require_full_first: true,
            mode: SmoothMode::FullWindow,
        }
    }
}

fn init_filters(first: &[Keypoint]) -> Vec<Kalman2d> {
    (0..NUM_KEYPOINTS)
        .map(|j| match first.get(j) {
            Some(kp) => Kalman2d::new(kp.x, kp.y),
            None => Kalman2d::new(0.0, 0.0),
        })
        .collect()
}

fn is_slide_boundary(t: usize, half_len: usize, slide_step: usize) -> bool {
    t >= half_len && slide_step > 0 && (t - half_len) % slide_step == 0
}

/// Smooth one window of 17-joint keypoint frames.
///
/// Each joint runs its own filter: predict every frame, update only when the
/// joint is present at or above the confidence threshold, so the filter
/// coasts through missing detections. If `require_full_first` is set and
/// frame 0 is not a complete skeleton, the input is returned unchanged and
/// the caller decides whether to keep the window.
///
/// Output confidence is copied from the frame's own measurement (0.0 where
/// the joint index does not exist).
pub fn smooth_window(frames: &[Vec<Keypoint>], cfg: &SmootherConfig) -> Vec<Vec<Keypoint>> {
    if frames.is_empty() {
        return Vec::new();
    }

    if cfg.require_full_first {
        let first_ok = frames[0]
            .iter()
            .filter(|kp| kp.is_valid(cfg.confidence_threshold))
            .count();
        if first_ok < NUM_KEYPOINTS {
            return frames.to_vec();
        }
    }

    let mut filters = init_filters(&frames[0]);
    let mut out = Vec::with_capacity(frames.len());

    for (t, frame) in frames.iter().enumerate() {
        if let SmoothMode::HalfSlide { half_len, slide_step, reset_at_slide: true } = cfg.mode {
            if t > 0 && is_slide_boundary(t, half_len, slide_step) {
                // Re-anchor joints that have a usable measurement here;
                // joints without one keep their coasting filter.
                for (j, kf) in filters.iter_mut().enumerate() {
                    if let Some(kp) = frame.get(j) {
                        if kp.is_valid(cfg.confidence_threshold) {
                            *kf = Kalman2d::new(kp.x, kp.y);
                        }
                    }
                }
            }
        }

        let mut smoothed = Vec::with_capacity(NUM_KEYPOINTS);
        for (j, kf) in filters.iter_mut().enumerate() {
            kf.predict();
            let measured = frame.get(j);
            if let Some(kp) = measured {
                if kp.is_valid(cfg.confidence_threshold) {
                    kf.update(kp.x, kp.y);
                }
            }
            let (x, y) = kf.position();
            let confidence = measured.map(|kp| kp.confidence).unwrap_or(0.0);
            smoothed.push(Keypoint::new(x, y, confidence));
        }
        out.push(smoothed);
    }

    out
}
