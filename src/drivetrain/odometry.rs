// Pose estimation from module encoders and a gyro
//
// Wheel displacements give a robot-frame twist that is integrated on SE(2);
// the gyro pins the heading so wheel slip cannot accumulate into heading
// drift. When a sensor drops out the estimator keeps going on whatever is
// left instead of faulting.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::kinematics::{normalize_angle, ModulePosition, SwerveKinematics, Twist2d};
use super::module::ModuleSensors;
use crate::motor::Gyro;

/// Field-frame position (m) and heading (rad, in `[-PI, PI)`)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
}

impl Pose {
    pub fn new(x: f64, y: f64, heading: f64) -> Self {
        Self {
            x,
            y,
            heading: normalize_angle(heading),
        }
    }

    /// Apply a robot-frame twist along a constant-curvature arc
    pub fn exp(&self, twist: &Twist2d) -> Self {
        let (sin_t, cos_t) = twist.dtheta.sin_cos();
        // sin(θ)/θ and (1 - cos(θ))/θ, with their series near zero
        let (s, c) = if twist.dtheta.abs() < 1e-9 {
            (
                1.0 - twist.dtheta * twist.dtheta / 6.0,
                0.5 * twist.dtheta,
            )
        } else {
            (sin_t / twist.dtheta, (1.0 - cos_t) / twist.dtheta)
        };
        let dx = twist.dx * s - twist.dy * c;
        let dy = twist.dx * c + twist.dy * s;

        let (sin_h, cos_h) = self.heading.sin_cos();
        Self::new(
            self.x + dx * cos_h - dy * sin_h,
            self.y + dx * sin_h + dy * cos_h,
            self.heading + twist.dtheta,
        )
    }
}

/// Fuses module positions with gyro heading
#[derive(Debug, Clone)]
pub struct PoseEstimator {
    kinematics: Arc<SwerveKinematics>,
    /// 1.0 trusts the gyro completely, 0.0 ignores it
    gyro_weight: f64,
    pose: Pose,
    /// Last known reading per module, `None` until a module first reports
    last_positions: Option<Vec<Option<ModulePosition>>>,
    /// Maps raw gyro readings onto the field heading
    gyro_offset: Option<f64>,
    last_timestamp: Option<f64>,
}

impl PoseEstimator {
    pub fn new(kinematics: Arc<SwerveKinematics>, gyro_weight: f64, initial: Pose) -> Self {
        Self {
            kinematics,
            gyro_weight: gyro_weight.clamp(0.0, 1.0),
            pose: initial,
            last_positions: None,
            gyro_offset: None,
            last_timestamp: None,
        }
    }

    pub fn pose(&self) -> Pose {
        self.pose
    }

    /// Timestamp (s) of the last accepted sample
    pub fn last_update(&self) -> Option<f64> {
        self.last_timestamp
    }

    /// Overwrite the estimate, dropping all fusion history
    pub fn seed(&mut self, pose: Pose) {
        self.pose = pose;
        self.last_positions = None;
        self.gyro_offset = None;
    }

    /// Fold in one round of samples
    ///
    /// `positions` holds one entry per module; `None` marks a failed read and
    /// holds that module at its last known position. A `None` gyro reading
    /// falls back to wheel-derived heading. Samples that are not newer than
    /// the previous one are ignored.
    pub fn update(
        &mut self,
        positions: &[Option<ModulePosition>],
        gyro_heading: Option<f64>,
        timestamp: f64,
    ) -> Pose {
        if let Some(last) = self.last_timestamp {
            if timestamp <= last {
                debug!("Ignoring odometry sample at {:.4}s (last {:.4}s)", timestamp, last);
                return self.pose;
            }
        }
        self.last_timestamp = Some(timestamp);

        let Some(previous) = self.last_positions.take() else {
            // First sample after start or seed only establishes the baseline
            self.last_positions = Some(positions_for(positions, self.kinematics.module_count()));
            if let Some(gyro) = gyro_heading {
                self.gyro_offset = Some(self.pose.heading - gyro);
            }
            return self.pose;
        };

        let current = positions_for(positions, previous.len());
        let deltas: Vec<ModulePosition> = current
            .iter()
            .zip(&previous)
            .enumerate()
            .map(|(i, (now, before))| match (now, before) {
                (Some(now), Some(before)) => {
                    ModulePosition::new(now.distance - before.distance, now.angle)
                }
                // No baseline yet: this reading becomes the baseline
                (Some(now), None) => ModulePosition::new(0.0, now.angle),
                (None, before) => {
                    debug!("Module {} sample missing, holding last position", i);
                    ModulePosition::new(0.0, before.map_or(0.0, |p| p.angle))
                }
            })
            .collect();
        let mut twist = self.kinematics.to_twist(&deltas);

        if let Some(gyro) = gyro_heading {
            let offset = *self.gyro_offset.get_or_insert(self.pose.heading - gyro);
            let wheel_heading = self.pose.heading + twist.dtheta;
            let correction = normalize_angle(gyro + offset - wheel_heading);
            let heading = wheel_heading + self.gyro_weight * correction;
            twist.dtheta = normalize_angle(heading - self.pose.heading);
        }

        self.pose = self.pose.exp(&twist);
        self.last_positions = Some(
            current
                .into_iter()
                .zip(previous)
                .map(|(now, before)| now.or(before))
                .collect(),
        );
        self.pose
    }
}

/// One entry per module, padding a short sample with missing reads
fn positions_for(positions: &[Option<ModulePosition>], count: usize) -> Vec<Option<ModulePosition>> {
    (0..count)
        .map(|i| positions.get(i).copied().flatten())
        .collect()
}

/// Shared access to the estimator
///
/// Readers copy the pose out under the lock, so they always see a complete
/// update.
#[derive(Clone)]
pub struct PoseHandle {
    estimator: Arc<Mutex<PoseEstimator>>,
}

impl PoseHandle {
    pub fn new(estimator: PoseEstimator) -> Self {
        Self {
            estimator: Arc::new(Mutex::new(estimator)),
        }
    }

    pub fn pose(&self) -> Pose {
        self.estimator.lock().pose()
    }

    pub fn seed(&self, pose: Pose) {
        self.estimator.lock().seed(pose);
    }

    pub fn last_update(&self) -> Option<f64> {
        self.estimator.lock().last_update()
    }

    pub fn update(
        &self,
        positions: &[Option<ModulePosition>],
        gyro_heading: Option<f64>,
        timestamp: f64,
    ) -> Pose {
        self.estimator
            .lock()
            .update(positions, gyro_heading, timestamp)
    }
}

/// Samples module encoders and the gyro for the estimator
///
/// Runs on its own task, independent of the control loop.
pub struct OdometrySampler {
    sensors: Vec<ModuleSensors>,
    gyro: Arc<dyn Gyro>,
    pose: PoseHandle,
    start: Instant,
}

impl OdometrySampler {
    pub fn new(sensors: Vec<ModuleSensors>, gyro: Arc<dyn Gyro>, pose: PoseHandle) -> Self {
        Self {
            sensors,
            gyro,
            pose,
            start: Instant::now(),
        }
    }

    pub fn sample(&self) -> Pose {
        // Reads come first so the lock is not held across bus traffic
        let positions: Vec<Option<ModulePosition>> = self
            .sensors
            .iter()
            .map(|sensor| sensor.position().ok())
            .collect();
        let heading = self.gyro.heading();
        self.pose
            .update(&positions, heading, self.start.elapsed().as_secs_f64())
    }
}
