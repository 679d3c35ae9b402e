// Autonomous interface and recorded chassis-speed replay
//
// Trajectory followers talk to the drivetrain only through `HolonomicTarget`.
// Replayed speeds take the same path as teleop: a request on the handle,
// consumed by the next control cycle.

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::interval;
use tracing::info;

use super::kinematics::ChassisSpeeds;
use super::odometry::{Pose, PoseHandle};
use super::{DriveRequest, Drivetrain, RequestHandle};

/// What a holonomic trajectory follower needs from a drivetrain
pub trait HolonomicTarget {
    fn pose(&self) -> Pose;

    fn reset_pose(&self, pose: Pose);

    /// Measured robot-relative velocity
    fn chassis_speeds(&self) -> ChassisSpeeds;

    /// Command robot-relative velocity
    fn drive(&self, speeds: ChassisSpeeds);
}

/// The drivetrain as seen from an autonomous task
pub struct AutoInterface {
    pose: PoseHandle,
    speeds: watch::Receiver<ChassisSpeeds>,
    requests: RequestHandle,
}

impl AutoInterface {
    /// Takes over the request handle: while replaying, nothing else drives
    pub fn new(drivetrain: &Drivetrain, requests: RequestHandle) -> Self {
        Self {
            pose: drivetrain.pose_handle(),
            speeds: drivetrain.subscribe_speeds(),
            requests,
        }
    }

    /// Give the request handle back once autonomous driving is over
    pub fn into_requests(self) -> RequestHandle {
        self.requests
    }
}

impl HolonomicTarget for AutoInterface {
    fn pose(&self) -> Pose {
        self.pose.pose()
    }

    fn reset_pose(&self, pose: Pose) {
        self.pose.seed(pose);
    }

    fn chassis_speeds(&self) -> ChassisSpeeds {
        *self.speeds.borrow()
    }

    fn drive(&self, speeds: ChassisSpeeds) {
        self.requests
            .set_control(DriveRequest::AutoChassisSpeeds { speeds });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("Failed to read recording: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse recording: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid recording: {0}")]
    Invalid(String),
}

/// Chassis speeds to hold from `t` seconds into the recording
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimedSpeeds {
    pub t: f64,
    pub speeds: ChassisSpeeds,
}

/// A recorded autonomous run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Recording {
    /// Pose the robot is seeded to before replay starts
    #[serde(default)]
    pub start: Option<Pose>,
    pub samples: Vec<TimedSpeeds>,
}

impl Recording {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let text = std::fs::read_to_string(path)?;
        let recording: Self = serde_json::from_str(&text)?;
        recording.validate()?;
        Ok(recording)
    }

    pub fn validate(&self) -> Result<(), ReplayError> {
        let mut last = 0.0;
        for (i, sample) in self.samples.iter().enumerate() {
            if !sample.t.is_finite() || sample.t < last {
                return Err(ReplayError::Invalid(format!(
                    "sample {} at t={} is out of order",
                    i, sample.t
                )));
            }
            if !sample.speeds.is_finite() {
                return Err(ReplayError::Invalid(format!(
                    "sample {} has non-finite speeds",
                    i
                )));
            }
            last = sample.t;
        }
        Ok(())
    }

    /// Length of the run in seconds
    pub fn duration(&self) -> f64 {
        self.samples.last().map_or(0.0, |s| s.t)
    }

    /// Speeds held at `t`, `None` once the recording is over
    ///
    /// The final sample only marks the end; whatever it holds is not driven.
    pub fn speeds_at(&self, t: f64) -> Option<ChassisSpeeds> {
        if t >= self.duration() {
            return None;
        }
        let held = self.samples.partition_point(|s| s.t <= t);
        Some(match held {
            0 => ChassisSpeeds::zero(),
            n => self.samples[n - 1].speeds,
        })
    }
}

/// Feed a recording to `target` every `period`, then stop it
pub async fn replay<T>(recording: &Recording, target: &T, period: Duration)
where
    T: HolonomicTarget + ?Sized,
{
    if let Some(start) = recording.start {
        target.reset_pose(start);
    }
    info!(
        "Replaying {} samples over {:.2}s",
        recording.samples.len(),
        recording.duration()
    );

    let mut tick = interval(period);
    let started = Instant::now();
    loop {
        tick.tick().await;
        match recording.speeds_at(started.elapsed().as_secs_f64()) {
            Some(speeds) => target.drive(speeds),
            None => break,
        }
    }
    target.drive(ChassisSpeeds::zero());

    let end = target.pose();
    info!(
        "Replay finished at ({:.3}, {:.3}, {:.3})",
        end.x, end.y, end.heading
    );
}
