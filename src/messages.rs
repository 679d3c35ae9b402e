// Message types published by the runtime
//
// Incoming commands on `swerve/cmd/drive` are `DriveRequest` JSON, e.g.
// {"type": "teleop", "speeds": {"vx": 0.5, "vy": 0.0, "omega": 0.0}, "frame": "field"}

use serde::{Deserialize, Serialize};

use crate::drivetrain::ControlStatus;
use crate::drivetrain::kinematics::ChassisSpeeds;
use crate::drivetrain::odometry::Pose;

// Fused pose estimate runtime -> consumers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseReport {
    pub x: f64,
    pub y: f64,
    pub heading: f64,
    /// Seconds since odometry started, of the newest sample folded in
    pub stamp: Option<f64>,
}

impl PoseReport {
    pub fn new(pose: Pose, stamp: Option<f64>) -> Self {
        Self {
            x: pose.x,
            y: pose.y,
            heading: pose.heading,
            stamp,
        }
    }
}

// Measured robot-relative velocity runtime -> consumers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SpeedsReport {
    pub vx: f64,
    pub vy: f64,
    pub omega: f64,
}

impl From<ChassisSpeeds> for SpeedsReport {
    fn from(speeds: ChassisSpeeds) -> Self {
        Self {
            vx: speeds.vx,
            vy: speeds.vy,
            omega: speeds.omega,
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    /// A sysid routine has the motors
    Diagnostics,
}

impl From<ControlStatus> for RuntimeHealth {
    fn from(status: ControlStatus) -> Self {
        match status {
            ControlStatus::Active | ControlStatus::Idle => RuntimeHealth::Ok,
            ControlStatus::Stale => RuntimeHealth::CmdStale,
            ControlStatus::Diagnostics => RuntimeHealth::Diagnostics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_json() {
        let json = serde_json::to_string(&RuntimeHealth::from(ControlStatus::Stale)).unwrap();
        assert_eq!(json, "\"cmd_stale\"");
        assert_eq!(
            RuntimeHealth::from(ControlStatus::Idle),
            RuntimeHealth::Ok
        );
    }

    #[test]
    fn test_pose_report_fields() {
        let report = PoseReport::new(Pose::new(1.0, -2.0, 0.25), Some(3.5));
        let value = serde_json::to_value(report).unwrap();
        assert_eq!(value["x"], 1.0);
        assert_eq!(value["heading"], 0.25);
        assert_eq!(value["stamp"], 3.5);
    }
}
