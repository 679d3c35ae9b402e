// Swerve kinematics for an N-module base
// Converts chassis velocities (vx, vy, omega) to per-module speed/angle targets and back.

use std::f64::consts::{FRAC_PI_2, PI, TAU};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Module speeds below this (m/s) carry no meaningful direction
pub const MIN_MODULE_SPEED: f64 = 1e-6;

/// Singular values below this are treated as zero when inverting the geometry
const RANK_EPSILON: f64 = 1e-9;

/// Normalize an angle to `[-PI, PI)`
pub fn normalize_angle(angle: f64) -> f64 {
    (angle + PI).rem_euclid(TAU) - PI
}

/// A point on the robot, relative to its centre (meters, +x forward, +y left)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Translation2d {
    pub x: f64,
    pub y: f64,
}

impl Translation2d {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn norm(&self) -> f64 {
        self.x.hypot(self.y)
    }
}

/// Chassis velocity: vx, vy in m/s, omega in rad/s (counter-clockwise positive)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChassisSpeeds {
    pub vx: f64,
    pub vy: f64,
    pub omega: f64,
}

impl ChassisSpeeds {
    pub const fn new(vx: f64, vy: f64, omega: f64) -> Self {
        Self { vx, vy, omega }
    }

    pub const fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Rotate a field-frame request into the robot frame, given the robot heading
    pub fn to_robot_relative(&self, heading: f64) -> Self {
        let (sin, cos) = heading.sin_cos();
        Self {
            vx: self.vx * cos + self.vy * sin,
            vy: -self.vx * sin + self.vy * cos,
            omega: self.omega,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.vx.is_finite() && self.vy.is_finite() && self.omega.is_finite()
    }
}

/// Target (or measured) velocity of one module
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModuleState {
    /// Wheel surface speed (m/s), signed
    pub speed: f64,
    /// Azimuth in `[-PI, PI)`
    pub angle: f64,
}

impl ModuleState {
    pub fn new(speed: f64, angle: f64) -> Self {
        Self {
            speed,
            angle: normalize_angle(angle),
        }
    }

    /// Pick the equivalent state that needs the least azimuth travel from `current`
    ///
    /// When the target is more than 90° away, turning to the opposite angle and
    /// reversing the wheel produces the same wheel motion.
    pub fn optimize(self, current: f64) -> Self {
        let delta = normalize_angle(self.angle - current);
        if delta.abs() > FRAC_PI_2 {
            Self::new(-self.speed, self.angle + PI)
        } else {
            self
        }
    }
}

/// Integrated wheel travel of one module, consumed by odometry
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ModulePosition {
    /// Wheel distance travelled (m), signed
    pub distance: f64,
    /// Azimuth (rad)
    pub angle: f64,
}

impl ModulePosition {
    pub fn new(distance: f64, angle: f64) -> Self {
        Self { distance, angle }
    }
}

/// Robot-frame displacement over one odometry step
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Twist2d {
    pub dx: f64,
    pub dy: f64,
    pub dtheta: f64,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GeometryError {
    #[error("Swerve drive needs at least 2 modules, got {count}")]
    TooFewModules { count: usize },

    #[error("Module {index} has a non-finite position")]
    NonFinitePosition { index: usize },

    #[error("Module positions are degenerate (kinematics matrix rank {rank}, need 3)")]
    Degenerate { rank: usize },

    #[error("Invalid {name}: {value} (must be positive)")]
    NonPositive { name: &'static str, value: f64 },
}

/// Fixed physical layout of the drivetrain
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleGeometry {
    positions: Vec<Translation2d>,
    wheel_radius: f64,
    drive_gear_ratio: f64,
    steer_gear_ratio: f64,
}

impl ModuleGeometry {
    pub fn new(
        positions: Vec<Translation2d>,
        wheel_radius: f64,
        drive_gear_ratio: f64,
        steer_gear_ratio: f64,
    ) -> Result<Self, GeometryError> {
        for (name, value) in [
            ("wheel radius", wheel_radius),
            ("drive gear ratio", drive_gear_ratio),
            ("steer gear ratio", steer_gear_ratio),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(GeometryError::NonPositive { name, value });
            }
        }

        if positions.len() < 2 {
            return Err(GeometryError::TooFewModules {
                count: positions.len(),
            });
        }
        if let Some(index) = positions
            .iter()
            .position(|p| !(p.x.is_finite() && p.y.is_finite()))
        {
            return Err(GeometryError::NonFinitePosition { index });
        }

        // Any two distinct positions pin down rotation; all-coincident ones do not
        let first = positions[0];
        if positions.iter().all(|p| *p == first) {
            return Err(GeometryError::Degenerate { rank: 2 });
        }

        Ok(Self {
            positions,
            wheel_radius,
            drive_gear_ratio,
            steer_gear_ratio,
        })
    }

    pub fn positions(&self) -> &[Translation2d] {
        &self.positions
    }

    pub fn wheel_radius(&self) -> f64 {
        self.wheel_radius
    }

    pub fn drive_gear_ratio(&self) -> f64 {
        self.drive_gear_ratio
    }

    pub fn steer_gear_ratio(&self) -> f64 {
        self.steer_gear_ratio
    }

    /// Distance from centre to the furthest module
    pub fn drive_base_radius(&self) -> f64 {
        self.positions
            .iter()
            .map(Translation2d::norm)
            .fold(0.0, f64::max)
    }
}

/// Inverse and forward kinematics for a fixed module geometry
///
/// The inverse matrix maps `[vx, vy, omega]` to stacked module velocity
/// components `[vx_0, vy_0, vx_1, vy_1, ...]`; forward kinematics is its
/// least-squares pseudo-inverse.
#[derive(Debug, Clone)]
pub struct SwerveKinematics {
    geometry: ModuleGeometry,
    inverse: DMatrix<f64>,
    forward: DMatrix<f64>,
}

impl SwerveKinematics {
    pub fn new(geometry: ModuleGeometry) -> Result<Self, GeometryError> {
        let positions = geometry.positions();
        let inverse = DMatrix::from_fn(positions.len() * 2, 3, |row, col| {
            let p = positions[row / 2];
            match (row % 2, col) {
                (0, 0) => 1.0,
                (0, 1) => 0.0,
                (0, _) => -p.y,
                (_, 0) => 0.0,
                (_, 1) => 1.0,
                (_, _) => p.x,
            }
        });

        let rank = inverse.rank(RANK_EPSILON);
        if rank < 3 {
            return Err(GeometryError::Degenerate { rank });
        }
        let forward = inverse
            .clone()
            .pseudo_inverse(RANK_EPSILON)
            .map_err(|_| GeometryError::Degenerate { rank })?;

        Ok(Self {
            geometry,
            inverse,
            forward,
        })
    }

    pub fn geometry(&self) -> &ModuleGeometry {
        &self.geometry
    }

    pub fn module_count(&self) -> usize {
        self.geometry.positions.len()
    }

    /// Inverse kinematics: chassis velocity to one state per module
    ///
    /// Modules with (near) zero speed report angle 0; the module controller
    /// keeps its current azimuth in that case.
    pub fn to_module_states(&self, speeds: &ChassisSpeeds) -> Vec<ModuleState> {
        let chassis = DVector::from_column_slice(&[speeds.vx, speeds.vy, speeds.omega]);
        let components = &self.inverse * chassis;

        (0..self.module_count())
            .map(|i| {
                let vx = components[2 * i];
                let vy = components[2 * i + 1];
                let speed = vx.hypot(vy);
                if speed < MIN_MODULE_SPEED {
                    ModuleState::new(0.0, 0.0)
                } else {
                    ModuleState::new(speed, vy.atan2(vx))
                }
            })
            .collect()
    }

    /// Forward kinematics: measured module states to chassis velocity
    pub fn to_chassis_speeds(&self, states: &[ModuleState]) -> ChassisSpeeds {
        let [vx, vy, omega] =
            self.solve_forward(states.iter().map(|s| (s.speed, s.angle)));
        ChassisSpeeds::new(vx, vy, omega)
    }

    /// Forward kinematics over wheel displacements rather than velocities
    pub fn to_twist(&self, deltas: &[ModulePosition]) -> Twist2d {
        let [dx, dy, dtheta] =
            self.solve_forward(deltas.iter().map(|d| (d.distance, d.angle)));
        Twist2d { dx, dy, dtheta }
    }

    // Missing trailing modules contribute zero motion
    fn solve_forward(&self, polar: impl Iterator<Item = (f64, f64)>) -> [f64; 3] {
        let mut components = DVector::zeros(self.module_count() * 2);
        for (i, (magnitude, angle)) in polar.take(self.module_count()).enumerate() {
            let (sin, cos) = angle.sin_cos();
            components[2 * i] = magnitude * cos;
            components[2 * i + 1] = magnitude * sin;
        }
        let chassis = &self.forward * components;
        [chassis[0], chassis[1], chassis[2]]
    }
}

/// Uniformly scale module speeds so that none exceeds `max_speed`
///
/// All speeds share one scale factor, which preserves the direction and
/// rotation of the commanded motion.
pub fn desaturate(states: &mut [ModuleState], max_speed: f64) {
    let peak = states.iter().map(|s| s.speed.abs()).fold(0.0, f64::max);
    if peak > max_speed && peak > 0.0 {
        let scale = max_speed / peak;
        for state in states.iter_mut() {
            state.speed *= scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn square(half: f64) -> SwerveKinematics {
        let geometry = ModuleGeometry::new(
            vec![
                Translation2d::new(half, half),
                Translation2d::new(half, -half),
                Translation2d::new(-half, half),
                Translation2d::new(-half, -half),
            ],
            0.05,
            6.75,
            1.0,
        )
        .unwrap();
        SwerveKinematics::new(geometry).unwrap()
    }

    fn assert_close(a: f64, b: f64, what: &str) {
        assert!((a - b).abs() < 1e-6, "{}: {} != {}", what, a, b);
    }

    #[test]
    fn test_normalize_angle() {
        assert_close(normalize_angle(0.0), 0.0, "zero");
        assert_close(normalize_angle(PI), -PI, "pi wraps to -pi");
        assert_close(normalize_angle(-PI), -PI, "-pi stays");
        assert_close(normalize_angle(3.0 * PI / 2.0), -PI / 2.0, "3pi/2");
        assert_close(normalize_angle(-5.0 * PI / 2.0), -PI / 2.0, "-5pi/2");
    }

    #[test]
    fn test_pure_translation_all_modules_match() {
        let kinematics = square(0.3);
        let states = kinematics.to_module_states(&ChassisSpeeds::new(1.0, 0.0, 0.0));
        assert_eq!(states.len(), 4);
        for state in states {
            assert_close(state.speed, 1.0, "speed");
            assert_close(state.angle, 0.0, "angle");
        }
    }

    #[test]
    fn test_pure_rotation_is_perpendicular_to_radius() {
        let kinematics = square(0.3);
        let states = kinematics.to_module_states(&ChassisSpeeds::new(0.0, 0.0, 2.0));

        // Front-left module sits at (0.3, 0.3)
        let front_left = states[0];
        let radius = Translation2d::new(0.3, 0.3).norm();
        assert_close(front_left.speed, 2.0 * radius, "speed");
        assert_close(front_left.angle, 0.3f64.atan2(-0.3), "angle");

        for state in &states {
            assert_close(state.speed, 2.0 * radius, "all modules equidistant");
        }
    }

    #[test]
    fn test_round_trip() {
        let kinematics = square(0.3);
        let requests = [
            ChassisSpeeds::new(1.0, 0.0, 0.0),
            ChassisSpeeds::new(0.0, -0.7, 0.0),
            ChassisSpeeds::new(0.4, 0.9, 1.3),
            ChassisSpeeds::new(-1.2, 0.3, -2.5),
        ];
        for request in requests {
            let states = kinematics.to_module_states(&request);
            let back = kinematics.to_chassis_speeds(&states);
            println!("{:?} -> {:?}", request, back);
            assert_close(back.vx, request.vx, "vx");
            assert_close(back.vy, request.vy, "vy");
            assert_close(back.omega, request.omega, "omega");
        }
    }

    #[test]
    fn test_round_trip_asymmetric_three_modules() {
        let geometry = ModuleGeometry::new(
            vec![
                Translation2d::new(0.4, 0.0),
                Translation2d::new(-0.2, 0.25),
                Translation2d::new(-0.1, -0.3),
            ],
            0.05,
            5.0,
            1.0,
        )
        .unwrap();
        let kinematics = SwerveKinematics::new(geometry).unwrap();
        let request = ChassisSpeeds::new(0.8, -0.4, 1.1);
        let back = kinematics.to_chassis_speeds(&kinematics.to_module_states(&request));
        assert_close(back.vx, request.vx, "vx");
        assert_close(back.vy, request.vy, "vy");
        assert_close(back.omega, request.omega, "omega");
    }

    #[test]
    fn test_desaturate_preserves_ratios() {
        let kinematics = square(0.3);
        let max_speed = 2.0;
        let request = ChassisSpeeds::new(3.0, 1.0, 4.0);

        let mut scaled = kinematics.to_module_states(&request);
        desaturate(&mut scaled, max_speed);

        // The same request shrunk to exactly the feasible magnitude
        let raw = kinematics.to_module_states(&request);
        let peak = raw.iter().map(|s| s.speed).fold(0.0, f64::max);
        let shrink = max_speed / peak;
        let feasible = kinematics.to_module_states(&ChassisSpeeds::new(
            request.vx * shrink,
            request.vy * shrink,
            request.omega * shrink,
        ));

        let peak_scaled = scaled.iter().map(|s| s.speed.abs()).fold(0.0, f64::max);
        assert_close(peak_scaled, max_speed, "peak");
        for (a, b) in scaled.iter().zip(&feasible) {
            assert_close(a.speed, b.speed, "speed");
            assert_close(a.angle, b.angle, "angle");
        }
        for i in 1..scaled.len() {
            assert_close(
                scaled[i].speed / scaled[0].speed,
                feasible[i].speed / feasible[0].speed,
                "ratio",
            );
        }
    }

    #[test]
    fn test_desaturate_leaves_feasible_request_alone() {
        let mut states = vec![ModuleState::new(1.0, 0.2), ModuleState::new(-1.5, 1.0)];
        let before = states.clone();
        desaturate(&mut states, 2.0);
        assert_eq!(states, before);
    }

    #[test]
    fn test_optimize_flips_when_beyond_quarter_turn() {
        let target = ModuleState::new(1.0, 3.0 * PI / 4.0);
        let optimized = target.optimize(0.0);
        assert_close(optimized.speed, -1.0, "speed");
        assert_close(optimized.angle, -PI / 4.0, "angle");

        // Same wheel motion vector either way
        let (sin_a, cos_a) = target.angle.sin_cos();
        let (sin_b, cos_b) = optimized.angle.sin_cos();
        assert_close(target.speed * cos_a, optimized.speed * cos_b, "x motion");
        assert_close(target.speed * sin_a, optimized.speed * sin_b, "y motion");
    }

    #[test]
    fn test_optimize_keeps_nearby_target() {
        let target = ModuleState::new(1.0, 0.5);
        assert_eq!(target.optimize(0.0), target);
        // Wrap-around: -170° is only 20° away from 170°
        let wrapped = ModuleState::new(1.0, -170f64.to_radians());
        assert_eq!(wrapped.optimize(170f64.to_radians()), wrapped);
    }

    #[test]
    fn test_zero_request_gives_zero_states() {
        let kinematics = square(0.3);
        for state in kinematics.to_module_states(&ChassisSpeeds::zero()) {
            assert_eq!(state.speed, 0.0);
        }
    }

    #[test]
    fn test_field_relative_rotation() {
        // Facing +y on the field, a field +x request is a robot -y request
        let robot = ChassisSpeeds::new(1.0, 0.0, 0.5).to_robot_relative(PI / 2.0);
        assert_close(robot.vx, 0.0, "vx");
        assert_close(robot.vy, -1.0, "vy");
        assert_close(robot.omega, 0.5, "omega");
    }

    #[test]
    fn test_twist_from_displacements() {
        let kinematics = square(0.3);
        let deltas = vec![ModulePosition::new(0.1, 0.0); 4];
        let twist = kinematics.to_twist(&deltas);
        assert_close(twist.dx, 0.1, "dx");
        assert_close(twist.dy, 0.0, "dy");
        assert!(twist.dtheta.abs() < EPS);
    }

    #[test]
    fn test_degenerate_geometry_rejected() {
        let coincident = ModuleGeometry::new(
            vec![Translation2d::new(0.1, 0.1); 3],
            0.05,
            6.75,
            1.0,
        );
        assert_eq!(coincident, Err(GeometryError::Degenerate { rank: 2 }));

        let single = ModuleGeometry::new(vec![Translation2d::new(0.1, 0.1)], 0.05, 6.75, 1.0);
        assert_eq!(single, Err(GeometryError::TooFewModules { count: 1 }));

        let bad_radius = ModuleGeometry::new(
            vec![Translation2d::new(0.1, 0.1), Translation2d::new(-0.1, 0.1)],
            0.0,
            6.75,
            1.0,
        );
        assert!(matches!(bad_radius, Err(GeometryError::NonPositive { .. })));

        let nan = ModuleGeometry::new(
            vec![Translation2d::new(0.1, 0.1), Translation2d::new(f64::NAN, 0.1)],
            0.05,
            6.75,
            1.0,
        );
        assert_eq!(nan, Err(GeometryError::NonFinitePosition { index: 1 }));
    }

    #[test]
    fn test_two_distinct_modules_are_enough() {
        let geometry = ModuleGeometry::new(
            vec![Translation2d::new(0.2, 0.0), Translation2d::new(-0.2, 0.0)],
            0.05,
            6.75,
            1.0,
        )
        .unwrap();
        assert!(SwerveKinematics::new(geometry).is_ok());
    }
}
