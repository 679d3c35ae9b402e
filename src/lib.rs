pub mod config;
pub mod drivetrain;
pub mod messages;
pub mod motor;
pub mod runtime;
