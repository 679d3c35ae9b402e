// Keyboard teleop: WASD move, Z/X rotate, R/F speed, G robot/field frame, Q quit
//
// Publishes a teleop request every poll so the runtime watchdog stays fed;
// releasing all keys decays to zero speeds after RELEASE_AFTER.

use std::time::{Duration, Instant};

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tracing::info;
use tracing_subscriber::EnvFilter;

use swerve_zenoh_runtime::config::{LOOP_HZ, TOPIC_CMD_DRIVE};
use swerve_zenoh_runtime::drivetrain::kinematics::ChassisSpeeds;
use swerve_zenoh_runtime::drivetrain::{DriveFrame, DriveRequest};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// (translation m/s, rotation deg/s, label) per speed level
const LEVELS: [(f64, f64, &str); 3] = [(0.5, 45.0, "LOW"), (1.5, 90.0, "MED"), (3.0, 180.0, "HIGH")];

/// Terminals repeat held keys; silence this long means the keys were released
const RELEASE_AFTER: Duration = Duration::from_millis(100);

#[derive(Debug, PartialEq)]
enum Input {
    Continue,
    Quit,
}

struct Pilot {
    level: usize,
    frame: DriveFrame,
    speeds: ChassisSpeeds,
    last_motion: Instant,
}

impl Pilot {
    fn new(now: Instant) -> Self {
        Self {
            level: 0,
            frame: DriveFrame::Robot,
            speeds: ChassisSpeeds::zero(),
            last_motion: now,
        }
    }

    fn press(&mut self, code: KeyCode, now: Instant) -> Input {
        let (linear, angular, _) = LEVELS[self.level];
        let angular = angular.to_radians();
        let speeds = &mut self.speeds;
        match code {
            KeyCode::Char('w') => speeds.vx = linear,
            KeyCode::Char('s') => speeds.vx = -linear,
            KeyCode::Char('a') => speeds.vy = linear,
            KeyCode::Char('d') => speeds.vy = -linear,
            KeyCode::Char('z') => speeds.omega = angular,
            KeyCode::Char('x') => speeds.omega = -angular,
            _ => return self.command(code),
        }
        self.last_motion = now;
        Input::Continue
    }

    fn command(&mut self, code: KeyCode) -> Input {
        match code {
            KeyCode::Char('r') => self.shift(1),
            KeyCode::Char('f') => self.shift(-1),
            KeyCode::Char('g') => {
                self.frame = match self.frame {
                    DriveFrame::Robot => DriveFrame::Field,
                    DriveFrame::Field => DriveFrame::Robot,
                };
                info!("Frame: {:?}", self.frame);
            }
            KeyCode::Char('q') | KeyCode::Esc => return Input::Quit,
            _ => {}
        }
        Input::Continue
    }

    fn shift(&mut self, by: isize) {
        self.level = self.level.saturating_add_signed(by).min(LEVELS.len() - 1);
        info!("Speed: {}", LEVELS[self.level].2);
    }

    fn request(&mut self, now: Instant) -> DriveRequest {
        if now.duration_since(self.last_motion) > RELEASE_AFTER {
            self.speeds = ChassisSpeeds::zero();
        }
        DriveRequest::Teleop {
            speeds: self.speeds,
            frame: self.frame,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_DRIVE).await?;

    info!("Controls: WASD=move, Z/X=rotate, R/F=speed, G=frame, Q=quit");
    info!("Speed: {}, frame: robot", LEVELS[0].2);

    enable_raw_mode()?;
    let result = drive(&publisher).await;
    disable_raw_mode()?;

    // Leave the base stopped rather than waiting for the watchdog
    publisher
        .put(serde_json::to_string(&DriveRequest::Idle)?)
        .await?;
    result
}

async fn drive(publisher: &zenoh::pubsub::Publisher<'_>) -> Result<(), BoxError> {
    let poll = Duration::from_millis(1000 / LOOP_HZ);
    let mut pilot = Pilot::new(Instant::now());

    loop {
        if event::poll(poll)? {
            if let Event::Key(KeyEvent { code, kind, .. }) = event::read()? {
                let held = matches!(kind, KeyEventKind::Press | KeyEventKind::Repeat);
                if held && pilot.press(code, Instant::now()) == Input::Quit {
                    return Ok(());
                }
            }
        }
        let request = pilot.request(Instant::now());
        publisher.put(serde_json::to_string(&request)?).await?;
    }
}
