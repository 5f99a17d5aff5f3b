//! Motor devices on the shared controller bus.
//!
//! Each physical axis is a [`MotorDevice`]: a channel address, a [`MotorModel`]
//! and a handle to the shared [`MotorProtocol`]. The protocol sits behind a
//! `tokio::sync::Mutex`, so commands from different axes are serialized and
//! only one is ever in flight on the bus.
//!
//! [`MotorSet`] builds the chamber's fixed assignment:
//!
//! | Axis                  | Port | Model |
//! |-----------------------|------|-------|
//! | Stand rotation        | 1    | B4836 |
//! | Stand translation     | 2    | B4836 |
//! | Test polarization     | 3    | B5990 |
//! | Chamber polarization  | 4    | B4836 |

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info};

use super::protocol::{MotorCommand, MotorProtocol, Port};
use super::steps::{to_steps, MotorModel, MAX_STEPS};
use crate::config::MotorTuning;
use crate::error::{AppResult, ChamberError};

/// Accepted speed range in steps per second.
pub const SPEED_RANGE: RangeInclusive<u32> = 1..=6000;

/// Accepted acceleration setting range.
pub const ACCELERATION_RANGE: RangeInclusive<u32> = 1..=127;

/// Protocol handle shared by every motor on one bus.
pub type SharedProtocol = Arc<Mutex<MotorProtocol>>;

/// Physical axes of the chamber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    StandRotation,
    StandTranslation,
    TestPolarization,
    ChamberPolarization,
}

impl Axis {
    pub const ALL: [Axis; 4] = [
        Axis::StandRotation,
        Axis::StandTranslation,
        Axis::TestPolarization,
        Axis::ChamberPolarization,
    ];

    /// Channel number on the controller.
    pub const fn port_number(self) -> u8 {
        match self {
            Axis::StandRotation => 1,
            Axis::StandTranslation => 2,
            Axis::TestPolarization => 3,
            Axis::ChamberPolarization => 4,
        }
    }

    pub const fn model(self) -> MotorModel {
        match self {
            Axis::TestPolarization => MotorModel::B5990,
            _ => MotorModel::B4836,
        }
    }

    /// Look an axis up by its channel number.
    pub fn from_port_number(number: u8) -> Option<Axis> {
        Axis::ALL.into_iter().find(|a| a.port_number() == number)
    }

    pub const fn label(self) -> &'static str {
        match self {
            Axis::StandRotation => "Stand Rotation",
            Axis::StandTranslation => "Stand Translation",
            Axis::TestPolarization => "Test Antenna Polarization",
            Axis::ChamberPolarization => "Chamber Antenna Polarization",
        }
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One motor channel.
pub struct MotorDevice {
    port: Port,
    model: MotorModel,
    speed: Option<u32>,
    acceleration: Option<u32>,
    protocol: SharedProtocol,
}

impl MotorDevice {
    pub fn new(port: Port, model: MotorModel, protocol: SharedProtocol) -> Self {
        Self {
            port,
            model,
            speed: None,
            acceleration: None,
            protocol,
        }
    }

    pub fn port(&self) -> Port {
        self.port
    }

    pub fn model(&self) -> MotorModel {
        self.model
    }

    /// Last speed successfully sent, if any.
    pub fn speed(&self) -> Option<u32> {
        self.speed
    }

    /// Last acceleration successfully sent, if any.
    pub fn acceleration(&self) -> Option<u32> {
        self.acceleration
    }

    async fn simple(&self, command: MotorCommand) -> AppResult<()> {
        self.protocol.lock().await.send_simple(&command).await
    }

    async fn complex(&self, command: MotorCommand) -> AppResult<()> {
        self.protocol.lock().await.send_complex(&command).await
    }

    /// Move to the stored zero reference. Blocks until the motion completes.
    pub async fn goto_zero(&self) -> AppResult<()> {
        self.complex(MotorCommand::GotoZero(self.port)).await
    }

    /// Rotate by `degrees`. A rotation that rounds to zero steps is a no-op.
    pub async fn rotate_by_degrees(&self, degrees: f64) -> AppResult<()> {
        let steps = to_steps(degrees, self.model)?;
        debug!(port = self.port.get(), degrees, steps, "rotate");
        self.rotate_by_steps(steps).await
    }

    /// Relative move in controller steps. Zero steps issues nothing.
    pub async fn rotate_by_steps(&self, steps: i64) -> AppResult<()> {
        if steps.abs() > MAX_STEPS {
            return Err(ChamberError::Validation(format!(
                "{} steps exceeds the {} step command limit",
                steps, MAX_STEPS
            )));
        }
        if steps == 0 {
            return Ok(());
        }
        self.complex(MotorCommand::MoveRelative {
            port: self.port,
            steps,
        })
        .await
    }

    /// Mark the current physical position as this channel's zero. Does not move.
    pub async fn set_zero_reference(&self) -> AppResult<()> {
        self.simple(MotorCommand::SetZero(self.port)).await
    }

    /// Zero every channel's position register (bus-wide).
    pub async fn set_all_zero(&self) -> AppResult<()> {
        self.simple(MotorCommand::SetAllZero).await
    }

    /// Current position in degrees, decoded with this channel's resolution.
    pub async fn get_position(&self) -> AppResult<f64> {
        self.protocol
            .lock()
            .await
            .send_location_query(&MotorCommand::QueryPosition(self.port), self.model)
            .await
    }

    pub async fn set_speed(&mut self, speed: u32) -> AppResult<()> {
        if !SPEED_RANGE.contains(&speed) {
            return Err(ChamberError::Validation(format!(
                "speed {} outside {}-{} steps/s",
                speed,
                SPEED_RANGE.start(),
                SPEED_RANGE.end()
            )));
        }
        self.simple(MotorCommand::SetSpeed {
            port: self.port,
            speed,
        })
        .await?;
        self.speed = Some(speed);
        Ok(())
    }

    pub async fn set_acceleration(&mut self, acceleration: u32) -> AppResult<()> {
        if !ACCELERATION_RANGE.contains(&acceleration) {
            return Err(ChamberError::Validation(format!(
                "acceleration {} outside {}-{}",
                acceleration,
                ACCELERATION_RANGE.start(),
                ACCELERATION_RANGE.end()
            )));
        }
        self.simple(MotorCommand::SetAcceleration {
            port: self.port,
            acceleration,
        })
        .await?;
        self.acceleration = Some(acceleration);
        Ok(())
    }

    /// Drive toward the negative limit switch.
    pub async fn seek_negative_limit(&self) -> AppResult<()> {
        self.complex(MotorCommand::SeekNegativeLimit(self.port)).await
    }

    /// Drive toward the positive limit switch.
    pub async fn seek_positive_limit(&self) -> AppResult<()> {
        self.complex(MotorCommand::SeekPositiveLimit(self.port)).await
    }

    pub async fn start_online(&self) -> AppResult<()> {
        self.simple(MotorCommand::StartOnline).await
    }

    pub async fn quit_online(&self) -> AppResult<()> {
        self.simple(MotorCommand::QuitOnline).await
    }

    /// Clear the firmware command buffer.
    pub async fn clear(&self) -> AppResult<()> {
        self.simple(MotorCommand::Clear).await
    }

    /// Raw controller status text.
    pub async fn verify_status(&self) -> AppResult<String> {
        self.protocol.lock().await.query_status().await
    }
}

impl fmt::Display for MotorDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on port {}", self.model, self.port)
    }
}

/// The four chamber motors on one bus.
pub struct MotorSet {
    protocol: SharedProtocol,
    rotation: MotorDevice,
    translation: MotorDevice,
    test_polarization: MotorDevice,
    chamber_polarization: MotorDevice,
}

impl MotorSet {
    /// Bind the fixed channel assignment to `protocol`. Sends nothing.
    pub fn new(protocol: MotorProtocol) -> AppResult<Self> {
        let protocol = Arc::new(Mutex::new(protocol));
        let device = |axis: Axis| -> AppResult<MotorDevice> {
            Ok(MotorDevice::new(
                Port::new(axis.port_number())?,
                axis.model(),
                protocol.clone(),
            ))
        };

        Ok(Self {
            rotation: device(Axis::StandRotation)?,
            translation: device(Axis::StandTranslation)?,
            test_polarization: device(Axis::TestPolarization)?,
            chamber_polarization: device(Axis::ChamberPolarization)?,
            protocol,
        })
    }

    /// Enter on-line mode, clear the buffer and apply speeds/accelerations.
    pub async fn initialize(&mut self, tuning: &MotorTuning) -> AppResult<()> {
        info!("Initializing motors");
        self.rotation.start_online().await?;
        self.rotation.clear().await?;

        for axis in Axis::ALL {
            self.get_mut(axis).set_acceleration(tuning.acceleration).await?;
        }
        self.rotation.set_speed(tuning.stand_speed).await?;
        self.translation.set_speed(tuning.translation_speed).await?;
        self.test_polarization
            .set_speed(tuning.polarization_speed)
            .await?;
        self.chamber_polarization
            .set_speed(tuning.polarization_speed)
            .await?;

        for axis in Axis::ALL {
            debug!("{}: {}", axis, self.get(axis));
        }
        Ok(())
    }

    pub fn get(&self, axis: Axis) -> &MotorDevice {
        match axis {
            Axis::StandRotation => &self.rotation,
            Axis::StandTranslation => &self.translation,
            Axis::TestPolarization => &self.test_polarization,
            Axis::ChamberPolarization => &self.chamber_polarization,
        }
    }

    pub fn get_mut(&mut self, axis: Axis) -> &mut MotorDevice {
        match axis {
            Axis::StandRotation => &mut self.rotation,
            Axis::StandTranslation => &mut self.translation,
            Axis::TestPolarization => &mut self.test_polarization,
            Axis::ChamberPolarization => &mut self.chamber_polarization,
        }
    }

    pub fn rotation(&self) -> &MotorDevice {
        &self.rotation
    }

    pub fn translation(&self) -> &MotorDevice {
        &self.translation
    }

    pub fn test_polarization(&self) -> &MotorDevice {
        &self.test_polarization
    }

    pub fn chamber_polarization(&self) -> &MotorDevice {
        &self.chamber_polarization
    }

    /// Send every axis to its zero reference, one after another.
    pub async fn goto_zero_all(&self) -> AppResult<()> {
        for axis in Axis::ALL {
            self.get(axis).goto_zero().await?;
        }
        Ok(())
    }

    /// Leave on-line mode and close the bus. Both steps are attempted.
    pub async fn shutdown(&self) -> AppResult<()> {
        let quit = self.rotation.quit_online().await;
        let close = self.protocol.lock().await.close().await;
        match (quit, close) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(a), Err(b)) => Err(ChamberError::ShutdownFailed(vec![a, b])),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockMotorController;
    use std::time::Duration;

    fn motor_set(mock: &MockMotorController) -> MotorSet {
        let protocol = MotorProtocol::new(Box::new(mock.clone()), Duration::from_millis(20));
        MotorSet::new(protocol).unwrap()
    }

    #[test]
    fn test_axis_assignment() {
        assert_eq!(Axis::StandRotation.port_number(), 1);
        assert_eq!(Axis::TestPolarization.model(), MotorModel::B5990);
        assert_eq!(Axis::ChamberPolarization.model(), MotorModel::B4836);
        assert_eq!(Axis::from_port_number(2), Some(Axis::StandTranslation));
        assert_eq!(Axis::from_port_number(5), None);
    }

    #[tokio::test]
    async fn test_initialize_sequence() {
        let mock = MockMotorController::new();
        let mut motors = motor_set(&mock);
        motors.initialize(&MotorTuning::default()).await.unwrap();

        assert_eq!(
            mock.commands().await,
            vec![
                "F", "C", "A1M1", "A2M1", "A3M1", "A4M1", "S1M1500", "S2M5000", "S3M2500",
                "S4M2500"
            ]
        );
        assert!(mock.is_online().await);
        assert_eq!(motors.rotation().speed(), Some(1500));
    }

    #[tokio::test]
    async fn test_rotate_by_degrees_and_position() {
        let mock = MockMotorController::new();
        let motors = motor_set(&mock);

        motors.rotation().rotate_by_degrees(30.0).await.unwrap();
        assert_eq!(mock.commands().await, vec!["I1M-1200,R", "C"]);

        let position = motors.rotation().get_position().await.unwrap();
        assert!((position - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_step_rotation_sends_nothing() {
        let mock = MockMotorController::new();
        let motors = motor_set(&mock);

        motors.rotation().rotate_by_degrees(0.0).await.unwrap();
        motors.rotation().rotate_by_degrees(0.01).await.unwrap();
        motors.test_polarization().rotate_by_steps(0).await.unwrap();
        assert!(mock.commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_validation_happens_before_io() {
        let mock = MockMotorController::new();
        let mut motors = motor_set(&mock);

        let rotation = motors.get_mut(Axis::StandRotation);
        assert!(matches!(
            rotation.set_speed(0).await,
            Err(ChamberError::Validation(_))
        ));
        assert!(matches!(
            rotation.set_speed(6001).await,
            Err(ChamberError::Validation(_))
        ));
        assert!(matches!(
            rotation.set_acceleration(128).await,
            Err(ChamberError::Validation(_))
        ));
        assert!(matches!(
            rotation.rotate_by_steps(MAX_STEPS + 1).await,
            Err(ChamberError::Validation(_))
        ));
        assert!(matches!(
            rotation.rotate_by_degrees(1.0e6).await,
            Err(ChamberError::Validation(_))
        ));
        assert!(mock.commands().await.is_empty());
        assert_eq!(rotation.speed(), None);
    }

    #[tokio::test]
    async fn test_range_boundaries_accepted() {
        let mock = MockMotorController::new();
        let mut motors = motor_set(&mock);
        let translation = motors.get_mut(Axis::StandTranslation);

        translation.set_speed(1).await.unwrap();
        translation.set_speed(6000).await.unwrap();
        translation.set_acceleration(1).await.unwrap();
        translation.set_acceleration(127).await.unwrap();
        assert_eq!(
            mock.commands().await,
            vec!["S2M1", "S2M6000", "A2M1", "A2M127"]
        );
    }

    #[tokio::test]
    async fn test_zero_reference_and_limits() {
        let mock = MockMotorController::new();
        let motors = motor_set(&mock);
        let chamber = motors.chamber_polarization();

        chamber.seek_negative_limit().await.unwrap();
        chamber.set_zero_reference().await.unwrap();
        chamber.seek_positive_limit().await.unwrap();
        chamber.goto_zero().await.unwrap();
        chamber.set_all_zero().await.unwrap();

        assert_eq!(
            mock.commands().await,
            vec!["I4M-0,R", "C", "IA4M-0", "I4M0,R", "C", "IA4M0,R", "C", "N"]
        );
        assert_eq!(chamber.get_position().await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_timeout_propagates_without_retry() {
        let mock = MockMotorController::new();
        mock.stall_motion(true).await;
        let motors = motor_set(&mock);

        let err = motors.rotation().goto_zero().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(mock.commands().await, vec!["IA1M0,R"]);
    }

    #[tokio::test]
    async fn test_shutdown_quits_online_and_closes() {
        let mock = MockMotorController::new();
        let motors = motor_set(&mock);

        motors.shutdown().await.unwrap();
        assert_eq!(mock.commands().await, vec!["Q"]);
        assert!(mock.is_closed().await);
    }

    #[tokio::test]
    async fn test_status() {
        let mock = MockMotorController::new();
        let motors = motor_set(&mock);
        assert_eq!(motors.rotation().verify_status().await.unwrap(), "R");
    }
}
