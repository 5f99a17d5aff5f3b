//! Motor hardware: unit conversion, bus protocol, devices and a simulated controller.

pub mod mock;
pub mod motor;
pub mod protocol;
pub mod steps;

pub use motor::{Axis, MotorDevice, MotorSet};
pub use protocol::{MotorCommand, MotorProtocol, Port};
pub use steps::{normalize_angle, to_degrees, to_steps, MotorModel};
