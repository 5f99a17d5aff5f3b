//! Motor controller command protocol.
//!
//! One serial bus addresses up to four motor channels; the channel number is
//! embedded in the command text. Commands fall into classes that differ in how
//! the bus is read afterwards:
//!
//! | Class           | Framing                                              |
//! |-----------------|------------------------------------------------------|
//! | `Simple`        | write `text\r`, no reply                             |
//! | `Complex`       | write, read until `^` (motion complete), then `C`    |
//! | `LocationQuery` | write, read until `\r`, decode a step index          |
//! | `StatusQuery`   | write, read until `\r`, return the raw status text   |
//!
//! [`MotorProtocol`] owns the transport and the bus read terminator. The
//! terminator is switched to `^` only for the duration of a complex command and
//! is always restored to `\r`, including when the acknowledgement times out.

use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use super::steps::{to_degrees, MotorModel};
use crate::adapters::SerialTransport;
use crate::error::{AppResult, ChamberError};

/// Motor channel address on the shared bus (1-4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Port(u8);

impl Port {
    /// Validate and wrap a channel number.
    pub fn new(number: u8) -> AppResult<Self> {
        if (1..=4).contains(&number) {
            Ok(Self(number))
        } else {
            Err(ChamberError::Validation(format!(
                "motor port must be 1-4, got {}",
                number
            )))
        }
    }

    /// Channel number as sent on the wire.
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Single-letter position register for this channel.
    pub const fn position_register(self) -> char {
        match self.0 {
            1 => 'X',
            2 => 'Y',
            3 => 'Z',
            _ => 'T',
        }
    }
}

impl fmt::Display for Port {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read terminator currently in effect on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// `\r`, used for every reply except motion completion.
    CarriageReturn,
    /// Motion-complete sentinel emitted by the firmware.
    Caret,
}

impl Terminator {
    /// Byte that ends a read.
    pub const fn byte(self) -> u8 {
        match self {
            Terminator::CarriageReturn => b'\r',
            Terminator::Caret => b'^',
        }
    }
}

/// How a command is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Written with no reply.
    Simple,
    /// Motion command; completion is signalled by `^`.
    Complex,
    /// Reply is a signed step count for one channel.
    LocationQuery,
    /// Reply is the raw status text.
    StatusQuery,
}

/// The fixed controller vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MotorCommand {
    /// `F`: enter on-line mode.
    StartOnline,
    /// `Q`: leave on-line mode.
    QuitOnline,
    /// `C`: clear the firmware command buffer.
    Clear,
    /// `N`: zero every position register.
    SetAllZero,
    /// `V`: controller status.
    Status,
    /// `X`/`Y`/`Z`/`T`: read one channel's position register.
    QueryPosition(Port),
    /// `S{ch}M{speed}`
    SetSpeed { port: Port, speed: u32 },
    /// `A{ch}M{accel}`
    SetAcceleration { port: Port, acceleration: u32 },
    /// `IA{ch}M-0`: current position becomes this channel's zero.
    SetZero(Port),
    /// `IA{ch}M0,R`
    GotoZero(Port),
    /// `I{ch}M{steps},R`
    MoveRelative { port: Port, steps: i64 },
    /// `I{ch}M-0,R`
    SeekNegativeLimit(Port),
    /// `I{ch}M0,R`
    SeekPositiveLimit(Port),
}

impl MotorCommand {
    /// Command text without terminator.
    pub fn text(&self) -> String {
        match self {
            MotorCommand::StartOnline => "F".to_string(),
            MotorCommand::QuitOnline => "Q".to_string(),
            MotorCommand::Clear => "C".to_string(),
            MotorCommand::SetAllZero => "N".to_string(),
            MotorCommand::Status => "V".to_string(),
            MotorCommand::QueryPosition(port) => port.position_register().to_string(),
            MotorCommand::SetSpeed { port, speed } => format!("S{}M{}", port, speed),
            MotorCommand::SetAcceleration { port, acceleration } => {
                format!("A{}M{}", port, acceleration)
            }
            MotorCommand::SetZero(port) => format!("IA{}M-0", port),
            MotorCommand::GotoZero(port) => format!("IA{}M0,R", port),
            MotorCommand::MoveRelative { port, steps } => format!("I{}M{},R", port, steps),
            MotorCommand::SeekNegativeLimit(port) => format!("I{}M-0,R", port),
            MotorCommand::SeekPositiveLimit(port) => format!("I{}M0,R", port),
        }
    }

    /// Acknowledgement style of this command.
    pub fn class(&self) -> CommandClass {
        match self {
            MotorCommand::GotoZero(_)
            | MotorCommand::MoveRelative { .. }
            | MotorCommand::SeekNegativeLimit(_)
            | MotorCommand::SeekPositiveLimit(_) => CommandClass::Complex,
            MotorCommand::QueryPosition(_) => CommandClass::LocationQuery,
            MotorCommand::Status => CommandClass::StatusQuery,
            _ => CommandClass::Simple,
        }
    }

    /// Addressed channel, if the command targets one.
    pub fn port(&self) -> Option<Port> {
        match self {
            MotorCommand::QueryPosition(port)
            | MotorCommand::SetSpeed { port, .. }
            | MotorCommand::SetAcceleration { port, .. }
            | MotorCommand::SetZero(port)
            | MotorCommand::GotoZero(port)
            | MotorCommand::MoveRelative { port, .. }
            | MotorCommand::SeekNegativeLimit(port)
            | MotorCommand::SeekPositiveLimit(port) => Some(*port),
            _ => None,
        }
    }
}

/// A framed command ready for the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialCommand {
    text: String,
    class: CommandClass,
}

impl SerialCommand {
    /// Command text without terminator.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn class(&self) -> CommandClass {
        self.class
    }

    /// Terminator the bus must read with while this command is pending.
    pub fn read_terminator(&self) -> Terminator {
        match self.class {
            CommandClass::Complex => Terminator::Caret,
            _ => Terminator::CarriageReturn,
        }
    }

    /// Bytes written to the bus.
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut bytes = self.text.clone().into_bytes();
        bytes.push(b'\r');
        bytes
    }
}

impl From<&MotorCommand> for SerialCommand {
    fn from(command: &MotorCommand) -> Self {
        Self {
            text: command.text(),
            class: command.class(),
        }
    }
}

/// Reply produced by [`MotorProtocol::execute`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Simple and complex commands.
    None,
    /// Channel position in degrees.
    Position(f64),
    Status(String),
}

/// Owner of the motor bus and its read terminator.
pub struct MotorProtocol {
    transport: Box<dyn SerialTransport>,
    terminator: Terminator,
    timeout: Duration,
}

impl MotorProtocol {
    pub fn new(transport: Box<dyn SerialTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            terminator: Terminator::CarriageReturn,
            timeout,
        }
    }

    /// Terminator currently in effect.
    pub fn terminator(&self) -> Terminator {
        self.terminator
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Dispatch on the command class. `model` is the resolution of the addressed
    /// channel and is only used for location queries.
    pub async fn execute(&mut self, command: &MotorCommand, model: MotorModel) -> AppResult<Reply> {
        match command.class() {
            CommandClass::Simple => self.send_simple(command).await.map(|_| Reply::None),
            CommandClass::Complex => self.send_complex(command).await.map(|_| Reply::None),
            CommandClass::LocationQuery => self
                .send_location_query(command, model)
                .await
                .map(Reply::Position),
            CommandClass::StatusQuery => self.query_status().await.map(Reply::Status),
        }
    }

    /// Fire-and-forget command.
    pub async fn send_simple(&mut self, command: &MotorCommand) -> AppResult<()> {
        let framed = SerialCommand::from(command);
        log_command(&framed, command.port());
        self.transport.write(&framed.wire_bytes()).await
    }

    /// Motion command gated on the firmware's `^` acknowledgement, followed by `C`.
    pub async fn send_complex(&mut self, command: &MotorCommand) -> AppResult<()> {
        let framed = SerialCommand::from(command);
        log_command(&framed, command.port());

        self.terminator = framed.read_terminator();
        let outcome = self.await_acknowledgement(&framed).await;
        self.terminator = Terminator::CarriageReturn;

        if let Err(e) = &outcome {
            warn!(command = framed.text(), error = %e, "motion command not acknowledged");
        }
        outcome?;

        self.send_simple(&MotorCommand::Clear).await
    }

    async fn await_acknowledgement(&mut self, framed: &SerialCommand) -> AppResult<()> {
        self.transport.write(&framed.wire_bytes()).await?;
        self.transport
            .read_until(self.terminator.byte(), self.timeout)
            .await
            .map_err(|e| match e {
                ChamberError::Timeout { timeout, .. } => ChamberError::timeout(
                    format!("'^' acknowledgement of {}", framed.text()),
                    timeout,
                ),
                other => other,
            })?;
        Ok(())
    }

    /// Read a position register and convert it with `model`'s resolution.
    pub async fn send_location_query(
        &mut self,
        command: &MotorCommand,
        model: MotorModel,
    ) -> AppResult<f64> {
        let reply = self.query_line(command).await?;
        let index: i64 = reply
            .trim()
            .parse()
            .map_err(|_| ChamberError::unexpected(command.text(), reply.clone()))?;
        Ok(to_degrees(index, model))
    }

    /// Raw controller status (`V`).
    pub async fn query_status(&mut self) -> AppResult<String> {
        self.query_line(&MotorCommand::Status).await
    }

    async fn query_line(&mut self, command: &MotorCommand) -> AppResult<String> {
        let framed = SerialCommand::from(command);
        log_command(&framed, command.port());
        self.transport.write(&framed.wire_bytes()).await?;
        self.transport
            .read_until(self.terminator.byte(), self.timeout)
            .await
    }

    /// Release the transport.
    pub async fn close(&mut self) -> AppResult<()> {
        debug!(transport = %self.transport.describe(), "closing motor bus");
        self.transport.close().await
    }
}

fn log_command(command: &SerialCommand, port: Option<Port>) {
    match port {
        Some(port) => debug!(port = port.get(), "Sending {} to motor {}", command.text(), port),
        None => debug!("Sending {} to motor bus", command.text()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockMotorController;

    fn port(n: u8) -> Port {
        Port::new(n).unwrap()
    }

    #[test]
    fn test_port_range() {
        assert!(Port::new(0).is_err());
        assert!(Port::new(5).is_err());
        assert_eq!(port(3).get(), 3);
    }

    #[test]
    fn test_command_vocabulary() {
        let cases = [
            (MotorCommand::StartOnline, "F"),
            (MotorCommand::QuitOnline, "Q"),
            (MotorCommand::Clear, "C"),
            (MotorCommand::SetAllZero, "N"),
            (MotorCommand::Status, "V"),
            (MotorCommand::QueryPosition(port(1)), "X"),
            (MotorCommand::QueryPosition(port(2)), "Y"),
            (MotorCommand::QueryPosition(port(3)), "Z"),
            (MotorCommand::QueryPosition(port(4)), "T"),
            (MotorCommand::SetSpeed { port: port(1), speed: 1500 }, "S1M1500"),
            (
                MotorCommand::SetAcceleration { port: port(2), acceleration: 1 },
                "A2M1",
            ),
            (MotorCommand::SetZero(port(3)), "IA3M-0"),
            (MotorCommand::GotoZero(port(1)), "IA1M0,R"),
            (MotorCommand::MoveRelative { port: port(1), steps: -1200 }, "I1M-1200,R"),
            (MotorCommand::SeekNegativeLimit(port(2)), "I2M-0,R"),
            (MotorCommand::SeekPositiveLimit(port(2)), "I2M0,R"),
        ];
        for (command, text) in cases {
            assert_eq!(command.text(), text);
        }
    }

    #[test]
    fn test_command_classes() {
        assert_eq!(MotorCommand::Clear.class(), CommandClass::Simple);
        assert_eq!(MotorCommand::SetZero(port(1)).class(), CommandClass::Simple);
        assert_eq!(MotorCommand::GotoZero(port(1)).class(), CommandClass::Complex);
        assert_eq!(
            MotorCommand::QueryPosition(port(4)).class(),
            CommandClass::LocationQuery
        );

        let framed = SerialCommand::from(&MotorCommand::GotoZero(port(1)));
        assert_eq!(framed.read_terminator(), Terminator::Caret);
        assert_eq!(framed.wire_bytes(), b"IA1M0,R\r".to_vec());
        let framed = SerialCommand::from(&MotorCommand::SetAllZero);
        assert_eq!(framed.read_terminator(), Terminator::CarriageReturn);
    }

    #[tokio::test]
    async fn test_simple_command_writes_carriage_return() {
        let mock = MockMotorController::new();
        let mut protocol = MotorProtocol::new(Box::new(mock.clone()), Duration::from_millis(50));

        protocol.send_simple(&MotorCommand::StartOnline).await.unwrap();
        assert_eq!(mock.raw_writes().await, vec![b"F\r".to_vec()]);
    }

    #[tokio::test]
    async fn test_complex_command_waits_then_clears() {
        let mock = MockMotorController::new();
        let mut protocol = MotorProtocol::new(Box::new(mock.clone()), Duration::from_millis(50));

        protocol
            .send_complex(&MotorCommand::MoveRelative { port: port(1), steps: -1200 })
            .await
            .unwrap();

        assert_eq!(mock.commands().await, vec!["I1M-1200,R", "C"]);
        assert_eq!(protocol.terminator(), Terminator::CarriageReturn);
        assert_eq!(mock.read_terminators().await, vec![b'^']);
    }

    #[tokio::test]
    async fn test_complex_timeout_restores_terminator() {
        let mock = MockMotorController::new();
        mock.stall_motion(true).await;
        let mut protocol = MotorProtocol::new(Box::new(mock.clone()), Duration::from_millis(20));

        let err = protocol
            .send_complex(&MotorCommand::GotoZero(port(1)))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(err.to_string().contains("IA1M0,R"));
        assert_eq!(protocol.terminator(), Terminator::CarriageReturn);
        // No clear after a failed acknowledgement
        assert_eq!(mock.commands().await, vec!["IA1M0,R"]);

        // The next query reads with the carriage return terminator again
        mock.stall_motion(false).await;
        protocol
            .send_location_query(&MotorCommand::QueryPosition(port(1)), MotorModel::B4836)
            .await
            .unwrap();
        assert_eq!(mock.read_terminators().await, vec![b'^', b'\r']);
    }

    #[tokio::test]
    async fn test_location_query_uses_given_model() {
        let mock = MockMotorController::new();
        mock.set_index(port(3), -9000).await;
        let mut protocol = MotorProtocol::new(Box::new(mock.clone()), Duration::from_millis(50));

        let query = MotorCommand::QueryPosition(port(3));
        let b5990 = protocol
            .send_location_query(&query, MotorModel::B5990)
            .await
            .unwrap();
        let b4836 = protocol
            .send_location_query(&query, MotorModel::B4836)
            .await
            .unwrap();

        assert!((b5990 - 90.0).abs() < 1e-9);
        assert!((b4836 - 225.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_execute_dispatches_by_class() {
        let mock = MockMotorController::new();
        let mut protocol = MotorProtocol::new(Box::new(mock.clone()), Duration::from_millis(50));

        let reply = protocol
            .execute(&MotorCommand::Status, MotorModel::B4836)
            .await
            .unwrap();
        assert!(matches!(reply, Reply::Status(ref s) if s == "R"));

        let reply = protocol
            .execute(&MotorCommand::QueryPosition(port(2)), MotorModel::B4836)
            .await
            .unwrap();
        assert_eq!(reply, Reply::Position(0.0));
    }
}
