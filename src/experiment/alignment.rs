//! Interactive motor alignment.
//!
//! The operator picks a motor, jogs it by whole degrees until it is physically
//! aligned, then enters `x` to make that position the motor's zero. Entering
//! `x` at the motor prompt ends the session and homes every motor. Blank or
//! unparsable lines repeat the prompt and never zero anything.
//!
//! Input and output are generic so the loop runs against stdin/stdout in the
//! binary and against byte buffers in tests.

use std::str::FromStr;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::info;

use super::context::SweepContext;
use super::polarization::record_polarization;
use crate::error::AppResult;
use crate::hardware::{Axis, MotorSet};

/// One answer from the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputResult<T> {
    Value(T),
    /// The operator entered `x` (either case).
    Cancel,
    /// Neither a value nor `x`; the prompt is repeated.
    Invalid,
}

const CANCEL_KEY: &str = "x";

const MOTOR_MENU: &str = "Motor Numbers:\n\
    1: Stand Rotation\n\
    2: Stand Translation\n\
    3: Test Antenna Polarization\n\
    4: Chamber Antenna Polarization\n\
    Input motor number (x to cancel):";
const ANGLE_PROMPT: &str = "Enter rotation angle as integer (x to set absolute zero):";

async fn write_text<W>(output: &mut W, text: &str) -> AppResult<()>
where
    W: AsyncWrite + Unpin,
{
    output.write_all(text.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

/// Classify one trimmed line of operator input.
pub fn parse_input<T: FromStr>(line: &str) -> InputResult<T> {
    let line = line.trim();
    if line.eq_ignore_ascii_case(CANCEL_KEY) {
        return InputResult::Cancel;
    }
    match line.parse::<T>() {
        Ok(value) => InputResult::Value(value),
        Err(_) => InputResult::Invalid,
    }
}

/// Read one line; `None` at end of input.
pub async fn read_input<R, T>(input: &mut R) -> AppResult<Option<InputResult<T>>>
where
    R: AsyncBufRead + Unpin,
    T: FromStr,
{
    let mut line = String::new();
    if input.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    Ok(Some(parse_input(&line)))
}

/// Prompt until a motor number in 1..=4 or a cancel is entered.
async fn select_motor<R, W>(input: &mut R, output: &mut W) -> AppResult<InputResult<Axis>>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        write_text(output, MOTOR_MENU).await?;
        match read_input::<_, i64>(input).await? {
            None | Some(InputResult::Cancel) => return Ok(InputResult::Cancel),
            Some(InputResult::Invalid) => {
                write_text(output, "\nMotor number must be integer in range [1 : 4]\n").await?
            }
            Some(InputResult::Value(number)) => {
                match u8::try_from(number).ok().and_then(Axis::from_port_number) {
                    Some(axis) => {
                        info!("Selected motor: {}", number);
                        return Ok(InputResult::Value(axis));
                    }
                    None => {
                        write_text(output, "\nMotor number must be integer in range [1 : 4]\n").await?
                    }
                }
            }
        }
    }
}

/// Jog `axis` until the operator sets its zero. Returns `false` at end of input.
async fn adjust_motor<R, W>(motors: &MotorSet, axis: Axis, input: &mut R, output: &mut W) -> AppResult<bool>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let motor = motors.get(axis);
    loop {
        write_text(output, ANGLE_PROMPT).await?;
        match read_input::<_, i64>(input).await? {
            None => return Ok(false),
            Some(InputResult::Invalid) => {
                write_text(output, "\nAngle must be integer in range [-359 : 359]\n").await?;
            }
            Some(InputResult::Value(angle)) if angle.abs() >= 360 => {
                write_text(output, "\nAngle must be integer in range [-359 : 359]\n").await?;
            }
            Some(InputResult::Value(angle)) => {
                info!("Rotating motor {} by {} degrees", axis.port_number(), angle);
                motor.rotate_by_degrees(angle as f64).await?;
            }
            Some(InputResult::Cancel) => {
                info!("Setting absolute zero position for motor {}", axis.port_number());
                motor.set_zero_reference().await?;
                motor.set_all_zero().await?;
                let position = motor.get_position().await?;
                info!("Motor {} position: {}", axis.port_number(), position);
                return Ok(true);
            }
        }
    }
}

/// Home every motor, then run the select/jog/zero loop until cancelled.
pub async fn run_alignment<R, W>(motors: &MotorSet, input: &mut R, output: &mut W) -> AppResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    motors.goto_zero_all().await?;

    loop {
        let axis = match select_motor(input, output).await? {
            InputResult::Value(axis) => axis,
            InputResult::Cancel | InputResult::Invalid => break,
        };
        if !adjust_motor(motors, axis, input, output).await? {
            info!("Input closed while adjusting motor {}", axis.port_number());
        }
    }

    motors.goto_zero_all().await
}

/// Align interactively, then record both polarizations as zero.
pub async fn run_motor_alignment<R, W>(ctx: &mut SweepContext, input: &mut R, output: &mut W) -> AppResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    run_alignment(&ctx.motors, input, output).await?;
    record_polarization(ctx.store.as_mut(), 0.0, 0.0).await
}
