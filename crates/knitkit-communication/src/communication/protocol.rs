//! Knitting machine wire protocol
//!
//! Commands are newline-terminated ASCII lines with colon-separated
//! arguments, e.g. `TURN:12000:CW` or `SPEED:1200`.

use knitkit_core::{Direction, ProtocolError};
use std::fmt;
use std::str::FromStr;

/// Allowed step delay range in microseconds
pub const SPEED_RANGE_US: std::ops::RangeInclusive<u32> = 500..=3000;

/// Allowed microstepping divisors
pub const MICROSTEP_DIVISORS: [u32; 6] = [1, 2, 4, 8, 16, 32];

/// Commands written by the emergency stop path, in order
pub const EMERGENCY_STOP_SEQUENCE: [MotorCommand; 3] = [
    MotorCommand::Stop,
    MotorCommand::EmergencyStop,
    MotorCommand::Halt,
];

/// A command understood by the machine firmware
#[derive(Debug, Clone, PartialEq)]
pub enum MotorCommand {
    /// `TURN:<steps>:<dir>` raw step-count motion
    Turn {
        /// Stepper steps
        steps: u64,
        /// Rotation direction
        direction: Direction,
    },
    /// `REV:<revolutions>:<dir>` revolution-count motion
    Rev {
        /// Full revolutions, may be fractional
        revolutions: f64,
        /// Rotation direction
        direction: Direction,
    },
    /// `SPEED:<us>` step delay
    Speed(u32),
    /// `MICRO:<n>` microstepping divisor
    Micro(u32),
    /// `WAIT:<seconds>` pause on the device
    Wait(f64),
    /// `STOP`
    Stop,
    /// `EMERGENCY_STOP`
    EmergencyStop,
    /// `HALT`
    Halt,
    /// `STATUS` status request
    Status,
    /// `NEEDLE_TARGET:<needles>:<dir>` move until N needles are counted
    NeedleTarget {
        /// Needles to count
        needles: u64,
        /// Rotation direction
        direction: Direction,
    },
    /// `NEEDLE_COUNT` query the sensor tally
    NeedleCount,
    /// `RESET_COUNT` reset the sensor tally
    ResetCount,
}

impl MotorCommand {
    /// Command keyword without arguments
    pub fn keyword(&self) -> &'static str {
        match self {
            MotorCommand::Turn { .. } => "TURN",
            MotorCommand::Rev { .. } => "REV",
            MotorCommand::Speed(_) => "SPEED",
            MotorCommand::Micro(_) => "MICRO",
            MotorCommand::Wait(_) => "WAIT",
            MotorCommand::Stop => "STOP",
            MotorCommand::EmergencyStop => "EMERGENCY_STOP",
            MotorCommand::Halt => "HALT",
            MotorCommand::Status => "STATUS",
            MotorCommand::NeedleTarget { .. } => "NEEDLE_TARGET",
            MotorCommand::NeedleCount => "NEEDLE_COUNT",
            MotorCommand::ResetCount => "RESET_COUNT",
        }
    }

    /// Whether the command moves the needle ring
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            MotorCommand::Turn { .. } | MotorCommand::Rev { .. } | MotorCommand::NeedleTarget { .. }
        )
    }

    /// Whether the command halts motion
    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            MotorCommand::Stop | MotorCommand::EmergencyStop | MotorCommand::Halt
        )
    }
}

impl fmt::Display for MotorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MotorCommand::Turn { steps, direction } => write!(f, "TURN:{}:{}", steps, direction),
            MotorCommand::Rev {
                revolutions,
                direction,
            } => write!(f, "REV:{}:{}", revolutions, direction),
            MotorCommand::Speed(us) => write!(f, "SPEED:{}", us),
            MotorCommand::Micro(n) => write!(f, "MICRO:{}", n),
            MotorCommand::Wait(secs) => write!(f, "WAIT:{}", secs),
            MotorCommand::NeedleTarget { needles, direction } => {
                write!(f, "NEEDLE_TARGET:{}:{}", needles, direction)
            }
            other => f.write_str(other.keyword()),
        }
    }
}

fn invalid(command: &str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidArgument {
        command: command.to_string(),
        reason: reason.into(),
    }
}

fn arg<'a>(parts: &[&'a str], index: usize, command: &str) -> Result<&'a str, ProtocolError> {
    parts
        .get(index)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid(command, format!("missing argument {}", index)))
}

fn expect_arity(parts: &[&str], arity: usize, command: &str) -> Result<(), ProtocolError> {
    if parts.len() != arity + 1 {
        return Err(invalid(
            command,
            format!("expected {} argument(s), got {}", arity, parts.len() - 1),
        ));
    }
    Ok(())
}

fn parse_direction(parts: &[&str], index: usize, command: &str) -> Result<Direction, ProtocolError> {
    arg(parts, index, command)?
        .parse()
        .map_err(|_| invalid(command, "direction must be CW or CCW"))
}

fn parse_count(parts: &[&str], index: usize, command: &str) -> Result<u64, ProtocolError> {
    arg(parts, index, command)?
        .parse()
        .map_err(|_| invalid(command, "count must be a non-negative integer"))
}

fn parse_float(parts: &[&str], index: usize, command: &str) -> Result<f64, ProtocolError> {
    let value: f64 = arg(parts, index, command)?
        .parse()
        .map_err(|_| invalid(command, "value must be a number"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid(command, "value must be a non-negative number"));
    }
    Ok(value)
}

impl FromStr for MotorCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim();
        let parts: Vec<&str> = line.split(':').collect();
        let keyword = parts[0].trim().to_ascii_uppercase();
        let cmd = keyword.as_str();

        let simple = |command: MotorCommand| -> Result<MotorCommand, ProtocolError> {
            expect_arity(&parts, 0, cmd)?;
            Ok(command)
        };

        match cmd {
            "TURN" => {
                expect_arity(&parts, 2, cmd)?;
                Ok(MotorCommand::Turn {
                    steps: parse_count(&parts, 1, cmd)?,
                    direction: parse_direction(&parts, 2, cmd)?,
                })
            }
            "REV" => {
                expect_arity(&parts, 2, cmd)?;
                Ok(MotorCommand::Rev {
                    revolutions: parse_float(&parts, 1, cmd)?,
                    direction: parse_direction(&parts, 2, cmd)?,
                })
            }
            "NEEDLE_TARGET" => {
                expect_arity(&parts, 2, cmd)?;
                Ok(MotorCommand::NeedleTarget {
                    needles: parse_count(&parts, 1, cmd)?,
                    direction: parse_direction(&parts, 2, cmd)?,
                })
            }
            "SPEED" => {
                expect_arity(&parts, 1, cmd)?;
                let us = parse_count(&parts, 1, cmd)?;
                match u32::try_from(us) {
                    Ok(us) if SPEED_RANGE_US.contains(&us) => Ok(MotorCommand::Speed(us)),
                    _ => Err(invalid(cmd, "step delay must be 500-3000 microseconds")),
                }
            }
            "MICRO" => {
                expect_arity(&parts, 1, cmd)?;
                let n = parse_count(&parts, 1, cmd)?;
                match u32::try_from(n) {
                    Ok(n) if MICROSTEP_DIVISORS.contains(&n) => Ok(MotorCommand::Micro(n)),
                    _ => Err(invalid(cmd, "microstepping must be 1, 2, 4, 8, 16 or 32")),
                }
            }
            "WAIT" => {
                expect_arity(&parts, 1, cmd)?;
                Ok(MotorCommand::Wait(parse_float(&parts, 1, cmd)?))
            }
            "STOP" => simple(MotorCommand::Stop),
            "EMERGENCY_STOP" => simple(MotorCommand::EmergencyStop),
            "HALT" => simple(MotorCommand::Halt),
            "STATUS" => simple(MotorCommand::Status),
            "NEEDLE_COUNT" => simple(MotorCommand::NeedleCount),
            "RESET_COUNT" => simple(MotorCommand::ResetCount),
            _ => Err(ProtocolError::UnknownCommand(line.to_string())),
        }
    }
}
