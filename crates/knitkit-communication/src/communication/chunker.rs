//! Splitting of oversized motion commands
//!
//! The firmware parses step counts into a signed 16-bit value and has a
//! small receive buffer, so long `TURN` commands are sent as a series of
//! shorter ones.

use super::protocol::MotorCommand;

/// Split `command` into device-safe pieces.
///
/// Only `TURN:<steps>:<dir>` is split; everything else, including
/// unparseable lines, comes back unchanged as a single element. A `TURN` of
/// `steps` becomes `ceil(steps / max_chunk_size)` commands whose step
/// counts sum to exactly `steps`, all in the original direction.
pub fn chunk_command(command: &str, max_chunk_size: u64) -> Vec<String> {
    let (steps, direction) = match command.parse::<MotorCommand>() {
        Ok(MotorCommand::Turn { steps, direction }) => (steps, direction),
        _ => return vec![command.to_string()],
    };

    if max_chunk_size == 0 || steps <= max_chunk_size {
        return vec![command.to_string()];
    }

    let mut chunks = Vec::with_capacity(steps.div_ceil(max_chunk_size) as usize);
    let mut remaining = steps;
    while remaining > 0 {
        let size = remaining.min(max_chunk_size);
        chunks.push(
            MotorCommand::Turn {
                steps: size,
                direction,
            }
            .to_string(),
        );
        remaining -= size;
    }
    chunks
}
