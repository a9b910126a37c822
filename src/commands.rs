// Remote meter commands received on the MQTT set topic

use serde::Deserialize;

use crate::accounting::MeterShared;

/// JSON key that overrides the cumulative energy (kWh)
pub const KEY_TOTAL: &str = "Total";

/// JSON key that requests a subtotal reset (boolean `true`)
pub const KEY_SUBTOTAL: &str = "Subtotal";

/// Command parsing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommandError {
    /// Payload is not a JSON object with the expected keys
    InvalidJson,
    /// Energy value is negative, not finite or out of range
    InvalidValue,
    /// Object contains no recognised key
    Empty,
}

/// A decoded meter command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MeterCommand {
    /// Replace the cumulative pulse counter
    SetTotal { pulse_count: u32 },
    /// Zero the subtotal counter
    ResetSubtotal,
}

#[derive(Deserialize)]
struct SetPayload {
    #[serde(rename = "Total", default)]
    total: Option<f64>,
    #[serde(rename = "Subtotal", default)]
    subtotal: Option<bool>,
}

/// Convert an energy value in kWh into a pulse count (rounded to nearest)
pub fn kwh_to_pulses(kwh: f64, pulses_per_kwh: u32) -> Option<u32> {
    if !kwh.is_finite() || kwh < 0.0 {
        return None;
    }
    let pulses = libm::round(kwh * pulses_per_kwh as f64);
    if pulses > u32::MAX as f64 {
        return None;
    }
    Some(pulses as u32)
}

/// Parse a set-topic payload
///
/// # Arguments
/// * `payload` - JSON object, e.g. `{"Total": 1234.5}` or `{"Subtotal": true}`
/// * `pulses_per_kwh` - Meter calibration used to convert kWh into pulses
///
/// # Returns
/// * `Ok(commands)` in the order they must be applied
/// * `Err(CommandError)` if the payload carries nothing usable
pub fn parse_set_payload(
    payload: &[u8],
    pulses_per_kwh: u32,
) -> Result<heapless::Vec<MeterCommand, 2>, CommandError> {
    let (parsed, _) = serde_json_core::from_slice::<SetPayload>(payload).map_err(|_| {
        error!("Set command: invalid JSON ({} bytes)", payload.len());
        CommandError::InvalidJson
    })?;

    let mut commands = heapless::Vec::new();

    if let Some(kwh) = parsed.total {
        let pulse_count = kwh_to_pulses(kwh, pulses_per_kwh).ok_or_else(|| {
            error!("Set command: invalid total {}", kwh);
            CommandError::InvalidValue
        })?;
        info!("Set command: total={} kWh -> {} pulses", kwh, pulse_count);
        let _ = commands.push(MeterCommand::SetTotal { pulse_count });
    }

    // `false` is accepted and ignored
    if parsed.subtotal == Some(true) {
        info!("Set command: subtotal reset");
        let _ = commands.push(MeterCommand::ResetSubtotal);
    }

    if commands.is_empty() && parsed.total.is_none() && parsed.subtotal.is_none() {
        return Err(CommandError::Empty);
    }

    Ok(commands)
}

/// Stage decoded commands for the pulse accounting task
///
/// Commands are never applied inline; the accounting task picks them up on its next loop.
pub fn dispatch(commands: &[MeterCommand], shared: &MeterShared) {
    for command in commands {
        match *command {
            MeterCommand::SetTotal { pulse_count } => shared.request_counter_override(pulse_count),
            MeterCommand::ResetSubtotal => shared.request_subtotal_reset(),
        }
    }
}
