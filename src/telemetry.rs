// Vehicle telemetry model and `vehicle_data` response parsing
//
// Values arrive in miles from the vehicle API; km helpers convert with the
// statute mile. Missing range, battery level or odometer fails the parse,
// missing location falls back to `location_data` and then to 0.0/0.0.

use serde::Deserialize;

/// Kilometres per statute mile
pub const KM_PER_MILE: f32 = 1.609344;

/// Telemetry fetch/parse errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TelemetryError {
    /// Response body is not valid JSON for the expected shape
    InvalidJson,
    /// Range, battery level or odometer missing (vehicle asleep)
    Incomplete,
    /// Request failed or timed out
    Unavailable,
}

impl TelemetryError {
    pub fn as_str(&self) -> &'static str {
        match self {
            TelemetryError::InvalidJson => "vehicle_data JSON parse failed",
            TelemetryError::Incomplete => "vehicle_data incomplete",
            TelemetryError::Unavailable => "vehicle unavailable",
        }
    }
}

/// Vehicle state captured at session boundaries
#[derive(Debug, Clone, Copy, Default, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct VehicleTelemetry {
    pub range_miles: f32,
    pub battery_level_pct: f32,
    pub odometer_miles: f32,
    pub latitude: f64,
    pub longitude: f64,
}

impl VehicleTelemetry {
    pub fn range_km(&self) -> f32 {
        self.range_miles * KM_PER_MILE
    }

    pub fn odometer_km(&self) -> f32 {
        self.odometer_miles * KM_PER_MILE
    }
}

#[derive(Deserialize, Default)]
struct ChargeState {
    #[serde(default)]
    est_battery_range: Option<f32>,
    #[serde(default)]
    battery_range: Option<f32>,
    #[serde(default)]
    ideal_battery_range: Option<f32>,
    #[serde(default)]
    battery_level: Option<f32>,
}

#[derive(Deserialize, Default)]
struct VehicleState {
    #[serde(default)]
    odometer: Option<f32>,
}

#[derive(Deserialize, Default)]
struct Location {
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

impl Location {
    fn coordinates(&self) -> Option<(f64, f64)> {
        Some((self.latitude?, self.longitude?))
    }
}

#[derive(Deserialize, Default)]
struct VehicleData {
    #[serde(default)]
    charge_state: Option<ChargeState>,
    #[serde(default)]
    vehicle_state: Option<VehicleState>,
    #[serde(default)]
    drive_state: Option<Location>,
    #[serde(default)]
    location_data: Option<Location>,
}

#[derive(Deserialize)]
struct Envelope {
    response: VehicleData,
}

/// Parse a `vehicle_data` response body
///
/// Range prefers `est_battery_range`, then `battery_range`, then `ideal_battery_range`.
pub fn parse_vehicle_data(body: &[u8]) -> Result<VehicleTelemetry, TelemetryError> {
    let (envelope, _) = serde_json_core::from_slice::<Envelope>(body).map_err(|_| {
        warn!("vehicle_data: JSON parse failed ({} bytes)", body.len());
        TelemetryError::InvalidJson
    })?;
    let data = envelope.response;

    let charge = data.charge_state.unwrap_or_default();
    let range_miles = charge
        .est_battery_range
        .or(charge.battery_range)
        .or(charge.ideal_battery_range);
    let odometer_miles = data.vehicle_state.and_then(|v| v.odometer);

    let (Some(range_miles), Some(battery_level_pct), Some(odometer_miles)) =
        (range_miles, charge.battery_level, odometer_miles)
    else {
        warn!("vehicle_data: range, battery level or odometer missing");
        return Err(TelemetryError::Incomplete);
    };

    let (latitude, longitude) = data
        .drive_state
        .as_ref()
        .and_then(Location::coordinates)
        .or_else(|| data.location_data.as_ref().and_then(Location::coordinates))
        .unwrap_or_else(|| {
            debug!("vehicle_data: no location");
            (0.0, 0.0)
        });

    Ok(VehicleTelemetry {
        range_miles,
        battery_level_pct,
        odometer_miles,
        latitude,
        longitude,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &[u8] = br#"{
        "response": {
            "id": 12345,
            "state": "online",
            "charge_state": {
                "battery_level": 80,
                "battery_range": 200.5,
                "est_battery_range": 190.25,
                "charging_state": "Charging"
            },
            "vehicle_state": { "odometer": 10000.0, "locked": true },
            "drive_state": { "latitude": 55.676098, "longitude": 12.568337, "heading": 90 }
        }
    }"#;

    #[test]
    fn test_parse_full_response() {
        let telemetry = parse_vehicle_data(FULL).unwrap();
        assert_eq!(telemetry.range_miles, 190.25);
        assert_eq!(telemetry.battery_level_pct, 80.0);
        assert_eq!(telemetry.odometer_miles, 10000.0);
        assert!((telemetry.latitude - 55.676098).abs() < 1e-9);
        assert!((telemetry.longitude - 12.568337).abs() < 1e-9);
    }

    #[test]
    fn test_km_conversion() {
        let telemetry = VehicleTelemetry {
            range_miles: 100.0,
            odometer_miles: 1000.0,
            ..Default::default()
        };
        assert!((telemetry.range_km() - 160.9344).abs() < 1e-3);
        assert!((telemetry.odometer_km() - 1609.344).abs() < 1e-2);
    }

    #[test]
    fn test_range_fallback_and_location_data() {
        let body = br#"{"response":{
            "charge_state":{"ideal_battery_range":210.0,"battery_level":55},
            "vehicle_state":{"odometer":42.5},
            "drive_state":{"latitude":null,"longitude":null},
            "location_data":{"latitude":1.5,"longitude":-2.5}
        }}"#;
        let telemetry = parse_vehicle_data(body).unwrap();
        assert_eq!(telemetry.range_miles, 210.0);
        assert_eq!(telemetry.latitude, 1.5);
        assert_eq!(telemetry.longitude, -2.5);
    }

    #[test]
    fn test_missing_odometer_is_incomplete() {
        let body = br#"{"response":{"charge_state":{"battery_range":200.0,"battery_level":80}}}"#;
        assert_eq!(parse_vehicle_data(body), Err(TelemetryError::Incomplete));
    }

    #[test]
    fn test_invalid_json() {
        assert_eq!(
            parse_vehicle_data(b"<html>502</html>"),
            Err(TelemetryError::InvalidJson)
        );
    }
}
