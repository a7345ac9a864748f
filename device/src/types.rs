use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Initialization,
    Error,
    Idle,
    Measuring,
    Reporting,
    ResponseWait,
    Sleeping,
    LowBattery,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Initialization => "Initialization",
            DeviceState::Error => "Error",
            DeviceState::Idle => "Idle",
            DeviceState::Measuring => "Measuring",
            DeviceState::Reporting => "Reporting",
            DeviceState::ResponseWait => "Response Wait",
            DeviceState::Sleeping => "Sleeping",
            DeviceState::LowBattery => "Low Battery",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct RadioDiagnostics {
    /// Access technology code as reported by the modem.
    pub access_technology: u8,
    pub signal_strength_pct: f32,
    pub signal_quality_pct: f32,
}

/// One measurement cycle's readings. Never mutated once built.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MeasurementSample {
    pub timestamp: DateTime<Utc>,
    pub soil_moisture_pct: [f32; 6],
    pub precipitation_tips: u32,
    pub soil_temp_c: f32,
    pub ambient_humidity_pct: f32,
    pub ambient_temp_c: f32,
    pub enclosure_humidity_pct: f32,
    pub enclosure_temp_c: f32,
    pub battery_volts: f32,
    pub radio: RadioDiagnostics,
}

const BATTERY_EMPTY_VOLTS: f32 = 3.0;
const BATTERY_FULL_VOLTS: f32 = 4.2;

impl MeasurementSample {
    pub fn battery_pct(&self) -> f32 {
        let span = BATTERY_FULL_VOLTS - BATTERY_EMPTY_VOLTS;
        let pct = (self.battery_volts - BATTERY_EMPTY_VOLTS) / span * 100.0;
        pct.clamp(0.0, 100.0)
    }
}

/// Body published on the report channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DeliveryPayload {
    pub soil1: f32,
    pub soil2: f32,
    pub soil3: f32,
    pub soil4: f32,
    pub soil5: f32,
    pub soil6: f32,
    pub precip: u32,
    #[serde(rename = "soiltemp")]
    pub soil_temp: f32,
    pub humidity: f32,
    pub temp: f32,
    #[serde(rename = "ihumidity")]
    pub enclosure_humidity: f32,
    #[serde(rename = "itemp")]
    pub enclosure_temp: f32,
    pub battery: f32,
    #[serde(rename = "rat")]
    pub access_technology: u8,
    #[serde(rename = "rssi")]
    pub signal_strength: f32,
    #[serde(rename = "quality")]
    pub signal_quality: f32,
    pub resets: u8,
    pub alerts: u8,
}

impl DeliveryPayload {
    pub fn new(sample: &MeasurementSample, resets: u8, alerts: u8) -> Self {
        let [soil1, soil2, soil3, soil4, soil5, soil6] = sample.soil_moisture_pct;
        DeliveryPayload {
            soil1,
            soil2,
            soil3,
            soil4,
            soil5,
            soil6,
            precip: sample.precipitation_tips,
            soil_temp: sample.soil_temp_c,
            humidity: sample.ambient_humidity_pct,
            temp: sample.ambient_temp_c,
            enclosure_humidity: sample.enclosure_humidity_pct,
            enclosure_temp: sample.enclosure_temp_c,
            battery: sample.battery_pct(),
            access_technology: sample.radio.access_technology,
            signal_strength: sample.radio.signal_strength_pct,
            signal_quality: sample.radio.signal_quality_pct,
            resets,
            alerts,
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_at(timestamp: DateTime<Utc>, battery_volts: f32) -> MeasurementSample {
    MeasurementSample {
        timestamp,
        soil_moisture_pct: [10.0, 20.0, 30.0, 40.0, 50.0, 60.0],
        precipitation_tips: 7,
        soil_temp_c: 14.5,
        ambient_humidity_pct: 61.0,
        ambient_temp_c: 18.25,
        enclosure_humidity_pct: 35.0,
        enclosure_temp_c: 24.0,
        battery_volts,
        radio: RadioDiagnostics {
            access_technology: 7,
            signal_strength_pct: 55.0,
            signal_quality_pct: 80.0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn battery_percentage_is_clamped() {
        let now = Utc::now();
        assert_eq!(sample_at(now, 2.5).battery_pct(), 0.0);
        assert_eq!(sample_at(now, 4.5).battery_pct(), 100.0);
        assert!((sample_at(now, 3.6).battery_pct() - 50.0).abs() < 0.01);
    }

    #[test]
    fn payload_uses_the_collector_field_names() {
        let sample = sample_at(Utc::now(), 4.2);
        let value = serde_json::to_value(DeliveryPayload::new(&sample, 2, 1)).unwrap();

        assert_eq!(value["soil6"], json!(60.0));
        assert_eq!(value["precip"], json!(7));
        assert_eq!(value["soiltemp"], json!(14.5));
        assert_eq!(value["itemp"], json!(24.0));
        assert_eq!(value["battery"], json!(100.0));
        assert_eq!(value["rat"], json!(7));
        assert_eq!(value["resets"], json!(2));
        assert_eq!(value["alerts"], json!(1));
        assert_eq!(value.as_object().unwrap().len(), 18);
    }
}
