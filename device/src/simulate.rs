use chrono::{DateTime, Utc};
use rand::Rng;

use crate::errors::MeasurementError;
use crate::types::{MeasurementSample, RadioDiagnostics};

/// Source of measurement samples; real hardware drivers sit behind this.
pub trait MeasurementProvider {
    fn measure(&mut self, now: DateTime<Utc>) -> Result<MeasurementSample, MeasurementError>;
}

/// Produces plausible readings until real sensor drivers are wired in.
pub struct SimulatedProvider {
    failure_rate: f64,
    precipitation_tips: u32,
    battery_volts: f32,
}

impl SimulatedProvider {
    pub fn new(failure_rate: f64) -> Self {
        SimulatedProvider {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            precipitation_tips: 0,
            battery_volts: 4.1,
        }
    }
}

impl MeasurementProvider for SimulatedProvider {
    fn measure(&mut self, now: DateTime<Utc>) -> Result<MeasurementSample, MeasurementError> {
        let mut rng = rand::thread_rng();
        if rng.gen_bool(self.failure_rate) {
            return Err(MeasurementError("sensor bus did not respond".to_string()));
        }

        let mut soil_moisture_pct = [0.0f32; 6];
        for channel in soil_moisture_pct.iter_mut() {
            *channel = rng.gen_range(15.0..45.0);
        }
        if rng.gen_bool(0.2) {
            self.precipitation_tips += rng.gen_range(1..5);
        }
        // Slow drain with some sensor noise.
        self.battery_volts = (self.battery_volts - rng.gen_range(0.0..0.002)).max(3.3);

        Ok(MeasurementSample {
            timestamp: now,
            soil_moisture_pct,
            precipitation_tips: self.precipitation_tips,
            soil_temp_c: rng.gen_range(8.0..16.0),
            ambient_humidity_pct: rng.gen_range(40.0..80.0),
            ambient_temp_c: rng.gen_range(5.0..25.0),
            enclosure_humidity_pct: rng.gen_range(20.0..40.0),
            enclosure_temp_c: rng.gen_range(10.0..30.0),
            battery_volts: self.battery_volts + rng.gen_range(-0.01..0.01),
            radio: RadioDiagnostics {
                access_technology: 7,
                signal_strength_pct: rng.gen_range(20.0..90.0),
                signal_quality_pct: rng.gen_range(30.0..100.0),
            },
        })
    }
}
