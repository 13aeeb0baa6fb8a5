//! Sensor and model injection point.
//!
//! The ADC front-end, GNSS receiver, health sensors and the anomaly model
//! are external; the scheduler only needs five functions. They are plain
//! function pointers rather than a trait so the embassy runtime task stays
//! monomorphic.

use crate::telemetry::{GpsStatus, HealthStatus, RFSampleWindow, RfFeatures};

/// The five collaborator functions the periodic tasks call.
#[derive(Clone, Copy)]
pub struct SensorSuite {
    pub collect_rf_window: fn(now_ms: u32) -> RFSampleWindow,
    pub read_gps_status: fn(now_ms: u32) -> GpsStatus,
    pub read_health_status: fn(now_ms: u32) -> HealthStatus,
    pub extract_rf_features: fn(window: &RFSampleWindow) -> RfFeatures,
    pub run_model_inference: fn(features: &RfFeatures) -> f32,
}

#[cfg(feature = "std")]
mod synthetic {
    //! Host-side synthetic suite: a ramp-plus-tone sample window, an O(N^2)
    //! DFT magnitude front-end and a peak-over-average toy score. Used by
    //! the scheduler tests and the host harness.

    use super::*;
    use crate::MAX_RF_SAMPLES;

    pub(super) fn collect_rf_window(now_ms: u32) -> RFSampleWindow {
        let mut window = RFSampleWindow {
            timestamp_ms: now_ms,
            center_freq_hz: 915_000_000,
            samples: [0i16; MAX_RF_SAMPLES],
            sample_count: MAX_RF_SAMPLES,
        };
        for (i, sample) in window.samples.iter_mut().enumerate() {
            *sample = (i % 64) as i16;
        }
        // A single strong sample stands in for a tone.
        window.samples[5] = 200;
        window
    }

    pub(super) fn read_gps_status(now_ms: u32) -> GpsStatus {
        GpsStatus {
            timestamp_ms: now_ms,
            latitude_deg: 37.7749,
            longitude_deg: -122.4194,
            altitude_m: 10.0,
            num_sats: 7,
            hdop: 1.2,
            valid_fix: true,
            jamming_detected: false,
            spoof_detected: false,
            cn0_db_hz_avg: 38.0,
        }
    }

    pub(super) fn read_health_status(now_ms: u32) -> HealthStatus {
        HealthStatus {
            timestamp_ms: now_ms,
            battery_v: 3.7,
            temp_c: 25.0,
            imu_tilt_deg: 0.5,
            tamper_flag: false,
        }
    }

    fn dft_magnitude(window: &RFSampleWindow, k: usize) -> f32 {
        let n = window.sample_count;
        let inv_n = 1.0f32 / n as f32;
        let mut re = 0.0f32;
        let mut im = 0.0f32;
        for (i, &sample) in window.samples[..n].iter().enumerate() {
            let angle = -2.0 * core::f32::consts::PI * (k * i) as f32 * inv_n;
            re += sample as f32 * angle.cos();
            im += sample as f32 * angle.sin();
        }
        (re * re + im * im).sqrt() * inv_n
    }

    pub(super) fn extract_rf_features(window: &RFSampleWindow) -> RfFeatures {
        if window.sample_count == 0 {
            return RfFeatures::default();
        }
        let bins = window.sample_count / 2 + 1;
        let mut peak = 0.0f32;
        let mut sum = 0.0f32;
        for k in 0..bins {
            let mag = dft_magnitude(window, k);
            if mag > peak {
                peak = mag;
            }
            sum += mag;
        }
        let avg = sum / bins as f32;

        RfFeatures {
            avg_dbm: 20.0 * avg.max(1e-6).log10() - 30.0,
            peak_dbm: 20.0 * peak.max(1e-6).log10() - 20.0,
        }
    }

    pub(super) fn run_model_inference(features: &RfFeatures) -> f32 {
        let delta = features.peak_dbm - features.avg_dbm;
        (delta / 20.0).clamp(0.0, 1.0)
    }
}

/// A complete host-side suite with fixed readings and the synthetic RF
/// front-end.
#[cfg(feature = "std")]
pub fn synthetic_sensor_suite() -> SensorSuite {
    SensorSuite {
        collect_rf_window: synthetic::collect_rf_window,
        read_gps_status: synthetic::read_gps_status,
        read_health_status: synthetic::read_health_status,
        extract_rf_features: synthetic::extract_rf_features,
        run_model_inference: synthetic::run_model_inference,
    }
}
