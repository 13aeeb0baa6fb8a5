//! Radio abstraction: the single seam between the mesh core and whatever
//! moves bytes over the air.
//!
//! The three supported transports (ESP-NOW, raw Wi-Fi, LoRa) differ only in
//! the injected callable, so the core sees one method: `send` an envelope,
//! get back whether the driver accepted it. The transport mode selection is
//! advisory and does not change core semantics.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::envelope::EncryptedFrame;

/// The radio driver interface. Returning false triggers a retry upstream.
///
/// Implementations must not block; drivers with blocking hardware paths
/// wrap their own timeout.
pub trait RadioLink {
    fn send(&mut self, envelope: &EncryptedFrame) -> bool;
}

/// Any `FnMut(&EncryptedFrame) -> bool` is a valid radio backend.
impl<F> RadioLink for F
where
    F: FnMut(&EncryptedFrame) -> bool,
{
    fn send(&mut self, envelope: &EncryptedFrame) -> bool {
        self(envelope)
    }
}

/// Physical transport behind the radio driver.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum RadioTransport {
    EspNow = 0,
    WifiRaw = 1,
    LoRa = 2,
}

static TRANSPORT_MODE: AtomicU8 = AtomicU8::new(RadioTransport::EspNow as u8);

pub fn set_radio_transport(mode: RadioTransport) {
    TRANSPORT_MODE.store(mode as u8, Ordering::Relaxed);
}

pub fn current_radio_transport() -> RadioTransport {
    match TRANSPORT_MODE.load(Ordering::Relaxed) {
        1 => RadioTransport::WifiRaw,
        2 => RadioTransport::LoRa,
        _ => RadioTransport::EspNow,
    }
}

/// Lower bound for decodable signals (dBm). Anything weaker sits below the
/// noise floor.
const RSSI_MIN: i16 = -120;

/// Upper bound for very strong signals (dBm).
const RSSI_MAX: i16 = -30;

/// Lower SNR bound (dB); negative values are decodable on spread-spectrum
/// links.
const SNR_MIN: i16 = -20;

/// Upper SNR bound (dB) for a clean channel.
const SNR_MAX: i16 = 10;

/// Clamps `value` into `[min, max]` and scales it linearly onto 0..=255.
pub fn normalize(value: i16, min: i16, max: i16) -> u8 {
    let clamped = value.max(min).min(max);
    let shifted = clamped - min;
    let scaled = (shifted as u32 * 255) / (max - min) as u32;
    scaled as u8
}

/// Combines RSSI and SNR into the 0-255 advisory link quality carried in
/// route entries. SNR is weighted heavier (70 %) since it tracks link
/// reliability better than raw signal strength.
pub fn calculate_link_quality(rssi: i16, snr: i16) -> u8 {
    let norm_rssi = normalize(rssi, RSSI_MIN, RSSI_MAX);
    let norm_snr = normalize(snr, SNR_MIN, SNR_MAX);
    ((3 * norm_rssi as u32 + 7 * norm_snr as u32) / 10) as u8
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn transport_mode_round_trips() {
        set_radio_transport(RadioTransport::LoRa);
        assert_eq!(current_radio_transport(), RadioTransport::LoRa);
        set_radio_transport(RadioTransport::WifiRaw);
        assert_eq!(current_radio_transport(), RadioTransport::WifiRaw);
        set_radio_transport(RadioTransport::EspNow);
        assert_eq!(current_radio_transport(), RadioTransport::EspNow);
    }

    #[test]
    fn normalize_clamps_and_scales() {
        assert_eq!(normalize(RSSI_MIN, RSSI_MIN, RSSI_MAX), 0);
        assert_eq!(normalize(RSSI_MAX, RSSI_MIN, RSSI_MAX), 255);
        assert_eq!(normalize(-150, RSSI_MIN, RSSI_MAX), 0);
        assert_eq!(normalize(-20, RSSI_MIN, RSSI_MAX), 255);

        let mid = normalize((RSSI_MIN + RSSI_MAX) / 2, RSSI_MIN, RSSI_MAX);
        assert!(mid > 100 && mid < 160);
    }

    #[test]
    fn link_quality_tracks_signal() {
        let good = calculate_link_quality(-70, 5);
        let poor = calculate_link_quality(-110, -15);
        assert!(good > poor);
        assert_eq!(calculate_link_quality(RSSI_MAX, SNR_MAX), 255);
        assert_eq!(calculate_link_quality(RSSI_MIN, SNR_MIN), 0);
    }

    #[test]
    fn snr_outweighs_rssi() {
        let high_snr = calculate_link_quality(RSSI_MIN, SNR_MAX);
        let high_rssi = calculate_link_quality(RSSI_MAX, SNR_MIN);
        assert!(high_snr > high_rssi);
    }

    #[test]
    fn closures_are_radio_links() {
        let mut hits = 0u32;
        let mut radio = |_env: &EncryptedFrame| {
            hits += 1;
            true
        };
        let env = EncryptedFrame::default();
        assert!(radio.send(&env));
        drop(radio);
        assert_eq!(hits, 1);
    }
}
