//! Simulated radio device for multi-node testing without hardware.
//!
//! Transmitted envelopes go to a network simulator through an "air" queue;
//! the simulator owns topology and delivery and feeds receiving nodes via
//! [`crate::MeshNode::inject_envelope`]. A configurable refusal rate models
//! a busy channel: the driver reports the send as not accepted, which
//! exercises the transport retry path exactly like a failed CAD on real
//! hardware.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::{log, Level};
use rand_core::RngCore;
use rand_core::SeedableRng;
use rand_wyrand::WyRand;

use crate::envelope::EncryptedFrame;
use crate::radio::RadioLink;

/// Size of the queue from simulated radios to the network simulator.
pub const AIR_QUEUE_SIZE: usize = 10;

/// Channel carrying transmitted envelopes to the network simulator.
pub type AirQueue = embassy_sync::channel::Channel<CriticalSectionRawMutex, EncryptedFrame, AIR_QUEUE_SIZE>;

/// Used by the network simulator to collect transmitted envelopes.
pub type AirQueueReceiver =
    embassy_sync::channel::Receiver<'static, CriticalSectionRawMutex, EncryptedFrame, AIR_QUEUE_SIZE>;

/// Used by simulated radio devices to transmit.
pub type AirQueueSender =
    embassy_sync::channel::Sender<'static, CriticalSectionRawMutex, EncryptedFrame, AIR_QUEUE_SIZE>;

/// Simulated radio with a deterministic, seedable refusal rate.
pub struct RadioDevice {
    air_queue_sender: AirQueueSender,
    refuse_permille: u16,
    rng: WyRand,
}

impl RadioDevice {
    /// Builds a simulated radio transmitting into `air_queue_sender`.
    ///
    /// `refuse_permille` of attempts (0..=1000) are refused as if the
    /// channel were busy; the refusal pattern is fully determined by
    /// `rng_seed`.
    pub fn with(air_queue_sender: AirQueueSender, refuse_permille: u16, rng_seed: u64) -> Self {
        RadioDevice {
            air_queue_sender,
            refuse_permille,
            rng: WyRand::seed_from_u64(rng_seed),
        }
    }
}

impl RadioLink for RadioDevice {
    fn send(&mut self, envelope: &EncryptedFrame) -> bool {
        if self.refuse_permille > 0 && self.rng.next_u32() % 1000 < self.refuse_permille as u32 {
            log!(Level::Trace, "simulated channel busy, refusing send");
            return false;
        }
        if self.air_queue_sender.try_send(*envelope).is_err() {
            log!(Level::Warn, "air queue full, refusing send");
            return false;
        }
        true
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    fn air_queue() -> &'static AirQueue {
        Box::leak(Box::new(AirQueue::new()))
    }

    #[test]
    fn lossless_device_transmits_everything() {
        let queue = air_queue();
        let mut device = RadioDevice::with(queue.sender(), 0, 42);
        let mut env = EncryptedFrame::default();
        env.len = 40;

        for _ in 0..AIR_QUEUE_SIZE {
            assert!(device.send(&env));
        }
        assert_eq!(queue.len(), AIR_QUEUE_SIZE);
    }

    #[test]
    fn fully_busy_channel_refuses_everything() {
        let queue = air_queue();
        let mut device = RadioDevice::with(queue.sender(), 1000, 42);
        let env = EncryptedFrame::default();

        for _ in 0..20 {
            assert!(!device.send(&env));
        }
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn refusal_pattern_is_deterministic_per_seed() {
        let queue_a = air_queue();
        let queue_b = air_queue();
        let mut a = RadioDevice::with(queue_a.sender(), 500, 7);
        let mut b = RadioDevice::with(queue_b.sender(), 500, 7);
        let env = EncryptedFrame::default();

        for _ in 0..50 {
            assert_eq!(a.send(&env), b.send(&env));
            // Drain so the queues never refuse for capacity reasons.
            let _ = queue_a.try_receive();
            let _ = queue_b.try_receive();
        }
    }
}
