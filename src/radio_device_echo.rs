//! Echo radio device: loops every transmitted envelope straight back into
//! the receive queue with perfect link readings.
//!
//! The simplest possible backend. No airtime, no loss, no timing: useful
//! for exercising the full seal/open/replay path on a single node without
//! hardware or a network simulator. Since a node ignores its own frames on
//! receive, the echoed traffic exercises the drop path too.

use log::{log, Level};

use crate::envelope::EncryptedFrame;
use crate::radio::RadioLink;
use crate::{ReceivedEnvelope, RxEnvelopeQueueSender};

/// RSSI reported for echoed envelopes: as strong as it gets.
const ECHO_RSSI_DBM: i8 = -30;

/// Link quality reported for echoed envelopes: the top of the advisory
/// scale.
const ECHO_LINK_QUALITY: u8 = 255;

/// Loopback radio. The receive-queue sender is attached during node
/// initialization; an unattached device refuses every send.
pub struct RadioDevice {
    rx_envelope_queue_sender: Option<RxEnvelopeQueueSender>,
}

impl RadioDevice {
    pub const fn new() -> Self {
        RadioDevice {
            rx_envelope_queue_sender: None,
        }
    }

    pub(crate) fn attach(&mut self, sender: RxEnvelopeQueueSender) {
        self.rx_envelope_queue_sender = Some(sender);
    }
}

impl Default for RadioDevice {
    fn default() -> Self {
        RadioDevice::new()
    }
}

impl RadioLink for RadioDevice {
    fn send(&mut self, envelope: &EncryptedFrame) -> bool {
        let sender = match &self.rx_envelope_queue_sender {
            Some(sender) => sender,
            None => return false,
        };
        let received = ReceivedEnvelope {
            envelope: *envelope,
            rssi_dbm: ECHO_RSSI_DBM,
            link_quality: ECHO_LINK_QUALITY,
        };
        if sender.try_send(received).is_err() {
            // Transmission itself succeeded; only the echo is lost.
            log!(Level::Warn, "RX queue full, dropping echoed envelope");
        }
        true
    }
}
