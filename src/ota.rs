//! Over-the-air update status tracking. The downloader itself is external;
//! this module only drives the state machine that telemetry reports and the
//! fault sink observes.

use log::{log, Level};

/// OTA state machine position.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum OtaState {
    #[default]
    Idle = 0,
    Downloading = 1,
    Verifying = 2,
    Applying = 3,
    Rollback = 4,
    Failed = 5,
}

impl OtaState {
    pub(crate) fn from_wire(value: u32) -> Option<OtaState> {
        match value {
            0 => Some(OtaState::Idle),
            1 => Some(OtaState::Downloading),
            2 => Some(OtaState::Verifying),
            3 => Some(OtaState::Applying),
            4 => Some(OtaState::Rollback),
            5 => Some(OtaState::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct OtaStatus {
    pub state: OtaState,
    pub current_offset: u32,
    pub total_size: u32,
    pub signature_valid: bool,
}

/// Tracks download progress reported by the external OTA downloader.
///
/// Failed verifies and rollbacks latch a failure event; the OTA task drains
/// it into the fault sink on its next release.
#[derive(Clone, Copy, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct OtaUpdater {
    status: OtaStatus,
    pending_failure: bool,
}

impl OtaUpdater {
    pub const fn new() -> Self {
        OtaUpdater {
            status: OtaStatus {
                state: OtaState::Idle,
                current_offset: 0,
                total_size: 0,
                signature_valid: false,
            },
            pending_failure: false,
        }
    }

    pub fn reset(&mut self) {
        *self = OtaUpdater::new();
    }

    /// Records one received image chunk. The first chunk moves the state
    /// machine out of `Idle`.
    pub fn apply_chunk(&mut self, offset: u32, len: usize) {
        if self.status.state == OtaState::Idle {
            self.status.state = OtaState::Downloading;
        }
        self.status.current_offset = offset.saturating_add(len as u32);
        if self.status.total_size == 0 {
            self.status.total_size = self.status.current_offset;
        }
        log!(Level::Debug, "OTA chunk received: offset={} len={}", offset, len);
    }

    /// Marks the downloaded image verified (or not) and advances to
    /// `Applying` or `Failed`. Returns the verdict.
    pub fn verify_and_mark(&mut self, signature_valid: bool) -> bool {
        self.status.state = OtaState::Verifying;
        self.status.signature_valid = signature_valid;
        if signature_valid {
            self.status.state = OtaState::Applying;
        } else {
            self.status.state = OtaState::Failed;
            self.pending_failure = true;
        }
        signature_valid
    }

    /// Abandons the current image and records a rollback.
    pub fn mark_rollback(&mut self) {
        self.status.state = OtaState::Rollback;
        self.status.signature_valid = false;
        self.pending_failure = true;
    }

    /// Returns and clears the latched failure event.
    pub(crate) fn take_failure_event(&mut self) -> bool {
        let pending = self.pending_failure;
        self.pending_failure = false;
        pending
    }

    pub fn status(&self) -> OtaStatus {
        self.status
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn first_chunk_starts_download() {
        let mut ota = OtaUpdater::new();
        assert_eq!(ota.status().state, OtaState::Idle);

        ota.apply_chunk(0, 512);
        let status = ota.status();
        assert_eq!(status.state, OtaState::Downloading);
        assert_eq!(status.current_offset, 512);
    }

    #[test]
    fn verify_success_moves_to_applying() {
        let mut ota = OtaUpdater::new();
        ota.apply_chunk(0, 1024);
        assert!(ota.verify_and_mark(true));
        let status = ota.status();
        assert_eq!(status.state, OtaState::Applying);
        assert!(status.signature_valid);
        assert!(!ota.take_failure_event());
    }

    #[test]
    fn verify_failure_moves_to_failed_and_latches_event() {
        let mut ota = OtaUpdater::new();
        ota.apply_chunk(0, 1024);
        assert!(!ota.verify_and_mark(false));
        assert_eq!(ota.status().state, OtaState::Failed);
        assert!(!ota.status().signature_valid);

        // The failure event reads once, then clears.
        assert!(ota.take_failure_event());
        assert!(!ota.take_failure_event());
    }

    #[test]
    fn rollback_latches_failure_event() {
        let mut ota = OtaUpdater::new();
        ota.apply_chunk(0, 1024);
        ota.verify_and_mark(true);
        ota.mark_rollback();
        assert_eq!(ota.status().state, OtaState::Rollback);
        assert!(ota.take_failure_event());
    }

    #[test]
    fn ota_state_rejects_unknown_wire_values() {
        assert_eq!(OtaState::from_wire(3), Some(OtaState::Applying));
        assert_eq!(OtaState::from_wire(6), None);
    }
}
