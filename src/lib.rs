#![cfg_attr(not(feature = "std"), no_std)]

//! Core of a low-power RF anomaly-sensing mesh node.
//!
//! Four subsystems define the node's behavior on the wire and under
//! failure: a fixed-plan cooperative scheduler, a self-describing frame
//! codec, an authenticated frame envelope with replay suppression, and a
//! bounded mesh routing layer. Everything else (radio PHY, sensors, the
//! anomaly model, the OTA downloader, the watchdog) is injected through a
//! small set of callables.

#[cfg(all(feature = "radio-device-echo", feature = "radio-device-simulator"))]
compile_error!("Only one radio device feature can be enabled at a time");

#[cfg(feature = "radio-device-echo")]
pub mod radio_device_echo;

#[cfg(feature = "radio-device-simulator")]
pub mod radio_device_simulator;

#[cfg(feature = "radio-device-echo")]
use crate::radio_device_echo::RadioDevice;

#[cfg(feature = "radio-device-simulator")]
use crate::radio_device_simulator::RadioDevice;

pub mod codec;
pub mod envelope;
pub mod fault;
pub mod ota;
pub mod radio;
pub mod routing;
pub mod scheduler;
pub mod sensors;
pub mod telemetry;
pub mod transport;
pub mod watchdog;

#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
use embassy_executor::Spawner;
#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
use embassy_futures::select::{select, Either};
#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
use embassy_sync::channel::Channel;
#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
use embassy_time::{Duration, Instant, Timer};
#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
use log::{log, Level};

pub use codec::{decode_mesh_frame_clear, encode_mesh_frame, EncodedFrame};
pub use envelope::{
    decrypt_mesh_frame, derive_nonce, encrypt_mesh_frame, open, seal, EncryptedFrame, MeshKey,
    ReplayWindow,
};
pub use fault::{FaultCounters, FaultMonitor, FaultStatus, MeshMetrics};
pub use ota::{OtaState, OtaStatus, OtaUpdater};
pub use radio::{
    calculate_link_quality, current_radio_transport, normalize, set_radio_transport, RadioLink,
    RadioTransport,
};
pub use routing::RoutingTable;
pub use scheduler::{task_plan, NodeRuntime, TaskConfig, TaskHeartbeat, TaskKind, TaskStatus};
#[cfg(feature = "std")]
pub use sensors::synthetic_sensor_suite;
pub use sensors::SensorSuite;
pub use telemetry::{
    FrameCounters, FrameHeader, FrameSecurity, GpsStatus, HealthStatus, MeshFrame, MsgType, NodeId,
    RFEvent, RFSampleWindow, RfFeatures, RouteEntry, RoutingPayload, TelemetryPayload,
};
pub use transport::TransportQueue;
pub use watchdog::WatchdogHooks;

// Wire-format constants. Changing any of these breaks compatibility with
// deployed nodes.
pub const PROTOCOL_VERSION: u8 = 1;
pub const MAX_NODE_ID_LEN: usize = 16;
pub const MAX_RF_SAMPLES: usize = 128;
pub const MAX_ROUTES: usize = 8;
pub const NONCE_LEN: usize = 12;
pub const AUTH_TAG_LEN: usize = 16;
pub const ENVELOPE_OVERHEAD: usize = NONCE_LEN + AUTH_TAG_LEN;
pub const MESH_KEY_LEN: usize = 32;
pub const MAX_FRAME_LEN: usize = 256;
pub const MAX_ENVELOPE_LEN: usize = MAX_FRAME_LEN + 32;

// Tuning constants. These only affect a single node's behavior.
pub const DEFAULT_TTL: u8 = 4;
pub const MODEL_VERSION: u8 = 1;
pub const SEEN_WINDOW_SIZE: usize = 8;
pub const REPLAY_WINDOW_SIZE: usize = 8;
pub const MAX_BLACKLIST: usize = 4;
pub const TRANSPORT_QUEUE_DEPTH: usize = 4;
pub const TRANSPORT_MAX_RETRIES: u8 = 3;
pub const TRANSPORT_RETRY_BACKOFF_MS: u32 = 250;
pub const LINK_MTU: usize = 200;
pub const MAX_FRAGMENTS: usize = 3;
pub const SCHEDULER_TICK_MS: u32 = 250;
pub const TASK_COUNT: usize = 8;

#[cfg(feature = "radio-device-simulator")]
pub(crate) const MAX_NODE_COUNT: usize = 1000;

#[cfg(all(feature = "radio-device-echo", not(feature = "radio-device-simulator")))]
pub(crate) const MAX_NODE_COUNT: usize = 1;

/// Errors recognized by the mesh core. All of them resolve into counter
/// increments or silent drops; none unwind the scheduler loop.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum MeshError {
    /// Encoder would exceed [`MAX_FRAME_LEN`]; the frame is dropped with
    /// nothing observable on the wire.
    EncodeTooLarge,
    /// Wire bytes do not conform; dropped without touching replay state.
    DecodeMalformed,
    /// Authenticator mismatch on decrypt.
    AuthFail,
    /// Sequence number not advancing for a known source.
    Replay,
    /// Transport queue saturated at push.
    QueueFull,
}

/// Node configuration, loaded once at boot and immutable afterwards.
#[derive(Clone, Copy)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub report_interval_ms: u32,
    pub rf_center_freq_hz: u32,
    pub fft_size: u16,
    pub anomaly_threshold: f32,
    pub heartbeat_interval_ms: u32,
    pub mesh_key: [u8; MESH_KEY_LEN],
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_id: NodeId::new("node-001"),
            report_interval_ms: 1000,
            rf_center_freq_hz: 915_000_000,
            fft_size: 128,
            anomaly_threshold: 0.8,
            heartbeat_interval_ms: 1000,
            mesh_key: [0x11; MESH_KEY_LEN],
        }
    }
}

/// An envelope as handed up by the radio, with the receive-side link
/// measurements the routing layer needs.
pub struct ReceivedEnvelope {
    pub envelope: EncryptedFrame,
    pub rssi_dbm: i8,
    pub link_quality: u8,
}

const RX_ENVELOPE_QUEUE_SIZE: usize = 8;
type RxEnvelopeQueue = embassy_sync::channel::Channel<
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    ReceivedEnvelope,
    RX_ENVELOPE_QUEUE_SIZE,
>;
pub type RxEnvelopeQueueReceiver = embassy_sync::channel::Receiver<
    'static,
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    ReceivedEnvelope,
    RX_ENVELOPE_QUEUE_SIZE,
>;
pub type RxEnvelopeQueueSender = embassy_sync::channel::Sender<
    'static,
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    ReceivedEnvelope,
    RX_ENVELOPE_QUEUE_SIZE,
>;

#[cfg(feature = "embedded")]
static RX_ENVELOPE_QUEUE: RxEnvelopeQueue = embassy_sync::channel::Channel::new();

const INCOMING_FRAME_QUEUE_SIZE: usize = 4;
type IncomingFrameQueue = embassy_sync::channel::Channel<
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    MeshFrame,
    INCOMING_FRAME_QUEUE_SIZE,
>;
pub type IncomingFrameQueueReceiver = embassy_sync::channel::Receiver<
    'static,
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    MeshFrame,
    INCOMING_FRAME_QUEUE_SIZE,
>;
pub type IncomingFrameQueueSender = embassy_sync::channel::Sender<
    'static,
    embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex,
    MeshFrame,
    INCOMING_FRAME_QUEUE_SIZE,
>;

#[cfg(feature = "embedded")]
static INCOMING_FRAME_QUEUE: IncomingFrameQueue = embassy_sync::channel::Channel::new();

pub enum ReceiveFrameError {
    NotInited,
}

pub enum InjectEnvelopeError {
    NotInited,
    QueueFull,
}

/// Drives the node: services the received-envelope queue between scheduler
/// ticks and advances the firmware cycle on every tick.
#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
#[embassy_executor::task(pool_size = MAX_NODE_COUNT)]
async fn node_runtime_task(
    mut runtime: NodeRuntime<RadioDevice>,
    rx_envelope_queue_receiver: RxEnvelopeQueueReceiver,
    incoming_frame_queue_sender: IncomingFrameQueueSender,
) -> ! {
    let boot = Instant::now();
    log!(Level::Info, "[{}] node runtime task started", runtime.node_id());
    loop {
        match select(
            rx_envelope_queue_receiver.receive(),
            Timer::after(Duration::from_millis(SCHEDULER_TICK_MS as u64)),
        )
        .await
        {
            Either::First(received) => {
                let now_ms = boot.elapsed().as_millis() as u32;
                if let Some(frame) = runtime.handle_received_envelope(&received, now_ms) {
                    if incoming_frame_queue_sender.try_send(frame).is_err() {
                        log!(
                            Level::Warn,
                            "[{}] incoming frame queue full, dropping frame",
                            runtime.node_id()
                        );
                    }
                }
            }
            Either::Second(_) => {
                let now_ms = boot.elapsed().as_millis() as u32;
                runtime.run_firmware_cycle(now_ms);
            }
        }
    }
}

#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
enum MeshNodeState {
    Uninitialized,
    Initialized {
        incoming_frame_queue_receiver: IncomingFrameQueueReceiver,
        rx_envelope_queue_sender: RxEnvelopeQueueSender,
    },
}

/// Public facade over one node: spawns the runtime task and exposes the
/// decoded-frame stream plus the envelope injection point for the radio
/// receive path.
#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
pub struct MeshNode {
    state: MeshNodeState,
}

#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
impl MeshNode {
    pub const fn new() -> Self {
        MeshNode {
            state: MeshNodeState::Uninitialized,
        }
    }

    #[cfg(feature = "embedded")]
    pub fn initialize(
        &mut self,
        cfg: NodeConfig,
        spawner: Spawner,
        radio_device: RadioDevice,
        sensors: SensorSuite,
        watchdog: WatchdogHooks,
    ) -> Result<(), ()> {
        self.initialize_common(
            cfg,
            spawner,
            radio_device,
            sensors,
            watchdog,
            &RX_ENVELOPE_QUEUE,
            &INCOMING_FRAME_QUEUE,
        )
    }

    #[cfg(all(feature = "std", not(feature = "embedded")))]
    pub fn initialize(
        &mut self,
        cfg: NodeConfig,
        spawner: Spawner,
        radio_device: RadioDevice,
        sensors: SensorSuite,
        watchdog: WatchdogHooks,
    ) -> Result<(), ()> {
        let rx_envelope_queue: &'static RxEnvelopeQueue = Box::leak(Box::new(Channel::new()));
        let incoming_frame_queue: &'static IncomingFrameQueue = Box::leak(Box::new(Channel::new()));
        self.initialize_common(
            cfg,
            spawner,
            radio_device,
            sensors,
            watchdog,
            rx_envelope_queue,
            incoming_frame_queue,
        )
    }

    #[allow(unused_mut)]
    fn initialize_common(
        &mut self,
        cfg: NodeConfig,
        spawner: Spawner,
        mut radio_device: RadioDevice,
        sensors: SensorSuite,
        watchdog: WatchdogHooks,
        rx_envelope_queue: &'static RxEnvelopeQueue,
        incoming_frame_queue: &'static IncomingFrameQueue,
    ) -> Result<(), ()> {
        #[cfg(feature = "radio-device-echo")]
        radio_device.attach(rx_envelope_queue.sender());

        let runtime = NodeRuntime::with_watchdog(cfg, sensors, radio_device, watchdog);
        if spawner
            .spawn(node_runtime_task(
                runtime,
                rx_envelope_queue.receiver(),
                incoming_frame_queue.sender(),
            ))
            .is_err()
        {
            return Err(());
        }
        log!(Level::Debug, "Node runtime task spawned");

        self.state = MeshNodeState::Initialized {
            incoming_frame_queue_receiver: incoming_frame_queue.receiver(),
            rx_envelope_queue_sender: rx_envelope_queue.sender(),
        };
        Ok(())
    }

    /// Next decoded frame addressed to this node (or broadcast).
    pub async fn receive_frame(&self) -> Result<MeshFrame, ReceiveFrameError> {
        match &self.state {
            MeshNodeState::Uninitialized => Err(ReceiveFrameError::NotInited),
            MeshNodeState::Initialized {
                incoming_frame_queue_receiver,
                ..
            } => Ok(incoming_frame_queue_receiver.receive().await),
        }
    }

    /// Feed point for the radio receive path (interrupt handler or network
    /// simulator): hands one on-air envelope to the runtime.
    pub fn inject_envelope(&self, received: ReceivedEnvelope) -> Result<(), InjectEnvelopeError> {
        match &self.state {
            MeshNodeState::Uninitialized => Err(InjectEnvelopeError::NotInited),
            MeshNodeState::Initialized {
                rx_envelope_queue_sender,
                ..
            } => rx_envelope_queue_sender
                .try_send(received)
                .map_err(|_| InjectEnvelopeError::QueueFull),
        }
    }
}

#[cfg(any(feature = "radio-device-echo", feature = "radio-device-simulator"))]
impl Default for MeshNode {
    fn default() -> Self {
        MeshNode::new()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn node_config_defaults_are_sane() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id.as_str(), "node-001");
        assert!(cfg.node_id.len() <= MAX_NODE_ID_LEN - 1);
        assert_eq!(cfg.mesh_key.len(), MESH_KEY_LEN);
        assert!(cfg.anomaly_threshold > 0.0 && cfg.anomaly_threshold <= 1.0);
    }

    #[test]
    fn envelope_bounds_are_consistent() {
        assert_eq!(ENVELOPE_OVERHEAD, 28);
        assert!(MAX_FRAME_LEN + ENVELOPE_OVERHEAD <= MAX_ENVELOPE_LEN);
        assert!(MAX_ENVELOPE_LEN <= MAX_FRAGMENTS * LINK_MTU);
    }
}

#[cfg(all(
    test,
    feature = "std",
    any(feature = "radio-device-echo", feature = "radio-device-simulator")
))]
mod manager_tests {
    use super::*;
    use futures::executor::block_on;

    #[test]
    fn receive_frame_before_initialize_fails() {
        let node = MeshNode::new();
        let result = block_on(async { node.receive_frame().await });
        assert!(matches!(result, Err(ReceiveFrameError::NotInited)));
    }

    #[test]
    fn inject_envelope_before_initialize_fails() {
        let node = MeshNode::new();
        let received = ReceivedEnvelope {
            envelope: EncryptedFrame::default(),
            rssi_dbm: -60,
            link_quality: 200,
        };
        assert!(matches!(
            node.inject_envelope(received),
            Err(InjectEnvelopeError::NotInited)
        ));
    }
}
