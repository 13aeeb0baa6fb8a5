//! Fixed-plan cooperative scheduler and the node runtime it drives.
//!
//! The plan is eight periodic tasks with priorities, periods and watchdog
//! budgets. On the device the host RTOS preempts between them; on the
//! portable harness [`NodeRuntime::run_firmware_cycle`] releases every due
//! task in a deterministic order for a given sequence of `now_ms` values.
//! Task bodies never block: they read latest-value slots and return.

use log::{log, Level};

use crate::envelope::{decrypt_mesh_frame, MeshKey, ReplayWindow};
use crate::fault::{FaultMonitor, FaultStatus, MeshMetrics};
use crate::ota::OtaUpdater;
use crate::radio::RadioLink;
use crate::routing::RoutingTable;
use crate::sensors::SensorSuite;
use crate::telemetry::{
    GpsStatus, HealthStatus, MeshFrame, MsgType, NodeId, RFEvent, RFSampleWindow, RouteEntry,
    RoutingPayload,
};
use crate::transport::TransportQueue;
use crate::watchdog::WatchdogHooks;
use crate::{NodeConfig, ReceivedEnvelope, DEFAULT_TTL, MAX_RF_SAMPLES, PROTOCOL_VERSION, TASK_COUNT};

/// Which body a plan entry runs.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum TaskKind {
    FaultMonitor,
    RfScan,
    FftInference,
    PacketBuilder,
    Transport,
    Gnss,
    SensorHealth,
    Ota,
}

/// One entry of the task plan.
#[derive(Clone, Copy)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct TaskConfig {
    pub name: &'static str,
    pub priority: u8,
    pub stack_words: u16,
    pub period_ms: u32,
    pub watchdog_protected: bool,
    pub watchdog_budget_ms: u32,
    pub kind: TaskKind,
}

const TASK_PLAN: [TaskConfig; TASK_COUNT] = [
    TaskConfig {
        name: "FaultMonitor",
        priority: 6,
        stack_words: 768,
        period_ms: 250,
        watchdog_protected: true,
        watchdog_budget_ms: 750,
        kind: TaskKind::FaultMonitor,
    },
    TaskConfig {
        name: "RFScan",
        priority: 5,
        stack_words: 2048,
        period_ms: 500,
        watchdog_protected: true,
        watchdog_budget_ms: 1000,
        kind: TaskKind::RfScan,
    },
    TaskConfig {
        name: "FFTInference",
        priority: 5,
        stack_words: 3584,
        period_ms: 500,
        watchdog_protected: true,
        watchdog_budget_ms: 1000,
        kind: TaskKind::FftInference,
    },
    TaskConfig {
        name: "PacketBuilder",
        priority: 4,
        stack_words: 2048,
        period_ms: 1000,
        watchdog_protected: true,
        watchdog_budget_ms: 2000,
        kind: TaskKind::PacketBuilder,
    },
    TaskConfig {
        name: "Transport",
        priority: 4,
        stack_words: 2048,
        period_ms: 250,
        watchdog_protected: true,
        watchdog_budget_ms: 750,
        kind: TaskKind::Transport,
    },
    TaskConfig {
        name: "GNSS",
        priority: 3,
        stack_words: 1536,
        period_ms: 2000,
        watchdog_protected: false,
        watchdog_budget_ms: 0,
        kind: TaskKind::Gnss,
    },
    TaskConfig {
        name: "SensorHealth",
        priority: 3,
        stack_words: 1536,
        period_ms: 1000,
        watchdog_protected: true,
        watchdog_budget_ms: 2000,
        kind: TaskKind::SensorHealth,
    },
    TaskConfig {
        name: "OTA",
        priority: 2,
        stack_words: 2048,
        period_ms: 5000,
        watchdog_protected: true,
        watchdog_budget_ms: 8000,
        kind: TaskKind::Ota,
    },
];

/// The task plan in declaration order. This order is a public contract.
pub fn task_plan() -> &'static [TaskConfig; TASK_COUNT] {
    &TASK_PLAN
}

/// A task's last-execution timestamp.
#[derive(Clone, Copy, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct TaskHeartbeat {
    pub name: &'static str,
    pub last_beat_ms: u32,
}

/// Snapshot of every task heartbeat plus the fault state, returned by each
/// firmware cycle.
#[derive(Clone, Copy, Default)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct TaskStatus {
    pub rf_scan: TaskHeartbeat,
    pub fft: TaskHeartbeat,
    pub gnss: TaskHeartbeat,
    pub health: TaskHeartbeat,
    pub packet_builder: TaskHeartbeat,
    pub transport: TaskHeartbeat,
    pub ota: TaskHeartbeat,
    pub fault_monitor: TaskHeartbeat,
    pub faults: FaultStatus,
}

#[derive(Clone, Copy)]
struct TaskSlot {
    cfg: TaskConfig,
    next_release_ms: u32,
    last_beat_ms: u32,
}

/// Process-wide mutable state, owned by the scheduler driver and passed by
/// exclusive reference to each operation. Cleared only via explicit resets.
pub struct MeshState {
    pub(crate) seq_no: u32,
    pub(crate) last_rf_window: RFSampleWindow,
    pub(crate) last_rf_event: RFEvent,
    pub(crate) last_gps: GpsStatus,
    pub(crate) last_health: HealthStatus,
    pub(crate) routing: RoutingTable,
    pub(crate) metrics: MeshMetrics,
    pub(crate) fault: FaultMonitor,
    pub(crate) ota: OtaUpdater,
    pub(crate) replay: ReplayWindow,
    pub(crate) transport: TransportQueue,
}

impl MeshState {
    fn new(self_id: NodeId) -> Self {
        MeshState {
            seq_no: 0,
            last_rf_window: RFSampleWindow::default(),
            last_rf_event: RFEvent::default(),
            last_gps: GpsStatus::default(),
            last_health: HealthStatus::default(),
            routing: RoutingTable::new(self_id),
            metrics: MeshMetrics::default(),
            fault: FaultMonitor::new(),
            ota: OtaUpdater::new(),
            replay: ReplayWindow::new(),
            transport: TransportQueue::new(),
        }
    }
}

/// The node core: configuration, collaborators and all process-wide state,
/// advanced one cycle at a time.
pub struct NodeRuntime<R: RadioLink> {
    cfg: NodeConfig,
    key: MeshKey,
    sensors: SensorSuite,
    radio: R,
    watchdog: WatchdogHooks,
    state: MeshState,
    slots: [TaskSlot; TASK_COUNT],
}

impl<R: RadioLink> NodeRuntime<R> {
    pub fn new(cfg: NodeConfig, sensors: SensorSuite, radio: R) -> Self {
        Self::with_watchdog(cfg, sensors, radio, WatchdogHooks::disabled())
    }

    pub fn with_watchdog(cfg: NodeConfig, sensors: SensorSuite, radio: R, watchdog: WatchdogHooks) -> Self {
        let mut slots = [TaskSlot {
            cfg: TASK_PLAN[0],
            next_release_ms: 0,
            last_beat_ms: 0,
        }; TASK_COUNT];
        for (slot, cfg) in slots.iter_mut().zip(TASK_PLAN.iter()) {
            slot.cfg = *cfg;
        }
        sort_slots(&mut slots);

        let mut max_budget_ms = 0;
        for cfg in TASK_PLAN.iter() {
            if cfg.watchdog_protected && cfg.watchdog_budget_ms > max_budget_ms {
                max_budget_ms = cfg.watchdog_budget_ms;
            }
        }
        (watchdog.init)(max_budget_ms);
        for cfg in TASK_PLAN.iter() {
            if cfg.watchdog_protected {
                (watchdog.register_task)(cfg.name, cfg.watchdog_budget_ms);
            }
        }

        let key = MeshKey(cfg.mesh_key);
        let state = MeshState::new(cfg.node_id);
        log!(Level::Info, "[{}] node runtime initialized", cfg.node_id);

        NodeRuntime {
            cfg,
            key,
            sensors,
            radio,
            watchdog,
            state,
            slots,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.cfg
    }

    pub fn node_id(&self) -> NodeId {
        self.cfg.node_id
    }

    /// Task names in the order releases run within a tick: the stable sort
    /// of the plan by `(priority desc, period asc)`.
    pub fn execution_order(&self) -> [&'static str; TASK_COUNT] {
        let mut names = [""; TASK_COUNT];
        for (name, slot) in names.iter_mut().zip(self.slots.iter()) {
            *name = slot.cfg.name;
        }
        names
    }

    /// Runs every task whose period has expired, then the watchdog check.
    ///
    /// Deterministic: a given sequence of `now_ms` values always produces
    /// the same observable state.
    pub fn run_firmware_cycle(&mut self, now_ms: u32) -> TaskStatus {
        for i in 0..TASK_COUNT {
            if now_ms >= self.slots[i].next_release_ms {
                let kind = self.slots[i].cfg.kind;
                self.dispatch(kind, now_ms);
                self.slots[i].last_beat_ms = now_ms;
                self.slots[i].next_release_ms = now_ms + self.slots[i].cfg.period_ms;
                if self.slots[i].cfg.watchdog_protected {
                    (self.watchdog.feed)(self.slots[i].cfg.name);
                }
            }
            self.enforce_watchdog(i, now_ms);
        }
        self.status()
    }

    /// Opens, ingests and possibly forwards one received envelope.
    ///
    /// Returns the decoded frame when it is addressed to this node (or
    /// broadcast). Malformed, forged and replayed traffic is dropped
    /// silently per the receive-path error policy.
    pub fn handle_received_envelope(&mut self, received: &ReceivedEnvelope, now_ms: u32) -> Option<MeshFrame> {
        let frame = match decrypt_mesh_frame(received.envelope.as_slice(), &self.key, &mut self.state.replay) {
            Ok(frame) => frame,
            Err(err) => {
                log!(
                    Level::Debug,
                    "[{}] dropping envelope at t={}: {} (len={})",
                    self.cfg.node_id,
                    now_ms,
                    drop_reason(err),
                    received.envelope.len
                );
                return None;
            }
        };

        // Our own traffic reflected back by a neighbor.
        if frame.header.src_node_id == self.cfg.node_id {
            return None;
        }

        self.state.routing.ingest_route_update(
            &frame.routing,
            frame.header.src_node_id,
            received.link_quality,
            received.rssi_dbm,
        );

        let local = frame.header.dest_node_id.is_empty() || frame.header.dest_node_id == self.cfg.node_id;

        if frame.header.dest_node_id != self.cfg.node_id {
            let mut forwarded = frame;
            if self
                .state
                .routing
                .should_forward(&mut forwarded, &mut self.state.metrics)
            {
                if self.state.transport.push(forwarded).is_err() {
                    self.state.fault.record_fault("Transport queue full");
                }
            }
        }

        if local {
            Some(frame)
        } else {
            None
        }
    }

    /// Mesh metrics snapshot.
    pub fn metrics(&self) -> MeshMetrics {
        self.state.metrics
    }

    /// Zeroes the mesh counters. Fault counters persist.
    pub fn reset_mesh_metrics(&mut self) {
        self.state.metrics.reset();
    }

    pub fn fault_status(&self) -> FaultStatus {
        self.state.fault.status()
    }

    pub fn current_routing(&self, epoch_ms: u32) -> RoutingPayload {
        self.state.routing.snapshot(epoch_ms)
    }

    pub fn select_best_parent(&mut self) -> RouteEntry {
        self.state.routing.select_best_parent(&mut self.state.metrics)
    }

    pub fn blacklist_neighbor(&mut self, neighbor_id: NodeId) {
        self.state.routing.blacklist(neighbor_id, &mut self.state.metrics);
    }

    pub fn ingest_route_update(
        &mut self,
        payload: &RoutingPayload,
        neighbor_id: NodeId,
        link_quality: u8,
        rssi_dbm: i8,
    ) -> bool {
        self.state
            .routing
            .ingest_route_update(payload, neighbor_id, link_quality, rssi_dbm)
    }

    pub fn should_forward(&mut self, frame: &mut MeshFrame) -> bool {
        self.state.routing.should_forward(frame, &mut self.state.metrics)
    }

    /// External OTA downloader surface.
    pub fn ota_updater(&mut self) -> &mut OtaUpdater {
        &mut self.state.ota
    }

    fn dispatch(&mut self, kind: TaskKind, now_ms: u32) {
        match kind {
            TaskKind::FaultMonitor => {
                if self.state.last_health.tamper_flag {
                    self.state.fault.record_tamper();
                }
                if self.state.last_rf_event.anomaly_score > self.cfg.anomaly_threshold {
                    log!(
                        Level::Warn,
                        "[{}] anomaly score {} above threshold",
                        self.cfg.node_id,
                        self.state.last_rf_event.anomaly_score
                    );
                }
            }
            TaskKind::RfScan => {
                let mut window = (self.sensors.collect_rf_window)(now_ms);
                window.center_freq_hz = self.cfg.rf_center_freq_hz;
                window.sample_count = window
                    .sample_count
                    .min(self.cfg.fft_size as usize)
                    .min(MAX_RF_SAMPLES);
                self.state.last_rf_window = window;
            }
            TaskKind::FftInference => {
                let features = (self.sensors.extract_rf_features)(&self.state.last_rf_window);
                let score = (self.sensors.run_model_inference)(&features);
                self.state.last_rf_event = RFEvent {
                    timestamp_ms: now_ms,
                    center_freq_hz: self.cfg.rf_center_freq_hz,
                    features,
                    anomaly_score: score,
                    model_version: crate::MODEL_VERSION,
                };
            }
            TaskKind::PacketBuilder => self.task_packet_builder(now_ms),
            TaskKind::Transport => {
                self.state.transport.service(
                    now_ms,
                    &self.key,
                    &mut self.radio,
                    &mut self.state.metrics,
                    &mut self.state.fault,
                );
            }
            TaskKind::Gnss => {
                self.state.last_gps = (self.sensors.read_gps_status)(now_ms);
            }
            TaskKind::SensorHealth => {
                self.state.last_health = (self.sensors.read_health_status)(now_ms);
            }
            TaskKind::Ota => {
                // Progress is driven by the external downloader through
                // `ota_updater`; this task only accounts its failures.
                if self.state.ota.take_failure_event() {
                    self.state.fault.record_ota_failure();
                }
            }
        }
    }

    fn task_packet_builder(&mut self, now_ms: u32) {
        self.state.seq_no = self.state.seq_no.wrapping_add(1);

        let mut frame = MeshFrame::default();
        frame.header.version = PROTOCOL_VERSION;
        frame.header.msg_type = MsgType::Telemetry;
        frame.header.ttl = DEFAULT_TTL;
        frame.header.hop_count = 0;
        frame.header.seq_no = self.state.seq_no;
        frame.header.src_node_id = self.cfg.node_id;
        frame.header.dest_node_id = NodeId::EMPTY;

        // All-zero nonce: derived inside the envelope at seal time.
        frame.security.encrypted = true;

        frame.counters.tx_counter = self.state.seq_no;
        frame.counters.replay_window = 0;

        frame.telemetry.rf_event = self.state.last_rf_event;
        frame.telemetry.gps = self.state.last_gps;
        frame.telemetry.health = self.state.last_health;

        frame.routing = self.state.routing.snapshot(now_ms);
        frame.fault = self.state.fault.status();
        frame.ota = self.state.ota.status();

        if self.state.transport.push(frame).is_err() {
            self.state.fault.record_fault("Transport queue full");
            log!(Level::Warn, "[{}] transport queue full, frame dropped", self.cfg.node_id);
        }
    }

    fn enforce_watchdog(&mut self, slot_index: usize, now_ms: u32) {
        let slot = &self.slots[slot_index];
        if !slot.cfg.watchdog_protected {
            return;
        }
        let budget = if slot.cfg.watchdog_budget_ms != 0 {
            slot.cfg.watchdog_budget_ms
        } else {
            slot.cfg.period_ms * 2
        };
        if now_ms > slot.last_beat_ms && now_ms - slot.last_beat_ms > budget {
            self.state.fault.record_watchdog_reset();
        }
    }

    fn status(&self) -> TaskStatus {
        let mut status = TaskStatus::default();
        for slot in &self.slots {
            let hb = TaskHeartbeat {
                name: slot.cfg.name,
                last_beat_ms: slot.last_beat_ms,
            };
            match slot.cfg.kind {
                TaskKind::FaultMonitor => status.fault_monitor = hb,
                TaskKind::RfScan => status.rf_scan = hb,
                TaskKind::FftInference => status.fft = hb,
                TaskKind::PacketBuilder => status.packet_builder = hb,
                TaskKind::Transport => status.transport = hb,
                TaskKind::Gnss => status.gnss = hb,
                TaskKind::SensorHealth => status.health = hb,
                TaskKind::Ota => status.ota = hb,
            }
        }
        status.faults = self.state.fault.status();
        status
    }
}

/// Stable sort by `(priority desc, period asc)`; ties keep plan order.
fn sort_slots(slots: &mut [TaskSlot; TASK_COUNT]) {
    let mut i = 1;
    while i < TASK_COUNT {
        let current = slots[i];
        let mut j = i;
        while j > 0 && runs_before(&current.cfg, &slots[j - 1].cfg) {
            slots[j] = slots[j - 1];
            j -= 1;
        }
        slots[j] = current;
        i += 1;
    }
}

fn runs_before(a: &TaskConfig, b: &TaskConfig) -> bool {
    if a.priority != b.priority {
        return a.priority > b.priority;
    }
    a.period_ms < b.period_ms
}

fn drop_reason(err: crate::MeshError) -> &'static str {
    match err {
        crate::MeshError::DecodeMalformed => "malformed",
        crate::MeshError::AuthFail => "auth failure",
        crate::MeshError::Replay => "replay",
        crate::MeshError::EncodeTooLarge => "oversized",
        crate::MeshError::QueueFull => "queue full",
    }
}
