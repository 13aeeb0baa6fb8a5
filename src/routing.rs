//! Mesh routing: a bounded neighbor table with ingest/merge, hysteresis-free
//! best-parent selection, a strike-based blacklist and the duplicate/TTL
//! guard applied to forwarded frames.
//!
//! All mutations are infallible from the caller's view. Capacity overflows
//! truncate silently (no-append for routes, oldest-slot overwrite for the
//! seen window and blacklist); the mesh metrics expose what was dropped.

use log::{log, Level};

use crate::fault::MeshMetrics;
use crate::telemetry::{MeshFrame, NodeId, RouteEntry, RoutingPayload};
use crate::{MAX_BLACKLIST, MAX_ROUTES, SEEN_WINDOW_SIZE};

#[derive(Clone, Copy, Default)]
struct BlacklistSlot {
    neighbor_id: NodeId,
    strikes: u8,
}

#[derive(Clone, Copy, Default)]
struct SeenSlot {
    src: NodeId,
    last_seq: u32,
}

/// Routing state for one node. Process-wide: initialized at boot, mutated
/// only by the routing and packet-builder paths.
pub struct RoutingTable {
    entries: [RouteEntry; MAX_ROUTES],
    entry_count: usize,
    version: u32,
    self_id: NodeId,
    blacklist: [BlacklistSlot; MAX_BLACKLIST],
    seen: [SeenSlot; SEEN_WINDOW_SIZE],
    last_parent: NodeId,
}

impl RoutingTable {
    pub fn new(self_id: NodeId) -> Self {
        RoutingTable {
            entries: [RouteEntry::default(); MAX_ROUTES],
            entry_count: 0,
            version: 0,
            self_id,
            blacklist: [BlacklistSlot::default(); MAX_BLACKLIST],
            seen: [SeenSlot::default(); SEEN_WINDOW_SIZE],
            last_parent: NodeId::EMPTY,
        }
    }

    /// Drops all routes, strikes and seen-window state. Self id persists.
    pub fn reset(&mut self) {
        *self = RoutingTable::new(self.self_id);
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries[..self.entry_count]
    }

    /// Copies the table into the wire payload shipped with every frame.
    pub fn snapshot(&self, epoch_ms: u32) -> RoutingPayload {
        RoutingPayload {
            epoch_ms,
            version: self.version,
            entries: self.entries,
            entry_count: self.entry_count,
        }
    }

    /// Adds a route, overwriting in place when the neighbor is already
    /// known. A full table silently drops new neighbors.
    pub fn add_route_entry(&mut self, entry: RouteEntry) {
        for existing in self.entries[..self.entry_count].iter_mut() {
            if existing.neighbor_id == entry.neighbor_id {
                *existing = entry;
                self.version += 1;
                self.prune_and_sort();
                return;
            }
        }
        if self.entry_count < MAX_ROUTES {
            self.entries[self.entry_count] = entry;
            self.entry_count += 1;
            self.version += 1;
        }
        self.prune_and_sort();
    }

    /// Ingests a neighbor's advertised routing payload.
    ///
    /// The direct link to the neighbor is recorded first at cost 1, then
    /// each advertised entry is merged with one extra hop of cost and a
    /// link quality capped by the quality of the link the advertisement
    /// arrived on. Entries naming this node are skipped. Returns true iff
    /// the table version advanced.
    pub fn ingest_route_update(
        &mut self,
        payload: &RoutingPayload,
        neighbor_id: NodeId,
        link_quality: u8,
        rssi_dbm: i8,
    ) -> bool {
        if neighbor_id.is_empty() {
            return false;
        }
        let prev_version = self.version;

        self.add_route_entry(RouteEntry {
            neighbor_id,
            rssi_dbm,
            link_quality,
            cost: 1,
        });

        for advertised in &payload.entries[..payload.entry_count.min(MAX_ROUTES)] {
            if advertised.neighbor_id == self.self_id {
                continue;
            }
            let mut candidate = *advertised;
            candidate.cost = candidate.cost.saturating_add(1);
            candidate.link_quality = candidate.link_quality.min(link_quality);
            self.add_route_entry(candidate);
        }
        self.version != prev_version
    }

    /// Prunes, sorts and returns the head entry as the current parent.
    ///
    /// An empty table returns an empty entry. A head that differs from the
    /// previously observed parent counts as a parent change.
    pub fn select_best_parent(&mut self, metrics: &mut MeshMetrics) -> RouteEntry {
        self.prune_and_sort();
        if self.entry_count == 0 {
            return RouteEntry::default();
        }
        let best = self.entries[0];
        if !best.neighbor_id.is_empty() && best.neighbor_id != self.last_parent {
            metrics.parent_changes += 1;
            log!(
                Level::Debug,
                "[{}] parent changed: {} -> {}",
                self.self_id,
                self.last_parent,
                best.neighbor_id
            );
            self.last_parent = best.neighbor_id;
        }
        best
    }

    /// Adds a strike against a neighbor and removes it from the table.
    pub fn blacklist(&mut self, neighbor_id: NodeId, metrics: &mut MeshMetrics) {
        if neighbor_id.is_empty() {
            return;
        }
        metrics.blacklist_hits += 1;

        for slot in self.blacklist.iter_mut() {
            if slot.strikes > 0 && slot.neighbor_id == neighbor_id {
                slot.strikes = slot.strikes.saturating_add(1);
                self.prune_and_sort();
                return;
            }
        }
        for slot in self.blacklist.iter_mut() {
            if slot.neighbor_id.is_empty() {
                slot.neighbor_id = neighbor_id;
                slot.strikes = 1;
                self.prune_and_sort();
                return;
            }
        }
        // No free slot: sacrifice slot 0.
        self.blacklist[0] = BlacklistSlot {
            neighbor_id,
            strikes: 1,
        };
        self.prune_and_sort();
    }

    pub fn is_blacklisted(&self, neighbor_id: &NodeId) -> bool {
        self.blacklist
            .iter()
            .any(|slot| slot.strikes > 0 && slot.neighbor_id == *neighbor_id)
    }

    /// TTL and duplicate guard for the forwarding path.
    ///
    /// Accepting a frame increments its hop count in place; the caller is
    /// expected to re-seal and enqueue it.
    pub fn should_forward(&mut self, frame: &mut MeshFrame, metrics: &mut MeshMetrics) -> bool {
        if frame.header.ttl == 0 || frame.header.hop_count >= frame.header.ttl {
            metrics.ttl_drops += 1;
            return false;
        }
        if self.seen_before(&frame.header.src_node_id, frame.header.seq_no) {
            return false;
        }
        frame.header.hop_count += 1;
        true
    }

    fn seen_before(&mut self, src: &NodeId, seq_no: u32) -> bool {
        for slot in self.seen.iter_mut() {
            if slot.src.is_empty() {
                slot.src = *src;
                slot.last_seq = seq_no;
                return false;
            }
            if slot.src == *src {
                if seq_no <= slot.last_seq {
                    return true;
                }
                slot.last_seq = seq_no;
                return false;
            }
        }
        // Window full: overwrite the oldest slot.
        self.seen[0] = SeenSlot {
            src: *src,
            last_seq: seq_no,
        };
        false
    }

    /// Removes blacklisted rows and re-establishes the sort order
    /// `(link_quality desc, cost asc)`, ties keeping insertion order.
    fn prune_and_sort(&mut self) {
        let mut kept: [RouteEntry; MAX_ROUTES] = [RouteEntry::default(); MAX_ROUTES];
        let mut kept_count = 0;
        for entry in &self.entries[..self.entry_count] {
            if self.is_blacklisted(&entry.neighbor_id) {
                continue;
            }
            kept[kept_count] = *entry;
            kept_count += 1;
        }

        // Insertion sort: stable, allocation-free, and the table is small.
        let mut i = 1;
        while i < kept_count {
            let current = kept[i];
            let mut j = i;
            while j > 0 && ranks_before(&current, &kept[j - 1]) {
                kept[j] = kept[j - 1];
                j -= 1;
            }
            kept[j] = current;
            i += 1;
        }

        self.entries = kept;
        self.entry_count = kept_count;
    }
}

fn ranks_before(a: &RouteEntry, b: &RouteEntry) -> bool {
    if a.link_quality != b.link_quality {
        return a.link_quality > b.link_quality;
    }
    a.cost < b.cost
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    fn entry(id: &str, rssi: i8, lq: u8, cost: u8) -> RouteEntry {
        RouteEntry {
            neighbor_id: NodeId::new(id),
            rssi_dbm: rssi,
            link_quality: lq,
            cost,
        }
    }

    fn payload_of(entries: &[RouteEntry]) -> RoutingPayload {
        let mut p = RoutingPayload::default();
        for (i, e) in entries.iter().enumerate() {
            p.entries[i] = *e;
        }
        p.entry_count = entries.len();
        p
    }

    #[test]
    fn capacity_is_never_exceeded() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        for i in 0..(MAX_ROUTES + 4) {
            let id = format!("N{:02}", i);
            table.add_route_entry(entry(&id, -50, 100 + i as u8, i as u8));
            assert!(table.entry_count() <= MAX_ROUTES);
        }
    }

    #[test]
    fn entries_sort_by_quality_then_cost() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        table.add_route_entry(entry("low", -80, 50, 1));
        table.add_route_entry(entry("high-far", -60, 200, 3));
        table.add_route_entry(entry("high-near", -60, 200, 1));
        table.add_route_entry(entry("mid", -70, 120, 2));

        let ids: Vec<&str> = table.entries().iter().map(|e| e.neighbor_id.as_str()).collect();
        assert_eq!(ids, ["high-near", "high-far", "mid", "low"]);
    }

    #[test]
    fn equal_keys_keep_insertion_order() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        table.add_route_entry(entry("first", -60, 180, 2));
        table.add_route_entry(entry("second", -61, 180, 2));
        table.add_route_entry(entry("third", -62, 180, 2));

        let ids: Vec<&str> = table.entries().iter().map(|e| e.neighbor_id.as_str()).collect();
        assert_eq!(ids, ["first", "second", "third"]);
    }

    #[test]
    fn replace_keeps_neighbor_ids_distinct() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        table.add_route_entry(entry("A", -60, 180, 1));
        table.add_route_entry(entry("A", -55, 190, 2));
        assert_eq!(table.entry_count(), 1);
        assert_eq!(table.entries()[0].link_quality, 190);
        assert_eq!(table.entries()[0].cost, 2);
    }

    #[test]
    fn ingest_records_direct_link_and_merges_with_cost() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        let advertised = payload_of(&[entry("C", -70, 150, 2), entry("self", -60, 250, 1)]);

        let changed = table.ingest_route_update(&advertised, NodeId::new("B"), 120, -65);
        assert!(changed);

        // Direct link to B at cost 1.
        let b = table.entries().iter().find(|e| e.neighbor_id.as_str() == "B").unwrap();
        assert_eq!(b.cost, 1);
        assert_eq!(b.link_quality, 120);

        // C merged with +1 cost, link quality clamped to the B link.
        let c = table.entries().iter().find(|e| e.neighbor_id.as_str() == "C").unwrap();
        assert_eq!(c.cost, 3);
        assert_eq!(c.link_quality, 120);

        // The advertisement naming this node never lands in the table.
        assert!(table.entries().iter().all(|e| e.neighbor_id.as_str() != "self"));
    }

    #[test]
    fn ingest_saturates_cost() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        let advertised = payload_of(&[entry("far", -90, 90, 255)]);
        table.ingest_route_update(&advertised, NodeId::new("B"), 100, -70);
        let far = table.entries().iter().find(|e| e.neighbor_id.as_str() == "far").unwrap();
        assert_eq!(far.cost, 255);
    }

    #[test]
    fn ingest_with_empty_neighbor_is_rejected() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        let advertised = payload_of(&[entry("C", -70, 150, 2)]);
        assert!(!table.ingest_route_update(&advertised, NodeId::EMPTY, 120, -65));
        assert_eq!(table.entry_count(), 0);
    }

    #[test]
    fn parent_preference_scenario() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        let mut metrics = MeshMetrics::default();

        table.ingest_route_update(&payload_of(&[entry("A", -60, 180, 1)]), NodeId::new("A"), 180, -60);
        let parent = table.select_best_parent(&mut metrics);
        assert_eq!(parent.neighbor_id.as_str(), "A");

        table.ingest_route_update(&payload_of(&[entry("B", -55, 200, 1)]), NodeId::new("B"), 200, -55);
        let parent = table.select_best_parent(&mut metrics);
        assert_eq!(parent.neighbor_id.as_str(), "B");
        assert!(metrics.parent_changes >= 1);

        table.blacklist(NodeId::new("B"), &mut metrics);
        let parent = table.select_best_parent(&mut metrics);
        assert_ne!(parent.neighbor_id.as_str(), "B");
        assert!(metrics.blacklist_hits >= 1);
    }

    #[test]
    fn blacklisted_neighbor_is_pruned_and_stays_out() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        let mut metrics = MeshMetrics::default();
        table.add_route_entry(entry("bad", -50, 250, 1));
        table.add_route_entry(entry("ok", -70, 100, 2));

        table.blacklist(NodeId::new("bad"), &mut metrics);
        assert!(table.is_blacklisted(&NodeId::new("bad")));
        assert!(table.entries().iter().all(|e| e.neighbor_id.as_str() != "bad"));

        // Re-learning the neighbor from a later advertisement is pruned too.
        table.add_route_entry(entry("bad", -50, 250, 1));
        assert!(table.entries().iter().all(|e| e.neighbor_id.as_str() != "bad"));
    }

    #[test]
    fn blacklist_strikes_saturate() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        let mut metrics = MeshMetrics::default();
        for _ in 0..300 {
            table.blacklist(NodeId::new("bad"), &mut metrics);
        }
        assert!(table.is_blacklisted(&NodeId::new("bad")));
        assert_eq!(metrics.blacklist_hits, 300);
    }

    #[test]
    fn blacklist_overflow_overwrites_slot_zero() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        let mut metrics = MeshMetrics::default();
        table.blacklist(NodeId::new("b0"), &mut metrics);
        table.blacklist(NodeId::new("b1"), &mut metrics);
        table.blacklist(NodeId::new("b2"), &mut metrics);
        table.blacklist(NodeId::new("b3"), &mut metrics);
        table.blacklist(NodeId::new("b4"), &mut metrics);

        assert!(table.is_blacklisted(&NodeId::new("b4")));
        assert!(!table.is_blacklisted(&NodeId::new("b0")));
    }

    #[test]
    fn ttl_guard_drops_exhausted_frames() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        let mut metrics = MeshMetrics::default();

        let mut frame = MeshFrame::default();
        frame.header.ttl = 1;
        frame.header.hop_count = 1;
        frame.header.src_node_id = NodeId::new("src");
        frame.header.seq_no = 42;

        assert!(!table.should_forward(&mut frame, &mut metrics));
        assert!(metrics.ttl_drops >= 1);

        frame.header.ttl = 0;
        frame.header.hop_count = 0;
        assert!(!table.should_forward(&mut frame, &mut metrics));
        assert_eq!(metrics.ttl_drops, 2);
    }

    #[test]
    fn duplicate_suppression_accepts_first_only() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        let mut metrics = MeshMetrics::default();

        let mut frame = MeshFrame::default();
        frame.header.ttl = 3;
        frame.header.hop_count = 1;
        frame.header.src_node_id = NodeId::new("X");
        frame.header.seq_no = 42;

        assert!(table.should_forward(&mut frame, &mut metrics));
        assert_eq!(frame.header.hop_count, 2);

        frame.header.hop_count = 1;
        assert!(!table.should_forward(&mut frame, &mut metrics));

        // A later sequence from the same source passes again.
        frame.header.seq_no = 43;
        assert!(table.should_forward(&mut frame, &mut metrics));
    }

    #[test]
    fn version_never_regresses_under_repeated_ingest() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        let payload = payload_of(&[entry("node-A", -60, 180, 1), entry("node-B", -70, 120, 2)]);

        assert!(table.ingest_route_update(&payload, NodeId::new("node-A"), 180, -60));
        let v1 = table.version();
        table.ingest_route_update(&payload, NodeId::new("node-A"), 180, -60);
        assert!(table.version() >= v1);
    }

    #[test]
    fn churn_respects_capacity() {
        let mut table = RoutingTable::new(NodeId::new("self"));
        for i in 0..20 {
            let id = format!("N{:02}", i);
            let payload = payload_of(&[
                entry(&id, -50, 150 + (i % 40) as u8, 1),
                entry("node-A", -60, 180, 1),
            ]);
            table.ingest_route_update(&payload, NodeId::new(&id), 150 + (i % 40) as u8, -50);
            assert!(table.entry_count() <= MAX_ROUTES);
        }
    }
}
