//! Buffer of pending membership events awaiting dissemination.
//!
//! Each event is piggybacked on outgoing probes until it has been
//! transmitted `ceil(3 * log2(n))` times, the classic infection-style
//! budget that reaches every member with high probability while keeping
//! per-probe overhead constant.

use crate::types::MemberId;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Kind of membership rumor.
///
/// `Alive`, `Suspect`, and `Confirm` describe one member's state and
/// supersede each other in that priority order at equal incarnation.
/// `Join` and `Leave` are standalone announcements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum GossipKind {
    Alive,
    Suspect,
    Confirm,
    Join,
    Leave,
}

impl GossipKind {
    /// Whether this kind participates in the Alive/Suspect/Confirm
    /// supersession order.
    pub fn is_state(self) -> bool {
        matches!(self, GossipKind::Alive | GossipKind::Suspect | GossipKind::Confirm)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipEvent {
    pub kind: GossipKind,
    pub address: String,
    pub provider_id: u16,
    pub incarnation: u64,
}

impl GossipEvent {
    pub fn new(kind: GossipKind, id: &MemberId, incarnation: u64) -> Self {
        Self {
            kind,
            address: id.address.clone(),
            provider_id: id.provider_id,
            incarnation,
        }
    }

    pub fn member_id(&self) -> MemberId {
        MemberId::new(self.address.clone(), self.provider_id)
    }
}

#[derive(Debug)]
struct BufferedEvent {
    event: GossipEvent,
    transmissions: u32,
}

#[derive(Debug)]
struct BufferInner {
    entries: Vec<BufferedEvent>,
    max_transmissions: u32,
}

/// Bounded set of pending gossip events.
///
/// Holds at most one state entry (Alive/Suspect/Confirm) per member;
/// Join and Leave announcements coexist with state entries and with each
/// other until their transmission budget is spent.
#[derive(Debug)]
pub struct GossipBuffer {
    inner: Mutex<BufferInner>,
}

/// `ceil(3 * log2(n))`, with `n` clamped to at least 1.
fn transmission_budget(group_size: usize) -> u32 {
    let n = group_size.max(1) as f64;
    (3.0 * n.log2()).ceil() as u32
}

impl GossipBuffer {
    pub fn new(group_size: usize) -> Self {
        Self {
            inner: Mutex::new(BufferInner {
                entries: Vec::new(),
                max_transmissions: transmission_budget(group_size),
            }),
        }
    }

    /// Insert or merge an event.
    ///
    /// An existing state entry for the same member is replaced when the
    /// incoming incarnation is strictly greater, or on a tie when the
    /// incoming kind has strictly higher priority. Join/Leave entries are
    /// only replaced by a same-kind event with a strictly greater
    /// incarnation. Replacement resets the transmission counter.
    pub fn push(&self, event: GossipEvent) {
        let mut inner = self.inner.lock().unwrap();

        let existing = inner.entries.iter().position(|buffered| {
            let cur = &buffered.event;
            cur.address == event.address
                && cur.provider_id == event.provider_id
                && if event.kind.is_state() {
                    cur.kind.is_state()
                } else {
                    cur.kind == event.kind
                }
        });

        match existing {
            Some(pos) => {
                let buffered = &mut inner.entries[pos];
                let cur = &buffered.event;
                let supersedes = event.incarnation > cur.incarnation
                    || (event.incarnation == cur.incarnation
                        && event.kind.is_state()
                        && event.kind > cur.kind);
                if supersedes {
                    buffered.event = event;
                    buffered.transmissions = 0;
                }
            }
            None => inner.entries.push(BufferedEvent { event, transmissions: 0 }),
        }
    }

    /// Return up to `max` events with remaining budget, in insertion
    /// order, incrementing each returned event's counter. Events are not
    /// removed; exhausted entries are reaped by [`GossipBuffer::cleanup`].
    pub fn gather(&self, max: usize) -> Vec<GossipEvent> {
        let mut inner = self.inner.lock().unwrap();
        let limit = inner.max_transmissions;

        let mut out = Vec::new();
        for buffered in inner.entries.iter_mut() {
            if out.len() >= max {
                break;
            }
            if buffered.transmissions < limit {
                buffered.transmissions += 1;
                out.push(buffered.event.clone());
            }
        }
        out
    }

    /// Drop entries whose transmission budget is spent.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().unwrap();
        let limit = inner.max_transmissions;
        inner.entries.retain(|b| b.transmissions < limit);
    }

    /// Recompute the transmission budget for the current group size. The
    /// new budget applies to existing and future entries alike.
    pub fn set_group_size(&self, group_size: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_transmissions = transmission_budget(group_size);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current per-entry transmission ceiling.
    pub fn max_transmissions(&self) -> u32 {
        self.inner.lock().unwrap().max_transmissions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: GossipKind, incarnation: u64) -> GossipEvent {
        GossipEvent {
            kind,
            address: "mem://a".into(),
            provider_id: 0,
            incarnation,
        }
    }

    #[test]
    fn test_budget_formula() {
        assert_eq!(transmission_budget(0), 0);
        assert_eq!(transmission_budget(1), 0);
        assert_eq!(transmission_budget(2), 3);
        assert_eq!(transmission_budget(3), 5);
        assert_eq!(transmission_budget(8), 9);
    }

    #[test]
    fn test_gather_respects_budget() {
        let buffer = GossipBuffer::new(2); // budget 3
        buffer.push(event(GossipKind::Alive, 0));

        let mut returned = 0;
        for _ in 0..10 {
            returned += buffer.gather(8).len();
        }
        assert_eq!(returned, 3);

        buffer.cleanup();
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_higher_incarnation_replaces_and_resets() {
        let buffer = GossipBuffer::new(2);
        buffer.push(event(GossipKind::Suspect, 1));
        assert_eq!(buffer.gather(8).len(), 1); // one transmission spent

        // lower incarnation ignored
        buffer.push(event(GossipKind::Confirm, 0));
        assert_eq!(buffer.gather(8)[0].kind, GossipKind::Suspect);

        // strictly higher incarnation wins even with lower priority
        buffer.push(event(GossipKind::Alive, 2));
        let gathered = buffer.gather(8);
        assert_eq!(gathered[0].kind, GossipKind::Alive);
        assert_eq!(gathered[0].incarnation, 2);

        // counter was reset: transmissions so far = 1, budget 3 remains
        assert_eq!(buffer.gather(8).len(), 1);
        assert_eq!(buffer.gather(8).len(), 1);
        assert_eq!(buffer.gather(8).len(), 0);
    }

    #[test]
    fn test_priority_order_at_equal_incarnation() {
        let buffer = GossipBuffer::new(2);
        buffer.push(event(GossipKind::Alive, 5));
        buffer.push(event(GossipKind::Suspect, 5));
        assert_eq!(buffer.gather(8)[0].kind, GossipKind::Suspect);

        buffer.push(event(GossipKind::Confirm, 5));
        assert_eq!(buffer.gather(8)[0].kind, GossipKind::Confirm);

        // and never downgrades
        buffer.push(event(GossipKind::Alive, 5));
        buffer.push(event(GossipKind::Suspect, 5));
        assert_eq!(buffer.gather(8)[0].kind, GossipKind::Confirm);
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_join_coexists_with_state() {
        let buffer = GossipBuffer::new(4);
        buffer.push(event(GossipKind::Join, 0));
        buffer.push(event(GossipKind::Alive, 0));
        assert_eq!(buffer.len(), 2);

        // a state event never displaces the announcement
        buffer.push(event(GossipKind::Confirm, 9));
        let kinds: Vec<GossipKind> = buffer.gather(8).iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&GossipKind::Join));
        assert!(kinds.contains(&GossipKind::Confirm));
    }

    #[test]
    fn test_gather_in_insertion_order() {
        let buffer = GossipBuffer::new(4);
        for (i, addr) in ["mem://x", "mem://y", "mem://z"].iter().enumerate() {
            buffer.push(GossipEvent {
                kind: GossipKind::Alive,
                address: addr.to_string(),
                provider_id: 0,
                incarnation: i as u64,
            });
        }
        let addrs: Vec<String> = buffer.gather(8).into_iter().map(|e| e.address).collect();
        assert_eq!(addrs, vec!["mem://x", "mem://y", "mem://z"]);
    }

    #[test]
    fn test_gather_caps_at_max() {
        let buffer = GossipBuffer::new(16);
        for i in 0..12 {
            buffer.push(GossipEvent {
                kind: GossipKind::Alive,
                address: format!("mem://{i}"),
                provider_id: 0,
                incarnation: 0,
            });
        }
        assert_eq!(buffer.gather(8).len(), 8);
    }

    #[test]
    fn test_group_size_change_applies_to_existing() {
        let buffer = GossipBuffer::new(2); // budget 3
        buffer.push(event(GossipKind::Alive, 0));
        assert_eq!(buffer.gather(8).len(), 1);

        buffer.set_group_size(1); // budget 0: entry is exhausted
        assert_eq!(buffer.gather(8).len(), 0);
        buffer.cleanup();
        assert!(buffer.is_empty());
    }
}
