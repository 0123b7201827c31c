//! Partition-local event grid and segment membership bits.
//!
//! Everything here is touched only by the partition's owning worker
//! thread; the enclosing mutex exists for the borrow checker, not for
//! contention.

use std::collections::HashMap;

use evq_common::PartitionId;

/// One event in an actor's time-ordered stream. Values are stored in
/// wire units: doubles scaled ×10,000, text as literal hash, bool as 0/1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Unix-millisecond event timestamp.
    pub stamp: i64,
    /// `(schema column index, scaled value)` pairs.
    pub values: Vec<(usize, i64)>,
}

impl Event {
    /// Value of `column` on this event, if present.
    pub fn value(&self, column: usize) -> Option<i64> {
        self.values
            .iter()
            .find(|(c, _)| *c == column)
            .map(|(_, v)| *v)
    }
}

/// One actor (person) and its event stream.
#[derive(Debug, Clone)]
pub struct Actor {
    /// Stable sharding hash of the actor id.
    pub id_hash: i64,
    /// Original string id when the actor was inserted with one.
    pub id_string: Option<String>,
    /// Events ordered by `stamp`.
    pub events: Vec<Event>,
}

impl Actor {
    /// Insert preserving stamp order; ties append after existing equals.
    pub fn insert_event(&mut self, event: Event) {
        let at = self.events.partition_point(|e| e.stamp <= event.stamp);
        self.events.insert(at, event);
    }

    /// Split the event stream into sessions at gaps larger than
    /// `session_time_ms`. Returns `(start, end)` index ranges.
    pub fn sessions(&self, session_time_ms: i64) -> Vec<(usize, usize)> {
        if self.events.is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut start = 0_usize;
        for i in 1..self.events.len() {
            if self.events[i].stamp - self.events[i - 1].stamp > session_time_ms {
                out.push((start, i));
                start = i;
            }
        }
        out.push((start, self.events.len()));
        out
    }

    /// Distinct values of `column` across all events.
    pub fn distinct_values(&self, column: usize) -> Vec<i64> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for e in &self.events {
            if let Some(v) = e.value(column) {
                if seen.insert(v) {
                    out.push(v);
                }
            }
        }
        out
    }
}

/// Boolean-per-actor membership for one named segment, indexed by the
/// actor's linear id within the partition.
#[derive(Debug, Clone, Default)]
pub struct SegmentBits {
    /// Membership flags, one per linear actor id.
    pub bits: Vec<bool>,
}

impl SegmentBits {
    /// Member count.
    pub fn population(&self) -> usize {
        self.bits.iter().filter(|b| **b).count()
    }

    /// Membership of `lin`, false when out of range.
    pub fn is_member(&self, lin: usize) -> bool {
        self.bits.get(lin).copied().unwrap_or(false)
    }
}

/// Per-(table × partition) store: actors, segment bits, interned text.
#[derive(Debug)]
pub struct TablePartition {
    partition: PartitionId,
    actors: Vec<Actor>,
    index: HashMap<i64, usize>,
    segments: HashMap<String, SegmentBits>,
    literals: HashMap<i64, String>,
}

impl TablePartition {
    /// Empty store for `partition`.
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            actors: Vec::new(),
            index: HashMap::new(),
            segments: HashMap::new(),
            literals: HashMap::new(),
        }
    }

    /// Partition id.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Actor count (exclusive upper bound of linear ids).
    pub fn actor_count(&self) -> usize {
        self.actors.len()
    }

    /// Actor by linear id.
    pub fn actor_by_lin(&self, lin: usize) -> Option<&Actor> {
        self.actors.get(lin)
    }

    /// Actor by sharding hash.
    pub fn actor_by_hash(&self, id_hash: i64) -> Option<&Actor> {
        self.index.get(&id_hash).and_then(|lin| self.actors.get(*lin))
    }

    /// Find or create the actor, returning its linear id.
    pub fn upsert_actor(&mut self, id_hash: i64, id_string: Option<&str>) -> usize {
        if let Some(&lin) = self.index.get(&id_hash) {
            if self.actors[lin].id_string.is_none() {
                self.actors[lin].id_string = id_string.map(|s| s.to_string());
            }
            return lin;
        }
        let lin = self.actors.len();
        self.actors.push(Actor {
            id_hash,
            id_string: id_string.map(|s| s.to_string()),
            events: Vec::new(),
        });
        self.index.insert(id_hash, lin);
        lin
    }

    /// Append one event to the actor at `lin`.
    pub fn insert_event(&mut self, lin: usize, event: Event) {
        if let Some(actor) = self.actors.get_mut(lin) {
            actor.insert_event(event);
        }
    }

    /// Intern a text value, returning its stable hash.
    pub fn intern(&mut self, text: &str) -> i64 {
        let hash = evq_common::hash_bytes(text.as_bytes());
        self.literals.entry(hash).or_insert_with(|| text.to_string());
        hash
    }

    /// Literal text for a hash, if interned on this partition.
    pub fn literal(&self, hash: i64) -> Option<&str> {
        self.literals.get(&hash).map(|s| s.as_str())
    }

    /// Replace the membership bits of a named segment.
    pub fn commit_segment(&mut self, name: &str, bits: SegmentBits) {
        self.segments.insert(name.to_string(), bits);
    }

    /// Membership bits of a named segment.
    pub fn segment(&self, name: &str) -> Option<&SegmentBits> {
        self.segments.get(name)
    }

    /// True when the named segment has been materialised here.
    pub fn has_segment(&self, name: &str) -> bool {
        self.segments.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_stay_stamp_ordered() {
        let mut p = TablePartition::new(PartitionId(0));
        let lin = p.upsert_actor(42, Some("alice"));
        for stamp in [50_i64, 10, 30] {
            p.insert_event(lin, Event { stamp, values: vec![] });
        }
        let stamps: Vec<i64> = p.actor_by_lin(lin).unwrap().events.iter().map(|e| e.stamp).collect();
        assert_eq!(stamps, vec![10, 30, 50]);
    }

    #[test]
    fn sessions_split_on_gap() {
        let mut actor = Actor {
            id_hash: 1,
            id_string: None,
            events: Vec::new(),
        };
        for stamp in [0_i64, 1_000, 100_000, 101_000, 300_000] {
            actor.insert_event(Event { stamp, values: vec![] });
        }
        let sessions = actor.sessions(60_000);
        assert_eq!(sessions, vec![(0, 2), (2, 4), (4, 5)]);
    }

    #[test]
    fn upsert_is_idempotent_per_hash() {
        let mut p = TablePartition::new(PartitionId(3));
        let a = p.upsert_actor(7, None);
        let b = p.upsert_actor(7, Some("bob"));
        assert_eq!(a, b);
        assert_eq!(p.actor_count(), 1);
        assert_eq!(p.actor_by_hash(7).unwrap().id_string.as_deref(), Some("bob"));
    }
}
