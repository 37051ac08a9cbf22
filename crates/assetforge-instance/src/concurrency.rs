//! Concurrency slot storage
//!
//! Each concurrency key owns a list of slots. A slot is free or claimed by a
//! run. Lowering a limit removes free slots first; claimed slots beyond the
//! limit are marked deleted and disappear when their run frees them.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One slot of a concurrency key
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConcurrencySlot {
    /// Run holding the slot, if claimed
    #[serde(default)]
    pub run_id: Option<String>,

    /// Pending removal once freed
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl ConcurrencySlot {
    pub fn is_claimed(&self) -> bool {
        self.run_id.is_some()
    }
}

/// Claimed and total slot counts for a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SlotCounts {
    pub claimed: usize,
    pub total: usize,
}

impl SlotCounts {
    pub fn of(slots: &[ConcurrencySlot]) -> Self {
        Self {
            claimed: slots.iter().filter(|slot| slot.is_claimed()).count(),
            total: slots.len(),
        }
    }
}

/// Slots by concurrency key
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConcurrencyTable {
    slots: BTreeMap<String, Vec<ConcurrencySlot>>,
}

impl ConcurrencyTable {
    /// Keys with at least one live slot
    pub fn limited_keys(&self) -> BTreeSet<String> {
        self.slots
            .iter()
            .filter(|(_, slots)| slots.iter().any(|slot| !slot.deleted))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Live slots of a key
    pub fn info(&self, key: &str) -> Vec<ConcurrencySlot> {
        self.slots
            .get(key)
            .map(|slots| slots.iter().filter(|slot| !slot.deleted).cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any slot (live or pending deletion) exists for a key
    pub fn has_key(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Set the number of live slots for a key
    pub fn allocate(&mut self, key: &str, limit: usize) {
        let slots = self.slots.entry(key.to_string()).or_default();
        let live = slots.iter().filter(|slot| !slot.deleted).count();

        if limit > live {
            let mut missing = limit - live;
            // Revive claimed slots pending deletion before adding new ones
            for slot in slots.iter_mut().filter(|slot| slot.deleted) {
                if missing == 0 {
                    break;
                }
                slot.deleted = false;
                missing -= 1;
            }
            slots.extend(std::iter::repeat_with(ConcurrencySlot::default).take(missing));
        } else if limit < live {
            let mut excess = live - limit;
            slots.retain(|slot| {
                if excess > 0 && !slot.deleted && !slot.is_claimed() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
            for slot in slots.iter_mut().filter(|slot| !slot.deleted) {
                if excess == 0 {
                    break;
                }
                slot.deleted = true;
                excess -= 1;
            }
        }

        if slots.is_empty() {
            self.slots.remove(key);
        }
    }

    /// Claim a free live slot for a run; false when none is available
    pub fn claim(&mut self, key: &str, run_id: &str) -> bool {
        let Some(slots) = self.slots.get_mut(key) else {
            return false;
        };

        match slots.iter_mut().find(|slot| !slot.deleted && !slot.is_claimed()) {
            Some(slot) => {
                slot.run_id = Some(run_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Release every slot held by a run; returns how many were released
    pub fn free(&mut self, run_id: &str) -> usize {
        let mut freed = 0;

        for slots in self.slots.values_mut() {
            slots.retain_mut(|slot| {
                if slot.run_id.as_deref() != Some(run_id) {
                    return true;
                }
                freed += 1;
                slot.run_id = None;
                !slot.deleted
            });
        }
        self.slots.retain(|_, slots| !slots.is_empty());

        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn counts(table: &ConcurrencyTable, key: &str) -> (usize, usize) {
        let counts = SlotCounts::of(&table.info(key));
        (counts.claimed, counts.total)
    }

    #[test]
    fn allocate_grows_and_lists_keys() {
        let mut table = ConcurrencyTable::default();
        table.allocate("snowflake", 3);
        table.allocate("dbt", 1);

        assert_eq!(
            table.limited_keys(),
            BTreeSet::from(["dbt".to_string(), "snowflake".to_string()])
        );
        assert_eq!(counts(&table, "snowflake"), (0, 3));
    }

    #[test]
    fn shrinking_removes_free_slots_first() {
        let mut table = ConcurrencyTable::default();
        table.allocate("snowflake", 3);
        assert!(table.claim("snowflake", "run-1"));

        table.allocate("snowflake", 1);
        assert_eq!(counts(&table, "snowflake"), (1, 1));
        assert!(!table.claim("snowflake", "run-2"));
    }

    #[test]
    fn shrinking_below_claimed_marks_slots_deleted() {
        let mut table = ConcurrencyTable::default();
        table.allocate("snowflake", 2);
        assert!(table.claim("snowflake", "run-1"));
        assert!(table.claim("snowflake", "run-2"));

        table.allocate("snowflake", 0);
        assert!(table.limited_keys().is_empty());
        assert!(table.has_key("snowflake"));

        assert_eq!(table.free("run-1"), 1);
        assert_eq!(table.free("run-2"), 1);
        assert!(!table.has_key("snowflake"));
    }

    #[test]
    fn growing_revives_pending_deletions() {
        let mut table = ConcurrencyTable::default();
        table.allocate("snowflake", 1);
        assert!(table.claim("snowflake", "run-1"));
        table.allocate("snowflake", 0);

        table.allocate("snowflake", 2);
        assert_eq!(counts(&table, "snowflake"), (1, 2));
    }

    #[test]
    fn freeing_returns_slots_to_the_pool() {
        let mut table = ConcurrencyTable::default();
        table.allocate("snowflake", 1);
        assert!(table.claim("snowflake", "run-1"));
        assert!(!table.claim("snowflake", "run-2"));

        assert_eq!(table.free("run-1"), 1);
        assert_eq!(counts(&table, "snowflake"), (0, 1));
        assert!(table.claim("snowflake", "run-2"));
    }

    #[test]
    fn unknown_keys() {
        let mut table = ConcurrencyTable::default();
        assert!(table.info("missing").is_empty());
        assert!(!table.claim("missing", "run-1"));
        assert_eq!(table.free("run-1"), 0);
    }

    #[test]
    fn round_trips_through_json() {
        let mut table = ConcurrencyTable::default();
        table.allocate("snowflake", 2);
        assert!(table.claim("snowflake", "run-1"));

        let json = serde_json::to_string(&table).unwrap();
        assert_eq!(
            json,
            r#"{"snowflake":[{"run_id":"run-1"},{"run_id":null}]}"#
        );
        let parsed: ConcurrencyTable = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, table);
    }
}
