use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use super::controller::{EngineCore, FormController, FormResult, FormState, read_lock, write_lock};
use super::observer::ChangeKind;
use super::value::{FieldId, FieldValue};

/// How a committed change interacts with the undo stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum HistoryPolicy {
    /// Push a new entry and drop the redo stack.
    Record,
    /// Fold the change into the newest entry.
    Amend,
    /// Replace the whole history with a single baseline.
    Rebase,
}

#[derive(Clone, Debug, PartialEq)]
pub struct HistoryEntry {
    pub values: BTreeMap<String, FieldValue>,
    pub recorded_at: Instant,
    /// Index of the entry in the undo stack at the time it was recorded.
    pub position: usize,
}

/// Linear undo/redo over whole-value snapshots. The newest undo entry always
/// mirrors the current values; the oldest one is the baseline undo stops at
/// and is never trimmed.
#[derive(Clone, Debug)]
pub struct HistoryManager {
    entries: Vec<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    limit: usize,
}

impl HistoryManager {
    pub fn new(values: BTreeMap<String, FieldValue>, limit: usize) -> Self {
        Self {
            entries: vec![HistoryEntry {
                values,
                recorded_at: Instant::now(),
                position: 0,
            }],
            redo: Vec::new(),
            limit,
        }
    }

    /// Pushes `values` unless they equal the newest entry. Returns whether an
    /// entry was recorded.
    pub fn snapshot(&mut self, values: BTreeMap<String, FieldValue>) -> bool {
        if self.current().is_some_and(|entry| entry.values == values) {
            return false;
        }
        self.entries.push(HistoryEntry {
            values,
            recorded_at: Instant::now(),
            position: self.entries.len(),
        });
        self.redo.clear();
        let overflow = self.entries.len().saturating_sub(self.limit.saturating_add(1));
        if overflow > 0 {
            self.entries.drain(1..=overflow);
            for (position, entry) in self.entries.iter_mut().enumerate() {
                entry.position = position;
            }
        }
        true
    }

    /// Steps back one entry. `None` at the baseline.
    pub fn undo(&mut self) -> Option<&HistoryEntry> {
        if self.entries.len() <= 1 {
            return None;
        }
        let entry = self.entries.pop()?;
        self.redo.push(entry);
        self.entries.last()
    }

    pub fn redo(&mut self) -> Option<&HistoryEntry> {
        let entry = self.redo.pop()?;
        self.entries.push(entry);
        self.entries.last()
    }

    pub fn can_undo(&self) -> bool {
        self.entries.len() > 1
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn current(&self) -> Option<&HistoryEntry> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overwrites the newest entry's values without touching redo state.
    pub fn amend(&mut self, values: BTreeMap<String, FieldValue>) {
        match self.entries.last_mut() {
            Some(entry) => entry.values = values,
            None => self.rebase(values),
        }
    }

    pub fn rebase(&mut self, values: BTreeMap<String, FieldValue>) {
        self.entries = vec![HistoryEntry {
            values,
            recorded_at: Instant::now(),
            position: 0,
        }];
        self.redo.clear();
    }

    pub fn clear(&mut self) {
        match self.entries.last().map(|entry| entry.values.clone()) {
            Some(values) => self.rebase(values),
            None => self.redo.clear(),
        }
    }
}

impl EngineCore {
    pub(super) fn record_history(&mut self, policy: HistoryPolicy) {
        let values = self.state.values.clone();
        match policy {
            HistoryPolicy::Record => {
                if self.history.snapshot(values) {
                    tracing::trace!(entries = self.history.len(), "recorded history entry");
                }
            }
            HistoryPolicy::Amend => self.history.amend(values),
            HistoryPolicy::Rebase => self.history.rebase(values),
        }
    }

    /// Writes for every known key whose value differs from `values`. Keys
    /// missing from `values` fall back to their initial value.
    fn restore_writes(&self, values: &BTreeMap<String, FieldValue>) -> Vec<(FieldId, FieldValue)> {
        self.known_fields()
            .into_iter()
            .filter_map(|field| {
                let value = values
                    .get(field.key())
                    .filter(|value| value.kind() == field.kind())
                    .cloned()
                    .unwrap_or_else(|| self.initial_value(&field));
                (self.current_value(&field) != value).then_some((field, value))
            })
            .collect()
    }
}

impl FormController {
    /// Restores the previous history entry. At the baseline this is a no-op
    /// that still returns the current snapshot.
    pub fn undo(&self) -> FormResult<Arc<FormState>> {
        self.travel(ChangeKind::Undo)
    }

    pub fn redo(&self) -> FormResult<Arc<FormState>> {
        self.travel(ChangeKind::Redo)
    }

    fn travel(&self, kind: ChangeKind) -> FormResult<Arc<FormState>> {
        let writes = {
            let mut core = write_lock(&self.core, "moving through history")?;
            let entry = match kind {
                ChangeKind::Redo => core.history.redo(),
                _ => core.history.undo(),
            };
            let Some(values) = entry.map(|entry| entry.values.clone()) else {
                return Ok(core.state.clone());
            };
            core.restore_writes(&values)
        };
        self.commit(writes, kind, HistoryPolicy::Amend)?;
        self.snapshot()
    }

    pub fn can_undo(&self) -> FormResult<bool> {
        Ok(read_lock(&self.core, "reading history")?.history.can_undo())
    }

    pub fn can_redo(&self) -> FormResult<bool> {
        Ok(read_lock(&self.core, "reading history")?.history.can_redo())
    }

    /// Drops every entry but the current one.
    pub fn clear_history(&self) -> FormResult<()> {
        write_lock(&self.core, "clearing history")?.history.clear();
        Ok(())
    }

    /// Applies several writes as one history entry and one notification.
    pub fn apply_batch(
        &self,
        writes: impl IntoIterator<Item = (FieldId, FieldValue)>,
    ) -> FormResult<Vec<FieldId>> {
        self.commit(
            writes.into_iter().collect(),
            ChangeKind::Values,
            HistoryPolicy::Record,
        )
    }
}
