use std::sync::Arc;

use super::controller::{FormController, FormResult, FormState, read_lock, write_lock};
use super::value::FieldId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeKind {
    Registered,
    Unregistered,
    Values,
    Validation,
    Touched,
    Reset,
    InitialValues,
    Undo,
    Redo,
    Submit,
    Step,
}

/// One committed mutation. `snapshot` is the state right after it.
#[derive(Clone, Debug)]
pub struct FormChange {
    pub version: u64,
    pub kind: ChangeKind,
    pub fields: Vec<FieldId>,
    pub snapshot: Arc<FormState>,
}

impl FormChange {
    pub fn touches(&self, field: &FieldId) -> bool {
        self.fields.contains(field)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SubscriptionScope {
    Form,
    /// Changes listing the field, plus whole-form resets.
    Field(FieldId),
}

impl SubscriptionScope {
    fn matches(&self, change: &FormChange) -> bool {
        match self {
            SubscriptionScope::Form => true,
            SubscriptionScope::Field(field) => {
                change.touches(field)
                    || matches!(change.kind, ChangeKind::Reset | ChangeKind::InitialValues)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SubscriptionId(u64);

type ObserverFn = Arc<dyn Fn(&FormChange) + Send + Sync>;

#[derive(Default)]
pub(super) struct ObserverList {
    next_id: u64,
    entries: Vec<(SubscriptionId, SubscriptionScope, ObserverFn)>,
}

impl FormController {
    pub fn subscribe<F>(&self, scope: SubscriptionScope, callback: F) -> FormResult<SubscriptionId>
    where
        F: Fn(&FormChange) + Send + Sync + 'static,
    {
        let mut observers = write_lock(&self.observers, "subscribing to form changes")?;
        observers.next_id += 1;
        let id = SubscriptionId(observers.next_id);
        observers.entries.push((id, scope, Arc::new(callback)));
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> FormResult<bool> {
        let mut observers = write_lock(&self.observers, "unsubscribing from form changes")?;
        let before = observers.entries.len();
        observers.entries.retain(|(entry, _, _)| *entry != id);
        Ok(observers.entries.len() != before)
    }

    /// Calls matching observers outside of every engine lock, so callbacks
    /// may read or mutate the form.
    pub(super) fn notify(&self, change: &FormChange) -> FormResult<()> {
        let callbacks = read_lock(&self.observers, "notifying observers")?
            .entries
            .iter()
            .filter(|(_, scope, _)| scope.matches(change))
            .map(|(_, _, callback)| callback.clone())
            .collect::<Vec<_>>();
        for callback in callbacks {
            callback(change);
        }
        Ok(())
    }
}
