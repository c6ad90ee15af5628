use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::{Arc, RwLock};

use super::controller::{
    FormController, FormError, FormId, FormResult, FormState, read_lock, write_lock,
};
use super::history::HistoryPolicy;
use super::observer::ChangeKind;
use super::value::{FieldId, FieldValue};

/// Saved field values keyed by field key.
pub type DraftValues = BTreeMap<String, FieldValue>;

pub trait FormDraftStore: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    fn save(&self, form_id: &FormId, values: &DraftValues) -> Result<(), Self::Error>;
    fn load(&self, form_id: &FormId) -> Result<Option<DraftValues>, Self::Error>;
    fn clear(&self, form_id: &FormId) -> Result<(), Self::Error>;
}

#[derive(Clone, Default)]
pub struct InMemoryDraftStore {
    state: Arc<RwLock<BTreeMap<FormId, DraftValues>>>,
}

impl InMemoryDraftStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, form_id: &FormId) -> bool {
        let state = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.contains_key(form_id)
    }
}

impl FormDraftStore for InMemoryDraftStore {
    type Error = Infallible;

    fn save(&self, form_id: &FormId, values: &DraftValues) -> Result<(), Self::Error> {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.insert(form_id.clone(), values.clone());
        Ok(())
    }

    fn load(&self, form_id: &FormId) -> Result<Option<DraftValues>, Self::Error> {
        let state = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(state.get(form_id).cloned())
    }

    fn clear(&self, form_id: &FormId) -> Result<(), Self::Error> {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.remove(form_id);
        Ok(())
    }
}

/// Object-safe view of a `FormDraftStore`.
pub(super) trait DynDraftStore: Send + Sync {
    fn save(&self, form_id: &FormId, values: &DraftValues) -> Result<(), String>;
    fn load(&self, form_id: &FormId) -> Result<Option<DraftValues>, String>;
    fn clear(&self, form_id: &FormId) -> Result<(), String>;
}

impl<S> DynDraftStore for S
where
    S: FormDraftStore,
{
    fn save(&self, form_id: &FormId, values: &DraftValues) -> Result<(), String> {
        FormDraftStore::save(self, form_id, values).map_err(|error| error.to_string())
    }

    fn load(&self, form_id: &FormId) -> Result<Option<DraftValues>, String> {
        FormDraftStore::load(self, form_id).map_err(|error| error.to_string())
    }

    fn clear(&self, form_id: &FormId) -> Result<(), String> {
        FormDraftStore::clear(self, form_id).map_err(|error| error.to_string())
    }
}

impl FormController {
    /// Persists values after each committed change and on `dispose`.
    pub fn with_draft_store<S>(self, store: S) -> Self
    where
        S: FormDraftStore,
    {
        match write_lock(&self.collaborators, "attaching draft store") {
            Ok(mut collaborators) => collaborators.draft_store = Some(Arc::new(store)),
            Err(error) => tracing::warn!(form = %self.id, %error, "draft store not attached"),
        }
        self
    }

    fn draft_store(&self) -> FormResult<Option<Arc<dyn DynDraftStore>>> {
        Ok(read_lock(&self.collaborators, "reading draft store")?
            .draft_store
            .clone())
    }

    pub fn save_draft(&self) -> FormResult<()> {
        let Some(store) = self.draft_store()? else {
            return Ok(());
        };
        let values = self.snapshot()?.values.clone();
        store
            .save(&self.id, &values)
            .map_err(FormError::DraftSaveFailed)
    }

    /// Like `save_draft`, but a failing store is only logged.
    pub(super) fn autosave(&self, snapshot: &FormState) -> FormResult<()> {
        let Some(store) = self.draft_store()? else {
            return Ok(());
        };
        if let Err(error) = store.save(&self.id, &snapshot.values) {
            tracing::warn!(form = %self.id, %error, "draft autosave failed");
        }
        Ok(())
    }

    /// Applies the saved draft, if any. Keys that are unknown or hold a value
    /// of another kind are skipped. History restarts from the restored
    /// values.
    pub fn restore_draft(&self) -> FormResult<bool> {
        let Some(store) = self.draft_store()? else {
            return Ok(false);
        };
        let Some(draft) = store.load(&self.id).map_err(FormError::DraftLoadFailed)? else {
            return Ok(false);
        };

        let writes = {
            let core = read_lock(&self.core, "reading fields for draft")?;
            draft
                .into_iter()
                .filter_map(|(key, value)| match core.field_id(&key) {
                    Some(field) if field.kind() == value.kind() => Some((field, value)),
                    Some(field) => {
                        tracing::warn!(
                            field = %field,
                            actual = %value.kind(),
                            "skipping draft value of another kind"
                        );
                        None
                    }
                    None => {
                        tracing::warn!(key = %key, "skipping draft value for unknown field");
                        None
                    }
                })
                .collect::<Vec<(FieldId, FieldValue)>>()
        };
        self.commit(writes, ChangeKind::Values, HistoryPolicy::Rebase)?;
        tracing::debug!(form = %self.id, "restored draft");
        Ok(true)
    }

    pub fn clear_draft(&self) -> FormResult<()> {
        let Some(store) = self.draft_store()? else {
            return Ok(());
        };
        store.clear(&self.id).map_err(FormError::DraftClearFailed)
    }
}
