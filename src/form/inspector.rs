use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::controller::{FormController, FormId, FormResult, FormState, read_lock, write_lock};

/// Explicit registry of live forms for debugging tools.
#[derive(Clone, Default)]
pub struct FormInspector {
    forms: Arc<RwLock<BTreeMap<FormId, FormController>>>,
}

impl FormInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any form attached under the same id.
    pub fn attach(&self, form: &FormController) -> FormResult<()> {
        write_lock(&self.forms, "attaching form to inspector")?
            .insert(form.form_id().clone(), form.clone());
        tracing::debug!(form = %form.form_id(), "attached form to inspector");
        Ok(())
    }

    pub fn detach(&self, form_id: &FormId) -> FormResult<bool> {
        Ok(write_lock(&self.forms, "detaching form from inspector")?
            .remove(form_id)
            .is_some())
    }

    pub fn forms(&self) -> FormResult<Vec<FormId>> {
        Ok(read_lock(&self.forms, "listing inspected forms")?
            .keys()
            .cloned()
            .collect())
    }

    pub fn controller(&self, form_id: &FormId) -> FormResult<Option<FormController>> {
        Ok(read_lock(&self.forms, "reading inspected form")?
            .get(form_id)
            .cloned())
    }

    pub fn snapshot(&self, form_id: &FormId) -> FormResult<Option<Arc<FormState>>> {
        match self.controller(form_id)? {
            Some(form) => form.snapshot().map(Some),
            None => Ok(None),
        }
    }
}
