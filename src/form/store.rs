use std::collections::BTreeSet;

use super::analytics::AnalyticsEvent;
use super::controller::{
    EngineCore, FormController, FormError, FormOptions, FormResult, RevalidateMode,
    SubmitState, ValidationMode, read_lock, transition_submit_state, write_lock,
};
use super::derivation::DerivationStep;
use super::history::HistoryPolicy;
use super::observer::ChangeKind;
use super::validation::ValidationResult;
use super::value::{Field, FieldId, FieldType, FieldValue};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(super) enum WriteEffect {
    Unchanged,
    /// Value already stored, but the dirty flag flipped.
    DirtyOnly,
    Changed,
}

#[derive(Debug, Default)]
pub(super) struct CommitOutcome {
    /// Fields whose stored value changed, written ones first, then derived
    /// ones in propagation order.
    pub(super) changed: Vec<FieldId>,
    pub(super) dirty_only: Vec<FieldId>,
    pub(super) revalidated: Vec<FieldId>,
}

impl CommitOutcome {
    pub(super) fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.dirty_only.is_empty()
    }

    pub(super) fn notified_fields(&self) -> Vec<FieldId> {
        let mut seen = BTreeSet::new();
        self.changed
            .iter()
            .chain(&self.dirty_only)
            .chain(&self.revalidated)
            .filter(|field| seen.insert((*field).clone()))
            .cloned()
            .collect()
    }
}

impl EngineCore {
    pub(super) fn initial_value(&self, field: &FieldId) -> FieldValue {
        self.initial_values
            .get(field.key())
            .cloned()
            .unwrap_or_else(|| field.kind().zero())
    }

    /// Stored value, then declared initial value, then the kind's zero value.
    pub(super) fn current_value(&self, field: &FieldId) -> FieldValue {
        match self.state.values.get(field.key()) {
            Some(value) => value.clone(),
            None => self.initial_value(field),
        }
    }

    pub(super) fn check_write(
        &self,
        field: &FieldId,
        value: &FieldValue,
        strict: bool,
    ) -> FormResult<()> {
        if value.kind() != field.kind() {
            return Err(FormError::ValueKindMismatch {
                field: field.key().to_string(),
                expected: field.kind(),
                actual: value.kind(),
            });
        }
        self.check_kind(field)?;
        if strict && !self.kinds.contains_key(field.key()) {
            return Err(FormError::UnknownField(field.key().to_string()));
        }
        Ok(())
    }

    fn set_dirty(&mut self, key: &str, dirty: bool) {
        let state = self.state_mut();
        if dirty {
            state.dirty_fields.insert(key.to_string());
        } else {
            state.dirty_fields.remove(key);
        }
    }

    /// Stores `value` and recomputes dirtiness against the initial value.
    pub(super) fn write_value(&mut self, field: &FieldId, value: FieldValue) -> WriteEffect {
        let key = field.key();
        if !self.kinds.contains_key(key) {
            self.kinds.insert(key.to_string(), field.kind());
        }
        let dirty = value != self.initial_value(field);
        let was_dirty = self.state.dirty_fields.contains(key);
        if self.current_value(field) == value {
            if was_dirty == dirty {
                return WriteEffect::Unchanged;
            }
            self.set_dirty(key, dirty);
            return WriteEffect::DirtyOnly;
        }
        self.state_mut().values.insert(key.to_string(), value);
        self.set_dirty(key, dirty);
        WriteEffect::Changed
    }

    /// Invalidates async work for a field whose value just changed and
    /// validates it per `validate_mode`. Returns whether sync validation ran.
    pub(super) fn on_value_changed(&mut self, field: &FieldId, options: &FormOptions) -> bool {
        let key = field.key();
        self.async_errors.remove(key);
        self.bump_validation_ticket(key);
        self.validating.remove(key);
        self.validation_queue.remove(field);
        if options.validate_mode == ValidationMode::OnChange && self.has_async_validator(field) {
            self.queue_async_validation(field);
        }
        self.refresh_pending(key);
        if options.validate_mode == ValidationMode::OnChange {
            self.run_sync_validation(field);
            true
        } else {
            self.refresh_validation(key);
            false
        }
    }

    /// Recomputes derivations and cross-field validation downstream of
    /// `roots`. Each field is visited at most once, after its inputs settled.
    pub(super) fn propagate(
        &mut self,
        roots: &[FieldId],
        options: &FormOptions,
    ) -> (Vec<FieldId>, Vec<FieldId>) {
        let order = self.graph.propagation_order(roots);
        let mut changed = roots.iter().cloned().collect::<BTreeSet<_>>();
        let mut derived = Vec::new();
        let mut revalidated = Vec::new();
        for field in order {
            if !self.graph.depends_on_any(&field, &changed) {
                continue;
            }
            let mut validated = false;
            if let DerivationStep::Write(value) = self.step_derivation(&field) {
                if self.write_value(&field, value) == WriteEffect::Changed {
                    validated = self.on_value_changed(&field, options);
                    changed.insert(field.clone());
                    derived.push(field.clone());
                }
            }
            if !validated
                && options.revalidate_mode == RevalidateMode::OnChange
                && self.has_sync_validation(&field)
            {
                self.run_sync_validation(&field);
                revalidated.push(field);
            }
        }
        if !derived.is_empty() || !revalidated.is_empty() {
            tracing::debug!(
                roots = roots.len(),
                derived = derived.len(),
                revalidated = revalidated.len(),
                "propagated field change"
            );
        }
        (derived, revalidated)
    }

    /// Writes every value, then propagates once for the whole batch. Nothing
    /// is written when any entry is rejected.
    pub(super) fn apply_writes(
        &mut self,
        writes: Vec<(FieldId, FieldValue)>,
        options: &FormOptions,
    ) -> FormResult<CommitOutcome> {
        for (field, value) in &writes {
            self.check_write(field, value, options.strict)?;
        }
        let mut outcome = CommitOutcome::default();
        for (field, value) in writes {
            // A direct write to a derived field leaves the cached projection
            // describing a value the field no longer holds.
            if let Some(entry) = self.derivations.get_mut(&field) {
                entry.last_projection = None;
            }
            match self.write_value(&field, value) {
                WriteEffect::Changed => {
                    self.on_value_changed(&field, options);
                    if !outcome.changed.contains(&field) {
                        outcome.changed.push(field);
                    }
                }
                WriteEffect::DirtyOnly => outcome.dirty_only.push(field),
                WriteEffect::Unchanged => {}
            }
        }
        if !outcome.changed.is_empty() {
            let roots = outcome.changed.clone();
            let (derived, revalidated) = self.propagate(&roots, options);
            outcome.changed.extend(derived);
            outcome.revalidated = revalidated;
        }
        Ok(outcome)
    }

    /// Drops every trace of async work and cached projections for `key`.
    fn forget_async(&mut self, field: &FieldId) {
        let key = field.key();
        self.bump_validation_ticket(key);
        self.bump_derivation_ticket(key);
        self.validation_queue.remove(field);
        self.derivation_queue.remove(field);
        self.validating.remove(key);
        self.deriving.remove(key);
        self.sync_errors.remove(key);
        self.async_errors.remove(key);
        if let Some(entry) = self.derivations.get_mut(field) {
            entry.last_projection = None;
        }
    }
}

impl FormController {
    /// Stored value, falling back to the initial and then the zero value.
    pub fn value<T>(&self, field: &Field<T>) -> FormResult<T>
    where
        T: FieldType,
    {
        let value = self.value_of(field)?;
        T::from_value(&value).ok_or_else(|| FormError::ValueKindMismatch {
            field: field.key().to_string(),
            expected: T::KIND,
            actual: value.kind(),
        })
    }

    pub fn value_of(&self, field: impl AsRef<FieldId>) -> FormResult<FieldValue> {
        let field = field.as_ref();
        let core = read_lock(&self.core, "reading field value")?;
        core.check_kind(field)?;
        if self.options.strict && !core.kinds.contains_key(field.key()) {
            return Err(FormError::UnknownField(field.key().to_string()));
        }
        Ok(core.current_value(field))
    }

    /// Writes one value. Returns the fields whose stored value changed,
    /// including derived fields updated by the write.
    pub fn set<T>(&self, field: &Field<T>, value: T) -> FormResult<Vec<FieldId>>
    where
        T: FieldType,
    {
        self.set_value(field, value.into_value())
    }

    pub fn set_value(
        &self,
        field: impl AsRef<FieldId>,
        value: FieldValue,
    ) -> FormResult<Vec<FieldId>> {
        let write = vec![(field.as_ref().clone(), value)];
        self.commit(write, ChangeKind::Values, HistoryPolicy::Record)
    }

    /// Sets a value and awaits the async validation and derivation it
    /// queued.
    pub async fn set_async<T>(&self, field: &Field<T>, value: T) -> FormResult<Vec<FieldId>>
    where
        T: FieldType,
    {
        let changed = self.set(field, value)?;
        self.flush_async().await?;
        Ok(changed)
    }

    pub(super) fn commit(
        &self,
        writes: Vec<(FieldId, FieldValue)>,
        kind: ChangeKind,
        policy: HistoryPolicy,
    ) -> FormResult<Vec<FieldId>> {
        let (changed, change) = {
            let mut core = write_lock(&self.core, "committing field values")?;
            let outcome = core.apply_writes(writes, &self.options)?;
            if outcome.is_empty() {
                return Ok(Vec::new());
            }
            if !outcome.changed.is_empty() {
                core.record_history(policy);
            }
            let fields = outcome.notified_fields();
            (outcome.changed, core.seal(kind, fields))
        };
        self.notify(&change)?;
        if !changed.is_empty() {
            self.autosave(&change.snapshot)?;
            for field in &changed {
                self.track(AnalyticsEvent::FieldChanged {
                    field: field.clone(),
                })?;
            }
        }
        Ok(changed)
    }

    /// Marks the field as touched; validates it under
    /// `ValidationMode::OnBlur`.
    pub fn touch(&self, field: impl AsRef<FieldId>) -> FormResult<()> {
        let field = field.as_ref().clone();
        let on_blur = self.options.validate_mode == ValidationMode::OnBlur;
        let revalidate = self.options.revalidate_mode == RevalidateMode::OnBlur;
        let (newly_touched, change) = {
            let mut core = write_lock(&self.core, "touching field")?;
            let newly_touched = !core.state.touched_fields.contains(field.key());
            if !newly_touched && !on_blur && !revalidate {
                return Ok(());
            }
            if newly_touched {
                core.state_mut()
                    .touched_fields
                    .insert(field.key().to_string());
            }
            let mut fields = vec![field.clone()];
            if on_blur {
                core.run_sync_validation(&field);
                if core.has_async_validator(&field) {
                    core.queue_async_validation(&field);
                }
            }
            if revalidate {
                fields.extend(core.revalidate_dependents(std::slice::from_ref(&field)));
            }
            (newly_touched, core.seal(ChangeKind::Touched, fields))
        };
        self.notify(&change)?;
        if newly_touched {
            self.track(AnalyticsEvent::FieldTouched { field })?;
        }
        Ok(())
    }

    /// Restores every field to its initial value and clears all flags in a
    /// single change.
    pub fn reset(&self) -> FormResult<()> {
        let change = {
            let mut core = write_lock(&self.core, "resetting form")?;
            let fields = core.known_fields();
            for field in &fields {
                core.forget_async(field);
            }
            let initial = fields
                .iter()
                .map(|field| (field.key().to_string(), core.initial_value(field)))
                .collect::<Vec<_>>();
            let state = core.state_mut();
            for (key, value) in initial {
                state
                    .validations
                    .insert(key.clone(), ValidationResult::valid());
                state.values.insert(key, value);
            }
            state.dirty_fields.clear();
            state.touched_fields.clear();
            state.pending_fields.clear();
            transition_submit_state(state, SubmitState::Idle)?;
            core.submitted = false;
            core.record_history(HistoryPolicy::Record);
            tracing::debug!(fields = fields.len(), "reset form");
            core.seal(ChangeKind::Reset, fields)
        };
        self.notify(&change)?;
        self.autosave(&change.snapshot)
    }

    /// Restores one field to its initial value and clears its flags.
    pub fn reset_field(&self, field: impl AsRef<FieldId>) -> FormResult<()> {
        let field = field.as_ref().clone();
        let change = {
            let mut core = write_lock(&self.core, "resetting field")?;
            core.check_kind(&field)?;
            core.forget_async(&field);
            let initial = core.initial_value(&field);
            let mut fields = vec![field.clone()];
            let effect = core.write_value(&field, initial);
            let key = field.key().to_string();
            let state = core.state_mut();
            state.touched_fields.remove(&key);
            state.dirty_fields.remove(&key);
            state.validations.insert(key.clone(), ValidationResult::valid());
            core.refresh_pending(&key);
            if effect == WriteEffect::Changed {
                let (derived, revalidated) = core.propagate(&fields, &self.options);
                fields.extend(derived);
                fields.extend(revalidated);
                core.record_history(HistoryPolicy::Record);
            }
            core.seal(ChangeKind::Values, fields)
        };
        self.notify(&change)?;
        self.autosave(&change.snapshot)
    }

    /// Adopts the current values as the new initial values.
    pub fn reset_initial_values(&self) -> FormResult<()> {
        let change = {
            let mut core = write_lock(&self.core, "resetting initial values")?;
            let fields = core.known_fields();
            for field in &fields {
                let value = core.current_value(field);
                core.initial_values.insert(field.key().to_string(), value);
            }
            core.state_mut().dirty_fields.clear();
            core.record_history(HistoryPolicy::Rebase);
            core.seal(ChangeKind::InitialValues, fields)
        };
        self.notify(&change)
    }

    /// Writes `values` and makes them the new initial values in one change.
    pub fn reset_to_values(
        &self,
        values: impl IntoIterator<Item = (FieldId, FieldValue)>,
    ) -> FormResult<()> {
        let writes = values.into_iter().collect::<Vec<_>>();
        let change = {
            let mut core = write_lock(&self.core, "resetting to values")?;
            for (field, value) in &writes {
                core.check_write(field, value, self.options.strict)?;
            }
            for (field, value) in &writes {
                core.initial_values
                    .insert(field.key().to_string(), value.clone());
            }
            let outcome = core.apply_writes(writes, &self.options)?;
            core.record_history(HistoryPolicy::Rebase);
            core.seal(ChangeKind::InitialValues, outcome.notified_fields())
        };
        self.notify(&change)?;
        self.autosave(&change.snapshot)
    }
}
