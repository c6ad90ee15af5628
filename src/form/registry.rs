use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use super::controller::{
    ConfigurationError, EngineCore, FormController, FormResult, FormState, read_lock, write_lock,
};
use super::graph::DependencyGraph;
use super::observer::ChangeKind;
use super::validation::{
    AsyncFieldValidator, AsyncValidatorEntry, AsyncValidatorFn, CrossFieldEntry,
    CrossFieldValidator, CrossFieldValidatorFn, FieldValidator, SyncValidatorFn,
    VALIDATION_FAILED,
};
use super::value::{Field, FieldId, FieldKind, FieldType, FieldValue};

/// Type-erased field configuration as stored by the registry.
#[derive(Clone)]
pub struct FieldDefinition {
    pub(super) id: FieldId,
    pub(super) initial: Option<FieldValue>,
    pub(super) validator: Option<SyncValidatorFn>,
    pub(super) async_validator: Option<AsyncValidatorEntry>,
    pub(super) depends_on: Vec<FieldId>,
    pub(super) cross_field: Vec<CrossFieldEntry>,
}

impl FieldDefinition {
    pub fn builder<T>(field: &Field<T>) -> FieldBuilder<T>
    where
        T: FieldType,
    {
        FieldBuilder {
            definition: FieldDefinition {
                id: field.id().clone(),
                initial: None,
                validator: None,
                async_validator: None,
                depends_on: Vec::new(),
                cross_field: Vec::new(),
            },
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> &FieldId {
        &self.id
    }

    /// Declared initial value, or the kind's zero value.
    pub fn initial_value(&self) -> FieldValue {
        self.initial
            .clone()
            .unwrap_or_else(|| self.id.kind().zero())
    }

    pub fn has_async_validator(&self) -> bool {
        self.async_validator.is_some()
    }

    pub(super) fn has_sync_validation(&self) -> bool {
        self.validator.is_some() || !self.cross_field.is_empty()
    }

    /// Explicit dependencies plus those of every cross-field rule.
    pub fn dependencies(&self) -> impl Iterator<Item = &FieldId> {
        self.depends_on
            .iter()
            .chain(self.cross_field.iter().flat_map(|entry| entry.depends_on.iter()))
    }
}

impl std::fmt::Debug for FieldDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDefinition")
            .field("id", &self.id)
            .field("initial", &self.initial)
            .field("validator", &self.validator.is_some())
            .field("async_validator", &self.async_validator.is_some())
            .field("depends_on", &self.depends_on)
            .field("cross_field", &self.cross_field.len())
            .finish()
    }
}

pub struct FieldBuilder<T> {
    definition: FieldDefinition,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FieldBuilder<T>
where
    T: FieldType,
{
    pub fn initial(mut self, value: T) -> Self {
        self.definition.initial = Some(value.into_value());
        self
    }

    pub fn validator<V>(mut self, validator: V) -> Self
    where
        V: FieldValidator<T> + 'static,
    {
        let validator = Arc::new(validator);
        let wrapped: SyncValidatorFn =
            Arc::new(move |value: &FieldValue| match T::from_value(value) {
                Some(typed) => validator.validate(&typed),
                None => Err(VALIDATION_FAILED.to_string()),
            });
        self.definition.validator = Some(wrapped);
        self
    }

    /// Async validator using the form's default debounce.
    pub fn async_validator<V>(self, validator: V) -> Self
    where
        V: AsyncFieldValidator<T> + 'static,
    {
        self.async_entry(None, validator)
    }

    pub fn async_validator_with_debounce<V>(self, debounce_ms: u64, validator: V) -> Self
    where
        V: AsyncFieldValidator<T> + 'static,
    {
        self.async_entry(Some(Duration::from_millis(debounce_ms)), validator)
    }

    fn async_entry<V>(mut self, debounce: Option<Duration>, validator: V) -> Self
    where
        V: AsyncFieldValidator<T> + 'static,
    {
        let validator = Arc::new(validator);
        let wrapped: AsyncValidatorFn = Arc::new(move |value: FieldValue| {
            match T::from_value(&value) {
                Some(typed) => validator.validate(typed).boxed(),
                None => async { Err::<(), String>(VALIDATION_FAILED.to_string()) }.boxed(),
            }
        });
        self.definition.async_validator = Some(AsyncValidatorEntry {
            debounce,
            validator: wrapped,
        });
        self
    }

    pub fn depends_on(mut self, field: impl AsRef<FieldId>) -> Self {
        let id = field.as_ref().clone();
        if !self.definition.depends_on.contains(&id) {
            self.definition.depends_on.push(id);
        }
        self
    }

    /// Cross-field rule, re-run whenever one of the field's dependencies
    /// changes.
    pub fn cross_field<V>(mut self, validator: V) -> Self
    where
        V: CrossFieldValidator<T> + 'static,
    {
        let entry = CrossFieldEntry {
            depends_on: Vec::new(),
            validator: wrap_cross_field::<T, V>(validator),
        };
        self.definition.cross_field.push(entry);
        self
    }

    pub fn build(self) -> FieldDefinition {
        self.definition
    }
}

impl<T> From<FieldBuilder<T>> for FieldDefinition
where
    T: FieldType,
{
    fn from(builder: FieldBuilder<T>) -> Self {
        builder.build()
    }
}

pub(super) fn wrap_cross_field<T, V>(validator: V) -> CrossFieldValidatorFn
where
    T: FieldType,
    V: CrossFieldValidator<T> + 'static,
{
    let validator = Arc::new(validator);
    Arc::new(move |value: &FieldValue, state: &FormState| {
        match T::from_value(value) {
            Some(typed) => validator.validate(&typed, state),
            None => Err(VALIDATION_FAILED.to_string()),
        }
    })
}

#[derive(Clone, Default)]
pub(super) struct FieldRegistry {
    definitions: BTreeMap<String, FieldDefinition>,
}

impl FieldRegistry {
    pub(super) fn get(&self, key: &str) -> Option<&FieldDefinition> {
        self.definitions.get(key)
    }

    pub(super) fn get_mut(&mut self, key: &str) -> Option<&mut FieldDefinition> {
        self.definitions.get_mut(key)
    }

    pub(super) fn contains(&self, id: &FieldId) -> bool {
        self.definitions
            .get(id.key())
            .is_some_and(|definition| definition.id == *id)
    }

    pub(super) fn insert(&mut self, definition: FieldDefinition) -> Option<FieldDefinition> {
        self.definitions
            .insert(definition.id.key().to_string(), definition)
    }

    pub(super) fn remove(&mut self, key: &str) -> Option<FieldDefinition> {
        self.definitions.remove(key)
    }

    pub(super) fn ids(&self) -> impl Iterator<Item = &FieldId> {
        self.definitions.values().map(|definition| &definition.id)
    }

    pub(super) fn definitions(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.definitions.values()
    }
}

impl EngineCore {
    pub(super) fn check_kind(&self, id: &FieldId) -> Result<(), ConfigurationError> {
        match self.kinds.get(id.key()) {
            Some(existing) if *existing != id.kind() => Err(ConfigurationError::KindMismatch {
                key: id.key().to_string(),
                existing: *existing,
                requested: id.kind(),
            }),
            _ => Ok(()),
        }
    }

    /// Builds the graph from every definition and derivation. Nothing is
    /// stored when the result would contain a cycle.
    pub(super) fn rebuild_graph(&mut self) -> Result<(), ConfigurationError> {
        let mut edges = Vec::new();
        for definition in self.registry.definitions() {
            for dependency in definition.dependencies() {
                edges.push((definition.id.clone(), dependency.clone()));
            }
        }
        for (target, entry) in &self.derivations {
            for source in &entry.sources {
                edges.push((target.clone(), source.clone()));
            }
        }
        self.graph = DependencyGraph::build(edges)?;
        Ok(())
    }
}

impl FormController {
    /// Adds or replaces a field definition. A value preserved from an
    /// earlier registration is kept over the definition's initial value.
    pub fn register(&self, definition: impl Into<FieldDefinition>) -> FormResult<()> {
        let definition = definition.into();
        let id = definition.id.clone();
        let change = {
            let mut core = write_lock(&self.core, "registering field")?;
            core.check_kind(&id)?;
            for dependency in definition.dependencies() {
                if dependency.key() == id.key() && dependency.kind() != id.kind() {
                    return Err(ConfigurationError::KindMismatch {
                        key: dependency.key().to_string(),
                        existing: id.kind(),
                        requested: dependency.kind(),
                    }
                    .into());
                }
                core.check_kind(dependency)?;
            }
            let conflicting = core
                .registry
                .definitions()
                .flat_map(|definition| definition.dependencies())
                .find(|dependency| dependency.key() == id.key() && dependency.kind() != id.kind())
                .cloned();
            if let Some(dependency) = conflicting {
                return Err(ConfigurationError::KindMismatch {
                    key: id.key().to_string(),
                    existing: dependency.kind(),
                    requested: id.kind(),
                }
                .into());
            }

            let previous = core.registry.insert(definition.clone());
            if let Err(error) = core.rebuild_graph() {
                match previous {
                    Some(previous) => core.registry.insert(previous),
                    None => core.registry.remove(id.key()),
                };
                tracing::warn!(field = %id, %error, "rejected field registration");
                return Err(error.into());
            }

            let key = id.key().to_string();
            let initial = definition.initial_value();
            core.kinds.insert(key.clone(), id.kind());
            core.initial_values.insert(key.clone(), initial.clone());
            let current = core.state.values.get(&key).cloned();
            let state = core.state_mut();
            let value = match current {
                Some(preserved) => preserved,
                None => {
                    state.values.insert(key.clone(), initial.clone());
                    initial.clone()
                }
            };
            if value != initial {
                state.dirty_fields.insert(key.clone());
            } else {
                state.dirty_fields.remove(&key);
            }
            if !state.validations.contains_key(&key) {
                state.validations.insert(key, Default::default());
            }
            let values = core.state.values.clone();
            core.history.amend(values);
            tracing::debug!(field = %id, "registered field");
            core.seal(ChangeKind::Registered, vec![id.clone()])
        };
        self.notify(&change)
    }

    /// Removes the definition. With `preserve` the stored value, flags and
    /// validation survive until the field is registered again.
    pub fn unregister(&self, field: impl AsRef<FieldId>, preserve: bool) -> FormResult<bool> {
        let id = field.as_ref().clone();
        let change = {
            let mut core = write_lock(&self.core, "unregistering field")?;
            if !core.registry.contains(&id) {
                return Ok(false);
            }
            let removed = core.registry.remove(id.key());
            if let Err(error) = core.rebuild_graph() {
                // Removing edges cannot introduce a cycle.
                if let Some(removed) = removed {
                    core.registry.insert(removed);
                }
                return Err(error.into());
            }

            let key = id.key();
            core.validation_queue.remove(&id);
            core.bump_validation_ticket(key);
            core.validating.remove(key);
            core.refresh_pending(key);
            if !preserve {
                core.kinds.remove(key);
                core.initial_values.remove(key);
                core.sync_errors.remove(key);
                core.async_errors.remove(key);
                let state = core.state_mut();
                state.values.remove(key);
                state.validations.remove(key);
                state.dirty_fields.remove(key);
                state.touched_fields.remove(key);
                state.pending_fields.remove(key);
            }
            tracing::debug!(field = %id, preserve, "unregistered field");
            core.seal(ChangeKind::Unregistered, vec![id.clone()])
        };
        self.notify(&change)?;
        Ok(true)
    }

    pub fn is_registered(&self, field: impl AsRef<FieldId>) -> FormResult<bool> {
        Ok(read_lock(&self.core, "checking field registration")?
            .registry
            .contains(field.as_ref()))
    }

    pub fn registered_fields(&self) -> FormResult<Vec<FieldId>> {
        Ok(
            read_lock(&self.core, "listing registered fields")?
                .registry
                .ids()
                .cloned()
                .collect(),
        )
    }

    pub fn definition(&self, field: impl AsRef<FieldId>) -> FormResult<Option<FieldDefinition>> {
        let id = field.as_ref();
        Ok(
            read_lock(&self.core, "reading field definition")?
                .registry
                .get(id.key())
                .filter(|definition| definition.id == *id)
                .cloned(),
        )
    }

    /// Declared kind for a key that is registered or preserved.
    pub fn kind_of(&self, key: &str) -> FormResult<Option<FieldKind>> {
        Ok(read_lock(&self.core, "reading field kind")?
            .kinds
            .get(key)
            .copied())
    }
}
