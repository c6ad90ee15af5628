use std::collections::BTreeSet;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use futures_timer::Delay;

use super::controller::{
    EngineCore, FormController, FormError, FormResult, FormState, ValidationMode,
    ValidationTicket, read_lock, write_lock,
};
use super::observer::ChangeKind;
use super::registry::wrap_cross_field;
use super::value::{Field, FieldId, FieldType, FieldValue};

/// Message reported when a validator panics or sees a value of the wrong
/// kind.
pub const VALIDATION_FAILED: &str = "Validation failed";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub error_message: Option<String>,
    /// While true, `is_valid` is the last synchronous verdict and an async
    /// validator is still running.
    pub is_validating: bool,
}

impl ValidationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            error_message: None,
            is_validating: false,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error_message: Some(message.into()),
            is_validating: false,
        }
    }
}

impl Default for ValidationResult {
    fn default() -> Self {
        Self::valid()
    }
}

pub trait FieldValidator<T>: Send + Sync {
    fn validate(&self, value: &T) -> Result<(), String>;
}

impl<T, F> FieldValidator<T> for F
where
    F: Fn(&T) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, value: &T) -> Result<(), String> {
        (self)(value)
    }
}

pub trait CrossFieldValidator<T>: Send + Sync {
    fn validate(&self, value: &T, state: &FormState) -> Result<(), String>;
}

impl<T, F> CrossFieldValidator<T> for F
where
    F: Fn(&T, &FormState) -> Result<(), String> + Send + Sync,
{
    fn validate(&self, value: &T, state: &FormState) -> Result<(), String> {
        (self)(value, state)
    }
}

pub trait AsyncFieldValidator<T>: Send + Sync {
    type Fut: Future<Output = Result<(), String>> + Send + 'static;

    fn validate(&self, value: T) -> Self::Fut;
}

impl<T, F, Fut> AsyncFieldValidator<T> for F
where
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    type Fut = Fut;

    fn validate(&self, value: T) -> Self::Fut {
        (self)(value)
    }
}

pub(super) type SyncValidatorFn = Arc<dyn Fn(&FieldValue) -> Result<(), String> + Send + Sync>;
pub(super) type CrossFieldValidatorFn =
    Arc<dyn Fn(&FieldValue, &FormState) -> Result<(), String> + Send + Sync>;
pub(super) type AsyncValidatorFn =
    Arc<dyn Fn(FieldValue) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

#[derive(Clone)]
pub(super) struct AsyncValidatorEntry {
    pub(super) debounce: Option<Duration>,
    pub(super) validator: AsyncValidatorFn,
}

#[derive(Clone)]
pub(super) struct CrossFieldEntry {
    pub(super) depends_on: Vec<FieldId>,
    pub(super) validator: CrossFieldValidatorFn,
}

struct AsyncValidationJob {
    ticket: ValidationTicket,
    debounce: Duration,
    value: FieldValue,
    validator: AsyncValidatorFn,
}

/// Runs a validator, turning a panic into a failure with the generic
/// message.
fn guarded(field: &FieldId, run: impl FnOnce() -> Result<(), String>) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(run)) {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(field = %field, "validator panicked");
            Err(VALIDATION_FAILED.to_string())
        }
    }
}

impl EngineCore {
    /// Re-runs the sync and cross-field validators of a registered field and
    /// publishes the combined result. Unregistered fields keep their last
    /// result.
    pub(super) fn run_sync_validation(&mut self, field: &FieldId) -> ValidationResult {
        let key = field.key();
        let validators = self
            .registry
            .get(key)
            .filter(|definition| definition.id == *field)
            .map(|definition| {
                (
                    definition.validator.clone(),
                    definition
                        .cross_field
                        .iter()
                        .map(|entry| entry.validator.clone())
                        .collect::<Vec<_>>(),
                )
            });
        let Some((validator, cross_field)) = validators else {
            return self.state.validation(key);
        };

        let value = self.current_value(field);
        let mut error = None;
        if let Some(validator) = validator {
            error = guarded(field, || validator(&value)).err();
        }
        if error.is_none() {
            let state = self.state.clone();
            error = cross_field
                .iter()
                .find_map(|validator| guarded(field, || validator(&value, &state)).err());
        }

        match error {
            Some(message) => {
                self.sync_errors.insert(key.to_string(), message);
            }
            None => {
                self.sync_errors.remove(key);
            }
        }
        self.refresh_validation(key);
        self.state.validation(key)
    }

    pub(super) fn has_async_validator(&self, field: &FieldId) -> bool {
        self.registry
            .get(field.key())
            .is_some_and(|definition| definition.id == *field && definition.has_async_validator())
    }

    pub(super) fn has_sync_validation(&self, field: &FieldId) -> bool {
        self.registry
            .get(field.key())
            .is_some_and(|definition| definition.id == *field && definition.has_sync_validation())
    }

    /// Marks the field as awaiting its async validator. Any in-flight run
    /// for the field becomes stale.
    pub(super) fn queue_async_validation(&mut self, field: &FieldId) {
        let key = field.key();
        self.bump_validation_ticket(key);
        self.validation_queue.insert(field.clone());
        self.validating.insert(key.to_string());
        self.refresh_pending(key);
        self.refresh_validation(key);
    }

    fn begin_async_validation(
        &mut self,
        field: &FieldId,
        default_debounce: Duration,
    ) -> Option<AsyncValidationJob> {
        let entry = self
            .registry
            .get(field.key())
            .filter(|definition| definition.id == *field)
            .and_then(|definition| definition.async_validator.clone())?;
        let key = field.key();
        let ticket = self.bump_validation_ticket(key);
        self.validation_queue.remove(field);
        self.validating.insert(key.to_string());
        self.refresh_pending(key);
        self.refresh_validation(key);
        Some(AsyncValidationJob {
            ticket,
            debounce: entry.debounce.unwrap_or(default_debounce),
            value: self.current_value(field),
            validator: entry.validator,
        })
    }

    fn is_latest_validation(&self, field: &FieldId, ticket: ValidationTicket) -> bool {
        self.validation_tickets.get(field.key()).copied() == Some(ticket)
    }

    /// Applies an async verdict unless a newer request superseded it.
    fn finish_async_validation(
        &mut self,
        field: &FieldId,
        ticket: ValidationTicket,
        result: Result<(), String>,
    ) -> bool {
        if !self.is_latest_validation(field, ticket) {
            tracing::debug!(field = %field, ticket = ticket.0, "discarding stale async validation");
            return false;
        }
        let key = field.key();
        self.validating.remove(key);
        match result {
            Ok(()) => {
                self.async_errors.remove(key);
            }
            Err(message) => {
                self.async_errors.insert(key.to_string(), message);
            }
        }
        self.refresh_pending(key);
        self.refresh_validation(key);
        true
    }

    /// Revalidates everything downstream of `sources`.
    pub(super) fn revalidate_dependents(&mut self, sources: &[FieldId]) -> Vec<FieldId> {
        let order = self.graph.propagation_order(sources);
        let mut revalidated = Vec::new();
        for field in order {
            if self.has_sync_validation(&field) {
                self.run_sync_validation(&field);
                revalidated.push(field);
            }
        }
        revalidated
    }
}

impl FormController {
    /// Runs the field's synchronous and cross-field validators.
    pub fn validate(&self, field: impl AsRef<FieldId>) -> FormResult<ValidationResult> {
        let field = field.as_ref();
        let (result, change) = {
            let mut core = write_lock(&self.core, "validating field")?;
            let result = core.run_sync_validation(field);
            (result, core.seal(ChangeKind::Validation, vec![field.clone()]))
        };
        self.notify(&change)?;
        Ok(result)
    }

    /// Runs the field's async validator after its debounce. A call that is
    /// superseded by a newer one for the same field, or by a value change,
    /// leaves the state untouched.
    pub async fn validate_async(&self, field: impl AsRef<FieldId>) -> FormResult<ValidationResult> {
        let field = field.as_ref().clone();
        let (job, change) = {
            let mut core = write_lock(&self.core, "starting async validation")?;
            match core.begin_async_validation(&field, self.options.default_debounce) {
                Some(job) => (job, core.seal(ChangeKind::Validation, vec![field.clone()])),
                None => return Ok(core.state.validation(field.key())),
            }
        };
        self.notify(&change)?;

        if !job.debounce.is_zero() {
            Delay::new(job.debounce).await;
            let core = read_lock(&self.core, "checking latest validation ticket")?;
            if !core.is_latest_validation(&field, job.ticket) {
                return Ok(core.state.validation(field.key()));
            }
        }

        let result = match AssertUnwindSafe((job.validator)(job.value))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(field = %field, "async validator panicked");
                Err(VALIDATION_FAILED.to_string())
            }
        };

        let (result, change) = {
            let mut core = write_lock(&self.core, "finishing async validation")?;
            let applied = core.finish_async_validation(&field, job.ticket, result);
            let result = core.state.validation(field.key());
            let change = applied.then(|| core.seal(ChangeKind::Validation, vec![field.clone()]));
            (result, change)
        };
        if let Some(change) = change {
            self.notify(&change)?;
        }
        Ok(result)
    }

    /// Validates `fields` (all registered fields when `None`) synchronously
    /// and queues their async validators without awaiting them.
    pub fn validate_form(&self, fields: Option<&[FieldId]>) -> FormResult<bool> {
        let (is_valid, change) = {
            let mut core = write_lock(&self.core, "validating form")?;
            let targets = match fields {
                Some(fields) => fields.to_vec(),
                None => core.registry.ids().cloned().collect(),
            };
            for field in &targets {
                core.run_sync_validation(field);
                if core.has_async_validator(field) {
                    core.queue_async_validation(field);
                }
            }
            let is_valid = targets
                .iter()
                .all(|field| core.state.validation(field.key()).is_valid);
            (is_valid, core.seal(ChangeKind::Validation, targets))
        };
        self.notify(&change)?;
        Ok(is_valid)
    }

    /// Validates every registered field and awaits the async tail.
    pub async fn validate_form_async(&self) -> FormResult<bool> {
        self.validate_form(None)?;
        self.flush_async().await?;
        let core = read_lock(&self.core, "reading form validity")?;
        Ok(core
            .registry
            .ids()
            .all(|field| core.state.validation(field.key()).is_valid))
    }

    /// Drains queued async validations and derivations, running them
    /// concurrently, until nothing new was queued by their results.
    pub async fn flush_async(&self) -> FormResult<()> {
        loop {
            let (validations, derivations) = {
                let mut core = write_lock(&self.core, "draining async queue")?;
                (
                    std::mem::take(&mut core.validation_queue),
                    std::mem::take(&mut core.derivation_queue),
                )
            };
            if validations.is_empty() && derivations.is_empty() {
                return Ok(());
            }
            let validations = join_all(validations.iter().map(|field| self.validate_async(field)));
            let derivations = join_all(derivations.iter().map(|field| self.derive_async(field)));
            let (validations, derivations) = futures::join!(validations, derivations);
            for result in validations {
                result?;
            }
            for result in derivations {
                result?;
            }
        }
    }

    /// Attaches a cross-field rule to a registered field. The rule re-runs
    /// whenever one of `depends_on` changes.
    pub fn add_cross_field_validator<T, V>(
        &self,
        field: &Field<T>,
        depends_on: &[FieldId],
        validator: V,
    ) -> FormResult<()>
    where
        T: FieldType,
        V: CrossFieldValidator<T> + 'static,
    {
        let id = field.id().clone();
        let change = {
            let mut core = write_lock(&self.core, "adding cross-field validator")?;
            for dependency in depends_on {
                core.check_kind(dependency)?;
            }
            let Some(definition) = core
                .registry
                .get_mut(id.key())
                .filter(|definition| definition.id == id)
            else {
                return Err(FormError::UnknownField(id.key().to_string()));
            };
            definition.cross_field.push(CrossFieldEntry {
                depends_on: depends_on.to_vec(),
                validator: wrap_cross_field::<T, V>(validator),
            });
            if let Err(error) = core.rebuild_graph() {
                if let Some(definition) = core.registry.get_mut(id.key()) {
                    definition.cross_field.pop();
                }
                return Err(error.into());
            }
            if self.options.validate_mode == ValidationMode::OnChange {
                core.run_sync_validation(&id);
            }
            core.seal(ChangeKind::Registered, vec![id])
        };
        self.notify(&change)
    }

    /// Fields whose async validation or derivation is queued but not yet
    /// running.
    pub fn queued_async(&self) -> FormResult<BTreeSet<FieldId>> {
        let core = read_lock(&self.core, "reading async queue")?;
        Ok(core
            .validation_queue
            .iter()
            .chain(core.derivation_queue.iter())
            .cloned()
            .collect())
    }
}
