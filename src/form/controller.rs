use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;

use super::analytics::{AnalyticsEvent, FormAnalytics};
use super::derivation::DerivationEntry;
use super::draft::DynDraftStore;
use super::graph::DependencyGraph;
use super::history::HistoryManager;
use super::observer::{ChangeKind, FormChange, ObserverList};
use super::registry::FieldRegistry;
use super::validation::ValidationResult;
use super::value::{Field, FieldId, FieldKind, FieldType, FieldValue};

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct FormId(Arc<str>);

impl FormId {
    pub fn new(value: impl Into<Arc<str>>) -> Self {
        Self(value.into())
    }

    /// Id derived from the caller's source location, stable across runs.
    #[track_caller]
    pub fn from_callsite(prefix: &str) -> Self {
        Self(crate::id::stable_auto_id(prefix).into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FormId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-field generation counter for async work.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ValidationTicket(pub u64);

impl ValidationTicket {
    pub(super) fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitState {
    Idle,
    Validating,
    Submitting,
    Succeeded,
    Failed,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationMode {
    OnChange,
    OnBlur,
    OnSubmit,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RevalidateMode {
    OnChange,
    OnBlur,
    OnSubmit,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FormOptions {
    /// Falls back to an id derived from the constructor's callsite.
    pub form_id: Option<FormId>,
    pub validate_mode: ValidationMode,
    pub revalidate_mode: RevalidateMode,
    /// Reading an unknown field fails instead of returning a zero value.
    pub strict: bool,
    /// Maximum number of undo entries kept beyond the baseline.
    pub history_limit: usize,
    /// Debounce applied to async validators registered without one.
    pub default_debounce: Duration,
}

impl Default for FormOptions {
    fn default() -> Self {
        Self {
            form_id: None,
            validate_mode: ValidationMode::OnChange,
            revalidate_mode: RevalidateMode::OnChange,
            strict: false,
            history_limit: 100,
            default_debounce: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConfigurationError {
    #[error("field `{key}` is declared as {existing} but was registered as {requested}")]
    KindMismatch {
        key: String,
        existing: FieldKind,
        requested: FieldKind,
    },
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    DependencyCycle { cycle: Vec<String> },
    #[error("field `{0}` already has a derivation")]
    DuplicateDerivation(String),
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum FormError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("form state lock poisoned while {0}")]
    StatePoisoned(&'static str),
    #[error("field `{0}` is not registered")]
    UnknownField(String),
    #[error("field `{field}` expects a {expected} value, got {actual}")]
    ValueKindMismatch {
        field: String,
        expected: FieldKind,
        actual: FieldKind,
    },
    #[error("invalid submit state transition: {from:?} -> {to:?}")]
    InvalidStateTransition { from: SubmitState, to: SubmitState },
    #[error("form submit is already in progress")]
    AlreadySubmitting,
    #[error("submit handler failed: {0}")]
    SubmitFailed(String),
    #[error("failed to load draft: {0}")]
    DraftLoadFailed(String),
    #[error("failed to save draft: {0}")]
    DraftSaveFailed(String),
    #[error("failed to clear draft: {0}")]
    DraftClearFailed(String),
}

pub type FormResult<T> = Result<T, FormError>;

/// Immutable snapshot of the whole form. Every committed mutation produces a
/// new version; readers holding an older `Arc<FormState>` never observe
/// partial updates.
#[derive(Clone, Debug, PartialEq)]
pub struct FormState {
    pub(super) version: u64,
    pub(super) values: BTreeMap<String, FieldValue>,
    pub(super) validations: BTreeMap<String, ValidationResult>,
    pub(super) dirty_fields: BTreeSet<String>,
    pub(super) touched_fields: BTreeSet<String>,
    pub(super) pending_fields: BTreeSet<String>,
    pub(super) submit_state: SubmitState,
    pub(super) submit_count: u32,
    pub(super) step: usize,
}

impl FormState {
    pub(super) fn empty() -> Self {
        Self {
            version: 0,
            values: BTreeMap::new(),
            validations: BTreeMap::new(),
            dirty_fields: BTreeSet::new(),
            touched_fields: BTreeSet::new(),
            pending_fields: BTreeSet::new(),
            submit_state: SubmitState::Idle,
            submit_count: 0,
            step: 0,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn value(&self, key: &str) -> Option<&FieldValue> {
        self.values.get(key)
    }

    pub fn get<T>(&self, field: &Field<T>) -> Option<T>
    where
        T: FieldType,
    {
        self.values.get(field.key()).and_then(T::from_value)
    }

    pub fn values(&self) -> &BTreeMap<String, FieldValue> {
        &self.values
    }

    /// Never fails: fields that were never validated report valid.
    pub fn validation(&self, key: &str) -> ValidationResult {
        self.validations.get(key).cloned().unwrap_or_default()
    }

    pub fn error(&self, key: &str) -> Option<&str> {
        self.validations
            .get(key)
            .and_then(|result| result.error_message.as_deref())
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.dirty_fields.contains(key)
    }

    pub fn is_touched(&self, key: &str) -> bool {
        self.touched_fields.contains(key)
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending_fields.contains(key)
    }

    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty_fields.iter().map(String::as_str)
    }

    pub fn pending_fields(&self) -> impl Iterator<Item = &str> {
        self.pending_fields.iter().map(String::as_str)
    }

    pub fn is_form_dirty(&self) -> bool {
        !self.dirty_fields.is_empty()
    }

    pub fn is_validating(&self) -> bool {
        !self.pending_fields.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.validations.values().all(|result| result.is_valid)
    }

    pub fn is_submitting(&self) -> bool {
        self.submit_state == SubmitState::Submitting
    }

    pub fn submit_state(&self) -> SubmitState {
        self.submit_state
    }

    pub fn submit_count(&self) -> u32 {
        self.submit_count
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

/// Everything the engine mutates under a single lock.
pub(super) struct EngineCore {
    pub(super) state: Arc<FormState>,
    pub(super) registry: FieldRegistry,
    pub(super) graph: DependencyGraph,
    pub(super) history: HistoryManager,
    pub(super) derivations: BTreeMap<FieldId, DerivationEntry>,
    /// Declared kind of every key the store knows, registered or preserved.
    pub(super) kinds: BTreeMap<String, FieldKind>,
    pub(super) initial_values: BTreeMap<String, FieldValue>,
    pub(super) sync_errors: BTreeMap<String, String>,
    pub(super) async_errors: BTreeMap<String, String>,
    pub(super) validation_tickets: BTreeMap<String, ValidationTicket>,
    pub(super) derivation_tickets: BTreeMap<String, ValidationTicket>,
    pub(super) validating: BTreeSet<String>,
    pub(super) deriving: BTreeSet<String>,
    pub(super) validation_queue: BTreeSet<FieldId>,
    pub(super) derivation_queue: BTreeSet<FieldId>,
    pub(super) submitted: bool,
}

impl EngineCore {
    fn new(history_limit: usize) -> Self {
        Self {
            state: Arc::new(FormState::empty()),
            registry: FieldRegistry::default(),
            graph: DependencyGraph::default(),
            history: HistoryManager::new(BTreeMap::new(), history_limit),
            derivations: BTreeMap::new(),
            kinds: BTreeMap::new(),
            initial_values: BTreeMap::new(),
            sync_errors: BTreeMap::new(),
            async_errors: BTreeMap::new(),
            validation_tickets: BTreeMap::new(),
            derivation_tickets: BTreeMap::new(),
            validating: BTreeSet::new(),
            deriving: BTreeSet::new(),
            validation_queue: BTreeSet::new(),
            derivation_queue: BTreeSet::new(),
            submitted: false,
        }
    }

    pub(super) fn state_mut(&mut self) -> &mut FormState {
        Arc::make_mut(&mut self.state)
    }

    /// Publishes the pending edits as a new snapshot version.
    pub(super) fn seal(&mut self, kind: ChangeKind, fields: Vec<FieldId>) -> FormChange {
        let state = self.state_mut();
        state.version += 1;
        FormChange {
            version: state.version,
            kind,
            fields,
            snapshot: self.state.clone(),
        }
    }

    pub(super) fn field_id(&self, key: &str) -> Option<FieldId> {
        self.kinds.get(key).map(|kind| FieldId::new(key, *kind))
    }

    pub(super) fn known_fields(&self) -> Vec<FieldId> {
        self.kinds
            .iter()
            .map(|(key, kind)| FieldId::new(key.as_str(), *kind))
            .collect()
    }

    pub(super) fn refresh_pending(&mut self, key: &str) {
        let pending = self.validating.contains(key) || self.deriving.contains(key);
        let state = self.state_mut();
        if pending {
            state.pending_fields.insert(key.to_string());
        } else {
            state.pending_fields.remove(key);
        }
    }

    /// Recomputes the published result from the stored sync and async errors.
    pub(super) fn refresh_validation(&mut self, key: &str) {
        let error = self
            .sync_errors
            .get(key)
            .or_else(|| self.async_errors.get(key))
            .cloned();
        let is_validating = self.validating.contains(key);
        let result = ValidationResult {
            is_valid: error.is_none(),
            error_message: error,
            is_validating,
        };
        self.state_mut().validations.insert(key.to_string(), result);
    }

    pub(super) fn bump_validation_ticket(&mut self, key: &str) -> ValidationTicket {
        let ticket = self
            .validation_tickets
            .get(key)
            .copied()
            .unwrap_or_default()
            .next();
        self.validation_tickets.insert(key.to_string(), ticket);
        ticket
    }

    pub(super) fn bump_derivation_ticket(&mut self, key: &str) -> ValidationTicket {
        let ticket = self
            .derivation_tickets
            .get(key)
            .copied()
            .unwrap_or_default()
            .next();
        self.derivation_tickets.insert(key.to_string(), ticket);
        ticket
    }
}

#[derive(Default)]
pub(super) struct Collaborators {
    pub(super) draft_store: Option<Arc<dyn DynDraftStore>>,
    pub(super) analytics: Vec<Arc<dyn FormAnalytics>>,
}

/// Headless form engine handle. Clones share the same form.
#[derive(Clone)]
pub struct FormController {
    pub(super) id: FormId,
    pub(super) options: FormOptions,
    pub(super) core: Arc<RwLock<EngineCore>>,
    pub(super) observers: Arc<RwLock<ObserverList>>,
    pub(super) collaborators: Arc<RwLock<Collaborators>>,
}

impl FormController {
    #[track_caller]
    pub fn new(options: FormOptions) -> Self {
        let id = match options.form_id.clone() {
            Some(id) => id,
            None => FormId::from_callsite("form"),
        };
        let core = EngineCore::new(options.history_limit);
        Self {
            id,
            options,
            core: Arc::new(RwLock::new(core)),
            observers: Arc::new(RwLock::new(ObserverList::default())),
            collaborators: Arc::new(RwLock::new(Collaborators::default())),
        }
    }

    pub fn form_id(&self) -> &FormId {
        &self.id
    }

    pub fn options(&self) -> &FormOptions {
        &self.options
    }

    /// Current snapshot; never blocks on async work.
    pub fn snapshot(&self) -> FormResult<Arc<FormState>> {
        Ok(read_lock(&self.core, "creating form snapshot")?.state.clone())
    }

    pub fn validation(&self, field: impl AsRef<FieldId>) -> FormResult<ValidationResult> {
        Ok(self.snapshot()?.validation(field.as_ref().key()))
    }

    pub fn set_step(&self, step: usize) -> FormResult<()> {
        let change = {
            let mut core = write_lock(&self.core, "changing form step")?;
            if core.state.step == step {
                return Ok(());
            }
            core.state_mut().step = step;
            core.seal(ChangeKind::Step, Vec::new())
        };
        self.notify(&change)
    }

    pub fn next_step(&self) -> FormResult<usize> {
        let step = self.snapshot()?.step.saturating_add(1);
        self.set_step(step)?;
        Ok(step)
    }

    pub fn previous_step(&self) -> FormResult<usize> {
        let step = self.snapshot()?.step.saturating_sub(1);
        self.set_step(step)?;
        Ok(step)
    }

    pub fn submit(&self, f: impl FnOnce(&FormState) -> FormResult<()>) -> FormResult<()> {
        self.begin_submit()?;
        let is_valid = self.validate_form(None)?;
        self.run_submit(is_valid, f)
    }

    pub async fn submit_async<F, Fut>(&self, f: F) -> FormResult<()>
    where
        F: FnOnce(Arc<FormState>) -> Fut,
        Fut: Future<Output = FormResult<()>>,
    {
        self.begin_submit()?;
        let is_valid = self.validate_form_async().await?;
        let Some(snapshot) = self.enter_submitting(is_valid)? else {
            return Ok(());
        };
        let result = f(snapshot).await;
        self.complete_submit(result)
    }

    fn run_submit(
        &self,
        is_valid: bool,
        f: impl FnOnce(&FormState) -> FormResult<()>,
    ) -> FormResult<()> {
        let Some(snapshot) = self.enter_submitting(is_valid)? else {
            return Ok(());
        };
        let result = f(&snapshot);
        self.complete_submit(result)
    }

    fn begin_submit(&self) -> FormResult<()> {
        let change = {
            let mut core = write_lock(&self.core, "preparing submit")?;
            if core.state.submit_state == SubmitState::Submitting {
                return Err(FormError::AlreadySubmitting);
            }
            transition_submit_state(core.state_mut(), SubmitState::Validating)?;
            let state = core.state_mut();
            state.submit_count = state.submit_count.saturating_add(1);
            core.seal(ChangeKind::Submit, Vec::new())
        };
        self.track(AnalyticsEvent::SubmitAttempt)?;
        self.notify(&change)
    }

    /// Moves to `Submitting` when valid; otherwise records the failure and
    /// returns `None`.
    fn enter_submitting(&self, is_valid: bool) -> FormResult<Option<Arc<FormState>>> {
        let (change, invalid) = {
            let mut core = write_lock(&self.core, "moving submit state")?;
            if is_valid {
                transition_submit_state(core.state_mut(), SubmitState::Submitting)?;
                (core.seal(ChangeKind::Submit, Vec::new()), Vec::new())
            } else {
                transition_submit_state(core.state_mut(), SubmitState::Failed)?;
                let invalid = core
                    .state
                    .validations
                    .iter()
                    .filter(|(_, result)| !result.is_valid)
                    .filter_map(|(key, _)| core.field_id(key))
                    .collect::<Vec<_>>();
                (core.seal(ChangeKind::Submit, Vec::new()), invalid)
            }
        };
        self.notify(&change)?;
        if is_valid {
            Ok(Some(change.snapshot))
        } else {
            self.track(AnalyticsEvent::SubmitFailure {
                invalid_fields: invalid,
            })?;
            Ok(None)
        }
    }

    fn complete_submit(&self, result: FormResult<()>) -> FormResult<()> {
        let change = {
            let mut core = write_lock(&self.core, "completing submit")?;
            let next = if result.is_ok() {
                core.submitted = true;
                SubmitState::Succeeded
            } else {
                SubmitState::Failed
            };
            transition_submit_state(core.state_mut(), next)?;
            core.seal(ChangeKind::Submit, Vec::new())
        };
        self.notify(&change)?;
        if result.is_ok() {
            self.track(AnalyticsEvent::SubmitSuccess)?;
            self.clear_draft()?;
        } else {
            self.track(AnalyticsEvent::SubmitFailure {
                invalid_fields: Vec::new(),
            })?;
        }
        result
    }

    /// Ends the form's lifecycle: flushes the draft and reports abandonment
    /// of a dirty form that was never submitted.
    pub fn dispose(&self) -> FormResult<()> {
        let (dirty, submitted) = {
            let core = read_lock(&self.core, "disposing form")?;
            (core.state.is_form_dirty(), core.submitted)
        };
        if !submitted {
            self.save_draft()?;
        }
        if dirty && !submitted {
            self.track(AnalyticsEvent::FormAbandoned)?;
        }
        Ok(())
    }
}

pub(super) fn transition_submit_state(
    state: &mut FormState,
    next: SubmitState,
) -> FormResult<()> {
    let current = state.submit_state;
    if current == next {
        return Ok(());
    }

    let allowed = matches!(
        (current, next),
        (SubmitState::Idle, SubmitState::Validating)
            | (SubmitState::Validating, SubmitState::Submitting)
            | (SubmitState::Validating, SubmitState::Failed)
            | (SubmitState::Submitting, SubmitState::Succeeded)
            | (SubmitState::Submitting, SubmitState::Failed)
            | (SubmitState::Succeeded, SubmitState::Validating)
            | (SubmitState::Failed, SubmitState::Validating)
            | (_, SubmitState::Idle)
    );
    if !allowed {
        return Err(FormError::InvalidStateTransition {
            from: current,
            to: next,
        });
    }
    state.submit_state = next;
    Ok(())
}

pub(super) fn read_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockReadGuard<'a, T>> {
    lock.read().map_err(|_| FormError::StatePoisoned(context))
}

pub(super) fn write_lock<'a, T>(
    lock: &'a RwLock<T>,
    context: &'static str,
) -> FormResult<RwLockWriteGuard<'a, T>> {
    lock.write().map_err(|_| FormError::StatePoisoned(context))
}
