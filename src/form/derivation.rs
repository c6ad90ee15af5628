use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use futures_timer::Delay;

use super::controller::{
    ConfigurationError, EngineCore, FormController, FormResult, ValidationTicket, read_lock,
    write_lock,
};
use super::history::HistoryPolicy;
use super::observer::ChangeKind;
use super::store::WriteEffect;
use super::value::{Field, FieldId, FieldType, FieldValue};

type DeriveFn = Arc<dyn Fn(&[FieldValue]) -> FieldValue + Send + Sync>;
type AsyncDeriveFn = Arc<dyn Fn(Vec<FieldValue>) -> BoxFuture<'static, FieldValue> + Send + Sync>;
type SelectFn = Arc<dyn Fn(&[FieldValue]) -> FieldValue + Send + Sync>;

#[derive(Clone)]
pub(super) enum Compute {
    Sync(DeriveFn),
    Async {
        debounce: Option<Duration>,
        derive: AsyncDeriveFn,
    },
}

/// A computed relationship: `target` is rewritten from `sources` whenever
/// one of them changes.
#[derive(Clone)]
pub struct Derivation {
    target: FieldId,
    sources: Vec<FieldId>,
    compute: Compute,
    select: Option<SelectFn>,
}

impl Derivation {
    /// `derive` receives the source values in the order given.
    pub fn new<T, F>(
        target: &Field<T>,
        sources: impl IntoIterator<Item = impl AsRef<FieldId>>,
        derive: F,
    ) -> Self
    where
        T: FieldType,
        F: Fn(&[FieldValue]) -> T + Send + Sync + 'static,
    {
        Self {
            target: target.id().clone(),
            sources: collect_sources(sources),
            compute: Compute::Sync(Arc::new(move |values: &[FieldValue]| {
                derive(values).into_value()
            })),
            select: None,
        }
    }

    pub fn new_async<T, F, Fut>(
        target: &Field<T>,
        sources: impl IntoIterator<Item = impl AsRef<FieldId>>,
        derive: F,
    ) -> Self
    where
        T: FieldType,
        F: Fn(Vec<FieldValue>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        Self {
            target: target.id().clone(),
            sources: collect_sources(sources),
            compute: Compute::Async {
                debounce: None,
                derive: Arc::new(move |values: Vec<FieldValue>| {
                    derive(values).map(|value: T| value.into_value()).boxed()
                }),
            },
            select: None,
        }
    }

    /// Skips recomputation while the projected value of the sources is
    /// unchanged.
    pub fn select<P>(mut self, projector: P) -> Self
    where
        P: Fn(&[FieldValue]) -> FieldValue + Send + Sync + 'static,
    {
        self.select = Some(Arc::new(projector));
        self
    }

    /// Debounce for async derivations; ignored for sync ones.
    pub fn debounce(mut self, debounce_ms: u64) -> Self {
        if let Compute::Async { debounce, .. } = &mut self.compute {
            *debounce = Some(Duration::from_millis(debounce_ms));
        }
        self
    }

    pub fn target(&self) -> &FieldId {
        &self.target
    }

    pub fn sources(&self) -> &[FieldId] {
        &self.sources
    }
}

fn collect_sources(sources: impl IntoIterator<Item = impl AsRef<FieldId>>) -> Vec<FieldId> {
    sources
        .into_iter()
        .map(|source| source.as_ref().clone())
        .collect()
}

pub(super) struct DerivationEntry {
    pub(super) sources: Vec<FieldId>,
    pub(super) compute: Compute,
    pub(super) select: Option<SelectFn>,
    pub(super) last_projection: Option<FieldValue>,
}

pub(super) enum DerivationStep {
    Write(FieldValue),
    Queued,
    Skipped,
}

struct AsyncDerivationJob {
    ticket: ValidationTicket,
    debounce: Duration,
    inputs: Vec<FieldValue>,
    derive: AsyncDeriveFn,
}

impl EngineCore {
    fn derivation_inputs(&self, sources: &[FieldId]) -> Vec<FieldValue> {
        sources
            .iter()
            .map(|source| self.current_value(source))
            .collect()
    }

    /// Evaluates the derivation targeting `field`, if any. Sync results are
    /// returned for the caller to write; async ones are queued.
    pub(super) fn step_derivation(&mut self, field: &FieldId) -> DerivationStep {
        let Some(entry) = self.derivations.get(field) else {
            return DerivationStep::Skipped;
        };
        let compute = entry.compute.clone();
        let select = entry.select.clone();
        let inputs = self.derivation_inputs(&entry.sources);

        if let Some(select) = select {
            let projection = match catch_unwind(AssertUnwindSafe(|| select(&inputs))) {
                Ok(projection) => projection,
                Err(_) => {
                    tracing::warn!(field = %field, "derivation projector panicked");
                    return DerivationStep::Skipped;
                }
            };
            let Some(entry) = self.derivations.get_mut(field) else {
                return DerivationStep::Skipped;
            };
            if entry.last_projection.as_ref() == Some(&projection) {
                tracing::trace!(field = %field, "projection unchanged, skipping derivation");
                return DerivationStep::Skipped;
            }
            entry.last_projection = Some(projection);
        }

        match compute {
            Compute::Sync(derive) => match catch_unwind(AssertUnwindSafe(|| derive(&inputs))) {
                Ok(value) => DerivationStep::Write(value),
                Err(_) => {
                    tracing::warn!(field = %field, "derivation panicked, keeping previous value");
                    DerivationStep::Skipped
                }
            },
            Compute::Async { .. } => {
                self.queue_async_derivation(field);
                DerivationStep::Queued
            }
        }
    }

    fn queue_async_derivation(&mut self, field: &FieldId) {
        let key = field.key();
        self.bump_derivation_ticket(key);
        self.derivation_queue.insert(field.clone());
        self.deriving.insert(key.to_string());
        self.refresh_pending(key);
    }

    fn begin_async_derivation(
        &mut self,
        field: &FieldId,
        default_debounce: Duration,
    ) -> Option<AsyncDerivationJob> {
        let entry = self.derivations.get(field)?;
        let Compute::Async { debounce, derive } = entry.compute.clone() else {
            return None;
        };
        let inputs = self.derivation_inputs(&entry.sources);
        let key = field.key();
        let ticket = self.bump_derivation_ticket(key);
        self.derivation_queue.remove(field);
        self.deriving.insert(key.to_string());
        self.refresh_pending(key);
        Some(AsyncDerivationJob {
            ticket,
            debounce: debounce.unwrap_or(default_debounce),
            inputs,
            derive,
        })
    }

    fn is_latest_derivation(&self, field: &FieldId, ticket: ValidationTicket) -> bool {
        self.derivation_tickets.get(field.key()).copied() == Some(ticket)
    }
}

impl FormController {
    /// Registers a derived field. Sync derivations are computed immediately;
    /// the first computed value becomes the target's initial value unless the
    /// target was already edited.
    pub fn add_derivation(&self, derivation: Derivation) -> FormResult<()> {
        let Derivation {
            target,
            sources,
            compute,
            select,
        } = derivation;
        let change = {
            let mut core = write_lock(&self.core, "adding derivation")?;
            core.check_kind(&target)?;
            for source in &sources {
                core.check_kind(source)?;
            }
            if core.derivations.keys().any(|field| field.key() == target.key()) {
                return Err(
                    ConfigurationError::DuplicateDerivation(target.key().to_string()).into(),
                );
            }

            core.derivations.insert(
                target.clone(),
                DerivationEntry {
                    sources,
                    compute,
                    select,
                    last_projection: None,
                },
            );
            if let Err(error) = core.rebuild_graph() {
                core.derivations.remove(&target);
                tracing::warn!(field = %target, %error, "rejected derivation");
                return Err(error.into());
            }
            let key = target.key().to_string();
            if !core.kinds.contains_key(&key) {
                core.kinds.insert(key.clone(), target.kind());
            }

            let mut fields = vec![target.clone()];
            if let DerivationStep::Write(value) = core.step_derivation(&target) {
                if !core.state.is_dirty(&key) {
                    core.initial_values.insert(key.clone(), value.clone());
                }
                if !core.state.values.contains_key(&key) {
                    core.state_mut().values.insert(key.clone(), value.clone());
                }
                if core.write_value(&target, value) == WriteEffect::Changed {
                    core.on_value_changed(&target, &self.options);
                    let (derived, revalidated) =
                        core.propagate(std::slice::from_ref(&target), &self.options);
                    fields.extend(derived);
                    fields.extend(revalidated);
                }
            }
            core.record_history(HistoryPolicy::Amend);
            tracing::debug!(field = %target, "added derivation");
            core.seal(ChangeKind::Values, fields)
        };
        self.notify(&change)
    }

    /// Removes the derivation targeting `field`; the last derived value stays.
    pub fn remove_derivation(&self, field: impl AsRef<FieldId>) -> FormResult<bool> {
        let field = field.as_ref();
        let mut core = write_lock(&self.core, "removing derivation")?;
        if core.derivations.remove(field).is_none() {
            return Ok(false);
        }
        core.rebuild_graph()?;
        let key = field.key();
        core.bump_derivation_ticket(key);
        core.derivation_queue.remove(field);
        core.deriving.remove(key);
        core.refresh_pending(key);
        Ok(true)
    }

    pub fn derivation_targets(&self) -> FormResult<Vec<FieldId>> {
        Ok(read_lock(&self.core, "listing derivations")?
            .derivations
            .keys()
            .cloned()
            .collect())
    }

    /// Runs the async derivation targeting `field` after its debounce and
    /// writes the result unless a newer request superseded it.
    pub async fn derive_async(&self, field: impl AsRef<FieldId>) -> FormResult<()> {
        let field = field.as_ref().clone();
        let job = {
            let mut core = write_lock(&self.core, "starting async derivation")?;
            match core.begin_async_derivation(&field, self.options.default_debounce) {
                Some(job) => job,
                None => return Ok(()),
            }
        };

        if !job.debounce.is_zero() {
            Delay::new(job.debounce).await;
            let core = read_lock(&self.core, "checking latest derivation ticket")?;
            if !core.is_latest_derivation(&field, job.ticket) {
                return Ok(());
            }
        }

        let value = AssertUnwindSafe((job.derive)(job.inputs))
            .catch_unwind()
            .await;

        let write = {
            let mut core = write_lock(&self.core, "finishing async derivation")?;
            if !core.is_latest_derivation(&field, job.ticket) {
                tracing::debug!(
                    field = %field,
                    ticket = job.ticket.0,
                    "discarding stale async derivation"
                );
                return Ok(());
            }
            core.deriving.remove(field.key());
            core.refresh_pending(field.key());
            match value {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(
                        field = %field,
                        "async derivation panicked, keeping previous value"
                    );
                    None
                }
            }
        };

        match write {
            Some(value) => {
                let changed = self.commit(
                    vec![(field.clone(), value)],
                    ChangeKind::Values,
                    HistoryPolicy::Amend,
                )?;
                if changed.is_empty() {
                    self.publish_pending(&field)?;
                }
                Ok(())
            }
            None => self.publish_pending(&field),
        }
    }

    /// Notifies observers that the field's pending flag settled without a
    /// value change.
    fn publish_pending(&self, field: &FieldId) -> FormResult<()> {
        let change = write_lock(&self.core, "publishing derivation state")?
            .seal(ChangeKind::Values, vec![field.clone()]);
        self.notify(&change)
    }
}
