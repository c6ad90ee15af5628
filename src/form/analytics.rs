use std::sync::{Arc, RwLock};

use super::controller::{FormController, FormId, FormResult, read_lock, write_lock};
use super::value::FieldId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AnalyticsEvent {
    FormStarted,
    FieldChanged { field: FieldId },
    FieldTouched { field: FieldId },
    SubmitAttempt,
    SubmitSuccess,
    SubmitFailure { invalid_fields: Vec<FieldId> },
    /// Disposed while dirty without a successful submit.
    FormAbandoned,
}

/// Side channel for form usage events. Never influences engine behavior.
pub trait FormAnalytics: Send + Sync + 'static {
    fn record(&self, form_id: &FormId, event: &AnalyticsEvent);
}

/// Keeps every recorded event in memory.
#[derive(Clone, Default)]
pub struct AnalyticsLog {
    events: Arc<RwLock<Vec<(FormId, AnalyticsEvent)>>>,
}

impl AnalyticsLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(FormId, AnalyticsEvent)> {
        match self.events.read() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn count(&self, predicate: impl Fn(&AnalyticsEvent) -> bool) -> usize {
        self.events()
            .iter()
            .filter(|(_, event)| predicate(event))
            .count()
    }
}

impl FormAnalytics for AnalyticsLog {
    fn record(&self, form_id: &FormId, event: &AnalyticsEvent) {
        let mut events = match self.events.write() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push((form_id.clone(), event.clone()));
    }
}

impl FormController {
    /// Attaches an analytics sink and reports `FormStarted` to it.
    pub fn with_analytics<A>(self, analytics: A) -> Self
    where
        A: FormAnalytics,
    {
        let analytics = Arc::new(analytics);
        match write_lock(&self.collaborators, "attaching analytics") {
            Ok(mut collaborators) => {
                collaborators.analytics.push(analytics.clone());
                analytics.record(&self.id, &AnalyticsEvent::FormStarted);
            }
            Err(error) => tracing::warn!(form = %self.id, %error, "analytics not attached"),
        }
        self
    }

    pub(super) fn track(&self, event: AnalyticsEvent) -> FormResult<()> {
        let sinks = read_lock(&self.collaborators, "reading analytics")?
            .analytics
            .clone();
        for sink in sinks {
            sink.record(&self.id, &event);
        }
        Ok(())
    }
}
