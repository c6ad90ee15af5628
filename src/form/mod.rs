mod analytics;
mod controller;
mod derivation;
mod draft;
mod graph;
mod history;
mod inspector;
mod model;
mod observer;
mod registry;
mod store;
mod validation;
mod value;

#[cfg(test)]
mod tests;

pub use analytics::{AnalyticsEvent, AnalyticsLog, FormAnalytics};
pub use controller::{
    ConfigurationError, FormController, FormError, FormId, FormOptions, FormResult, FormState,
    RevalidateMode, SubmitState, ValidationMode, ValidationTicket,
};
pub use derivation::Derivation;
pub use draft::{DraftValues, FormDraftStore, InMemoryDraftStore};
pub use formix_derive::FormModel;
pub use graph::DependencyGraph;
pub use history::{HistoryEntry, HistoryManager};
pub use inspector::FormInspector;
pub use model::FormModel;
pub use observer::{ChangeKind, FormChange, SubscriptionId, SubscriptionScope};
pub use registry::{FieldBuilder, FieldDefinition};
pub use validation::{
    AsyncFieldValidator, CrossFieldValidator, FieldValidator, VALIDATION_FAILED,
    ValidationResult,
};
pub use value::{Field, FieldId, FieldKind, FieldType, FieldValue};
