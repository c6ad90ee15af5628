use super::controller::{FormController, FormError, FormResult, FormState};
use super::registry::FieldDefinition;
use super::value::FieldType;

/// A plain struct whose fields map one-to-one onto form fields. Usually
/// implemented through `#[derive(FormModel)]`.
pub trait FormModel: Sized + Send + Sync + 'static {
    type Fields;

    fn fields() -> Self::Fields;

    /// One definition per field, initialized from `self`.
    fn definitions(&self) -> Vec<FieldDefinition>;

    fn from_state(state: &FormState) -> FormResult<Self>;
}

impl FormState {
    /// Typed read that fails for missing keys and values of another kind.
    pub fn read<T>(&self, key: &str) -> FormResult<T>
    where
        T: FieldType,
    {
        let value = self
            .values
            .get(key)
            .ok_or_else(|| FormError::UnknownField(key.to_string()))?;
        T::from_value(value).ok_or_else(|| FormError::ValueKindMismatch {
            field: key.to_string(),
            expected: T::KIND,
            actual: value.kind(),
        })
    }
}

impl FormController {
    /// Registers every field of `model` with the model's values as initial
    /// values.
    pub fn register_model<M>(&self, model: &M) -> FormResult<()>
    where
        M: FormModel,
    {
        for definition in model.definitions() {
            self.register(definition)?;
        }
        Ok(())
    }

    pub fn model<M>(&self) -> FormResult<M>
    where
        M: FormModel,
    {
        let snapshot = self.snapshot()?;
        M::from_state(&snapshot)
    }
}
