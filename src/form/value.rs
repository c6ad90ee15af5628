use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;

use rust_decimal::Decimal;

/// Declared value type of a field.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Bool,
    List,
}

impl FieldKind {
    pub fn zero(self) -> FieldValue {
        match self {
            FieldKind::Text => FieldValue::Text(String::new()),
            FieldKind::Integer => FieldValue::Integer(0),
            FieldKind::Decimal => FieldValue::Decimal(Decimal::ZERO),
            FieldKind::Bool => FieldValue::Bool(false),
            FieldKind::List => FieldValue::List(Vec::new()),
        }
    }
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldKind::Text => "text",
            FieldKind::Integer => "integer",
            FieldKind::Decimal => "decimal",
            FieldKind::Bool => "bool",
            FieldKind::List => "list",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Bool(bool),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Integer(_) => FieldKind::Integer,
            FieldValue::Decimal(_) => FieldKind::Decimal,
            FieldValue::Bool(_) => FieldKind::Bool,
            FieldValue::List(_) => FieldKind::List,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            FieldValue::Decimal(value) => Some(*value),
            FieldValue::Integer(value) => Some(Decimal::from(*value)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[FieldValue]> {
        match self {
            FieldValue::List(values) => Some(values),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Integer(value)
    }
}

impl From<Decimal> for FieldValue {
    fn from(value: Decimal) -> Self {
        FieldValue::Decimal(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

/// Rust types that can live in a form field.
pub trait FieldType: Clone + PartialEq + Send + Sync + 'static {
    const KIND: FieldKind;

    fn into_value(self) -> FieldValue;
    fn from_value(value: &FieldValue) -> Option<Self>;
}

impl FieldType for String {
    const KIND: FieldKind = FieldKind::Text;

    fn into_value(self) -> FieldValue {
        FieldValue::Text(self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        value.as_text().map(str::to_string)
    }
}

impl FieldType for i64 {
    const KIND: FieldKind = FieldKind::Integer;

    fn into_value(self) -> FieldValue {
        FieldValue::Integer(self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        value.as_integer()
    }
}

impl FieldType for Decimal {
    const KIND: FieldKind = FieldKind::Decimal;

    fn into_value(self) -> FieldValue {
        FieldValue::Decimal(self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        match value {
            FieldValue::Decimal(value) => Some(*value),
            _ => None,
        }
    }
}

impl FieldType for bool {
    const KIND: FieldKind = FieldKind::Bool;

    fn into_value(self) -> FieldValue {
        FieldValue::Bool(self)
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        value.as_bool()
    }
}

impl<T> FieldType for Vec<T>
where
    T: FieldType,
{
    const KIND: FieldKind = FieldKind::List;

    fn into_value(self) -> FieldValue {
        FieldValue::List(self.into_iter().map(FieldType::into_value).collect())
    }

    fn from_value(value: &FieldValue) -> Option<Self> {
        value.as_list()?.iter().map(T::from_value).collect()
    }
}

/// Field identity: key plus declared kind. Two ids with the same key but
/// different kinds never compare equal.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldId {
    key: Arc<str>,
    kind: FieldKind,
}

impl FieldId {
    pub fn new(key: impl Into<Arc<str>>, kind: FieldKind) -> Self {
        Self {
            key: key.into(),
            kind,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }
}

impl Display for FieldId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.key, self.kind)
    }
}

/// Typed handle to a field. The value type is checked at compile time.
pub struct Field<T> {
    id: FieldId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Field<T>
where
    T: FieldType,
{
    pub fn new(key: impl Into<Arc<str>>) -> Self {
        Self {
            id: FieldId::new(key, T::KIND),
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> &FieldId {
        &self.id
    }

    pub fn key(&self) -> &str {
        self.id.key()
    }
}

impl<T> Clone for Field<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Field").field(&self.id).finish()
    }
}

impl<T> PartialEq for Field<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Field<T> {}

impl AsRef<FieldId> for FieldId {
    fn as_ref(&self) -> &FieldId {
        self
    }
}

impl<T> AsRef<FieldId> for Field<T> {
    fn as_ref(&self) -> &FieldId {
        &self.id
    }
}

impl<T> From<Field<T>> for FieldId {
    fn from(field: Field<T>) -> Self {
        field.id
    }
}

impl<T> From<&Field<T>> for FieldId {
    fn from(field: &Field<T>) -> Self {
        field.id.clone()
    }
}

impl From<&FieldId> for FieldId {
    fn from(id: &FieldId) -> Self {
        id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_discriminate_by_kind() {
        let text = FieldId::new("amount", FieldKind::Text);
        let number = FieldId::new("amount", FieldKind::Integer);
        assert_ne!(text, number);
        assert_eq!(text, Field::<String>::new("amount").id().clone());
    }

    #[test]
    fn zero_values_match_kind() {
        for kind in [
            FieldKind::Text,
            FieldKind::Integer,
            FieldKind::Decimal,
            FieldKind::Bool,
            FieldKind::List,
        ] {
            assert_eq!(kind.zero().kind(), kind);
        }
        assert_eq!(FieldKind::Text.zero(), FieldValue::from(""));
    }

    #[test]
    fn list_conversion_rejects_mixed_items() {
        let mixed = FieldValue::List(vec![FieldValue::from("a"), FieldValue::Integer(1)]);
        assert_eq!(Vec::<String>::from_value(&mixed), None);

        let tags = vec!["a".to_string(), "b".to_string()].into_value();
        assert_eq!(
            Vec::<String>::from_value(&tags),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }
}
