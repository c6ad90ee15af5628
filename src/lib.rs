pub mod form;
pub mod id;
