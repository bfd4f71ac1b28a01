pub mod field_spec;
pub mod numeric;
pub mod text;
