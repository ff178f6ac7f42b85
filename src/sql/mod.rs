//! SQL utilities for Feature Store
//!
//! Literal escaping, LIKE-pattern escaping and identifier quoting.

pub mod escape;
pub mod sanitize;

pub use escape::{NamePatternEscaper, escape_literal, escape_sql};
pub use sanitize::{quote_identifier, quote_qualified, validate_parameter_name};
