//! SQL clause guard, SELECT assembly and typed parameter values.

mod builder;
pub mod guard;
pub mod params;
pub use builder::*;
pub use guard::{contains_keywords, is_positional_name, is_variable_name, strip_comments, GuardError};
pub use params::*;
