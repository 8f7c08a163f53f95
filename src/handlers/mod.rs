//! HTTP handlers for the meta, data and errors actions.

pub mod api;
pub mod serialized;
pub use api::dispatch;
