pub mod connection;
pub mod interpolate;
pub mod loader;
pub mod source;
pub mod types;

pub use connection::{parse_connection, Connection, ConnectionSettings, ConnectionView};
pub use interpolate::{interpolate, Tokens};
pub use loader::{resolve, Resolution};
pub use source::{ConfigSource, Snapshot, ZERO_HASH};
pub use types::*;
