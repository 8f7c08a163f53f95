//! sqlgate: read-only HTTP data endpoints generated from an HSON service description.

pub mod config;
pub mod error;
pub mod handlers;
pub mod hson;
pub mod refresh;
pub mod response;
pub mod routes;
pub mod service;
pub mod settings;
pub mod sql;
pub mod state;

pub use config::{resolve, ConfigSource, Resolution, ServiceCollection, Snapshot};
pub use error::{AppError, ExecError, LexError, LoadError};
pub use response::{success_many, success_one};
pub use routes::{api_routes, app, common_routes};
pub use service::{DataService, SqlExecutor, SqlSession, TdsExecutor};
pub use settings::Settings;
pub use state::AppState;
