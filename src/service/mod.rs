//! Data execution: database sessions, pooling, row shaping.

pub mod data;
pub mod executor;
pub mod mapping;
pub mod pool;

pub use data::{DataMeta, DataResult, DataService, ParameterValue, Timings};
pub use executor::{SqlExecutor, SqlSession, TdsExecutor};
pub use mapping::RowMapper;
pub use pool::{ConnectionPool, PoolRegistry, PooledClient};
