//! Connection pools keyed by connection string.

use crate::config::{Connection, ConnectionSettings};
use crate::error::ExecError;
use crate::service::executor::exec_error;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tiberius::{AuthMethod, Client, Config, EncryptionLevel};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

pub type SqlClient = Client<Compat<TcpStream>>;

/// Build the driver configuration from resolved settings.
///
/// `dataSource` accepts `host`, `host,port`, `host\instance` and an optional `tcp:` prefix.
/// The driver has no integrated security here; without a user id it logs in with an
/// empty SQL login.
pub fn tds_config(settings: &ConnectionSettings) -> Result<Config, ExecError> {
    let mut config = Config::new();
    let source = settings.data_source.trim();
    let source = source.strip_prefix("tcp:").unwrap_or(source);
    let (host, port) = match source.split_once(',') {
        Some((host, port)) => {
            let port = port
                .trim()
                .parse::<u16>()
                .map_err(|_| ExecError::Connect(format!("invalid port in data source '{}'", settings.data_source)))?;
            (host.trim(), Some(port))
        }
        None => (source, None),
    };
    match host.split_once('\\') {
        Some((host, instance)) => {
            config.host(host);
            config.instance_name(instance);
        }
        None => config.host(host),
    }
    if let Some(port) = port {
        config.port(port);
    }
    if let Some(catalog) = &settings.initial_catalog {
        config.database(catalog);
    }
    config.authentication(AuthMethod::sql_server(
        settings.user_id.as_deref().unwrap_or(""),
        settings.password.as_deref().unwrap_or(""),
    ));
    if settings.trust_server_certificate == Some(true) {
        config.trust_cert();
    }
    match settings.encrypt {
        Some(true) => config.encryption(EncryptionLevel::Required),
        Some(false) => config.encryption(EncryptionLevel::Off),
        None => {}
    }
    if let Some(app) = &settings.application_name {
        config.application_name(app);
    }
    config.readonly(true);
    Ok(config)
}

/// Bounded pool for one connection string. Up to `max_size` connections are checked out
/// at once; after the first checkout the pool fills itself up to `min_size`.
pub struct ConnectionPool {
    config: Config,
    pooling: bool,
    min_size: usize,
    max_size: usize,
    connect_timeout: Duration,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<SqlClient>>,
    warmed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(settings: &ConnectionSettings) -> Result<Self, ExecError> {
        Ok(ConnectionPool {
            config: tds_config(settings)?,
            pooling: settings.pooling,
            min_size: settings.min_pool_size as usize,
            max_size: settings.max_pool_size as usize,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs as u64),
            permits: Arc::new(Semaphore::new(settings.max_pool_size as usize)),
            idle: Mutex::new(Vec::new()),
            warmed: AtomicBool::new(false),
        })
    }

    /// Connections still needed to reach the minimum size, counting idle and checked-out ones.
    fn shortfall(&self) -> usize {
        if !self.pooling {
            return 0;
        }
        let in_use = self.max_size - self.permits.available_permits();
        self.min_size.saturating_sub(self.idle_count() + in_use)
    }

    /// Open connections in the background up to the minimum size. Runs once per pool and
    /// stops at the first failure; the request path opens its own connections regardless.
    fn warm(self: &Arc<Self>) {
        if self.shortfall() == 0 || self.warmed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.fill().await });
    }

    async fn fill(&self) -> usize {
        let mut opened = 0;
        while self.shortfall() > 0 {
            let Ok(_permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let connected = if self.connect_timeout.is_zero() {
                self.connect().await
            } else {
                tokio::time::timeout(self.connect_timeout, self.connect())
                    .await
                    .unwrap_or(Err(ExecError::Timeout(self.connect_timeout)))
            };
            match connected {
                Ok(client) => {
                    self.idle.lock().unwrap_or_else(|e| e.into_inner()).push(client);
                    opened += 1;
                }
                Err(e) => {
                    tracing::warn!(error = %e, opened, "could not pre-open pooled connections");
                    break;
                }
            }
        }
        tracing::debug!(opened, idle = self.idle_count(), "connection pool warmed");
        opened
    }

    fn take_idle(&self) -> Option<SqlClient> {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).pop()
    }

    /// Check out a connection, opening one when none is idle. Waiting for a free slot
    /// and opening both count against the connect timeout.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledClient, ExecError> {
        let timeout = self.connect_timeout;
        let checkout = async {
            let permit = self
                .permits
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| ExecError::Connect(e.to_string()))?;
            let client = match self.take_idle() {
                Some(client) => client,
                None => self.connect().await?,
            };
            Ok::<_, ExecError>((client, permit))
        };
        let (client, permit) = if timeout.is_zero() {
            checkout.await?
        } else {
            tokio::time::timeout(timeout, checkout)
                .await
                .map_err(|_| ExecError::Timeout(timeout))??
        };
        let pooled = PooledClient {
            client,
            reusable: self.pooling,
            pool: Arc::clone(self),
            _permit: permit,
        };
        self.warm();
        Ok(pooled)
    }

    async fn connect(&self) -> Result<SqlClient, ExecError> {
        let tcp = TcpStream::connect(self.config.get_addr())
            .await
            .map_err(|e| ExecError::Connect(e.to_string()))?;
        tcp.set_nodelay(true).map_err(|e| ExecError::Connect(e.to_string()))?;
        match Client::connect(self.config.clone(), tcp.compat_write()).await {
            Ok(client) => Ok(client),
            // Azure gateways redirect to the actual node.
            Err(tiberius::error::Error::Routing { host, port }) => {
                let mut config = self.config.clone();
                config.host(&host);
                config.port(port);
                let tcp = TcpStream::connect(config.get_addr())
                    .await
                    .map_err(|e| ExecError::Connect(e.to_string()))?;
                tcp.set_nodelay(true).map_err(|e| ExecError::Connect(e.to_string()))?;
                Client::connect(config, tcp.compat_write()).await.map_err(exec_error)
            }
            Err(e) => Err(exec_error(e)),
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// A checked-out connection. Call [`PooledClient::release`] when done; dropping it
/// closes the connection instead of returning it.
pub struct PooledClient {
    client: SqlClient,
    reusable: bool,
    pool: Arc<ConnectionPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledClient {
    pub fn client(&mut self) -> &mut SqlClient {
        &mut self.client
    }

    /// The connection is in an unknown state and must not be reused.
    pub fn mark_broken(&mut self) {
        self.reusable = false;
    }

    pub fn release(self) {
        if self.reusable {
            self.pool
                .idle
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(self.client);
        }
    }
}

/// One pool per distinct connection string, created on first use.
#[derive(Default)]
pub struct PoolRegistry {
    pools: RwLock<HashMap<String, Arc<ConnectionPool>>>,
}

impl PoolRegistry {
    pub fn pool_for(&self, connection: &Connection) -> Result<Arc<ConnectionPool>, ExecError> {
        if let Some(pool) = self
            .pools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&connection.connection_string)
        {
            return Ok(Arc::clone(pool));
        }
        let mut pools = self.pools.write().unwrap_or_else(|e| e.into_inner());
        if let Some(pool) = pools.get(&connection.connection_string) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(ConnectionPool::new(&connection.settings)?);
        tracing::debug!(data_source = %connection.settings.data_source, "created connection pool");
        pools.insert(connection.connection_string.clone(), Arc::clone(&pool));
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.pools.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_connection;
    use crate::config::Tokens;
    use serde_json::json;

    fn connection(v: serde_json::Value) -> Connection {
        parse_connection(&v, &Tokens::new()).unwrap()
    }

    #[test]
    fn data_source_forms() {
        let c = tds_config(&connection(json!({ "dataSource": "tcp:db.example.com,1444" })).settings).unwrap();
        assert_eq!(c.get_addr(), "db.example.com:1444");
        let c = tds_config(&connection(json!({ "dataSource": "localhost" })).settings).unwrap();
        assert_eq!(c.get_addr(), "localhost:1433");
        assert!(tds_config(&connection(json!({ "dataSource": "db,notaport" })).settings).is_err());
    }

    #[test]
    fn registry_shares_pools_per_connection_string() {
        let registry = PoolRegistry::default();
        let a = connection(json!({ "dataSource": "db1" }));
        let b = connection(json!({ "dataSource": "db2" }));
        let p1 = registry.pool_for(&a).unwrap();
        let p2 = registry.pool_for(&a).unwrap();
        registry.pool_for(&b).unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));
        assert_eq!(registry.len(), 2);
        assert_eq!(p1.idle_count(), 0);
    }

    #[test]
    fn shortfall_counts_towards_min_pool_size() {
        let c = connection(json!({ "dataSource": "db1", "minPoolSize": 3, "maxPoolSize": 5 }));
        let pool = ConnectionPool::new(&c.settings).unwrap();
        assert_eq!(pool.shortfall(), 3);
        let _held = pool.permits.clone().try_acquire_many_owned(2).unwrap();
        assert_eq!(pool.shortfall(), 1);

        let unpooled = connection(json!({ "dataSource": "db1", "minPoolSize": 3, "pooling": false }));
        assert_eq!(ConnectionPool::new(&unpooled.settings).unwrap().shortfall(), 0);
    }

    #[tokio::test]
    async fn filling_stops_at_the_first_failed_connect() {
        let c = connection(json!({ "dataSource": "127.0.0.1,9", "minPoolSize": 2, "connectTimeout": 1 }));
        let pool = ConnectionPool::new(&c.settings).unwrap();
        assert_eq!(pool.fill().await, 0);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.permits.available_permits(), pool.max_size);
    }
}
