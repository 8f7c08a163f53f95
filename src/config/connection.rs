//! Connection objects in configuration and the ADO-style connection strings built from them.

use crate::config::interpolate::{interpolate, Tokens};
use serde::Serialize;
use serde_json::{Map, Value};

pub const DEFAULT_MIN_POOL_SIZE: u32 = 16;
pub const DEFAULT_MAX_POOL_SIZE: u32 = 256;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u32 = 10;
pub const MIN_PACKET_SIZE: u32 = 512;
pub const MAX_PACKET_SIZE: u32 = 32768;

/// Settings of one resolved `connection` object.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionSettings {
    pub data_source: String,
    pub initial_catalog: Option<String>,
    /// `None` means integrated security.
    pub user_id: Option<String>,
    pub password: Option<String>,
    pub pooling: bool,
    pub min_pool_size: u32,
    pub max_pool_size: u32,
    pub connect_timeout_secs: u32,
    pub packet_size: u32,
    pub trust_server_certificate: Option<bool>,
    pub encrypt: Option<bool>,
    pub application_name: Option<String>,
}

/// A connection as exposed in meta views: no credentials.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionView<'a> {
    pub data_source: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_catalog: Option<&'a str>,
}

/// Resolved connection: settings plus the connection string that keys its pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connection {
    pub settings: ConnectionSettings,
    pub connection_string: String,
}

impl Connection {
    pub fn new(settings: ConnectionSettings) -> Self {
        let connection_string = settings.to_connection_string();
        Connection {
            settings,
            connection_string,
        }
    }

    pub fn view(&self) -> ConnectionView<'_> {
        ConnectionView {
            data_source: &self.settings.data_source,
            initial_catalog: self.settings.initial_catalog.as_deref(),
        }
    }
}

fn quote_value(value: &str) -> String {
    let needs_quotes = value.contains([';', '"', '\''])
        || value.starts_with(char::is_whitespace)
        || value.ends_with(char::is_whitespace);
    if needs_quotes {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "True"
    } else {
        "False"
    }
}

impl ConnectionSettings {
    /// Render as an ADO.NET-style connection string. Asynchronous processing and
    /// read-only application intent are always on.
    pub fn to_connection_string(&self) -> String {
        let mut parts: Vec<String> = vec![format!("Server={}", quote_value(&self.data_source))];
        if let Some(catalog) = &self.initial_catalog {
            parts.push(format!("Database={}", quote_value(catalog)));
        }
        match &self.user_id {
            Some(user) => {
                parts.push(format!("User ID={}", quote_value(user)));
                parts.push(format!("Password={}", quote_value(self.password.as_deref().unwrap_or(""))));
            }
            None => parts.push("Integrated Security=True".into()),
        }
        parts.push(format!("Pooling={}", yes_no(self.pooling)));
        parts.push(format!("Min Pool Size={}", self.min_pool_size));
        parts.push(format!("Max Pool Size={}", self.max_pool_size));
        parts.push(format!("Connect Timeout={}", self.connect_timeout_secs));
        parts.push(format!("Packet Size={}", self.packet_size));
        parts.push("Asynchronous Processing=True".into());
        parts.push("ApplicationIntent=ReadOnly".into());
        if let Some(trust) = self.trust_server_certificate {
            parts.push(format!("TrustServerCertificate={}", yes_no(trust)));
        }
        if let Some(encrypt) = self.encrypt {
            parts.push(format!("Encrypt={}", yes_no(encrypt)));
        }
        if let Some(app) = &self.application_name {
            parts.push(format!("Application Name={}", quote_value(app)));
        }
        parts.join(";")
    }
}

fn get_string(obj: &Map<String, Value>, key: &str, tokens: &Tokens) -> Result<Option<String>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(interpolate(s, tokens))),
        Some(_) => Err(format!("`{}` is expected to be a string", key)),
    }
}

fn get_bool(obj: &Map<String, Value>, key: &str) -> Result<Option<bool>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(format!("`{}` is expected to be a boolean", key)),
    }
}

fn get_int(obj: &Map<String, Value>, key: &str) -> Result<Option<i64>, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| format!("`{}` is expected to be an integer", key)),
        Some(_) => Err(format!("`{}` is expected to be an integer", key)),
    }
}

fn non_negative(value: Option<i64>, key: &str, default: u32) -> Result<u32, String> {
    match value {
        None => Ok(default),
        Some(v) => u32::try_from(v).map_err(|_| format!("`{}` must be a non-negative integer, got {}", key, v)),
    }
}

fn parse_settings(obj: &Map<String, Value>, tokens: &Tokens) -> Result<ConnectionSettings, String> {
    let data_source = get_string(obj, "dataSource", tokens)?
        .filter(|s| !s.is_empty())
        .ok_or_else(|| "`dataSource` is required".to_string())?;
    let initial_catalog = get_string(obj, "initialCatalog", tokens)?;
    let user_id = get_string(obj, "userID", tokens)?;
    let password = match user_id {
        Some(_) => get_string(obj, "password", tokens)?,
        None => None,
    };

    let min_pool_size = non_negative(get_int(obj, "minPoolSize")?, "minPoolSize", DEFAULT_MIN_POOL_SIZE)?;
    let max_pool_size = non_negative(get_int(obj, "maxPoolSize")?, "maxPoolSize", DEFAULT_MAX_POOL_SIZE)?;
    if max_pool_size == 0 {
        return Err("`maxPoolSize` must be greater than zero".into());
    }
    if min_pool_size > max_pool_size {
        return Err(format!(
            "`minPoolSize` ({}) must not exceed `maxPoolSize` ({})",
            min_pool_size, max_pool_size
        ));
    }
    let connect_timeout_secs = non_negative(
        get_int(obj, "connectTimeout")?,
        "connectTimeout",
        DEFAULT_CONNECT_TIMEOUT_SECS,
    )?;
    let packet_size = get_int(obj, "packetSize")?
        .unwrap_or(MAX_PACKET_SIZE as i64)
        .clamp(MIN_PACKET_SIZE as i64, MAX_PACKET_SIZE as i64) as u32;

    Ok(ConnectionSettings {
        data_source,
        initial_catalog,
        user_id,
        password,
        pooling: get_bool(obj, "pooling")?.unwrap_or(true),
        min_pool_size,
        max_pool_size,
        connect_timeout_secs,
        packet_size,
        trust_server_certificate: get_bool(obj, "trustServerCertificate")?,
        encrypt: get_bool(obj, "encrypt")?,
        application_name: get_string(obj, "applicationName", tokens)?,
    })
}

/// Resolve a `connection` property value. String fields are interpolated with `tokens`.
pub fn parse_connection(value: &Value, tokens: &Tokens) -> Result<Connection, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "The `connection` property is expected to be of type object".to_string())?;
    parse_settings(obj, tokens)
        .map(Connection::new)
        .map_err(|e| format!("Invalid 'connection' object: {}", e))
}
