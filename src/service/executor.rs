//! Database collaborator: async session traits and the SQL Server implementation.

use crate::config::Connection;
use crate::error::{ExecError, ServerMessage};
use crate::service::pool::{PoolRegistry, PooledClient};
use crate::sql::SqlValue;
use async_trait::async_trait;
use futures::{Stream, TryStreamExt};
use serde_json::Value;
use tiberius::{ColumnData, FromSql, Query, QueryItem};
use tokio::sync::mpsc;

/// Opens sessions on a connection. One session runs one batch.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    async fn open(&self, connection: &Connection) -> Result<Box<dyn SqlSession>, ExecError>;
}

/// A connection checked out for one batch.
#[async_trait]
pub trait SqlSession: Send {
    /// Run `sql` with positional parameters `@P1..@Pn`; returns the column names of the
    /// first result set (empty when the batch produces none).
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<String>, ExecError>;

    /// Next row of the result set, one JSON value per column.
    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, ExecError>;
}

/// SQL Server over tiberius, pooled per connection string.
#[derive(Default)]
pub struct TdsExecutor {
    pools: PoolRegistry,
}

impl TdsExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SqlExecutor for TdsExecutor {
    async fn open(&self, connection: &Connection) -> Result<Box<dyn SqlSession>, ExecError> {
        let client = self.pools.pool_for(connection)?.acquire().await?;
        Ok(Box::new(TdsSession {
            client: Some(client),
            events: Events { rx: None },
        }))
    }
}

#[derive(Debug)]
enum StreamEvent {
    Columns(Vec<String>),
    Row(Vec<Value>),
}

type EventResult = Result<StreamEvent, ExecError>;

const ROW_BUFFER: usize = 64;

/// Receiving end of a running batch. Only the first result set is read.
struct Events {
    rx: Option<mpsc::Receiver<EventResult>>,
}

impl Events {
    /// Column names of the first result set; empty when the batch produced none.
    async fn columns(&mut self) -> Result<Vec<String>, ExecError> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(Vec::new());
        };
        match rx.recv().await {
            Some(Ok(StreamEvent::Columns(columns))) => Ok(columns),
            Some(Ok(StreamEvent::Row(_))) => Err(ExecError::Protocol("row received before column metadata".into())),
            Some(Err(e)) => Err(e),
            None => {
                self.rx = None;
                Ok(Vec::new())
            }
        }
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, ExecError> {
        let Some(rx) = self.rx.as_mut() else {
            return Ok(None);
        };
        match rx.recv().await {
            Some(Ok(StreamEvent::Row(row))) => Ok(Some(row)),
            // Later result sets are not part of the response.
            Some(Ok(StreamEvent::Columns(_))) | None => {
                self.rx = None;
                Ok(None)
            }
            Some(Err(e)) => Err(e),
        }
    }
}

/// The query stream borrows the client, so the batch runs in its own task and rows
/// come back over a bounded channel.
struct TdsSession {
    client: Option<PooledClient>,
    events: Events,
}

#[async_trait]
impl SqlSession for TdsSession {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<String>, ExecError> {
        let client = self
            .client
            .take()
            .ok_or_else(|| ExecError::Protocol("session already executed a batch".into()))?;
        let (tx, rx) = mpsc::channel(ROW_BUFFER);
        tokio::spawn(run_batch(client, sql.to_string(), params.to_vec(), tx));
        self.events = Events { rx: Some(rx) };
        self.events.columns().await
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, ExecError> {
        self.events.next_row().await
    }
}

async fn run_batch(mut client: PooledClient, sql: String, params: Vec<SqlValue>, tx: mpsc::Sender<EventResult>) {
    let mut query = Query::new(sql);
    for p in params {
        bind(&mut query, p);
    }
    let failure = stream_rows(query, &mut client, &tx).await;
    if let Some(e) = failure {
        // Server errors leave the connection usable; anything else does not.
        if !matches!(e, tiberius::error::Error::Server(_)) {
            client.mark_broken();
        }
        let _ = tx.send(Err(exec_error(e))).await;
    }
    client.release();
}

/// How forwarding a result stream ended.
#[derive(Debug)]
enum Forwarded {
    /// The stream was read to the end.
    Done,
    /// The receiver went away or a row could not be converted; the rest is unread.
    Abandoned,
    /// The driver failed mid-stream.
    Failed(tiberius::error::Error),
}

/// Send each event until the stream ends, the receiver hangs up, or a conversion fails.
async fn forward<S>(mut stream: S, tx: &mpsc::Sender<EventResult>) -> Forwarded
where
    S: Stream<Item = Result<EventResult, tiberius::error::Error>> + Unpin,
{
    loop {
        let event = match stream.try_next().await {
            Ok(Some(event)) => event,
            Ok(None) => return Forwarded::Done,
            Err(e) => return Forwarded::Failed(e),
        };
        let unreadable = event.is_err();
        if tx.send(event).await.is_err() || unreadable {
            return Forwarded::Abandoned;
        }
    }
}

fn item_event(item: QueryItem) -> EventResult {
    match item {
        QueryItem::Metadata(meta) => Ok(StreamEvent::Columns(
            meta.columns().iter().map(|c| c.name().to_string()).collect(),
        )),
        QueryItem::Row(row) => row
            .into_iter()
            .map(column_to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(StreamEvent::Row),
    }
}

/// Forward every result item; returns the driver error that stopped the stream, if any.
async fn stream_rows(
    query: Query<'_>,
    client: &mut PooledClient,
    tx: &mpsc::Sender<EventResult>,
) -> Option<tiberius::error::Error> {
    let stream = match query.query(client.client()).await {
        Ok(stream) => stream,
        Err(e) => return Some(e),
    };
    match forward(stream.map_ok(item_event), tx).await {
        Forwarded::Done => None,
        Forwarded::Abandoned => {
            // The rest of the stream is never drained.
            client.mark_broken();
            None
        }
        Forwarded::Failed(e) => Some(e),
    }
}

fn bind(query: &mut Query<'_>, value: SqlValue) {
    match value {
        SqlValue::Null => query.bind(Option::<String>::None),
        SqlValue::Bool(b) => query.bind(b),
        SqlValue::U8(n) => query.bind(n),
        SqlValue::I16(n) => query.bind(n),
        SqlValue::I32(n) => query.bind(n),
        SqlValue::I64(n) => query.bind(n),
        SqlValue::F64(n) => query.bind(n),
        SqlValue::Decimal(d) => query.bind(tiberius::numeric::Numeric::new_with_scale(
            d.mantissa(),
            d.scale() as u8,
        )),
        SqlValue::String(s) | SqlValue::Xml(s) => query.bind(s),
        SqlValue::Binary(b) => query.bind(b),
        SqlValue::Guid(g) => query.bind(g),
        SqlValue::Date(d) => query.bind(d),
        SqlValue::Time(t) => query.bind(t),
        SqlValue::DateTime(dt) => query.bind(dt),
        SqlValue::DateTimeOffset(dt) => query.bind(dt),
    }
}

fn conversion(e: tiberius::error::Error) -> ExecError {
    ExecError::Conversion(e.to_string())
}

fn column_to_json(data: ColumnData<'static>) -> Result<Value, ExecError> {
    let value = match &data {
        ColumnData::U8(v) => v.map(SqlValue::U8),
        ColumnData::I16(v) => v.map(SqlValue::I16),
        ColumnData::I32(v) => v.map(SqlValue::I32),
        ColumnData::I64(v) => v.map(SqlValue::I64),
        ColumnData::F32(v) => v.map(|f| SqlValue::F64(f as f64)),
        ColumnData::F64(v) => v.map(SqlValue::F64),
        ColumnData::Bit(v) => v.map(SqlValue::Bool),
        ColumnData::String(v) => v.as_ref().map(|s| SqlValue::String(s.to_string())),
        ColumnData::Guid(v) => v.map(SqlValue::Guid),
        ColumnData::Binary(v) => v.as_ref().map(|b| SqlValue::Binary(b.to_vec())),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| SqlValue::Xml(x.clone().into_owned().into_string())),
        ColumnData::Numeric(_) => rust_decimal::Decimal::from_sql(&data)
            .map_err(conversion)?
            .map(SqlValue::Decimal),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            chrono::NaiveDateTime::from_sql(&data)
                .map_err(conversion)?
                .map(SqlValue::DateTime)
        }
        ColumnData::Date(_) => chrono::NaiveDate::from_sql(&data)
            .map_err(conversion)?
            .map(SqlValue::Date),
        ColumnData::Time(_) => chrono::NaiveTime::from_sql(&data)
            .map_err(conversion)?
            .map(SqlValue::Time),
        ColumnData::DateTimeOffset(_) => chrono::DateTime::<chrono::FixedOffset>::from_sql(&data)
            .map_err(conversion)?
            .map(SqlValue::DateTimeOffset),
    };
    Ok(value.map(|v| v.to_json()).unwrap_or(Value::Null))
}

/// Translate a driver error, keeping server messages for the response.
pub(crate) fn exec_error(e: tiberius::error::Error) -> ExecError {
    match e {
        tiberius::error::Error::Server(token) => ExecError::from_server_messages(vec![ServerMessage {
            number: token.code(),
            state: token.state(),
            class: token.class(),
            message: token.message().to_string(),
            procedure: token.procedure().to_string(),
            line_number: token.line(),
        }]),
        tiberius::error::Error::Io { kind, message } => ExecError::Connect(format!("{:?}: {}", kind, message)),
        other => ExecError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn column_values_render_like_parameter_values() {
        assert_eq!(column_to_json(ColumnData::I32(Some(7))).unwrap(), Value::from(7));
        assert_eq!(column_to_json(ColumnData::I32(None)).unwrap(), Value::Null);
        assert_eq!(
            column_to_json(ColumnData::String(Some(Cow::Borrowed("x")))).unwrap(),
            Value::from("x")
        );
        assert_eq!(
            column_to_json(ColumnData::Binary(Some(Cow::Owned(vec![1, 2, 3])))).unwrap(),
            Value::from("AQID")
        );
        assert_eq!(column_to_json(ColumnData::Bit(Some(true))).unwrap(), Value::Bool(true));
    }

    fn columns(names: &[&str]) -> EventResult {
        Ok(StreamEvent::Columns(names.iter().map(|n| n.to_string()).collect()))
    }

    fn row(values: &[i32]) -> EventResult {
        Ok(StreamEvent::Row(values.iter().map(|v| Value::from(*v)).collect()))
    }

    fn receiver(events: Vec<EventResult>) -> Events {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for e in events {
            tx.try_send(e).unwrap();
        }
        Events { rx: Some(rx) }
    }

    #[tokio::test]
    async fn only_the_first_result_set_is_read() {
        let mut events = receiver(vec![columns(&["a"]), row(&[1]), row(&[2]), columns(&["b"]), row(&[3])]);
        assert_eq!(events.columns().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(events.next_row().await.unwrap(), Some(vec![Value::from(1)]));
        assert_eq!(events.next_row().await.unwrap(), Some(vec![Value::from(2)]));
        assert_eq!(events.next_row().await.unwrap(), None);
        assert_eq!(events.next_row().await.unwrap(), None);
    }

    #[tokio::test]
    async fn batches_without_results_have_no_columns() {
        let mut events = receiver(vec![]);
        assert!(events.columns().await.unwrap().is_empty());
        assert_eq!(events.next_row().await.unwrap(), None);
    }

    #[tokio::test]
    async fn errors_surface_in_order() {
        let mut events = receiver(vec![Err(ExecError::Connect("refused".into()))]);
        assert!(matches!(events.columns().await, Err(ExecError::Connect(_))));

        let mut events = receiver(vec![row(&[1])]);
        assert!(matches!(events.columns().await, Err(ExecError::Protocol(_))));

        let mut events = receiver(vec![columns(&["a"]), row(&[1]), Err(ExecError::Conversion("bad date".into()))]);
        events.columns().await.unwrap();
        events.next_row().await.unwrap();
        assert!(matches!(events.next_row().await, Err(ExecError::Conversion(_))));
    }

    #[tokio::test]
    async fn forwarding_sends_everything_then_reports_done() {
        let (tx, rx) = mpsc::channel(8);
        let items = futures::stream::iter(vec![Ok(columns(&["a"])), Ok(row(&[1])), Ok(row(&[2]))]);
        assert!(matches!(forward(items, &tx).await, Forwarded::Done));
        drop(tx);
        let mut events = Events { rx: Some(rx) };
        assert_eq!(events.columns().await.unwrap(), vec!["a".to_string()]);
        assert_eq!(events.next_row().await.unwrap(), Some(vec![Value::from(1)]));
        assert_eq!(events.next_row().await.unwrap(), Some(vec![Value::from(2)]));
        assert_eq!(events.next_row().await.unwrap(), None);
    }

    #[tokio::test]
    async fn conversion_failure_is_sent_and_stops_forwarding() {
        let (tx, mut rx) = mpsc::channel(8);
        let items = futures::stream::iter(vec![
            Ok(columns(&["a"])),
            Ok(Err(ExecError::Conversion("bad date".into()))),
            Ok(row(&[9])),
        ]);
        assert!(matches!(forward(items, &tx).await, Forwarded::Abandoned));
        drop(tx);
        assert!(matches!(rx.recv().await, Some(Ok(StreamEvent::Columns(_)))));
        assert!(matches!(rx.recv().await, Some(Err(ExecError::Conversion(_)))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn driver_failure_and_hang_up_end_forwarding() {
        let (tx, rx) = mpsc::channel(8);
        let items = futures::stream::iter(vec![
            Ok(columns(&["a"])),
            Err(tiberius::error::Error::Protocol("stream reset".into())),
        ]);
        assert!(matches!(forward(items, &tx).await, Forwarded::Failed(_)));

        drop(rx);
        let items = futures::stream::iter(vec![Ok(row(&[1]))]);
        assert!(matches!(forward(items, &tx).await, Forwarded::Abandoned));
    }
}
