//! HTTP API tests: the full router against an in-memory database.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use sqlgate::config::{Connection, Snapshot};
use sqlgate::hson::{read_document, HsonSource, NoImports, WhitespaceHandling};
use sqlgate::sql::SqlValue;
use sqlgate::{app, resolve, AppState, ExecError, SqlExecutor, SqlSession};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tower::ServiceExt; // for `oneshot`

const SALES: &str = r#"
// Sales reporting
{
    "$": { "schema": "dbo" },
    "services": {
        "Sales": {
            "connection": { "dataSource": "db01", "initialCatalog": "Sales" },
            "methods": {
                "ByYear": {
                    "parameters": { "year": { "sqlType": "int" } },
                    "query": {
                        "select": "s.Id, s.Amount",
                        "from": "{schema}.Sales s",
                        "where": "s.Year = @year"
                    }
                },
                "Nested": {
                    "query": { "select": "o.Id, c.Id, c.Name", "from": "o JOIN c ON c.Id = o.C" },
                    "result": { "id": "Id", "customer": { "<exists>": "Id`2", "name": "Name" } }
                },
                "Dangerous": {
                    "query": { "select": "1 AS x", "where": "1=1; DROP TABLE x" }
                }
            }
        }
    },
    "aliases": { "Revenue": "Sales" }
}
"#;

/// Records every batch and answers with canned rows.
#[derive(Clone, Default)]
struct FakeDb {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    calls: Arc<Mutex<Vec<(String, Vec<SqlValue>)>>>,
}

impl FakeDb {
    fn with_rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Self {
        FakeDb {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            calls: Arc::default(),
        }
    }

    fn calls(&self) -> Vec<(String, Vec<SqlValue>)> {
        self.calls.lock().unwrap().clone()
    }
}

struct FakeSession {
    db: FakeDb,
    pending: VecDeque<Vec<Value>>,
}

#[async_trait]
impl SqlExecutor for FakeDb {
    async fn open(&self, _connection: &Connection) -> Result<Box<dyn SqlSession>, ExecError> {
        Ok(Box::new(FakeSession {
            db: self.clone(),
            pending: VecDeque::new(),
        }))
    }
}

#[async_trait]
impl SqlSession for FakeSession {
    async fn execute(&mut self, sql: &str, params: &[SqlValue]) -> Result<Vec<String>, ExecError> {
        self.db.calls.lock().unwrap().push((sql.to_string(), params.to_vec()));
        self.pending = self.db.rows.iter().cloned().collect();
        Ok(self.db.columns.clone())
    }

    async fn next_row(&mut self) -> Result<Option<Vec<Value>>, ExecError> {
        Ok(self.pending.pop_front())
    }
}

fn snapshot(text: &str) -> Snapshot {
    let doc = read_document(
        HsonSource::new("test.hson", text),
        WhitespaceHandling::default(),
        Arc::new(NoImports),
    )
    .unwrap();
    Snapshot {
        hash: doc.hash,
        services: resolve(&doc.value).services,
    }
}

fn router(text: &str, db: FakeDb) -> (Router, String) {
    let snapshot = snapshot(text);
    let hash = snapshot.hash.clone();
    (app(AppState::new(snapshot, Arc::new(db))), hash)
}

async fn request(app: &Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or_else(|_| json!({}));
    (status, json)
}

async fn get(app: &Router, uri: &str) -> (StatusCode, Value) {
    request(app, Method::GET, uri).await
}

#[tokio::test]
async fn missing_required_parameter_is_listed() {
    let db = FakeDb::default();
    let (app, _) = router(SALES, db.clone());
    let (status, body) = get(&app, "/data/Sales/ByYear").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Missing required parameters");
    assert_eq!(body["error"]["details"]["parameters"]["year"]["sqlName"], "@year");
    assert!(db.calls().is_empty());
}

#[tokio::test]
async fn executes_compiled_select_with_typed_parameter() {
    let db = FakeDb::with_rows(&["Id", "Amount"], vec![vec![json!(1), json!(9.5)], vec![json!(2), json!(3)]]);
    let (app, hash) = router(SALES, db.clone());
    let (status, body) = get(&app, "/data/Sales/ByYear?YEAR=2024").await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"], json!([{ "Id": 1, "Amount": 9.5 }, { "Id": 2, "Amount": 3 }]));

    let meta = &body["meta"];
    assert_eq!(meta["configHash"], json!(hash));
    assert_eq!(meta["service"], "Sales");
    assert_eq!(meta["method"], "ByYear");
    assert_eq!(meta["parameters"]["year"], json!({ "isValid": true, "value": 2024 }));
    for phase in ["open", "exec", "read", "total"] {
        assert!(meta["timings"][phase].as_f64().unwrap() >= 0.0, "{}", phase);
    }

    let calls = db.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].0,
        "DECLARE @year int = @P1;\r\nSET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED;\r\n\
         SELECT s.Id, s.Amount\r\nFROM dbo.Sales s\r\nWHERE s.Year = @year"
    );
    assert_eq!(calls[0].1, vec![SqlValue::I32(2024)]);
}

#[tokio::test]
async fn invalid_parameter_value_is_rejected_before_execution() {
    let db = FakeDb::default();
    let (app, _) = router(SALES, db.clone());
    let (status, body) = get(&app, "/data/Sales/ByYear?year=soon").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Invalid parameter value");
    assert_eq!(body["error"]["details"]["parameter"], "year");
    assert_eq!(body["error"]["details"]["attemptedValue"], "soon");
    assert!(db.calls().is_empty());
}

#[tokio::test]
async fn injected_clause_is_never_executed() {
    let db = FakeDb::default();
    let (app, _) = router(SALES, db.clone());
    let (status, body) = get(&app, "/data/Sales/Dangerous").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["message"], "Bad method descriptor");
    assert_eq!(
        body["error"]["details"]["errors"],
        json!(["No semicolons are allowed in any query clause"])
    );
    assert!(db.calls().is_empty());
}

#[tokio::test]
async fn meta_with_no_services_reports_hash() {
    let (app, hash) = router(r#"{ "services": {} }"#, FakeDb::default());
    let (status, body) = get(&app, "/meta").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!({ "configHash": hash, "serviceLinks": {} }));
}

#[tokio::test]
async fn result_mapping_shapes_rows() {
    let db = FakeDb::with_rows(
        &["Id", "Id", "Name"],
        vec![vec![json!(1), json!(7), json!("Ann")], vec![json!(2), Value::Null, Value::Null]],
    );
    let (app, _) = router(SALES, db);
    let (status, body) = get(&app, "/data/revenue/nested").await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(
        body["data"],
        json!([
            { "id": 1, "customer": { "name": "Ann" } },
            { "id": 2, "customer": null }
        ])
    );
}

#[tokio::test]
async fn routing_errors() {
    let (app, _) = router(SALES, FakeDb::default());

    let (status, body) = request(&app, Method::POST, "/meta").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body["error"]["message"], "Method Not Allowed");

    let (status, body) = get(&app, "/stats").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Unknown request type 'stats'");

    let (status, body) = get(&app, "/meta/Nope").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["details"], json!({ "service": "Nope" }));

    let (status, body) = get(&app, "/meta/Sales/Nope").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Unknown method name 'Nope'");

    let (status, body) = get(&app, "/meta/Sales/ByYear/extra").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "Too many path components supplied");
}

#[tokio::test]
async fn data_without_method_redirects_to_meta() {
    let (app, _) = router(SALES, FakeDb::default());
    let request = Request::builder().uri("/data/Sales").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/meta/Sales");

    let request = Request::builder().uri("/data").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.headers()[header::LOCATION], "/meta");
}

#[tokio::test]
async fn root_and_meta_views() {
    let (app, hash) = router(SALES, FakeDb::default());

    let (status, body) = get(&app, "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body["data"],
        json!({
            "configHash": hash,
            "links": [{ "rel": "meta", "href": "/meta" }, { "rel": "errors", "href": "/errors" }]
        })
    );

    let (_, body) = get(&app, "/meta").await;
    assert_eq!(
        body["data"]["serviceLinks"],
        json!({
            "Sales": { "rel": "child", "href": "/meta/Sales" },
            "Revenue": { "rel": "child", "href": "/meta/Revenue" }
        })
    );

    let (_, body) = get(&app, "/meta/Sales").await;
    let service = &body["data"]["service"];
    assert_eq!(service["name"], "Sales");
    assert_eq!(service["connection"], json!({ "dataSource": "db01", "initialCatalog": "Sales" }));
    assert_eq!(service["tokens"], json!({ "schema": "dbo" }));

    let (_, body) = get(&app, "/meta/Sales/ByYear").await;
    let data = &body["data"];
    assert_eq!(data["serviceLink"], json!({ "rel": "parent", "href": "/meta/Sales" }));
    assert_eq!(data["selfLink"], json!({ "rel": "self", "href": "/meta/Sales/ByYear" }));
    assert_eq!(data["dataLink"], json!({ "rel": "data", "href": "/data/Sales/ByYear" }));
    assert_eq!(data["method"]["sql"], "SELECT s.Id, s.Amount\r\nFROM dbo.Sales s\r\nWHERE s.Year = @year");
}

#[tokio::test]
async fn errors_views_list_failing_entities() {
    let (app, _) = router(SALES, FakeDb::default());

    let (status, body) = get(&app, "/errors").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["errors"], json!([]));
    assert_eq!(
        body["data"]["services"],
        json!({
            "Sales": {
                "errors": [],
                "methods": { "Dangerous": { "errors": ["No semicolons are allowed in any query clause"] } }
            }
        })
    );

    let (_, body) = get(&app, "/errors/Sales/ByYear").await;
    assert_eq!(body["data"]["errors"], json!([]));
}

#[tokio::test]
async fn severe_errors_block_meta_and_data_but_not_errors() {
    let (app, _) = router(r#"{ "aliases": {} }"#, FakeDb::default());

    let (status, body) = get(&app, "/meta").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"]["message"], "Severe errors encountered");
    assert_eq!(body["error"]["details"]["errors"], json!(["A 'services' section is required"]));

    let (status, _) = get(&app, "/data/Sales/ByYear").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, body) = get(&app, "/errors").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["errors"], json!(["A 'services' section is required"]));

    let (status, _) = get(&app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get(&app, "/ready").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn encoded_names_are_decoded_and_links_encoded() {
    let text = r#"{
        "services": {
            "Sales East": {
                "connection": { "dataSource": "db01" },
                "methods": { "Top 10": { "query": { "select": "1 AS one" } } }
            }
        }
    }"#;
    let db = FakeDb::with_rows(&["one"], vec![vec![json!(1)]]);
    let (app, _) = router(text, db);

    let (status, body) = get(&app, "/meta/Sales%20East/Top%2010").await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["dataLink"]["href"], "/data/Sales%20East/Top%2010");

    let (status, body) = get(&app, "/data/sales%20east/top%2010").await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"], json!([{ "one": 1 }]));

    let request = Request::builder().uri("/data/Sales%20East").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/meta/Sales%20East");

    let (status, _) = get(&app, "/meta/%FF").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn parameters_keep_declaration_order() {
    let text = r#"{
        "services": { "S": {
            "connection": { "dataSource": "db01" },
            "methods": { "M": {
                "parameters": {
                    "zeta": { "sqlType": "int" },
                    "alpha": { "sqlType": "varchar(10)" }
                },
                "query": { "select": "@zeta AS z, @alpha AS a" }
            } }
        } }
    }"#;
    let db = FakeDb::with_rows(&["z", "a"], vec![]);
    let (app, _) = router(text, db.clone());

    let keys = |v: &Value| v.as_object().unwrap().keys().cloned().collect::<Vec<_>>();
    let (_, body) = get(&app, "/meta/S/M").await;
    assert_eq!(keys(&body["data"]["method"]["parameters"]), vec!["zeta", "alpha"]);

    let (status, body) = get(&app, "/data/S/M?alpha=x&zeta=1").await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(keys(&body["meta"]["parameters"]), vec!["zeta", "alpha"]);
    let calls = db.calls();
    assert!(calls[0].0.starts_with("DECLARE @zeta int = @P1;\r\nDECLARE @alpha varchar(10) = @P2;\r\n"), "{}", calls[0].0);
    assert_eq!(calls[0].1, vec![SqlValue::I32(1), SqlValue::String("x".into())]);
}
