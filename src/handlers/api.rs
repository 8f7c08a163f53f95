//! `/{action}/{service}/{method}` dispatch for the meta, data and errors actions.

use crate::config::{Service, ServiceCollection, Snapshot};
use crate::error::AppError;
use crate::handlers::serialized::{Link, MethodSerialized, Ordered, ServiceErrors, ServiceSerialized};
use crate::response::{success_many, success_one};
use crate::service::DataService;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    http::{header, Method as HttpMethod, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use serde_json::{json, Map, Value};

/// Absolute path from raw name segments, each percent-encoded.
fn href(parts: &[&str]) -> String {
    parts.iter().map(|p| format!("/{}", urlencoding::encode(p))).collect()
}

fn found(location: String) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn find_service<'a>(services: &'a ServiceCollection, name: &str) -> Result<&'a Service, AppError> {
    services.get(name).ok_or_else(|| {
        AppError::bad_request_with(format!("Unknown service name '{}'", name), json!({ "service": name }))
    })
}

fn find_method<'a>(service: &'a Service, name: &str) -> Result<&'a crate::config::Method, AppError> {
    service.methods.get(name).ok_or_else(|| {
        AppError::bad_request_with(format!("Unknown method name '{}'", name), json!({ "method": name }))
    })
}

/// Entry point for every API path. The snapshot is read once per request.
pub async fn dispatch(
    State(state): State<AppState>,
    method: HttpMethod,
    uri: Uri,
    Query(query): Query<Vec<(String, String)>>,
) -> Result<Response, AppError> {
    if method != HttpMethod::GET {
        return Err(AppError::MethodNotAllowed);
    }
    let snapshot = state.current();
    let decoded = uri
        .path()
        .split('/')
        .filter(|s| !s.is_empty())
        .map(urlencoding::decode)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| AppError::bad_request("Path components must be valid UTF-8"))?;
    if decoded.len() > 3 {
        return Err(AppError::bad_request("Too many path components supplied"));
    }
    let segments: Vec<&str> = decoded.iter().map(|s| s.as_ref()).collect();
    let Some((action, rest)) = segments.split_first() else {
        return Ok(root(&snapshot));
    };

    let action = action.to_ascii_lowercase();
    if matches!(action.as_str(), "meta" | "data") && !snapshot.services.errors.is_empty() {
        return Err(AppError::Severe(json!({
            "configHash": snapshot.hash,
            "errors": snapshot.services.errors,
        })));
    }
    match action.as_str() {
        "meta" => meta(&snapshot, rest),
        "errors" => errors(&snapshot, rest),
        "data" => data(&state, &snapshot, rest, &query).await,
        _ => Err(AppError::bad_request_with(
            format!("Unknown request type '{}'", segments[0]),
            json!({ "action": segments[0] }),
        )),
    }
}

fn root(snapshot: &Snapshot) -> Response {
    success_one(json!({
        "configHash": snapshot.hash,
        "links": [Link::new("meta", "/meta"), Link::new("errors", "/errors")],
    }))
    .into_response()
}

fn meta(snapshot: &Snapshot, path: &[&str]) -> Result<Response, AppError> {
    let services = &snapshot.services;
    let body = match *path {
        [] => {
            let links: Ordered<&str, Link> = services
                .entries()
                .map(|(name, _)| (name, Link::new("child", href(&["meta", name]))))
                .collect();
            json!({
                "configHash": snapshot.hash,
                "serviceLinks": links,
            })
        }
        [service_name] => {
            let service = find_service(services, service_name)?;
            json!({
                "configHash": snapshot.hash,
                "service": ServiceSerialized::new(services, service),
            })
        }
        [service_name, method_name] => {
            let service = find_service(services, service_name)?;
            let method = find_method(service, method_name)?;
            json!({
                "configHash": snapshot.hash,
                "serviceLink": Link::new("parent", href(&["meta", service_name])),
                "selfLink": Link::new("self", href(&["meta", service_name, method_name])),
                "dataLink": Link::new("data", href(&["data", service_name, method_name])),
                "method": MethodSerialized::from(method),
            })
        }
        _ => return Err(AppError::bad_request("Too many path components supplied")),
    };
    Ok(success_one(body).into_response())
}

fn errors(snapshot: &Snapshot, path: &[&str]) -> Result<Response, AppError> {
    let services = &snapshot.services;
    let body = match *path {
        [] => {
            let failing: Map<String, Value> = services
                .services()
                .iter()
                .filter(|s| s.has_errors())
                .map(|s| {
                    let view = serde_json::to_value(ServiceErrors::from(s)).unwrap_or(Value::Null);
                    (s.name.clone(), view)
                })
                .collect();
            json!({
                "configHash": snapshot.hash,
                "errors": services.errors,
                "services": failing,
            })
        }
        [service_name] => {
            let service = find_service(services, service_name)?;
            let view = ServiceErrors::from(service);
            json!({
                "configHash": snapshot.hash,
                "service": service.name,
                "errors": view.errors,
                "methods": view.methods,
            })
        }
        [service_name, method_name] => {
            let service = find_service(services, service_name)?;
            let method = find_method(service, method_name)?;
            json!({
                "configHash": snapshot.hash,
                "service": service.name,
                "method": method.name,
                "errors": method.errors,
            })
        }
        _ => return Err(AppError::bad_request("Too many path components supplied")),
    };
    Ok(success_one(body).into_response())
}

async fn data(
    state: &AppState,
    snapshot: &Snapshot,
    path: &[&str],
    query: &[(String, String)],
) -> Result<Response, AppError> {
    match *path {
        [] => Ok(found("/meta".to_string())),
        [service_name] => {
            find_service(&snapshot.services, service_name)?;
            Ok(found(href(&["meta", service_name])))
        }
        [service_name, method_name] => {
            let service = find_service(&snapshot.services, service_name)?;
            let method = find_method(service, method_name)?;
            let result =
                DataService::execute(state.executor.as_ref(), snapshot, &service.name, method, query).await?;
            Ok(success_many(result.rows, result.meta).into_response())
        }
        _ => Err(AppError::bad_request("Too many path components supplied")),
    }
}
