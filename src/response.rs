//! Standard response envelope helpers.

use axum::{http::StatusCode, Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct SuccessOne<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

#[derive(Serialize)]
pub struct SuccessMany<T, M> {
    pub data: Vec<T>,
    pub meta: M,
}

pub fn success_one<T: Serialize>(data: T) -> (StatusCode, Json<SuccessOne<T>>) {
    (StatusCode::OK, Json(SuccessOne { data, meta: None }))
}

pub fn success_many<T: Serialize, M: Serialize>(data: Vec<T>, meta: M) -> (StatusCode, Json<SuccessMany<T, M>>) {
    (StatusCode::OK, Json(SuccessMany { data, meta }))
}
