//! HTTP tunnel for callers that cannot reach storage nodes directly.
//!
//! `GET`  `/api/session/{session_id}/storage/{data_key}` reads an object.
//! `POST` on the same path reads with slicing conditions in the body.
//! `PUT`  on the same path stores the body; `?level=` picks the tier.
//!
//! Every body is bincode with content type `application/octet-stream`.

pub mod client;
pub mod handler;

use common::IndexItem;
use serde::{Deserialize, Serialize};

pub const STORAGE_ROUTE: &str = "/api/session/{session_id}/storage/{data_key}";

pub fn storage_path(session_id: &str, data_key: &str) -> String {
    format!("/api/session/{session_id}/storage/{data_key}")
}

/// Body of a conditional read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReadRequest {
    pub conditions: Option<Vec<IndexItem>>,
}
