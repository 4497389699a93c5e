use std::future::Future;

use serde_json::Value;

use crate::error::RequestError;
use crate::models::Method;

#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    /// Query parameters, encoded by the requester.
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    #[must_use]
    pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
        self.query = query;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// The authenticated request function the data layer talks through.
///
/// Implementations attach the bearer credential, bound each attempt with a
/// timeout, retry 5xx/429 a fixed number of times with non-decreasing
/// delays, and report HTTP 401 as [`RequestError::SessionExpired`] so it is
/// never confused with a connectivity failure. A successful response with
/// an empty body is returned as `Value::Null`.
pub trait Requester: Send + Sync + 'static {
    fn request(&self, req: ApiRequest) -> impl Future<Output = Result<Value, RequestError>> + Send;
}

/// Pull the entity object out of a `{ "<field>": {...} }` response.
#[must_use]
pub fn entity_field<'a>(response: &'a Value, field: &str) -> Option<&'a Value> {
    response.get(field).filter(|v| v.is_object())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entity_field() {
        let response = json!({ "habit": { "habitId": "h_42" }, "ok": true });
        assert_eq!(
            entity_field(&response, "habit"),
            Some(&json!({ "habitId": "h_42" }))
        );
        assert!(entity_field(&response, "ok").is_none());
        assert!(entity_field(&Value::Null, "habit").is_none());
    }
}
