//! The remote management API as seen by the engine.
//!
//! The engine never talks to the network itself. Everything goes through
//! [`Transport`], which the agent implements over HTTP and tests implement
//! in memory.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Query parameters as ordered key/value pairs.
pub type Query = Vec<(String, String)>;

/// A failed request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{method} {path} failed{}: {message}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
pub struct ApiError {
    pub method: String,
    pub path: String,
    /// HTTP status, when the server answered at all
    pub status: Option<u16>,
    pub message: String,
}

impl ApiError {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        status: Option<u16>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            status,
            message: message.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

/// A 404 on delete means the item is already gone.
pub(crate) fn tolerate_missing(result: Result<(), ApiError>) -> crate::error::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// One page of a collection read.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<String>,
}

/// CRUD access to collection endpoints.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Read one page of a collection.
    async fn list(
        &self,
        path: &str,
        filters: &[(String, String)],
        page_token: Option<&str>,
    ) -> Result<Page, ApiError>;

    /// Read a single item.
    async fn get(&self, path: &str) -> Result<Value, ApiError>;

    async fn post(&self, path: &str, query: &[(String, String)], body: Value)
        -> Result<Value, ApiError>;

    async fn put(&self, path: &str, body: Value) -> Result<Value, ApiError>;

    async fn delete(&self, path: &str, query: &[(String, String)]) -> Result<(), ApiError>;
}

/// Read every page of a collection.
pub async fn list_all<T: Transport + ?Sized>(
    transport: &T,
    path: &str,
    filters: &[(String, String)],
) -> Result<Vec<Value>, ApiError> {
    let mut items = Vec::new();
    let mut token: Option<String> = None;

    loop {
        let page = transport.list(path, filters, token.as_deref()).await?;
        items.extend(page.items);

        match page.next_page_token {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => break,
        }
    }

    Ok(items)
}

/// Walk pages until an item matches, e.g. to resolve a name to its id.
pub async fn find_first<T, P>(
    transport: &T,
    path: &str,
    filters: &[(String, String)],
    predicate: P,
) -> Result<Option<Value>, ApiError>
where
    T: Transport + ?Sized,
    P: Fn(&Value) -> bool,
{
    let mut token: Option<String> = None;

    loop {
        let page = transport.list(path, filters, token.as_deref()).await?;
        if let Some(found) = page.items.into_iter().find(|item| predicate(item)) {
            return Ok(Some(found));
        }

        match page.next_page_token {
            Some(next) if !next.is_empty() => token = Some(next),
            _ => return Ok(None),
        }
    }
}

/// Join a collection path and an item identifier.
pub fn item_path(collection: &str, id: &str) -> String {
    format!("{}/{}", collection.trim_end_matches('/'), id)
}

/// A collection endpoint and the names of its identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub path: String,
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_name_field")]
    pub name_field: String,
}

fn default_id_field() -> String {
    "id".to_string()
}

fn default_name_field() -> String {
    "name".to_string()
}

impl Endpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            id_field: default_id_field(),
            name_field: default_name_field(),
        }
    }

    pub fn item(&self, id: &str) -> String {
        item_path(&self.path, id)
    }

    /// Bulk-response filler items the server emits with an empty name, or
    /// with neither a name nor an id.
    pub fn is_placeholder(&self, item: &Value) -> bool {
        let Some(obj) = item.as_object() else {
            return true;
        };
        match obj.get(&self.name_field) {
            Some(Value::String(name)) => name.is_empty(),
            Some(Value::Null) | None => !obj.contains_key(&self.id_field),
            Some(_) => false,
        }
    }
}

/// Items of a bulk response: a bare array, or an array under `items`,
/// `data` or `results`. A single object counts as one item.
pub fn response_items(response: Value) -> Vec<Value> {
    match response {
        Value::Array(items) => items,
        Value::Object(mut obj) => {
            for key in ["items", "data", "results"] {
                if let Some(Value::Array(items)) = obj.remove(key) {
                    return items;
                }
            }
            vec![Value::Object(obj)]
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves fixed pages keyed by token and records every token requested.
    struct PagedTransport {
        pages: Vec<Page>,
        requested: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl Transport for PagedTransport {
        async fn list(
            &self,
            _path: &str,
            _filters: &[(String, String)],
            page_token: Option<&str>,
        ) -> Result<Page, ApiError> {
            self.requested
                .lock()
                .unwrap()
                .push(page_token.map(String::from));
            let index: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
            Ok(self.pages[index].clone())
        }

        async fn get(&self, path: &str) -> Result<Value, ApiError> {
            Err(ApiError::new("GET", path, Some(404), "not found"))
        }

        async fn post(
            &self,
            path: &str,
            _: &[(String, String)],
            _: Value,
        ) -> Result<Value, ApiError> {
            Err(ApiError::new("POST", path, Some(405), "read only"))
        }

        async fn put(&self, path: &str, _: Value) -> Result<Value, ApiError> {
            Err(ApiError::new("PUT", path, Some(405), "read only"))
        }

        async fn delete(&self, path: &str, _: &[(String, String)]) -> Result<(), ApiError> {
            Err(ApiError::new("DELETE", path, Some(405), "read only"))
        }
    }

    fn three_pages() -> PagedTransport {
        PagedTransport {
            pages: vec![
                Page {
                    items: vec![json!({"name": "a"}), json!({"name": "b"})],
                    next_page_token: Some("1".into()),
                },
                Page {
                    items: vec![json!({"name": "c"})],
                    next_page_token: Some("2".into()),
                },
                Page {
                    items: vec![json!({"name": "d"})],
                    next_page_token: None,
                },
            ],
            requested: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn list_all_follows_tokens() {
        let transport = three_pages();
        let items = list_all(&transport, "/hosts", &[]).await.unwrap();

        assert_eq!(items.len(), 4);
        assert_eq!(
            *transport.requested.lock().unwrap(),
            vec![None, Some("1".to_string()), Some("2".to_string())]
        );
    }

    #[tokio::test]
    async fn find_first_stops_early() {
        let transport = three_pages();
        let found = find_first(&transport, "/hosts", &[], |v| v["name"] == "c")
            .await
            .unwrap();

        assert_eq!(found, Some(json!({"name": "c"})));
        assert_eq!(transport.requested.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn find_first_exhausts_pages() {
        let transport = three_pages();
        let found = find_first(&transport, "/hosts", &[], |v| v["name"] == "z")
            .await
            .unwrap();

        assert_eq!(found, None);
    }

    #[test]
    fn api_error_display() {
        let err = ApiError::new("DELETE", "/hosts/1", Some(404), "gone");
        assert_eq!(err.to_string(), "DELETE /hosts/1 failed with status 404: gone");
        assert!(err.is_not_found());
        assert_eq!(tolerate_missing(Err(err)), Ok(()));

        let err = ApiError::new("DELETE", "/hosts/1", Some(500), "boom");
        assert_eq!(
            tolerate_missing(Err(err.clone())),
            Err(crate::Error::Api(err))
        );

        let err = ApiError::new("GET", "/hosts", None, "connection reset");
        assert_eq!(err.to_string(), "GET /hosts failed: connection reset");
    }

    #[test]
    fn placeholders() {
        let endpoint = Endpoint::new("/rules");
        assert!(endpoint.is_placeholder(&json!({"name": "", "id": "1"})));
        assert!(endpoint.is_placeholder(&json!({})));
        assert!(endpoint.is_placeholder(&Value::Null));
        assert!(!endpoint.is_placeholder(&json!({"name": "r1", "id": "1"})));
        assert!(!endpoint.is_placeholder(&json!({"id": "1"})));
    }

    #[test]
    fn bulk_response_shapes() {
        assert_eq!(response_items(json!([{"id": 1}])).len(), 1);
        assert_eq!(response_items(json!({"data": [{"id": 1}, {"id": 2}]})).len(), 2);
        assert_eq!(response_items(json!({"id": 1})), vec![json!({"id": 1})]);
        assert!(response_items(Value::Null).is_empty());
    }

    #[test]
    fn item_paths() {
        assert_eq!(item_path("/hosts", "1"), "/hosts/1");
        assert_eq!(item_path("/hosts/", "1"), "/hosts/1");
    }
}
