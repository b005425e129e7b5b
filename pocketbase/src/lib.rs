use reqwest::{Client, Error as ReqwestError, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum PocketBaseError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] ReqwestError),
    #[error("API error: {message} (code: {code})")]
    Api {
        message: String,
        code: String,
        /// Per-field validation codes from the response's `data` object.
        field_codes: Vec<String>,
    },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Field code PocketBase reports when a unique index rejects a write.
pub const NOT_UNIQUE: &str = "validation_not_unique";

impl PocketBaseError {
    /// Builds an `Api` error from a failed response's status and JSON body.
    pub fn from_api_body(status: StatusCode, body: &Value, fallback: &str) -> Self {
        let field_codes = body["data"]
            .as_object()
            .map(|fields| {
                fields
                    .values()
                    .filter_map(|field| field["code"].as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Self::Api {
            message: body["message"].as_str().unwrap_or(fallback).to_string(),
            code: status.to_string(),
            field_codes,
        }
    }

    /// True when the write collided with a unique index.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Api { field_codes, .. } => field_codes.iter().any(|code| code == NOT_UNIQUE),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PocketBaseClient {
    client: Client,
    base_url: String,
    admin_token: Option<String>,
}

/// A stored record: system fields plus the collection's own columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub created: String,
    #[serde(default)]
    pub updated: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Decodes the collection columns into `T`.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, PocketBaseError> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

#[derive(Debug, Deserialize)]
struct AuthRecord {
    token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    items: Vec<Record>,
    #[serde(default)]
    total_pages: u32,
}

/// Filter/sort/paging for a record listing.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub filter: Option<String>,
    pub sort: Option<String>,
    /// Caps the number of records returned; `None` walks every page.
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn filter(filter: impl Into<String>) -> Self {
        Self {
            filter: Some(filter.into()),
            ..Default::default()
        }
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

const MAX_PAGE_SIZE: usize = 500;

/// Quotes a value for use inside a PocketBase filter expression.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl PocketBaseClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            admin_token: None,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn records_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{}/records", self.base_url, collection)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.admin_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn api_error(response: Response, fallback: &str) -> PocketBaseError {
        let status = response.status();
        let body: Value = response.json().await.unwrap_or_default();
        PocketBaseError::from_api_body(status, &body, fallback)
    }

    /// Health check
    pub async fn health(&self) -> Result<(), PocketBaseError> {
        let url = format!("{}/api/health", self.base_url);
        let response = self.client.get(&url).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::api_error(response, "health check failed").await)
        }
    }

    /// Create record
    pub async fn create_record(&self, collection: &str, data: Value) -> Result<Record, PocketBaseError> {
        let response = self
            .authorized(self.client.post(self.records_url(collection)))
            .json(&data)
            .send()
            .await?;

        if response.status().is_success() {
            let record: Record = response.json().await?;
            debug!(collection, id = %record.id, "pocketbase: record created");
            Ok(record)
        } else {
            Err(Self::api_error(response, "create failed").await)
        }
    }

    /// Patch record: only the keys present in `data` change.
    pub async fn update_record(&self, collection: &str, id: &str, data: Value) -> Result<Record, PocketBaseError> {
        let url = format!("{}/{}", self.records_url(collection), id);
        let response = self
            .authorized(self.client.patch(&url))
            .json(&data)
            .send()
            .await?;

        if response.status().is_success() {
            let record: Record = response.json().await?;
            debug!(collection, id, "pocketbase: record updated");
            Ok(record)
        } else {
            Err(Self::api_error(response, "update failed").await)
        }
    }

    /// Get record by id; `Ok(None)` on 404.
    pub async fn get_record(&self, collection: &str, id: &str) -> Result<Option<Record>, PocketBaseError> {
        let url = format!("{}/{}", self.records_url(collection), id);
        let response = self.authorized(self.client.get(&url)).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if response.status().is_success() {
            Ok(Some(response.json().await?))
        } else {
            Err(Self::api_error(response, "get failed").await)
        }
    }

    /// List records, following pages until `query.limit` is satisfied.
    pub async fn list_records(&self, collection: &str, query: &ListQuery) -> Result<Vec<Record>, PocketBaseError> {
        let per_page = query.limit.unwrap_or(MAX_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let mut records = Vec::new();
        let mut page = 1u32;

        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("page", page.to_string()),
                ("perPage", per_page.to_string()),
            ];
            if let Some(filter) = &query.filter {
                params.push(("filter", filter.clone()));
            }
            if let Some(sort) = &query.sort {
                params.push(("sort", sort.clone()));
            }

            let response = self
                .authorized(self.client.get(self.records_url(collection)))
                .query(&params)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(Self::api_error(response, "list failed").await);
            }

            let body: ListPage = response.json().await?;
            let exhausted = body.items.is_empty() || page >= body.total_pages;
            records.extend(body.items);

            if let Some(limit) = query.limit {
                if records.len() >= limit {
                    records.truncate(limit);
                    break;
                }
            }
            if exhausted {
                break;
            }
            page += 1;
        }

        Ok(records)
    }

    /// First record matching `filter`, if any.
    pub async fn first_record(&self, collection: &str, filter: &str) -> Result<Option<Record>, PocketBaseError> {
        let records = self
            .list_records(collection, &ListQuery::filter(filter).limit(1))
            .await?;
        Ok(records.into_iter().next())
    }

    /// Authenticate admin
    pub async fn auth_admin(&mut self, email: &str, password: &str) -> Result<(), PocketBaseError> {
        let url = format!("{}/api/admins/auth-with-password", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&json!({
                "identity": email,
                "password": password
            }))
            .send()
            .await?;

        if response.status().is_success() {
            let auth: AuthRecord = response.json().await?;
            self.admin_token = Some(auth.token);
            info!("pocketbase: authenticated as admin");
            Ok(())
        } else {
            Err(Self::api_error(response, "authentication failed").await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_escapes_filter_values() {
        assert_eq!(quote("eu-1"), "'eu-1'");
        assert_eq!(quote("o'brien"), "'o\\'brien'");
    }

    #[test]
    fn record_decodes_columns_only() {
        let record: Record = serde_json::from_value(json!({
            "id": "rec1",
            "created": "2024-01-01 00:00:00.000Z",
            "updated": "2024-01-01 00:00:00.000Z",
            "player_id": "alice",
            "value": 42
        }))
        .expect("record");

        #[derive(Deserialize)]
        struct Row {
            player_id: String,
            value: i64,
        }
        let row: Row = record.decode().expect("decode");
        assert_eq!(row.player_id, "alice");
        assert_eq!(row.value, 42);
        assert_eq!(record.id, "rec1");
    }

    #[test]
    fn unique_index_rejections_are_recognised() {
        let duplicate = PocketBaseError::from_api_body(
            StatusCode::BAD_REQUEST,
            &json!({
                "code": 400,
                "message": "Failed to create record.",
                "data": { "corp_id": { "code": "validation_not_unique", "message": "Value must be unique." } }
            }),
            "create failed",
        );
        assert!(duplicate.is_unique_violation());
        assert_eq!(duplicate.to_string(), "API error: Failed to create record. (code: 400 Bad Request)");

        let missing_field = PocketBaseError::from_api_body(
            StatusCode::BAD_REQUEST,
            &json!({ "message": "Failed to create record.", "data": { "name": { "code": "validation_required" } } }),
            "create failed",
        );
        assert!(!missing_field.is_unique_violation());

        let empty = PocketBaseError::from_api_body(StatusCode::INTERNAL_SERVER_ERROR, &Value::Null, "create failed");
        assert!(!empty.is_unique_violation());
        assert!(empty.to_string().contains("create failed"));
    }

    #[test]
    fn base_url_is_normalised() {
        let client = PocketBaseClient::new("http://localhost:8090/");
        assert_eq!(client.base_url(), "http://localhost:8090");
    }
}
