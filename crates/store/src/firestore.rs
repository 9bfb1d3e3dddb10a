//! Firestore REST client.
//!
//! Implements `DocumentStore` (fetch by id, equality query) and the paged
//! collection listing used by the polling change feed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;

use outliner_common::credentials::TokenSource;
use outliner_common::error::AppError;
use outliner_common::types::Document;

use crate::DocumentStore;
use crate::value::{decode_fields, encode_string};

/// Page size used when listing a whole collection.
const LIST_PAGE_SIZE: usize = 300;

/// Document as returned by the REST API.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDocument {
    name: String,
    #[serde(default)]
    fields: Option<serde_json::Value>,
    create_time: Option<DateTime<Utc>>,
    update_time: Option<DateTime<Utc>>,
}

impl RawDocument {
    fn into_document(self) -> Document {
        let id = self
            .name
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();

        Document {
            id,
            fields: decode_fields(self.fields.as_ref()),
            create_time: self.create_time,
            update_time: self.update_time,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<RawDocument>,
    next_page_token: Option<String>,
}

/// One element of the `:runQuery` response array.
#[derive(Debug, Deserialize)]
struct RunQueryResponse {
    document: Option<RawDocument>,
}

/// Client for one Firestore database.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    base_url: String,
    project_id: String,
    database: String,
    tokens: Arc<TokenSource>,
}

impl FirestoreClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        database: impl Into<String>,
        tokens: Arc<TokenSource>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            database: database.into(),
            tokens,
        }
    }

    /// `.../projects/{project}/databases/{database}/documents/{segments...}`
    ///
    /// Every segment is percent-encoded, so ids containing `/`, `?` or `#`
    /// stay inside their own path segment.
    pub fn document_url(&self, segments: &[&str]) -> Result<Url, AppError> {
        self.database_url(std::iter::once("documents").chain(segments.iter().copied()))
    }

    fn run_query_url(&self) -> Result<Url, AppError> {
        self.database_url(std::iter::once("documents:runQuery"))
    }

    fn database_url<'a>(&self, tail: impl IntoIterator<Item = &'a str>) -> Result<Url, AppError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            AppError::Store(format!("Invalid Firestore URL {}: {}", self.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                AppError::Store(format!("Firestore URL {} cannot take a path", self.base_url))
            })?
            .pop_if_empty()
            .extend([
                "projects",
                self.project_id.as_str(),
                "databases",
                self.database.as_str(),
            ])
            .extend(tail);
        Ok(url)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, AppError> {
        let token = self.tokens.bearer().await?;
        Ok(request.bearer_auth(token))
    }

    /// List every document in a collection, following pagination.
    pub async fn list_documents(&self, collection: &str) -> Result<Vec<Document>, AppError> {
        let url = self.document_url(&[collection])?;
        let mut documents = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .http
                .get(url.clone())
                .query(&[("pageSize", LIST_PAGE_SIZE.to_string())]);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let response = self.authorized(request).await?.send().await?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(AppError::Store(format!(
                    "Listing {} returned {}: {}",
                    collection, status, body
                )));
            }

            let page: ListDocumentsResponse = response.json().await?;
            documents.extend(page.documents.into_iter().map(RawDocument::into_document));

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        Ok(documents)
    }
}

/// Build a `:runQuery` body filtering `collection` on `field == value`.
pub fn build_field_query(
    collection: &str,
    field: &str,
    value: &str,
    limit: usize,
) -> serde_json::Value {
    json!({
        "structuredQuery": {
            "from": [{ "collectionId": collection }],
            "where": {
                "fieldFilter": {
                    "field": { "fieldPath": field },
                    "op": "EQUAL",
                    "value": encode_string(value)
                }
            },
            "limit": limit
        }
    })
}

#[async_trait]
impl DocumentStore for FirestoreClient {
    async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, AppError> {
        let url = self.document_url(&[collection, id])?;
        let response = self.authorized(self.http.get(url)).await?.send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Store(format!(
                "Fetching {}/{} returned {}: {}",
                collection, id, status, body
            )));
        }

        let raw: RawDocument = response.json().await?;
        Ok(Some(raw.into_document()))
    }

    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<Document>, AppError> {
        let url = self.run_query_url()?;
        let body = build_field_query(collection, field, value, limit);
        let response = self
            .authorized(self.http.post(url).json(&body))
            .await?
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Store(format!(
                "Query on {}.{} returned {}: {}",
                collection, field, status, body
            )));
        }

        let rows: Vec<RunQueryResponse> = response.json().await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.document)
            .map(RawDocument::into_document)
            .collect())
    }
}
