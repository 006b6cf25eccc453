//! Document store API client.
//!
//! The docs API is a per-link connect endpoint: it can enumerate the whole
//! document tree with metadata, serve one document's content as markdown,
//! and search with a document-id filter (the only way to fetch a single
//! document's metadata). There is no delta endpoint, which is why the doc
//! poller re-enumerates the full tree on its own cadence.

use std::time::Duration;

use inflow_domain::{DocsConfig, InflowError, Result};
use reqwest::Method;
use serde_json::Value;
use tracing::{debug, info};

use crate::http::client::{ensure_success, HttpClient};

/// Client for the document store API.
pub struct DocsClient {
    http: HttpClient,
    base_url: String,
}

impl DocsClient {
    pub fn new(config: &DocsConfig) -> Result<Self> {
        // Documents can be large; give content fetches more room.
        let http = HttpClient::builder().timeout(Duration::from_secs(60)).build()?;
        Ok(Self { http, base_url: config.base_url.trim_end_matches('/').to_string() })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.request(Method::GET, &format!("{}{path}", self.base_url))
    }

    /// Enumerate every document with metadata, tombstones included.
    pub async fn list_documents(&self) -> Result<Vec<Value>> {
        let request = self.get("/documents").query(&[("fetchMetadata", "true")]);
        let response = ensure_success(self.http.send(request).await?).await?;
        let body: Value = response
            .json()
            .await
            .map_err(|err| InflowError::Network(format!("invalid document listing: {err}")))?;

        let items = body["items"].as_array().cloned().unwrap_or_default();
        info!(count = items.len(), "document tree enumerated");
        Ok(items)
    }

    /// One document's metadata via the search endpoint's id filter.
    pub async fn find_document(&self, document_id: &str) -> Result<Option<Value>> {
        let request = self
            .get("/documents/search")
            .query(&[("documentIds", document_id), ("fetchMetadata", "true")]);
        let response = match ensure_success(self.http.send(request).await?).await {
            Ok(response) => response,
            Err(InflowError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        let body: Value = response
            .json()
            .await
            .map_err(|err| InflowError::Network(format!("invalid search response: {err}")))?;

        Ok(body["items"].as_array().and_then(|items| items.first()).cloned())
    }

    /// A document's content as markdown (the block endpoint honours the
    /// `text/markdown` accept header). `None` when the document is gone.
    pub async fn get_document_content(&self, document_id: &str) -> Result<Option<String>> {
        let request = self
            .get("/blocks")
            .query(&[("id", document_id), ("fetchMetadata", "true")])
            .header("Accept", "text/markdown");
        let response = match ensure_success(self.http.send(request).await?).await {
            Ok(response) => response,
            Err(InflowError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };

        let content = response
            .text()
            .await
            .map_err(|err| InflowError::Network(format!("invalid document content: {err}")))?;
        debug!(document_id, bytes = content.len(), "fetched document content");
        Ok(Some(content))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer) -> DocsClient {
        DocsClient::new(&DocsConfig { base_url: server.uri(), webhook_secret: None }).unwrap()
    }

    #[tokio::test]
    async fn listing_returns_all_items() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents"))
            .and(query_param("fetchMetadata", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [
                    { "id": "d-1", "title": "Roadmap" },
                    { "id": "d-2", "title": "Old plan", "isDeleted": true }
                ]
            })))
            .mount(&server)
            .await;

        let docs = client(&server).list_documents().await.unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[tokio::test]
    async fn search_by_id_returns_first_match() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/search"))
            .and(query_param("documentIds", "d-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "items": [ { "id": "d-1", "title": "Roadmap" } ]
            })))
            .mount(&server)
            .await;

        let doc = client(&server).find_document("d-1").await.unwrap().unwrap();
        assert_eq!(doc["title"], "Roadmap");
    }

    #[tokio::test]
    async fn search_with_no_match_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/documents/search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "items": [] })))
            .mount(&server)
            .await;

        assert!(client(&server).find_document("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn content_is_fetched_as_markdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blocks"))
            .and(query_param("id", "d-1"))
            .and(header("Accept", "text/markdown"))
            .respond_with(ResponseTemplate::new(200).set_body_string("# Roadmap\n\ncontent"))
            .mount(&server)
            .await;

        let content = client(&server).get_document_content("d-1").await.unwrap().unwrap();
        assert!(content.starts_with("# Roadmap"));
    }
}
