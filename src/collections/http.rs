//! HTTP-backed Collection Service client.
//!
//! Thin wrapper over the remote REST API: bearer-key auth, cursor-paginated
//! item streaming, JSON error surfacing. No retry policy of its own — the
//! workflows decide what a failed call means at each step.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;

use crate::collections::{
    Collection, CollectionService, CreateCollection, ItemStream, RawItem, ResearchJob,
    ResearchOutput, ResearchRequest, ScheduleSpec,
};
use crate::error::CollectionError;

/// Items fetched per page while streaming.
const ITEM_PAGE_SIZE: u32 = 100;

/// Spacing between research status polls.
const RESEARCH_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Connection settings for the remote service.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Service root, e.g. `https://api.example.com/v0`.
    pub base_url: String,
    pub api_key: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Production [`CollectionService`] implementation.
pub struct HttpCollectionService {
    config: HttpConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ItemPage {
    data: Vec<RawItem>,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResearchStatus {
    id: String,
    status: String,
    #[serde(default)]
    content: Option<String>,
}

impl HttpCollectionService {
    pub fn new(config: HttpConfig) -> Result<Self, CollectionError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| CollectionError::Request {
                reason: e.to_string(),
            })?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .bearer_auth(&self.config.api_key)
    }

    /// Send a request and decode the JSON body, mapping non-2xx statuses to
    /// [`CollectionError::Api`] with whatever body the service returned.
    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, CollectionError> {
        let response = request.send().await.map_err(|e| CollectionError::Request {
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CollectionError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| CollectionError::InvalidResponse(e.to_string()))
    }

    /// As [`send`], discarding the response body.
    async fn send_unit(&self, request: reqwest::RequestBuilder) -> Result<(), CollectionError> {
        let response = request.send().await.map_err(|e| CollectionError::Request {
            reason: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(CollectionError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(())
    }

    async fn fetch_item_page(
        &self,
        collection_id: &str,
        cursor: Option<&str>,
    ) -> Result<ItemPage, CollectionError> {
        let mut request = self
            .request(
                reqwest::Method::GET,
                &format!("collections/{collection_id}/items"),
            )
            .query(&[("limit", ITEM_PAGE_SIZE.to_string())]);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        self.send(request).await
    }
}

#[async_trait]
impl CollectionService for HttpCollectionService {
    async fn create_collection(
        &self,
        spec: CreateCollection,
    ) -> Result<Collection, CollectionError> {
        self.send(
            self.request(reqwest::Method::POST, "collections")
                .json(&spec),
        )
        .await
    }

    async fn get_collection(&self, id: &str) -> Result<Collection, CollectionError> {
        self.send(self.request(reqwest::Method::GET, &format!("collections/{id}")))
            .await
    }

    async fn cancel_collection(&self, id: &str) -> Result<(), CollectionError> {
        self.send_unit(self.request(reqwest::Method::POST, &format!("collections/{id}/cancel")))
            .await
    }

    async fn delete_collection(&self, id: &str) -> Result<(), CollectionError> {
        self.send_unit(self.request(reqwest::Method::DELETE, &format!("collections/{id}")))
            .await
    }

    async fn stream_items(&self, collection_id: &str) -> Result<ItemStream, CollectionError> {
        // Fetch the first page eagerly so auth/id errors surface here
        // rather than mid-stream.
        let first = self.fetch_item_page(collection_id, None).await?;

        struct PageState {
            buffered: std::vec::IntoIter<RawItem>,
            next_cursor: Option<String>,
        }

        let state = PageState {
            buffered: first.data.into_iter(),
            next_cursor: first.next_cursor,
        };

        // The service outlives the stream in practice, but the stream owns a
        // clone of everything it needs so the borrow checker agrees.
        let client = self.client.clone();
        let config = self.config.clone();
        let collection_id = collection_id.to_string();

        let stream = futures::stream::try_unfold(state, move |mut state| {
            let client = client.clone();
            let config = config.clone();
            let collection_id = collection_id.clone();
            async move {
                loop {
                    if let Some(item) = state.buffered.next() {
                        return Ok(Some((item, state)));
                    }
                    let Some(cursor) = state.next_cursor.take() else {
                        return Ok(None);
                    };

                    let service = HttpCollectionService {
                        config: config.clone(),
                        client: client.clone(),
                    };
                    let page = service.fetch_item_page(&collection_id, Some(&cursor)).await?;
                    state.buffered = page.data.into_iter();
                    state.next_cursor = page.next_cursor;
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn create_schedule(
        &self,
        collection_id: &str,
        schedule: ScheduleSpec,
    ) -> Result<(), CollectionError> {
        self.send_unit(
            self.request(
                reqwest::Method::POST,
                &format!("collections/{collection_id}/schedules"),
            )
            .json(&schedule),
        )
        .await
    }

    async fn create_research(
        &self,
        request: ResearchRequest,
    ) -> Result<ResearchJob, CollectionError> {
        self.send(
            self.request(reqwest::Method::POST, "research")
                .json(&request),
        )
        .await
    }

    async fn poll_research(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<ResearchOutput, CollectionError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let status: ResearchStatus = self
                .send(self.request(reqwest::Method::GET, &format!("research/{id}")))
                .await?;

            match status.status.as_str() {
                "completed" => {
                    return Ok(ResearchOutput {
                        id: status.id,
                        content: status.content.unwrap_or_default(),
                    });
                }
                "failed" => {
                    return Err(CollectionError::InvalidResponse(format!(
                        "research {id} failed: {}",
                        status.content.unwrap_or_default()
                    )));
                }
                _ => {}
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(CollectionError::ResearchTimeout {
                    id: id.to_string(),
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(RESEARCH_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let service = HttpCollectionService::new(HttpConfig {
            base_url: "https://api.example.com/v0/".into(),
            api_key: "key".into(),
            timeout: Duration::from_secs(30),
        })
        .unwrap();
        assert_eq!(
            service.url("collections/col_1"),
            "https://api.example.com/v0/collections/col_1"
        );
    }

    #[test]
    fn item_page_decodes_without_cursor() {
        let page: ItemPage = serde_json::from_value(serde_json::json!({
            "data": [{ "id": "item_1" }],
        }))
        .unwrap();
        assert_eq!(page.data.len(), 1);
        assert!(page.next_cursor.is_none());
    }
}
