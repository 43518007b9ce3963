//! Concrete pipeline collaborators used by the `drover` binary.
//!
//! - [`HttpSource`]: GET the item's `source_url` (primary content)
//! - [`HttpSubItems`]: GET each sub-item's URL (attachments)
//! - [`FsArtifactSink`]: write `<output_dir>/<item_id>.json`
//!
//! Parsing, extraction and embeddings live outside drover; these keep the
//! fetched bodies opaque.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use drover_core::config::HttpConfig;
use drover_core::domain::{StageFailure, SubItem, WorkItem};
use drover_core::ports::{
    ArtifactSink, Artifacts, ContentSource, StagePayload, SubItemProcessor,
};
use reqwest::{Client, StatusCode};
use serde_json::json;

/// Build the shared HTTP client from `[http]`.
pub fn http_client(config: &HttpConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(config.user_agent.as_str())
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
}

/// Map an HTTP status to a stage failure. `None` = success.
pub(crate) fn classify_status(url: &str, status: StatusCode) -> Option<StageFailure> {
    if status.is_success() {
        return None;
    }
    let message = format!("{url}: HTTP {status}");
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        Some(StageFailure::transient(message))
    } else {
        Some(StageFailure::permanent(message))
    }
}

fn classify_error(url: &str, e: &reqwest::Error) -> StageFailure {
    if e.is_timeout() {
        StageFailure::timeout(format!("{url}: {e}"))
    } else {
        StageFailure::transient(format!("{url}: {e}"))
    }
}

struct Fetched {
    status: u16,
    content_type: Option<String>,
    body: Vec<u8>,
}

async fn get(client: &Client, token: Option<&str>, url: &str) -> Result<Fetched, StageFailure> {
    tracing::debug!(%url, "fetching");
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token);
    }
    let response = request.send().await.map_err(|e| classify_error(url, &e))?;

    let status = response.status();
    if let Some(failure) = classify_status(url, status) {
        return Err(failure);
    }
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response
        .bytes()
        .await
        .map_err(|e| classify_error(url, &e))?;

    Ok(Fetched {
        status: status.as_u16(),
        content_type,
        body: body.to_vec(),
    })
}

/// Primary content over HTTP. Text bodies are kept; binary bodies only by size.
#[derive(Clone)]
pub struct HttpSource {
    client: Client,
    token: Option<String>,
}

impl HttpSource {
    pub fn new(client: Client, token: Option<String>) -> Self {
        Self { client, token }
    }
}

#[async_trait]
impl ContentSource for HttpSource {
    async fn fetch(&self, item: &WorkItem) -> Result<StagePayload, StageFailure> {
        let fetched = get(&self.client, self.token.as_deref(), &item.source_url).await?;
        let text = String::from_utf8(fetched.body).ok();
        if text.as_deref().is_none_or(str::is_empty) {
            return Err(StageFailure::permanent(format!(
                "{}: empty or non-text body",
                item.source_url
            )));
        }
        Ok(json!({
            "url": item.source_url,
            "status": fetched.status,
            "content_type": fetched.content_type,
            "body": text,
        }))
    }
}

/// Attachments over HTTP; records what was fetched, not the bytes.
#[derive(Clone)]
pub struct HttpSubItems {
    client: Client,
    token: Option<String>,
}

impl HttpSubItems {
    pub fn new(client: Client, token: Option<String>) -> Self {
        Self { client, token }
    }
}

#[async_trait]
impl SubItemProcessor for HttpSubItems {
    async fn process(
        &self,
        _parent: &WorkItem,
        _primary: &StagePayload,
        sub_item: &SubItem,
    ) -> Result<StagePayload, StageFailure> {
        let fetched = get(&self.client, self.token.as_deref(), &sub_item.source_url).await?;
        if fetched.body.is_empty() {
            return Err(StageFailure::permanent(format!(
                "{}: empty body",
                sub_item.source_url
            )));
        }
        Ok(json!({
            "url": sub_item.source_url,
            "status": fetched.status,
            "content_type": fetched.content_type,
            "bytes": fetched.body.len(),
        }))
    }
}

/// Writes one JSON document per item.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    output_dir: PathBuf,
}

impl FsArtifactSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn path_for(&self, item: &WorkItem) -> PathBuf {
        self.output_dir.join(format!("{}.json", item.id.to_key()))
    }
}

#[async_trait]
impl ArtifactSink for FsArtifactSink {
    async fn persist(
        &self,
        item: &WorkItem,
        artifacts: Artifacts<'_>,
    ) -> Result<StagePayload, StageFailure> {
        let doc = json!({
            "item_id": item.id,
            "category": item.category,
            "source_url": item.source_url,
            "primary": artifacts.primary,
            "sub_items": artifacts.sub_items,
            "enrichment": artifacts.enrichment,
        });
        let bytes = serde_json::to_vec_pretty(&doc)
            .map_err(|e| StageFailure::permanent(format!("serialize artifacts: {e}")))?;

        let path = self.path_for(item);
        let io_err = |e: std::io::Error| StageFailure::transient(format!("{}: {e}", path.display()));
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(io_err)?;
        tokio::fs::write(&path, &bytes).await.map_err(io_err)?;

        Ok(json!({ "path": path.display().to_string(), "bytes": bytes.len() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use drover_core::domain::{FailureKind, ItemId, NewWorkItem};
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case(StatusCode::OK, None)]
    #[case(StatusCode::NOT_FOUND, Some(FailureKind::Permanent))]
    #[case(StatusCode::FORBIDDEN, Some(FailureKind::Permanent))]
    #[case(StatusCode::TOO_MANY_REQUESTS, Some(FailureKind::Transient))]
    #[case(StatusCode::BAD_GATEWAY, Some(FailureKind::Transient))]
    fn status_classification(#[case] status: StatusCode, #[case] expected: Option<FailureKind>) {
        let failure = classify_status("https://example.com", status);
        assert_eq!(failure.map(|f| f.kind), expected);
    }

    #[tokio::test]
    async fn fs_sink_writes_one_file_per_item() {
        let dir = std::env::temp_dir().join(format!("drover_artifacts_{}", Ulid::new()));
        let sink = FsArtifactSink::new(&dir);
        let item = WorkItem::from_new(
            &NewWorkItem {
                id: ItemId::from_ulid(Ulid::new()),
                category: Some("sensors".into()),
                source_url: "https://example.com/p/1".into(),
                sub_items: vec![],
            },
            Utc::now(),
        );
        let primary = json!({ "body": "<html/>" });

        let payload = sink
            .persist(
                &item,
                Artifacts {
                    primary: &primary,
                    sub_items: &[],
                    enrichment: None,
                },
            )
            .await
            .unwrap();

        let path = sink.path_for(&item);
        assert_eq!(payload["path"], path.display().to_string());
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["source_url"], "https://example.com/p/1");
        assert_eq!(written["primary"]["body"], "<html/>");
        assert!(written["enrichment"].is_null());
    }
}
