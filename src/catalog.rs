use super::*;
use crate::markup::{parse_item_details, parse_search_results};

use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::header::CONTENT_DISPOSITION;

const SEARCH_ATTEMPTS: usize = 3;
const MIN_SEARCH_BODY_BYTES: usize = 1000;
const SEARCH_RETRY_DELAY: Duration = Duration::from_secs(1);

pub(super) type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

/// An open download: the body has not been read yet. Dropping it releases the
/// underlying connection.
pub(super) struct CatalogDownload {
    pub(super) stream: ByteStream,
    pub(super) filename: String,
}

/// Remote catalog. All calls go over the network and rely on the client's
/// request timeout; nothing here retries except `search`.
#[async_trait]
pub(super) trait Catalog: Send + Sync {
    fn base_url(&self) -> &str;

    async fn search(&self, query: &str) -> Result<Vec<CatalogItem>>;

    async fn fetch_details(&self, item_id: &str) -> Result<ItemDetails>;

    async fn fetch_stream(&self, item_id: &str, format_path: &str) -> Result<CatalogDownload>;

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>>;
}

pub(super) struct HttpCatalog {
    client: reqwest::Client,
    base_url: String,
    retry_delay: Duration,
}

impl HttpCatalog {
    pub(super) fn new(base_url: &str, proxy: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(timeout);
        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy).with_context(|| format!("parse proxy {}", proxy))?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().context("build catalog http client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry_delay: SEARCH_RETRY_DELAY,
        })
    }

    #[cfg(test)]
    pub(super) fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request {}", url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("{} returned {}", url, status));
        }
        Ok(response)
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.get(url).await?;
        response
            .text()
            .await
            .with_context(|| format!("read body of {}", url))
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn search(&self, query: &str) -> Result<Vec<CatalogItem>> {
        let url = format!(
            "{}/booksearch?ask={}",
            self.base_url,
            urlencoding::encode(query)
        );
        debug!("search request: {}", url);

        for attempt in 1..=SEARCH_ATTEMPTS {
            let body = self.get_text(&url).await?;
            if body.len() < MIN_SEARCH_BODY_BYTES {
                warn!(
                    "search response too short ({} bytes), attempt {}/{}",
                    body.len(),
                    attempt,
                    SEARCH_ATTEMPTS
                );
            } else {
                let items = parse_search_results(&body);
                debug!("search attempt {}: {} items", attempt, items.len());
                if !items.is_empty() {
                    return Ok(items);
                }
            }
            if attempt < SEARCH_ATTEMPTS {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Ok(Vec::new())
    }

    async fn fetch_details(&self, item_id: &str) -> Result<ItemDetails> {
        let url = format!("{}/b/{}", self.base_url, item_id);
        let body = self.get_text(&url).await?;
        Ok(parse_item_details(&body, item_id))
    }

    async fn fetch_stream(&self, item_id: &str, format_path: &str) -> Result<CatalogDownload> {
        let format_path = format_path.trim();
        if format_path.is_empty() {
            return Err(anyhow!("empty download format"));
        }
        let url = format!("{}/b/{}/{}", self.base_url, item_id, format_path);
        info!("download request: {}", url);

        let response = self.get(&url).await?;
        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| format!("{}.{}", item_id, format_path));
        let stream = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(anyhow::Error::from)
            })
            .boxed();

        Ok(CatalogDownload { stream, filename })
    }

    async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.get(url).await?;
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("read body of {}", url))?;
        Ok(bytes.to_vec())
    }
}

/// `filename*` (RFC 5987) wins over plain `filename`.
pub(super) fn filename_from_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    for part in value.split(';') {
        let Some((key, raw)) = part.trim().split_once('=') else {
            continue;
        };
        let key = key.trim();
        let raw = raw.trim().trim_matches('"');
        if key.eq_ignore_ascii_case("filename*") {
            let encoded = raw.rsplit("''").next().unwrap_or(raw);
            if let Ok(decoded) = urlencoding::decode(encoded) {
                if !decoded.trim().is_empty() {
                    return Some(decoded.trim().to_string());
                }
            }
        } else if key.eq_ignore_ascii_case("filename") && !raw.is_empty() {
            plain = Some(raw.to_string());
        }
    }
    plain
}
