//! Multi-source content fetching with a fixed preference order.

use crate::{BundlioError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use object_store::ObjectStore;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const R2_HOST_SUFFIX: &str = ".r2.cloudflarestorage.com";
const S3_HOST_SUFFIX: &str = "amazonaws.com";
const R2_REGION: &str = "auto";

/// Declaration order is the fetch preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourceProvider {
    S3,
    R2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentSource {
    pub provider: SourceProvider,
    pub bucket_name: String,
    pub bucket_region: String,
    pub key: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveItem {
    pub sources: Vec<String>,
    pub size: u64,
}

/// Parses a virtual-hosted S3 URL (`<bucket>.s3.<region>.amazonaws.com/<key>`)
/// or a path-style R2 URL (`<account>.r2.cloudflarestorage.com/<bucket>/<key>`).
pub fn parse_source_url(raw: &str) -> Result<ContentSource> {
    let url = Url::parse(raw)
        .map_err(|error| BundlioError::Parse(format!("invalid source url {}: {}", raw, error)))?;
    let host = url
        .host_str()
        .ok_or_else(|| BundlioError::Parse(format!("source url has no host: {}", raw)))?
        .to_ascii_lowercase();
    let path = url.path().trim_start_matches('/');

    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() == 5 && labels[1] == "s3" && host.ends_with(S3_HOST_SUFFIX) {
        if path.is_empty() {
            return Err(BundlioError::Parse(format!("source url has no key: {}", raw)));
        }
        return Ok(ContentSource {
            provider: SourceProvider::S3,
            bucket_name: labels[0].to_string(),
            bucket_region: labels[2].to_string(),
            key: path.to_string(),
            url: raw.to_string(),
        });
    }

    if host.ends_with(R2_HOST_SUFFIX) {
        let (bucket_name, key) = path.split_once('/').unwrap_or((path, ""));
        if bucket_name.is_empty() || key.is_empty() {
            return Err(BundlioError::Parse(format!(
                "r2 source url needs /<bucket>/<key>: {}",
                raw
            )));
        }
        return Ok(ContentSource {
            provider: SourceProvider::R2,
            bucket_name: bucket_name.to_string(),
            bucket_region: R2_REGION.to_string(),
            key: key.to_string(),
            url: raw.to_string(),
        });
    }

    Err(BundlioError::Parse(format!(
        "unrecognized source url: {}",
        raw
    )))
}

/// A single read against one source.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, source: &ContentSource) -> Result<Bytes>;
}

/// S3 through an authenticated object store client (credentials come from the
/// environment), R2 through a plain HTTP GET.
#[derive(Clone, Default)]
pub struct RemoteSourceFetcher {
    http: reqwest::Client,
    /// One client per (bucket, region).
    s3_clients: Arc<Mutex<HashMap<(String, String), Arc<AmazonS3>>>>,
}

impl RemoteSourceFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self {
            http,
            s3_clients: Arc::default(),
        }
    }

    async fn s3_client(&self, source: &ContentSource) -> Result<Arc<AmazonS3>> {
        let key = (source.bucket_name.clone(), source.bucket_region.clone());
        let mut clients = self.s3_clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = AmazonS3Builder::from_env()
            .with_bucket_name(&source.bucket_name)
            .with_region(&source.bucket_region)
            .build()
            .map_err(|error| {
                BundlioError::ContentResolver(format!("s3 client setup failed: {}", error))
            })?;
        let client = Arc::new(client);
        clients.insert(key, client.clone());
        Ok(client)
    }

    async fn fetch_s3(&self, source: &ContentSource) -> Result<Bytes> {
        let store = self.s3_client(source).await?;

        let location = ObjectPath::from_url_path(&source.key).map_err(|error| {
            BundlioError::Parse(format!("invalid object key {}: {}", source.key, error))
        })?;

        let result = store.get(&location).await.map_err(|error| {
            BundlioError::ContentResolver(format!("s3 get failed for {}: {}", source.url, error))
        })?;

        result.bytes().await.map_err(|error| {
            BundlioError::ContentResolver(format!("s3 read failed for {}: {}", source.url, error))
        })
    }

    async fn fetch_http(&self, source: &ContentSource) -> Result<Bytes> {
        let response = self.http.get(&source.url).send().await.map_err(|error| {
            BundlioError::ContentResolver(format!("GET {} failed: {}", source.url, error))
        })?;

        if !response.status().is_success() {
            return Err(BundlioError::ContentResolver(format!(
                "GET {} returned status {}",
                source.url,
                response.status()
            )));
        }

        response.bytes().await.map_err(|error| {
            BundlioError::ContentResolver(format!("reading {} failed: {}", source.url, error))
        })
    }
}

#[async_trait]
impl SourceFetcher for RemoteSourceFetcher {
    async fn fetch(&self, source: &ContentSource) -> Result<Bytes> {
        match source.provider {
            SourceProvider::S3 => self.fetch_s3(source).await,
            SourceProvider::R2 => self.fetch_http(source).await,
        }
    }
}

#[derive(Clone)]
pub struct ContentResolver {
    fetcher: Arc<dyn SourceFetcher>,
}

impl ContentResolver {
    pub fn new(fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self { fetcher }
    }

    /// Returns the bytes of the first source that can be read. Malformed
    /// sources fail the whole call before anything is fetched.
    pub async fn resolve(&self, item: &ResolveItem) -> Result<Bytes> {
        let mut sources = item
            .sources
            .iter()
            .map(|raw| parse_source_url(raw))
            .collect::<Result<Vec<_>>>()?;

        if sources.is_empty() {
            return Err(BundlioError::ContentResolver(
                "no sources to resolve from".to_string(),
            ));
        }

        sources.sort_by_key(|source| source.provider);

        for source in &sources {
            match self.fetcher.fetch(source).await {
                Ok(bytes) => {
                    tracing::debug!(
                        "resolved content from {} bytes={} expected={}",
                        source.url,
                        bytes.len(),
                        item.size
                    );
                    return Ok(bytes);
                }
                Err(error) => {
                    tracing::warn!(
                        "content source failed, trying next. provider={:?} bucket={} key={} error={}",
                        source.provider,
                        source.bucket_name,
                        source.key,
                        error
                    );
                }
            }
        }

        Err(BundlioError::ContentResolver(format!(
            "all {} sources failed",
            sources.len()
        )))
    }
}
