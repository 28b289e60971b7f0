/*
 * linpama - Package transaction engine for Arch Linux front ends.
 * Copyright (C) 2025  linpama contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! AUR RPC search client with caching and rate limiting.

use lru::LruCache;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use super::AurRpcResponse;
use crate::config::Config;
use crate::error::{LinpamaError, LinpamaResult};
use crate::search::{PackageRecord, Repository};

const CACHE_TTL: Duration = Duration::from_secs(300);

/// AUR package information from the RPC API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AurPackageInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl AurPackageInfo {
    /// Project into a search record. AUR hits are never reported as installed.
    pub fn to_record(&self) -> PackageRecord {
        PackageRecord::new(
            self.name.clone(),
            Repository::Aur,
            self.version.clone(),
            false,
            self.description.clone().unwrap_or_default(),
        )
    }
}

/// AUR RPC client with a short-lived per-query cache
pub struct AurClient {
    client: reqwest::Client,
    cache: Arc<RwLock<LruCache<String, CacheEntry>>>,
    base_url: String,
    timeout: Duration,
    last_request: Arc<RwLock<Instant>>,
    min_request_interval: Duration,
}

#[derive(Clone)]
struct CacheEntry {
    results: Vec<AurPackageInfo>,
    cached_at: Instant,
}

impl AurClient {
    /// Build from the `[aur]` and `[search]` sections
    pub fn from_config(config: &Config) -> LinpamaResult<Self> {
        Self::with_config(
            config.aur.rpc_url.clone(),
            config.search.aur_cache_size,
            config.search.aur_timeout(),
        )
    }

    /// Create a client with explicit settings; `timeout` bounds each whole request
    pub fn with_config(base_url: String, cache_size: usize, timeout: Duration) -> LinpamaResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(2)
            .user_agent(concat!("linpama/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| LinpamaError::Network {
                url: base_url.clone(),
                message: "cannot build HTTP client".to_string(),
                source: Some(e),
            })?;

        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            client,
            cache: Arc::new(RwLock::new(LruCache::new(capacity))),
            base_url,
            timeout,
            last_request: Arc::new(RwLock::new(
                Instant::now().checked_sub(Duration::from_secs(1)).unwrap_or_else(Instant::now),
            )),
            min_request_interval: Duration::from_millis(100),
        })
    }

    /// Rate limit requests to avoid hammering the AUR
    async fn rate_limit(&self) {
        let mut last = self.last_request.write().await;
        let elapsed = last.elapsed();
        if elapsed < self.min_request_interval {
            tokio::time::sleep(self.min_request_interval - elapsed).await;
        }
        *last = Instant::now();
    }

    /// Raw keyword search (name and description), cached per normalised query
    pub async fn search(&self, query: &str) -> LinpamaResult<Vec<AurPackageInfo>> {
        // The RPC matches case-insensitively, so "VIM" and " vim" share an entry
        let key = query.trim().to_lowercase();
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.peek(&key) {
                if entry.cached_at.elapsed() < CACHE_TTL {
                    debug!("AUR cache hit for '{}'", key);
                    return Ok(entry.results.clone());
                }
            }
        }

        self.rate_limit().await;

        let url = format!(
            "{}?v=5&type=search&arg={}",
            self.base_url,
            urlencoding::encode(&key)
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.request_error(&url, e))?;

        if !response.status().is_success() {
            return Err(LinpamaError::network(
                url.as_str(),
                format!("HTTP {}", response.status()),
            ));
        }

        let body: AurRpcResponse = response
            .json()
            .await
            .map_err(|e| self.request_error(&url, e))?;

        if body.response_type == "error" || body.error.is_some() {
            return Err(LinpamaError::network(
                url.as_str(),
                body.error.unwrap_or_else(|| "AUR RPC error".to_string()),
            ));
        }

        {
            let mut cache = self.cache.write().await;
            cache.put(
                key,
                CacheEntry {
                    results: body.results.clone(),
                    cached_at: Instant::now(),
                },
            );
        }

        Ok(body.results)
    }

    /// Search and keep only packages whose name contains `query`, case-insensitively
    pub async fn search_records(&self, query: &str) -> LinpamaResult<Vec<PackageRecord>> {
        let needle = query.to_lowercase();
        let results = self.search(query).await?;

        Ok(results
            .iter()
            .filter(|info| info.name.to_lowercase().contains(&needle))
            .map(AurPackageInfo::to_record)
            .collect())
    }

    fn request_error(&self, url: &str, e: reqwest::Error) -> LinpamaError {
        if e.is_timeout() {
            LinpamaError::NetworkTimeout {
                url: url.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            LinpamaError::Network {
                url: url.to_string(),
                message: e.to_string(),
                source: Some(e),
            }
        }
    }

    /// Cached query count and capacity
    pub async fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read().await;
        (cache.len(), cache.cap().get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const BODY: &str = r#"{"version":5,"type":"search","resultcount":2,"results":[
        {"ID":1,"Name":"yay","PackageBase":"yay","Version":"12.4.2-1","Description":"Yet another yogurt","NumVotes":2000,"Popularity":30.1},
        {"ID":2,"Name":"paru","PackageBase":"paru","Version":"2.0.4-1","Description":null}
    ]}"#;

    fn client(server: &mockito::ServerGuard) -> AurClient {
        AurClient::with_config(format!("{}/rpc/", server.url()), 8, Duration::from_secs(2))
            .unwrap()
    }

    #[tokio::test]
    async fn test_search_parses_results_and_caches() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Regex(r"^/rpc/".to_string()))
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("type".into(), "search".into()),
                mockito::Matcher::UrlEncoded("arg".into(), "ya y".into()),
            ]))
            .with_status(200)
            .with_body(BODY)
            .expect(1)
            .create_async()
            .await;

        let client = client(&server);
        let first = client.search("ya y").await.unwrap();
        let second = client.search("ya y").await.unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(first[1].description, None);
        assert_eq!(client.cache_stats().await, (1, 8));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cache_key_ignores_case_and_padding() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", mockito::Matcher::Any)
            .match_query(mockito::Matcher::UrlEncoded("arg".into(), "yay".into()))
            .with_status(200)
            .with_body(BODY)
            .expect(1)
            .create_async()
            .await;

        let client = client(&server);
        assert_eq!(client.search("YAY").await.unwrap().len(), 2);
        assert_eq!(client.search(" yay ").await.unwrap().len(), 2);
        assert_eq!(client.search("yay").await.unwrap().len(), 2);

        assert_eq!(client.cache_stats().await.0, 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_search_records_filters_by_name() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(BODY)
            .create_async()
            .await;

        let records = client(&server).search_records("YA").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name(), "yay");
        assert_eq!(records[0].repository(), &Repository::Aur);
        assert_eq!(records[0].description(), "Yet another yogurt");
        assert!(!records[0].installed());
    }

    #[tokio::test]
    async fn test_rpc_error_and_bad_status() {
        let mut server = mockito::Server::new_async().await;
        let _err = server
            .mock("GET", mockito::Matcher::Any)
            .match_query(mockito::Matcher::UrlEncoded("arg".into(), "aa".into()))
            .with_status(200)
            .with_body(r#"{"version":5,"type":"error","resultcount":0,"results":[],"error":"Query arg too small."}"#)
            .create_async()
            .await;
        let _down = server
            .mock("GET", mockito::Matcher::Any)
            .match_query(mockito::Matcher::UrlEncoded("arg".into(), "bb".into()))
            .with_status(503)
            .create_async()
            .await;

        let client = client(&server);

        let err = client.search("aa").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(err.to_string().contains("Query arg too small."));

        let err = client.search("bb").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(client.cache_stats().await.0, 0);
    }

    #[tokio::test]
    async fn test_malformed_body_is_network_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body("<html>maintenance</html>")
            .create_async()
            .await;

        let err = client(&server).search("yay").await.unwrap_err();
        assert!(!err.is_transaction_fatal());
        assert_eq!(err.kind(), ErrorKind::Network);
    }
}
