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

//! Search aggregation over the local index and the AUR.
//!
//! [`SearchAggregator`] answers one query. [`SearchSession`] sits in front of
//! it for interactive use: it debounces input, tags every request with a
//! strictly increasing id, and drops any response that is not for the latest
//! id, whatever order the responses arrive in.

pub mod local;

use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument};

pub use local::{parse_search_output, LocalIndex, ParsedIndex};

use crate::aur::AurClient;
use crate::config::Config;
use crate::error::{ErrorKind, LinpamaResult};
use crate::events::Event;

/// Where a package comes from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Repository {
    /// Installed package not tied to a sync repository
    Local,
    /// Named sync repository (core, extra, multilib, ...)
    Remote(String),
    /// Arch User Repository
    Aur,
}

impl Repository {
    /// Map the repository prefix used in `pacman -Ss` output
    pub fn from_index_name(name: &str) -> Self {
        match name {
            "local" => Repository::Local,
            other => Repository::Remote(other.to_string()),
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Repository::Local => f.write_str("local"),
            Repository::Remote(name) => f.write_str(name),
            Repository::Aur => f.write_str("AUR"),
        }
    }
}

/// One search hit. Identity is `(name, repository)`.
#[derive(Debug, Clone)]
pub struct PackageRecord {
    name: String,
    repository: Repository,
    version: String,
    installed: bool,
    description: String,
}

impl PackageRecord {
    pub fn new(
        name: impl Into<String>,
        repository: Repository,
        version: impl Into<String>,
        installed: bool,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            repository,
            version: version.into(),
            installed,
            description: description.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn is_aur(&self) -> bool {
        self.repository == Repository::Aur
    }
}

impl PartialEq for PackageRecord {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.repository == other.repository
    }
}

impl Eq for PackageRecord {}

impl std::hash::Hash for PackageRecord {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.repository.hash(state);
    }
}

/// What happened to the remote half of a search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStatus {
    /// AUR lookup was not requested
    Skipped,
    /// AUR lookup answered with this many matching records
    Fetched(usize),
    /// AUR lookup failed or timed out; results are local only
    Degraded(ErrorKind),
}

/// Merged result of one query
#[derive(Debug, Clone)]
pub struct AggregateResults {
    pub records: Vec<PackageRecord>,
    pub remote: RemoteStatus,
    pub skipped_lines: usize,
}

/// Results for one tagged request
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub request_id: u64,
    pub query: String,
    pub records: Vec<PackageRecord>,
    pub remote: RemoteStatus,
    pub skipped_lines: usize,
}

/// Runs the local and AUR lookups for a query
pub struct SearchAggregator {
    local: LocalIndex,
    aur: AurClient,
}

impl SearchAggregator {
    pub fn new(local: LocalIndex, aur: AurClient) -> Self {
        Self { local, aur }
    }

    /// Build from configuration
    pub fn from_config(config: &Config) -> LinpamaResult<Self> {
        Ok(Self::new(
            LocalIndex::new(config.tools.pacman.clone()),
            AurClient::from_config(config)?,
        ))
    }

    /// Run both lookups concurrently and merge them, local records first.
    ///
    /// AUR failures only degrade the result. The call fails only when the
    /// local lookup could not run and the AUR contributed nothing.
    pub async fn search(&self, query: &str, include_aur: bool) -> LinpamaResult<AggregateResults> {
        let local = self.local.search(query);
        let remote = async {
            if include_aur {
                Some(self.aur.search_records(query).await)
            } else {
                None
            }
        };

        let (local, remote) = tokio::join!(local, remote);

        let (mut aur_records, remote) = match remote {
            None => (Vec::new(), RemoteStatus::Skipped),
            Some(Ok(records)) => {
                let count = records.len();
                (records, RemoteStatus::Fetched(count))
            }
            Some(Err(e)) => {
                warn!("AUR search degraded: {}", e);
                (Vec::new(), RemoteStatus::Degraded(e.kind()))
            }
        };

        let (mut records, skipped_lines) = match local {
            Ok(parsed) => (parsed.records, parsed.skipped.len()),
            Err(e) => {
                if aur_records.is_empty() {
                    return Err(e);
                }
                warn!("local search failed, showing AUR results only: {}", e);
                (Vec::new(), 0)
            }
        };

        records.append(&mut aur_records);

        Ok(AggregateResults {
            records,
            remote,
            skipped_lines,
        })
    }

    /// Lazy stream of records for `query`.
    ///
    /// Nothing runs until the stream is polled and every call starts a fresh
    /// search. A failed search yields an empty stream; use [`search`](Self::search)
    /// when the failure matters.
    pub fn stream<'a>(
        &'a self,
        query: &'a str,
        include_aur: bool,
    ) -> impl Stream<Item = PackageRecord> + 'a {
        futures::stream::once(self.search(query, include_aur))
            .map(move |result| {
                let records = match result {
                    Ok(results) => results.records,
                    Err(e) => {
                        debug!("search stream for '{}' ended early: {}", query, e);
                        Vec::new()
                    }
                };
                futures::stream::iter(records)
            })
            .flatten()
    }
}

/// A query tagged with its issue order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
    pub include_aur: bool,
    pub request_id: u64,
}

/// Issues strictly increasing request ids and remembers the latest
#[derive(Debug, Default)]
pub struct SearchTracker {
    latest: u64,
}

impl SearchTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a request, superseding every earlier one
    pub fn issue(&mut self, query: impl Into<String>, include_aur: bool) -> SearchRequest {
        self.latest += 1;
        SearchRequest {
            query: query.into(),
            include_aur,
            request_id: self.latest,
        }
    }

    /// Supersede earlier requests without issuing a new search
    pub fn invalidate(&mut self) -> u64 {
        self.latest += 1;
        self.latest
    }

    pub fn latest(&self) -> u64 {
        self.latest
    }

    pub fn is_current(&self, request_id: u64) -> bool {
        request_id == self.latest
    }
}

/// Trailing-edge debounce over search requests.
///
/// Time is passed in so the coalescing rule does not depend on a real clock.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    pending: Option<(Instant, SearchRequest)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    /// Replace any pending request and restart the window
    pub fn push(&mut self, request: SearchRequest, now: Instant) {
        self.pending = Some((now + self.window, request));
    }

    /// When the pending request becomes due
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|(at, _)| *at)
    }

    /// Take the pending request if its window has elapsed
    pub fn poll(&mut self, now: Instant) -> Option<SearchRequest> {
        match self.pending {
            Some((at, _)) if at <= now => self.pending.take().map(|(_, request)| request),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.pending = None;
    }
}

/// Worker result for a dispatched request
#[derive(Debug)]
pub struct SearchMessage {
    pub request: SearchRequest,
    pub result: LinpamaResult<AggregateResults>,
}

/// What a keystroke did to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputOutcome {
    /// Query too short: results should be cleared
    Cleared,
    /// Request scheduled to run once the debounce window elapses
    Scheduled(SearchRequest),
}

/// Interactive search front: debounce, id tagging and stale-result filtering
pub struct SearchSession {
    aggregator: Arc<SearchAggregator>,
    tracker: SearchTracker,
    debouncer: Debouncer,
    min_query_len: usize,
    tx: mpsc::UnboundedSender<SearchMessage>,
    rx: mpsc::UnboundedReceiver<SearchMessage>,
}

impl SearchSession {
    pub fn new(aggregator: Arc<SearchAggregator>, config: &Config) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            aggregator,
            tracker: SearchTracker::new(),
            debouncer: Debouncer::new(config.search.debounce()),
            min_query_len: config.search.min_query_len,
            tx,
            rx,
        }
    }

    /// Register new input. Every call supersedes all earlier requests.
    pub fn input(&mut self, query: &str, include_aur: bool, now: Instant) -> InputOutcome {
        let query = query.trim();
        if query.chars().count() < self.min_query_len {
            self.tracker.invalidate();
            self.debouncer.clear();
            return InputOutcome::Cleared;
        }

        let request = self.tracker.issue(query, include_aur);
        self.debouncer.push(request.clone(), now);
        InputOutcome::Scheduled(request)
    }

    /// When the pending request is due, if any
    pub fn next_deadline(&self) -> Option<Instant> {
        self.debouncer.deadline()
    }

    /// Dispatch the pending request if its debounce window has elapsed
    pub fn fire_due(&mut self, now: Instant) -> Option<SearchRequest> {
        let request = self.debouncer.poll(now)?;
        self.dispatch(request.clone());
        Some(request)
    }

    /// Run `request` on a worker task; its result arrives through [`recv`](Self::recv)
    pub fn dispatch(&self, request: SearchRequest) {
        let aggregator = Arc::clone(&self.aggregator);
        let tx = self.tx.clone();
        let span = crate::span_search!(request.request_id, request.query);

        tokio::spawn(
            async move {
                let result = aggregator.search(&request.query, request.include_aur).await;
                let _ = tx.send(SearchMessage { request, result });
            }
            .instrument(span),
        );
    }

    /// Next worker result, current or stale
    pub async fn recv(&mut self) -> Option<SearchMessage> {
        self.rx.recv().await
    }

    /// Turn a worker result into an event, or `None` if it has been superseded
    pub fn accept(&self, message: SearchMessage) -> Option<Event> {
        let SearchMessage { request, result } = message;
        if !self.tracker.is_current(request.request_id) {
            debug!(
                "discarding stale search #{} (latest #{})",
                request.request_id,
                self.tracker.latest()
            );
            return None;
        }

        Some(match result {
            Ok(results) => Event::SearchCompleted(SearchOutcome {
                request_id: request.request_id,
                query: request.query,
                records: results.records,
                remote: results.remote,
                skipped_lines: results.skipped_lines,
            }),
            Err(e) => Event::SearchFailed {
                request_id: request.request_id,
                query: request.query,
                reason: e.to_string(),
            },
        })
    }

    /// Issue and run a search immediately, bypassing the debounce window
    pub async fn search_now(&mut self, query: &str, include_aur: bool) -> Option<Event> {
        self.debouncer.clear();
        let request = self.tracker.issue(query.trim(), include_aur);
        let id = request.request_id;
        self.dispatch(request);

        while let Some(message) = self.recv().await {
            if message.request.request_id == id {
                return self.accept(message);
            }
        }
        None
    }
}

/// Batches a result list for incremental rendering
#[derive(Debug, Clone)]
pub struct ResultPages {
    records: Vec<PackageRecord>,
    displayed: usize,
    batch_size: usize,
}

impl ResultPages {
    pub fn new(records: Vec<PackageRecord>, batch_size: usize) -> Self {
        Self {
            records,
            displayed: 0,
            batch_size: batch_size.max(1),
        }
    }

    /// Next batch to append to the view; empty once everything is shown
    pub fn next_batch(&mut self) -> &[PackageRecord] {
        let start = self.displayed;
        let end = (start + self.batch_size).min(self.records.len());
        self.displayed = end;
        &self.records[start..end]
    }

    /// Records of 1-based page `number`
    pub fn page(&self, number: usize) -> &[PackageRecord] {
        let start = number.saturating_sub(1).saturating_mul(self.batch_size);
        if start >= self.records.len() {
            return &[];
        }
        let end = (start + self.batch_size).min(self.records.len());
        &self.records[start..end]
    }

    pub fn page_count(&self) -> usize {
        self.records.len().div_ceil(self.batch_size)
    }

    pub fn has_more(&self) -> bool {
        self.displayed < self.records.len()
    }

    pub fn total(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn record(name: &str) -> PackageRecord {
        PackageRecord::new(name, Repository::Remote("extra".into()), "1.0-1", false, "")
    }

    fn write_stub(dir: &Path, body: &str) -> Vec<String> {
        let path = dir.join("fake-pacman");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        vec!["sh".to_string(), path.display().to_string()]
    }

    fn aggregator(pacman: Vec<String>, aur_url: &str) -> SearchAggregator {
        let aur = AurClient::with_config(format!("{}/rpc/", aur_url), 16, Duration::from_secs(2))
            .unwrap();
        SearchAggregator::new(LocalIndex::new(pacman), aur)
    }

    fn message(id: u64, names: &[&str]) -> SearchMessage {
        SearchMessage {
            request: SearchRequest {
                query: "vi".to_string(),
                include_aur: false,
                request_id: id,
            },
            result: Ok(AggregateResults {
                records: names.iter().map(|n| record(n)).collect(),
                remote: RemoteStatus::Skipped,
                skipped_lines: 0,
            }),
        }
    }

    #[test]
    fn test_record_identity() {
        let a = PackageRecord::new("vim", Repository::Aur, "1", false, "x");
        let b = PackageRecord::new("vim", Repository::Aur, "2", true, "y");
        let c = PackageRecord::new("vim", Repository::Remote("extra".into()), "1", false, "x");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_tracker_ids_increase() {
        let mut tracker = SearchTracker::new();
        let first = tracker.issue("vi", false);
        let second = tracker.issue("vim", false);
        assert!(second.request_id > first.request_id);
        assert!(tracker.is_current(second.request_id));
        assert!(!tracker.is_current(first.request_id));

        tracker.invalidate();
        assert!(!tracker.is_current(second.request_id));
    }

    #[test]
    fn test_debouncer_coalesces_to_last_request() {
        let mut tracker = SearchTracker::new();
        let mut debouncer = Debouncer::new(Duration::from_millis(400));
        let t0 = Instant::now();

        debouncer.push(tracker.issue("vi", false), t0);
        debouncer.push(tracker.issue("vim", false), t0 + Duration::from_millis(100));

        assert!(debouncer.poll(t0 + Duration::from_millis(450)).is_none());
        let fired = debouncer
            .poll(t0 + Duration::from_millis(500))
            .expect("window elapsed");
        assert_eq!(fired.query, "vim");
        assert!(debouncer.poll(t0 + Duration::from_secs(5)).is_none());
    }

    #[tokio::test]
    async fn test_only_latest_response_is_accepted() {
        let server = mockito::Server::new_async().await;
        let mut session = SearchSession::new(
            Arc::new(aggregator(vec!["true".to_string()], &server.url())),
            &Config::default(),
        );
        let now = Instant::now();

        let ids: Vec<u64> = ["vi", "vim", "vimb", "vimba"]
            .iter()
            .map(|q| match session.input(q, false, now) {
                InputOutcome::Scheduled(request) => request.request_id,
                InputOutcome::Cleared => panic!("query long enough"),
            })
            .collect();
        let latest = *ids.last().unwrap();

        // Deliver in scrambled order, latest in the middle.
        let mut presented = Vec::new();
        for id in [ids[2], ids[0], latest, ids[1]] {
            if let Some(event) = session.accept(message(id, &["hit"])) {
                presented.push(event);
            }
        }

        assert_eq!(presented.len(), 1);
        match &presented[0] {
            Event::SearchCompleted(outcome) => assert_eq!(outcome.request_id, latest),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_short_query_supersedes_in_flight_request() {
        let server = mockito::Server::new_async().await;
        let mut session = SearchSession::new(
            Arc::new(aggregator(vec!["true".to_string()], &server.url())),
            &Config::default(),
        );
        let now = Instant::now();

        let id = match session.input("vim", false, now) {
            InputOutcome::Scheduled(request) => request.request_id,
            InputOutcome::Cleared => panic!("query long enough"),
        };
        assert_eq!(session.input("v", false, now), InputOutcome::Cleared);
        assert!(session.next_deadline().is_none());
        assert!(session.accept(message(id, &["vim"])).is_none());
    }

    #[tokio::test]
    async fn test_local_only_search_makes_no_network_request() {
        let mut server = mockito::Server::new_async().await;
        let aur = server
            .mock("GET", mockito::Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pacman = write_stub(
            dir.path(),
            "printf 'extra/vim 9.1.0-1\\n    Vi Improved\\n'",
        );
        let aggregator = aggregator(pacman, &server.url());

        let results = aggregator.search("vim", false).await.unwrap();

        assert_eq!(results.records.len(), 1);
        assert_eq!(results.records[0].name(), "vim");
        assert_eq!(results.records[0].description(), "Vi Improved");
        assert_eq!(results.remote, RemoteStatus::Skipped);
        aur.assert_async().await;
    }

    #[tokio::test]
    async fn test_aur_results_are_appended_and_filtered() {
        let mut server = mockito::Server::new_async().await;
        let _aur = server
            .mock("GET", mockito::Matcher::Regex(r"^/rpc/".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"version":5,"type":"search","resultcount":2,"results":[
                    {"Name":"vim-git","Version":"9.1-1","Description":"Vim from git"},
                    {"Name":"emacs-nox","Version":"29.4-1","Description":"An editor that is not vim"}
                ]}"#,
            )
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pacman = write_stub(dir.path(), "printf 'extra/vim 9.1.0-1\\n    Vi Improved\\n'");
        let aggregator = aggregator(pacman, &server.url());

        let results = aggregator.search("VIM", true).await.unwrap();
        let names: Vec<&str> = results.records.iter().map(|r| r.name()).collect();

        assert_eq!(names, vec!["vim", "vim-git"]);
        assert!(results.records[1].is_aur());
        assert_eq!(results.remote, RemoteStatus::Fetched(1));
    }

    #[tokio::test]
    async fn test_aur_error_degrades_to_local_results() {
        let mut server = mockito::Server::new_async().await;
        let _aur = server
            .mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(r#"{"version":5,"type":"error","resultcount":0,"results":[],"error":"Too many package results."}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let pacman = write_stub(dir.path(), "printf 'core/sed 4.9-3\\n'");
        let aggregator = aggregator(pacman, &server.url());

        let results = aggregator.search("se", true).await.unwrap();
        assert_eq!(results.records.len(), 1);
        assert_eq!(results.remote, RemoteStatus::Degraded(ErrorKind::Network));
    }

    #[tokio::test]
    async fn test_aur_timeout_degrades_to_local_results() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _silent = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let pacman = write_stub(dir.path(), "printf 'core/sed 4.9-3\\n    GNU stream editor\\n'");
        let aur = AurClient::with_config(
            format!("http://{}/rpc/", addr),
            16,
            Duration::from_millis(300),
        )
        .unwrap();
        let aggregator = SearchAggregator::new(LocalIndex::new(pacman), aur);

        let started = std::time::Instant::now();
        let results = aggregator.search("sed", true).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(results.records.len(), 1);
        assert_eq!(results.records[0].name(), "sed");
        assert_eq!(
            results.remote,
            RemoteStatus::Degraded(ErrorKind::NetworkTimeout)
        );
    }

    #[tokio::test]
    async fn test_no_matches_is_empty_not_error() {
        let server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let pacman = write_stub(dir.path(), "exit 1");
        let aggregator = aggregator(pacman, &server.url());

        let results = aggregator.search("nothing-matches", false).await.unwrap();
        assert!(results.records.is_empty());
    }

    #[tokio::test]
    async fn test_stream_is_lazy_and_yields_records() {
        let server = mockito::Server::new_async().await;
        let dir = tempfile::tempdir().unwrap();
        let pacman = write_stub(dir.path(), "printf 'core/bash 5.2-1\\nextra/zsh 5.9-5\\n'");
        let aggregator = aggregator(pacman, &server.url());

        let stream = aggregator.stream("sh", false);
        let names: Vec<String> = stream.map(|r| r.name().to_string()).collect().await;
        assert_eq!(names, vec!["bash", "zsh"]);

        // A second stream runs the search again from scratch.
        let again: Vec<PackageRecord> = aggregator.stream("sh", false).collect().await;
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn test_result_pages() {
        let records: Vec<PackageRecord> = (0..65).map(|i| record(&format!("pkg{}", i))).collect();
        let mut pages = ResultPages::new(records, 30);

        assert_eq!(pages.page_count(), 3);
        assert_eq!(pages.page(3).len(), 5);
        assert!(pages.page(4).is_empty());

        assert_eq!(pages.next_batch().len(), 30);
        assert_eq!(pages.next_batch().len(), 30);
        assert!(pages.has_more());
        assert_eq!(pages.next_batch().len(), 5);
        assert!(!pages.has_more());
        assert!(pages.next_batch().is_empty());
    }
}
