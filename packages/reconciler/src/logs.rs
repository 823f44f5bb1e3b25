// ABOUTME: Log snapshots and line streams, with one shared runtime stream per followed container
// ABOUTME: Followers each get their own queue; the runtime stream closes when the last one leaves

use crate::cache::StatusCache;
use crate::calls::RuntimeCalls;
use crate::error::{ReconcileError, Result};
use crate::plan::ActionKind;
use crate::reconciler::Reconciler;
use dockformer_runtime::{LogOptions, ObservedContainer, OutputStream, RuntimeError};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct LogStreamerConfig {
    /// Lines returned by a snapshot when the caller gives no tail, and
    /// replayed when a follow stream first opens
    pub default_tail: usize,
    /// Lines a follow hub keeps for readers that join late
    pub backlog: usize,
}

impl Default for LogStreamerConfig {
    fn default() -> Self {
        Self {
            default_tail: 100,
            backlog: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogSnapshot {
    pub container: ObservedContainer,
    pub logs: String,
}

/// Splits byte chunks into lines, carrying partial lines across chunks
#[derive(Debug, Default)]
struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in data {
            if byte == b'\n' {
                lines.push(Self::decode(&self.partial));
                self.partial.clear();
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = Self::decode(&self.partial);
        self.partial.clear();
        Some(line)
    }

    fn decode(bytes: &[u8]) -> String {
        String::from_utf8_lossy(bytes)
            .trim_end_matches('\r')
            .to_string()
    }
}

/// Drain a finite stream and decode it once, so a character split across
/// chunks survives
async fn read_text(stream: &mut OutputStream) -> std::result::Result<String, RuntimeError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = stream.next().await {
        bytes.extend_from_slice(&chunk?.data);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

type HubMap = HashMap<String, Arc<Hub>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<u64, mpsc::UnboundedSender<String>>,
    backlog: VecDeque<String>,
    next_id: u64,
    closed: bool,
}

/// Fan-out point for one container's follow stream
#[derive(Default)]
struct Hub {
    state: Mutex<HubState>,
    cancel: Notify,
}

impl Hub {
    fn publish(&self, lines: Vec<String>, backlog: usize) {
        let mut state = lock(&self.state);
        for line in lines {
            state.backlog.push_back(line.clone());
            while state.backlog.len() > backlog {
                state.backlog.pop_front();
            }
            state
                .subscribers
                .retain(|_, tx| tx.send(line.clone()).is_ok());
        }
    }

    /// Register a reader; caller holds the hub map lock
    fn subscribe(self: &Arc<Self>, key: &str, hubs: &Arc<Mutex<HubMap>>) -> LogLines {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut state = lock(&self.state);
            for line in &state.backlog {
                let _ = tx.send(line.clone());
            }
            state.next_id += 1;
            let id = state.next_id;
            state.subscribers.insert(id, tx);
            id
        };

        let inner = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|line| (line, rx))
        })
        .boxed();

        LogLines {
            inner,
            membership: Some(Membership {
                key: key.to_string(),
                id,
                hub: Arc::clone(self),
                hubs: Arc::clone(hubs),
            }),
        }
    }
}

/// A follower's seat in a hub; leaving closes the hub when it empties
struct Membership {
    key: String,
    id: u64,
    hub: Arc<Hub>,
    hubs: Arc<Mutex<HubMap>>,
}

impl Drop for Membership {
    fn drop(&mut self) {
        let mut hubs = lock(&self.hubs);
        let mut state = lock(&self.hub.state);
        state.subscribers.remove(&self.id);
        if state.subscribers.is_empty() && !state.closed {
            state.closed = true;
            if hubs
                .get(&self.key)
                .is_some_and(|hub| Arc::ptr_eq(hub, &self.hub))
            {
                hubs.remove(&self.key);
            }
            self.hub.cancel.notify_one();
            debug!(container = %self.key, "Last log follower left");
        }
    }
}

/// Lines of container output. Dropping a follow stream leaves its hub.
pub struct LogLines {
    inner: BoxStream<'static, String>,
    membership: Option<Membership>,
}

impl LogLines {
    fn finite(stream: OutputStream, container: String) -> Self {
        let state = (stream, LineSplitter::default(), VecDeque::new(), false);
        let inner = stream::unfold(state, move |(mut stream, mut splitter, mut pending, mut done)| {
            let container = container.clone();
            async move {
                loop {
                    if let Some(line) = pending.pop_front() {
                        return Some((line, (stream, splitter, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    match stream.next().await {
                        Some(Ok(chunk)) => pending.extend(splitter.push(&chunk.data)),
                        Some(Err(e)) => {
                            warn!(container = %container, "Log stream failed: {}", e);
                            pending.extend(splitter.finish());
                            done = true;
                        }
                        None => {
                            pending.extend(splitter.finish());
                            done = true;
                        }
                    }
                }
            }
        })
        .boxed();

        Self {
            inner,
            membership: None,
        }
    }

    pub fn is_follow(&self) -> bool {
        self.membership.is_some()
    }
}

impl Stream for LogLines {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl fmt::Debug for LogLines {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogLines")
            .field("follow", &self.is_follow())
            .finish()
    }
}

#[derive(Clone)]
pub struct LogStreamer {
    calls: RuntimeCalls,
    cache: Arc<StatusCache>,
    config: LogStreamerConfig,
    hubs: Arc<Mutex<HubMap>>,
}

impl LogStreamer {
    pub fn new(reconciler: &Reconciler, config: LogStreamerConfig) -> Self {
        Self {
            calls: reconciler.calls().clone(),
            cache: reconciler.cache(),
            config,
            hubs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &LogStreamerConfig {
        &self.config
    }

    /// Point-in-time log text for a container name or id
    pub async fn snapshot(&self, target: &str, tail: Option<usize>) -> Result<LogSnapshot> {
        let container = self.calls.resolve(&self.cache, target).await?;
        let tail = tail.unwrap_or(self.config.default_tail);

        let mut stream = self
            .calls
            .logs(container.id(), LogOptions::snapshot(Some(tail)))
            .await
            .map_err(|e| ReconcileError::runtime(container.name(), ActionKind::Logs, e))?;

        let logs = read_text(&mut stream)
            .await
            .map_err(|e| ReconcileError::runtime(container.name(), ActionKind::Logs, e))?;

        Ok(LogSnapshot { container, logs })
    }

    /// Open a line stream. Without `follow` the stream ends after the retained
    /// output and can simply be opened again; with `follow` it ends when the
    /// container stops or the caller drops it.
    pub async fn open(&self, target: &str, follow: bool) -> Result<LogLines> {
        let container = self.calls.resolve(&self.cache, target).await?;

        if !follow {
            let stream = self
                .calls
                .logs(container.id(), LogOptions::snapshot(None))
                .await
                .map_err(|e| ReconcileError::runtime(container.name(), ActionKind::Logs, e))?;
            return Ok(LogLines::finite(stream, container.name().to_string()));
        }

        let key = container.id().to_string();
        if let Some(lines) = self.join(&key) {
            return Ok(lines);
        }

        let stream = self
            .calls
            .logs(&key, LogOptions::follow(Some(self.config.default_tail)))
            .await
            .map_err(|e| ReconcileError::runtime(container.name(), ActionKind::Logs, e))?;

        let mut hubs = lock(&self.hubs);
        if let Some(hub) = hubs.get(&key).cloned() {
            // Another reader opened the hub while we were connecting
            return Ok(hub.subscribe(&key, &self.hubs));
        }

        let hub = Arc::new(Hub::default());
        hubs.insert(key.clone(), Arc::clone(&hub));
        let lines = hub.subscribe(&key, &self.hubs);
        drop(hubs);

        debug!(container = container.name(), id = %key, "Opened log hub");
        tokio::spawn(pump(
            key,
            hub,
            Arc::clone(&self.hubs),
            stream,
            self.config.backlog,
        ));
        Ok(lines)
    }

    fn join(&self, key: &str) -> Option<LogLines> {
        let hubs = lock(&self.hubs);
        hubs.get(key).map(|hub| hub.subscribe(key, &self.hubs))
    }

    /// Containers with an open follow hub
    pub fn active_hubs(&self) -> usize {
        lock(&self.hubs).len()
    }

    /// Followers attached to a container's hub
    pub fn followers(&self, id: &str) -> usize {
        lock(&self.hubs)
            .get(id)
            .map(|hub| lock(&hub.state).subscribers.len())
            .unwrap_or(0)
    }
}

/// Move lines from the runtime stream into a hub until the stream ends or
/// the last follower leaves
async fn pump(
    key: String,
    hub: Arc<Hub>,
    hubs: Arc<Mutex<HubMap>>,
    mut stream: OutputStream,
    backlog: usize,
) {
    let mut splitter = LineSplitter::default();
    loop {
        let next = tokio::select! {
            _ = hub.cancel.notified() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let lines = splitter.push(&chunk.data);
                if !lines.is_empty() {
                    hub.publish(lines, backlog);
                }
            }
            Some(Err(e)) => {
                warn!(container = %key, "Log stream failed: {}", e);
                break;
            }
            None => {
                if let Some(rest) = splitter.finish() {
                    hub.publish(vec![rest], backlog);
                }
                break;
            }
        }
    }
    drop(stream);

    let mut map = lock(&hubs);
    if map.get(&key).is_some_and(|h| Arc::ptr_eq(h, &hub)) {
        map.remove(&key);
    }
    let mut state = lock(&hub.state);
    state.closed = true;
    // Dropping the senders ends every follower's stream
    state.subscribers.clear();
    debug!(container = %key, "Log hub closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::ReconcilerConfig;
    use crate::RetryPolicy;
    use dockformer_runtime::MemoryRuntime;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn setup() -> (MemoryRuntime, Arc<Reconciler>, LogStreamer) {
        let runtime = MemoryRuntime::new();
        let reconciler = Arc::new(Reconciler::new(
            Arc::new(runtime.clone()),
            ReconcilerConfig {
                retry: RetryPolicy::none(),
                ..ReconcilerConfig::default()
            },
        ));
        let manifest =
            dockformer_manifest::parse(b"containers:\n  - name: web\n    image: nginx:latest\n")
                .unwrap();
        reconciler.submit(manifest).await.unwrap();

        let streamer = LogStreamer::new(
            &reconciler,
            LogStreamerConfig {
                default_tail: 0,
                backlog: 10,
            },
        );
        (runtime, reconciler, streamer)
    }

    #[tokio::test]
    async fn test_snapshot_text_keeps_character_split_across_chunks() {
        use dockformer_runtime::LogChunk;

        let bytes = "caf\u{e9}\n".as_bytes();
        let (tx, rx) = mpsc::channel(4);
        tx.send(Ok(LogChunk::stdout(&bytes[..4]))).await.unwrap();
        tx.send(Ok(LogChunk::stdout(&bytes[4..]))).await.unwrap();
        drop(tx);

        let text = read_text(&mut OutputStream::new(rx)).await.unwrap();
        assert_eq!(text, "caf\u{e9}\n");
    }

    async fn next_line(lines: &mut LogLines) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), lines.next())
            .await
            .expect("timed out waiting for a log line")
    }

    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_line_splitter_handles_partial_lines() {
        let mut splitter = LineSplitter::default();
        assert_eq!(splitter.push(b"one\ntw"), vec!["one"]);
        assert_eq!(splitter.push(b"o\r\nthree"), vec!["two"]);
        assert_eq!(splitter.finish(), Some("three".to_string()));
        assert_eq!(splitter.finish(), None);
    }

    #[tokio::test]
    async fn test_snapshot_returns_tail() {
        let (runtime, _reconciler, streamer) = setup().await;
        runtime.emit_log("web", "a").unwrap();
        runtime.emit_log("web", "b").unwrap();

        let snapshot = streamer.snapshot("web", Some(1)).await.unwrap();
        assert_eq!(snapshot.logs, "b\n");
        assert_eq!(snapshot.container.name(), "web");
    }

    #[tokio::test]
    async fn test_snapshot_unknown_container() {
        let (_runtime, _reconciler, streamer) = setup().await;
        assert!(matches!(
            streamer.snapshot("ghost", None).await,
            Err(ReconcileError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_non_follow_is_restartable() {
        let (runtime, _reconciler, streamer) = setup().await;
        runtime.emit_log("web", "hello").unwrap();

        let first: Vec<String> = streamer.open("web", false).await.unwrap().collect().await;
        let second: Vec<String> = streamer.open("web", false).await.unwrap().collect().await;
        assert_eq!(first, vec!["web started", "hello"]);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_followers_each_receive_every_line() {
        let (runtime, _reconciler, streamer) = setup().await;

        let mut a = streamer.open("web", true).await.unwrap();
        let mut b = streamer.open("web", true).await.unwrap();
        assert_eq!(streamer.active_hubs(), 1);

        runtime.emit_log("web", "one").unwrap();
        runtime.emit_log("web", "two").unwrap();

        assert_eq!(next_line(&mut a).await.as_deref(), Some("one"));
        assert_eq!(next_line(&mut a).await.as_deref(), Some("two"));
        assert_eq!(next_line(&mut b).await.as_deref(), Some("one"));
        assert_eq!(next_line(&mut b).await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn test_late_follower_gets_backlog() {
        let (runtime, _reconciler, streamer) = setup().await;

        let mut early = streamer.open("web", true).await.unwrap();
        runtime.emit_log("web", "before").unwrap();
        assert_eq!(next_line(&mut early).await.as_deref(), Some("before"));

        let mut late = streamer.open("web", true).await.unwrap();
        assert_eq!(next_line(&mut late).await.as_deref(), Some("before"));
    }

    #[tokio::test]
    async fn test_follow_ends_when_container_stops() {
        let (runtime, reconciler, streamer) = setup().await;
        let mut lines = streamer.open("web", true).await.unwrap();

        reconciler.stop("web").await.unwrap();
        assert_eq!(next_line(&mut lines).await.as_deref(), Some("web stopped"));
        assert_eq!(next_line(&mut lines).await, None);
        wait_until(|| streamer.active_hubs() == 0).await;
        wait_until(|| runtime.open_log_streams() == 0).await;
    }

    #[tokio::test]
    async fn test_last_follower_leaving_closes_runtime_stream() {
        let (runtime, _reconciler, streamer) = setup().await;
        let a = streamer.open("web", true).await.unwrap();
        let b = streamer.open("web", true).await.unwrap();
        assert_eq!(runtime.open_log_streams(), 1);

        drop(a);
        assert_eq!(streamer.active_hubs(), 1);
        drop(b);
        assert_eq!(streamer.active_hubs(), 0);

        wait_until(|| runtime.open_log_streams() == 0).await;
    }
}
