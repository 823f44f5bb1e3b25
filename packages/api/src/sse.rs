// ABOUTME: Server-Sent Events plumbing for log streaming
// ABOUTME: Per-client connection limits and a stream wrapper that releases its slot on drop

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, warn};

/// Default maximum concurrent log streams per client address
pub const DEFAULT_MAX_STREAMS_PER_IP: usize = 3;

/// Lines longer than this are cut before being sent as an event
pub const MAX_SSE_EVENT_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub struct StreamLimitExceeded;

/// Tracks concurrent SSE connections per client address
#[derive(Clone)]
pub struct SseConnectionTracker {
    connections: Arc<Mutex<HashMap<IpAddr, usize>>>,
    max_per_ip: usize,
}

impl Default for SseConnectionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_STREAMS_PER_IP)
    }
}

impl SseConnectionTracker {
    pub fn new(max_per_ip: usize) -> Self {
        Self {
            connections: Arc::new(Mutex::new(HashMap::new())),
            max_per_ip: max_per_ip.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<IpAddr, usize>> {
        self.connections.lock().unwrap_or_else(|poisoned| {
            warn!("SSE connection tracker mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Take a slot for `ip`, or fail when it already has the maximum open
    pub fn try_acquire(&self, ip: IpAddr) -> Result<SseConnectionGuard, StreamLimitExceeded> {
        let mut connections = self.lock();
        let count = connections.entry(ip).or_insert(0);

        if *count >= self.max_per_ip {
            warn!(ip = %ip, current = *count, max = self.max_per_ip, "SSE connection limit exceeded");
            return Err(StreamLimitExceeded);
        }

        *count += 1;
        debug!(ip = %ip, count = *count, "SSE connection acquired");

        Ok(SseConnectionGuard {
            ip,
            tracker: self.clone(),
        })
    }

    fn release(&self, ip: IpAddr) {
        let mut connections = self.lock();
        if let Some(count) = connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            debug!(ip = %ip, remaining = *count, "SSE connection released");
            if *count == 0 {
                connections.remove(&ip);
            }
        }
    }

    /// Open connections for `ip`
    pub fn active(&self, ip: IpAddr) -> usize {
        self.lock().get(&ip).copied().unwrap_or(0)
    }
}

/// Releases an SSE connection slot when dropped
pub struct SseConnectionGuard {
    ip: IpAddr,
    tracker: SseConnectionTracker,
}

impl Drop for SseConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release(self.ip);
    }
}

/// Holds the connection slot for as long as the response stream lives, so a
/// client disconnect frees it even if the stream never ended
pub struct GuardedSseStream<S> {
    stream: Pin<Box<S>>,
    _guard: SseConnectionGuard,
}

impl<S> GuardedSseStream<S> {
    pub fn new(stream: S, guard: SseConnectionGuard) -> Self {
        Self {
            stream: Box::pin(stream),
            _guard: guard,
        }
    }
}

impl<S, T, E> Stream for GuardedSseStream<S>
where
    S: Stream<Item = Result<T, E>>,
{
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.stream.as_mut().poll_next(cx)
    }
}

/// SSE response with the standard keep-alive
pub fn create_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// One `log` event per output line
pub fn log_event(line: &str) -> Event {
    let data = if line.len() > MAX_SSE_EVENT_SIZE {
        let mut end = MAX_SSE_EVENT_SIZE;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        &line[..end]
    } else {
        line
    };
    Event::default().event("log").data(data)
}

/// Sent once when the container's output ends
pub fn end_event() -> Event {
    Event::default().event("end").data("{}")
}
