//! Inbound datagram queue.
//!
//! The socket's receive loop only ever pushes; a single drain task pops in
//! FIFO order and hands each entry to the dispatcher. The drain task is
//! started on the first push and restarted by the next push if it died.

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// One received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEntry {
    pub payload: Vec<u8>,
    /// `payload` decoded as UTF-8, invalid sequences replaced.
    pub text: String,
    pub addr: IpAddr,
    pub port: u16,
}

impl InboundEntry {
    pub fn new(payload: Vec<u8>, source: SocketAddr) -> Self {
        let text = String::from_utf8_lossy(&payload).into_owned();
        Self {
            payload,
            text,
            addr: source.ip(),
            port: source.port(),
        }
    }

    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

type Dispatch = Box<dyn Fn(InboundEntry) + Send + Sync>;

/// Bounded FIFO between a receive loop and a dispatcher.
#[derive(Clone)]
pub struct InboundQueue {
    inner: Arc<Inner>,
}

struct Inner {
    device: String,
    capacity: usize,
    entries: Mutex<VecDeque<InboundEntry>>,
    ready: Notify,
    draining: AtomicBool,
    closed: AtomicBool,
    drain: Mutex<Option<JoinHandle<()>>>,
    dispatch: Dispatch,
}

impl InboundQueue {
    /// Create a queue that calls `dispatch` for every entry, one at a time.
    pub fn new(
        device: impl Into<String>,
        capacity: usize,
        dispatch: impl Fn(InboundEntry) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                device: device.into(),
                capacity: capacity.max(1),
                entries: Mutex::new(VecDeque::new()),
                ready: Notify::new(),
                draining: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                drain: Mutex::new(None),
                dispatch: Box::new(dispatch),
            }),
        }
    }

    /// Queue an entry. Returns `false` if it was dropped because the queue is
    /// full or closed. Must be called inside a tokio runtime.
    pub fn enqueue(&self, entry: InboundEntry) -> bool {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut entries = inner.entries();
            if entries.len() >= inner.capacity {
                warn!(
                    device = %inner.device,
                    source = %entry.source(),
                    capacity = inner.capacity,
                    "inbound queue full, datagram dropped"
                );
                return false;
            }
            entries.push_back(entry);
        }
        self.ensure_draining();
        inner.ready.notify_one();
        true
    }

    pub fn len(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a drain task is alive.
    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Stop draining and drop everything still queued.
    pub fn close(&self) {
        let inner = &self.inner;
        inner.closed.store(true, Ordering::Release);
        if let Some(task) = inner.drain().take() {
            task.abort();
        }
        let dropped = {
            let mut entries = inner.entries();
            let n = entries.len();
            entries.clear();
            n
        };
        if dropped > 0 {
            debug!(device = %inner.device, dropped, "queue closed with entries pending");
        }
    }

    fn ensure_draining(&self) {
        let inner = &self.inner;
        if inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        debug!(device = %inner.device, "starting drain task");
        let task = tokio::spawn(drain(Arc::clone(inner)));
        *inner.drain() = Some(task);
    }
}

impl Inner {
    fn entries(&self) -> MutexGuard<'_, VecDeque<InboundEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn drain(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.drain.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Clears the draining flag however the drain task ends.
struct DrainGuard(Arc<Inner>);

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            error!(
                device = %self.0.device,
                pending = self.0.entries().len(),
                "dispatcher panicked, drain task stopped"
            );
        }
        self.0.draining.store(false, Ordering::Release);
    }
}

async fn drain(inner: Arc<Inner>) {
    let _guard = DrainGuard(Arc::clone(&inner));
    loop {
        let next = inner.entries().pop_front();
        match next {
            Some(entry) => (inner.dispatch)(entry),
            None => inner.ready.notified().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn entry(text: &str) -> InboundEntry {
        InboundEntry::new(text.as_bytes().to_vec(), "10.0.0.5:9000".parse().unwrap())
    }

    #[test]
    fn entry_decodes_lossily() {
        let e = InboundEntry::new(vec![b'o', b'k', 0xff], "10.0.0.5:9000".parse().unwrap());
        assert_eq!(e.text, "ok\u{fffd}");
        assert_eq!(e.port, 9000);
        assert_eq!(e.source().to_string(), "10.0.0.5:9000");
    }

    #[tokio::test]
    async fn drains_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = InboundQueue::new("udp", 16, move |e: InboundEntry| {
            let _ = tx.send(e.text);
        });
        for text in ["a", "b", "c"] {
            assert!(queue.enqueue(entry(text)));
        }
        for expected in ["a", "b", "c"] {
            let got = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert_eq!(got, expected);
        }
        assert!(queue.is_draining());
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = InboundQueue::new("udp", 2, move |e: InboundEntry| {
            let _ = tx.send(e.text);
        });
        // current_thread runtime: the drain task cannot run until we yield.
        assert!(queue.enqueue(entry("1")));
        assert!(queue.enqueue(entry("2")));
        assert!(!queue.enqueue(entry("3")));
        assert_eq!(queue.len(), 2);

        assert_eq!(rx.recv().await.unwrap(), "1");
        assert_eq!(rx.recv().await.unwrap(), "2");
    }

    #[tokio::test]
    async fn closed_queue_refuses() {
        let queue = InboundQueue::new("udp", 4, |_| {});
        queue.close();
        assert!(!queue.enqueue(entry("late")));
        assert!(queue.is_empty());
    }
}
