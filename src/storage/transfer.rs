//! Write pipes and transfer progress

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, DuplexStream, ReadBuf};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{DataWriter, TransferObserver};
use crate::error::{Error, Result};

/// In-flight bytes buffered between a writer and its sink
const PIPE_BUFFER: usize = 64 * 1024;

/// State of the current write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteStatus {
    Idle,
    Active,
    Committed,
    Failed(String),
}

impl WriteStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, WriteStatus::Committed | WriteStatus::Failed(_))
    }
}

/// Byte counters and completion signal shared by a client and its sink task
pub struct TransferTracker {
    expected: AtomicU64,
    transferred: AtomicU64,
    status: watch::Sender<WriteStatus>,
    sink: Mutex<Option<JoinHandle<()>>>,
}

impl TransferTracker {
    pub fn new() -> Arc<Self> {
        let (status, _) = watch::channel(WriteStatus::Idle);
        Arc::new(Self {
            expected: AtomicU64::new(0),
            transferred: AtomicU64::new(0),
            status,
            sink: Mutex::new(None),
        })
    }

    /// Reset counters for a transfer of `size` bytes
    pub fn begin(&self, size: u64) {
        self.expected.store(size, Ordering::SeqCst);
        self.transferred.store(0, Ordering::SeqCst);
    }

    pub fn add(&self, bytes: u64) -> u64 {
        self.transferred.fetch_add(bytes, Ordering::SeqCst) + bytes
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    /// Percentage of the declared size moved so far
    pub fn progress(&self) -> u8 {
        if *self.status.borrow() == WriteStatus::Committed {
            return 100;
        }
        percent(self.transferred(), self.expected.load(Ordering::SeqCst))
    }

    pub fn status(&self) -> WriteStatus {
        self.status.borrow().clone()
    }

    fn set_status(&self, status: WriteStatus) {
        self.status.send_replace(status);
    }

    /// Wait for the sink to commit or fail
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.status.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.is_finished() || *s == WriteStatus::Idle)
                .await
                .map(|s| (*s).clone())
        })
        .await;

        match waited {
            Err(_) => Err(Error::Timeout(format!(
                "write not completed within {:?}",
                timeout
            ))),
            Ok(Err(_)) => Err(Error::Internal("write status channel closed".to_string())),
            Ok(Ok(WriteStatus::Committed)) => Ok(()),
            Ok(Ok(WriteStatus::Failed(reason))) => Err(Error::TransferIncomplete(reason)),
            Ok(Ok(_)) => Err(Error::TransferIncomplete("no write in progress".to_string())),
        }
    }

    /// Abort the running sink and wait until it is gone
    pub async fn cancel(&self) {
        let handle = self.sink.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
            self.set_status(WriteStatus::Failed("write cancelled".to_string()));
        }
    }

    /// Open a pipe whose read side is consumed by `sink` on a spawned task
    pub(crate) fn open_pipe<F, Fut>(
        self: &Arc<Self>,
        uri: String,
        size: u64,
        observer: Option<Arc<dyn TransferObserver>>,
        sink: F,
    ) -> DataWriter
    where
        F: FnOnce(ProgressReader<DuplexStream>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if let Some(previous) = self.sink.lock().take() {
            previous.abort();
        }
        self.begin(size);
        self.set_status(WriteStatus::Active);

        let (writer, reader) = tokio::io::duplex(PIPE_BUFFER);
        let reader = ProgressReader::new(reader, Arc::clone(self), observer);
        let tracker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match sink(reader).await {
                Ok(()) => {
                    debug!("Committed {}", uri);
                    tracker.set_status(WriteStatus::Committed);
                }
                Err(e) => {
                    warn!("Write of {} failed: {}", uri, e);
                    tracker.set_status(WriteStatus::Failed(e.to_string()));
                }
            }
        });
        *self.sink.lock() = Some(handle);

        Box::new(writer)
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

/// Reader that counts bytes into a tracker and reports progress
pub struct ProgressReader<R> {
    inner: R,
    tracker: Arc<TransferTracker>,
    observer: Option<Arc<dyn TransferObserver>>,
    expected: u64,
    last_percent: u8,
}

impl<R> ProgressReader<R> {
    pub fn new(
        inner: R,
        tracker: Arc<TransferTracker>,
        observer: Option<Arc<dyn TransferObserver>>,
    ) -> Self {
        let expected = tracker.expected.load(Ordering::SeqCst);
        Self {
            inner,
            tracker,
            observer,
            expected,
            last_percent: 0,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let this = &mut *self;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);

        if let Poll::Ready(Ok(())) = poll {
            let read = (buf.filled().len() - before) as u64;
            if read > 0 {
                let total = this.tracker.add(read);
                let pct = percent(total, this.expected);
                if pct > this.last_percent {
                    this.last_percent = pct;
                    if let Some(observer) = &this.observer {
                        observer.progress_made(pct);
                    }
                }
            }
        }
        poll
    }
}
