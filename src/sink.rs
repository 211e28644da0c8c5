//! Bounded conduit carrying finished results from the workers to the reporter.
//!
//! Results arrive in completion order. A full sink makes producers wait
//! rather than drop results, so a reporter that stops draining stalls the
//! run; the capacity is sized well above what a burst of workers produces.

use crate::RequestResult;

use tokio::sync::mpsc;

/// Hard cap on buffered results.
pub const MAX_RESULTS: usize = 32_000_000;

/// Buffer size for `concurrency` workers.
pub fn capacity(concurrency: usize) -> usize {
    concurrency.saturating_mul(1000).clamp(1, MAX_RESULTS)
}

/// Writing end, owned by the runner. Closing it is what ends the stream.
#[derive(Debug)]
pub struct Sink {
    tx: Option<mpsc::Sender<RequestResult>>,
}

/// Receive-only end handed to the reporter.
#[derive(Debug)]
pub struct Results {
    rx: mpsc::Receiver<RequestResult>,
}

/// Per-worker handle for pushing results.
#[derive(Debug, Clone)]
pub struct Producer {
    tx: mpsc::Sender<RequestResult>,
}

impl Sink {
    pub fn open(concurrency: usize) -> (Sink, Results) {
        let (tx, rx) = mpsc::channel(capacity(concurrency));
        (Sink { tx: Some(tx) }, Results { rx })
    }

    /// `None` once the sink is closed.
    pub fn producer(&self) -> Option<Producer> {
        self.tx.as_ref().map(|tx| Producer { tx: tx.clone() })
    }

    /// Drops the runner's sender. The reporter sees the end of the stream
    /// once every producer is gone as well. Returns `false` if already closed.
    pub fn close(&mut self) -> bool {
        self.tx.take().is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}

impl Producer {
    /// Waits for room in the sink. Returns `false` if the reporter is gone.
    pub async fn push(&self, result: RequestResult) -> bool {
        self.tx.send(result).await.is_ok()
    }
}

impl Results {
    /// Next result, `None` after the sink is closed and drained.
    pub async fn recv(&mut self) -> Option<RequestResult> {
        self.rx.recv().await
    }
}
