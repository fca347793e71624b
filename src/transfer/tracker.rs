//! Completion tracking / 完成状态跟踪
//!
//! `ChunkTally` counts finished chunks of one file, `ChunkQueue` bounds the
//! number of chunk jobs waiting for the network pool, and `FatalSlot` keeps
//! the first error that aborts the whole invocation.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::TransferError;

/// Per-file chunk counters / 单文件分片计数器
#[derive(Debug, Default)]
pub struct ChunkTally {
    total: AtomicU64,
    claimed: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    finished: AtomicU64,
}

impl ChunkTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_total(&self, total: u64) {
        self.total.store(total, Ordering::SeqCst);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::SeqCst)
    }

    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Record one chunk outcome / 记录一个分片结果
    ///
    /// Returns `true` for exactly one caller: the one that finished the last
    /// chunk. Reports beyond `total` are dropped.
    pub fn record(&self, success: bool) -> bool {
        let total = self.total();
        let claimed = self.claimed.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
            if c < total { Some(c + 1) } else { None }
        });
        if claimed.is_err() {
            tracing::warn!("Chunk reported after all {} chunks finished", total);
            return false;
        }

        if success {
            self.successful.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        self.finished.fetch_add(1, Ordering::SeqCst) + 1 == total
    }

    pub fn is_done(&self) -> bool {
        let total = self.total();
        total != 0 && self.finished.load(Ordering::SeqCst) == total
    }

    /// All chunks succeeded / 全部分片成功
    pub fn is_complete_success(&self) -> bool {
        let total = self.total();
        total != 0 && self.successful() == total
    }
}

/// Admission limit for queued chunk jobs / 分片任务排队上限
pub struct ChunkQueue {
    limit: usize,
    queued: AtomicUsize,
    notify: Notify,
}

impl ChunkQueue {
    pub fn new(parallel: usize) -> Self {
        Self {
            limit: 2 * parallel.max(1),
            queued: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Wait until the queue is under its limit, then add `n` jobs / 等待队列空闲后加入任务
    ///
    /// A file always submits all of its chunks at once, so the queue may go
    /// above the limit by at most one file's worth.
    pub async fn admit(&self, n: usize) {
        loop {
            let notified = self.notify.notified();
            if self.queued() <= self.limit {
                break;
            }
            notified.await;
        }
        self.queued.fetch_add(n, Ordering::SeqCst);
    }

    /// One job left the queue / 任务出队
    pub fn release(&self) {
        let _ = self.queued.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| q.checked_sub(1));
        self.notify.notify_waiters();
    }
}

/// First fatal error of an invocation / 本次传输的首个致命错误
#[derive(Default)]
pub struct FatalSlot {
    error: Mutex<Option<TransferError>>,
    token: CancellationToken,
}

impl FatalSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Keep the first fatal error and cancel outstanding work / 记录致命错误并取消
    pub fn raise(&self, message: impl Into<String>) {
        let message = message.into();
        let mut slot = self.error.lock();
        if slot.is_none() {
            tracing::error!("Fatal transfer error: {}", message);
            *slot = Some(TransferError::Fatal(message));
        } else {
            tracing::debug!("Additional fatal error: {}", message);
        }
        drop(slot);
        self.token.cancel();
    }

    pub fn take(&self) -> Option<TransferError> {
        self.error.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_tally_single_finisher() {
        let tally = ChunkTally::new();
        tally.set_total(3);
        assert!(!tally.record(true));
        assert!(!tally.record(false));
        assert!(tally.record(true));
        assert!(tally.is_done());
        assert!(!tally.is_complete_success());
        assert_eq!(tally.successful() + tally.failed(), tally.total());

        // Overflow reports are ignored
        assert!(!tally.record(true));
        assert_eq!(tally.successful(), 2);
    }

    #[test]
    fn test_tally_zero_chunks_never_succeeds() {
        let tally = ChunkTally::new();
        assert!(!tally.is_complete_success());
        assert!(!tally.record(true));
        assert!(!tally.is_done());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tally_concurrent_records() {
        let tally = Arc::new(ChunkTally::new());
        tally.set_total(200);
        let mut handles = Vec::new();
        for i in 0..200 {
            let tally = tally.clone();
            handles.push(tokio::spawn(async move { tally.record(i % 7 != 0) }));
        }
        let mut finishers = 0;
        for h in handles {
            if h.await.unwrap() {
                finishers += 1;
            }
        }
        assert_eq!(finishers, 1);
        assert_eq!(tally.successful() + tally.failed(), 200);
        assert_eq!(tally.failed(), 29);
    }

    #[tokio::test]
    async fn test_queue_blocks_over_limit() {
        let queue = Arc::new(ChunkQueue::new(1));
        queue.admit(3).await;
        assert_eq!(queue.queued(), 3);

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.admit(1).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.release();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(queue.queued(), 3);
    }

    #[test]
    fn test_fatal_slot_keeps_first() {
        let slot = FatalSlot::new();
        assert!(!slot.is_cancelled());
        slot.raise("first");
        slot.raise("second");
        assert!(slot.is_cancelled());
        assert_eq!(slot.take().unwrap().to_string(), "Transfer aborted: first");
        assert!(slot.take().is_none());
    }
}
