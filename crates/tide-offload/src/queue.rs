//! Bounded three-class transfer queue.
//!
//! Workers always take from the highest non-empty class:
//! `Download > Upload > Prefetch`. Each class has its own bound and its own
//! overflow policy:
//!
//! | class    | when full                                         |
//! |----------|---------------------------------------------------|
//! | download | reject the new request (backpressure to reader)   |
//! | upload   | reject; the block stays `Pending` for the drain pass |
//! | prefetch | drop the oldest queued request                    |
//!
//! Upload and prefetch requests for a block that is already queued coalesce.

use std::collections::{HashSet, VecDeque};
use std::fmt;

use parking_lot::Mutex;
use tide_config::OffloadSection;
use tide_store::PayloadId;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Priority class of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Download,
    Upload,
    Prefetch,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransferKind::Download => "download",
            TransferKind::Upload => "upload",
            TransferKind::Prefetch => "prefetch",
        })
    }
}

/// One queued transfer of one block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub kind: TransferKind,
    pub payload: PayloadId,
    pub block: u64,
    /// Cache epoch the read was issued in; unused for uploads
    pub epoch: u64,
}

impl Transfer {
    pub fn upload(payload: PayloadId, block: u64) -> Self {
        Self {
            kind: TransferKind::Upload,
            payload,
            block,
            epoch: 0,
        }
    }

    pub fn download(payload: PayloadId, block: u64, epoch: u64) -> Self {
        Self {
            kind: TransferKind::Download,
            payload,
            block,
            epoch,
        }
    }

    pub fn prefetch(payload: PayloadId, block: u64, epoch: u64) -> Self {
        Self {
            kind: TransferKind::Prefetch,
            payload,
            block,
            epoch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    /// An identical request was already waiting
    Coalesced,
    /// Queued after dropping the oldest prefetch
    DroppedOldest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    Full(TransferKind),
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    pub download: usize,
    pub upload: usize,
    pub prefetch: usize,
}

#[derive(Default)]
struct State {
    download: VecDeque<Transfer>,
    upload: VecDeque<Transfer>,
    prefetch: VecDeque<Transfer>,
    queued_uploads: HashSet<(PayloadId, u64)>,
    queued_prefetches: HashSet<(PayloadId, u64)>,
    closed: bool,
}

pub struct TransferQueue {
    state: Mutex<State>,
    notify: Notify,
    download_limit: usize,
    upload_limit: usize,
    prefetch_limit: usize,
}

impl TransferQueue {
    pub fn new(download_limit: usize, upload_limit: usize, prefetch_limit: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            download_limit,
            upload_limit,
            prefetch_limit,
        }
    }

    pub fn from_config(cfg: &OffloadSection) -> Self {
        Self::new(cfg.download_queue, cfg.upload_queue, cfg.prefetch_queue)
    }

    /// Enqueue without waiting.
    pub fn push(&self, transfer: Transfer) -> Result<Enqueued, Rejected> {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(Rejected::Closed);
            }
            let key = (transfer.payload.clone(), transfer.block);
            match transfer.kind {
                TransferKind::Download => {
                    if state.download.len() >= self.download_limit {
                        return Err(Rejected::Full(TransferKind::Download));
                    }
                    state.download.push_back(transfer);
                    Enqueued::Queued
                }
                TransferKind::Upload => {
                    if state.queued_uploads.contains(&key) {
                        return Ok(Enqueued::Coalesced);
                    }
                    if state.upload.len() >= self.upload_limit {
                        return Err(Rejected::Full(TransferKind::Upload));
                    }
                    state.queued_uploads.insert(key);
                    state.upload.push_back(transfer);
                    Enqueued::Queued
                }
                TransferKind::Prefetch => {
                    if state.queued_prefetches.contains(&key) {
                        return Ok(Enqueued::Coalesced);
                    }
                    if self.prefetch_limit == 0 {
                        return Err(Rejected::Full(TransferKind::Prefetch));
                    }
                    let mut outcome = Enqueued::Queued;
                    if state.prefetch.len() >= self.prefetch_limit {
                        if let Some(old) = state.prefetch.pop_front() {
                            state.queued_prefetches.remove(&(old.payload, old.block));
                        }
                        outcome = Enqueued::DroppedOldest;
                    }
                    state.queued_prefetches.insert(key);
                    state.prefetch.push_back(transfer);
                    outcome
                }
            }
        };
        self.notify.notify_one();
        Ok(outcome)
    }

    pub fn try_pop(&self) -> Option<Transfer> {
        let mut state = self.state.lock();
        if let Some(t) = state.download.pop_front() {
            return Some(t);
        }
        if let Some(t) = state.upload.pop_front() {
            state.queued_uploads.remove(&(t.payload.clone(), t.block));
            return Some(t);
        }
        if let Some(t) = state.prefetch.pop_front() {
            state.queued_prefetches.remove(&(t.payload.clone(), t.block));
            return Some(t);
        }
        None
    }

    /// Wait for the next transfer. Returns `None` once cancelled or closed
    /// and empty.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<Transfer> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(t) = self.try_pop() {
                return Some(t);
            }
            if self.state.lock().closed {
                return None;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    /// Refuse new requests and wake every waiting worker.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn depths(&self) -> QueueDepths {
        let state = self.state.lock();
        QueueDepths {
            download: state.download.len(),
            upload: state.upload.len(),
            prefetch: state.prefetch.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let d = self.depths();
        d.download + d.upload + d.prefetch == 0
    }
}
