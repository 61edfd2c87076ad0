//! Buffered writer over the store's bounded atomic multi-write.
//!
//! # Invariants
//! - No commit ever carries more than `capacity()` operations.
//! - The buffer is flushed as soon as it reaches the flush threshold.
//! - Operations of a failed flush are dropped, never retried.
//! - A group pushed with `push_group` is always committed by one flush.

use crate::config::BatchLimits;
use crate::repo::document_repo::{DocumentRepository, RepoError, RepoResult, WriteOp};
use log::{debug, error};

pub struct BoundedBatchWriter<'r, R: DocumentRepository + ?Sized> {
    repo: &'r R,
    capacity: usize,
    flush_threshold: usize,
    pending: Vec<WriteOp>,
    flushed_ops: usize,
    flushes: usize,
}

impl<'r, R: DocumentRepository + ?Sized> BoundedBatchWriter<'r, R> {
    /// Creates a writer bounded by both `limits` and the store's own limit.
    pub fn new(repo: &'r R, limits: BatchLimits) -> Self {
        let capacity = limits.max_ops.min(repo.max_batch_ops()).max(1);
        let flush_threshold = limits.flush_threshold.clamp(1, capacity);
        Self {
            repo,
            capacity,
            flush_threshold,
            pending: Vec::with_capacity(flush_threshold),
            flushed_ops: 0,
            flushes: 0,
        }
    }

    /// Buffers one operation, flushing when the threshold is reached.
    pub fn push(&mut self, op: WriteOp) -> RepoResult<()> {
        self.pending.push(op);
        if self.pending.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Buffers operations that must land in the same commit.
    ///
    /// Flushes the buffer first when the group would not fit under the
    /// threshold. A group larger than `capacity()` is rejected untouched.
    pub fn push_group(&mut self, ops: Vec<WriteOp>) -> RepoResult<()> {
        if ops.len() > self.capacity {
            return Err(RepoError::BatchTooLarge {
                len: ops.len(),
                max: self.capacity,
            });
        }
        if self.pending.len() + ops.len() > self.flush_threshold {
            self.flush()?;
        }
        self.pending.extend(ops);
        if self.pending.len() >= self.flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    /// Commits every buffered operation. Returns the number committed.
    pub fn flush(&mut self) -> RepoResult<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let batch = std::mem::take(&mut self.pending);
        match self.repo.commit_batch(&batch) {
            Ok(()) => {
                self.flushed_ops += batch.len();
                self.flushes += 1;
                debug!(
                    "event=batch_flush module=batch_writer status=ok ops={} flushes={}",
                    batch.len(),
                    self.flushes
                );
                Ok(batch.len())
            }
            Err(err) => {
                error!(
                    "event=batch_flush module=batch_writer status=error ops={} flushes={} error={}",
                    batch.len(),
                    self.flushes,
                    err
                );
                Err(err)
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn flushed_ops(&self) -> usize {
        self.flushed_ops
    }

    pub fn flush_count(&self) -> usize {
        self.flushes
    }
}
