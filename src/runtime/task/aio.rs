//! Disk I/O completion tasks.
//!
//! The producer describes the I/O in a [`DiskAio`] and hands the task to the
//! disk engine. Writes may be assembled from several fragments; `collapse`
//! merges them into one contiguous buffer so the engine can submit a single
//! request. When the I/O completes the engine calls
//! [`AioTask::enqueue_aio`], and the task delivers `(error, bytes)` to the
//! completion callback on its pool.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

use super::{Execution, Payload, Task, TaskCode};
use crate::runtime::error::{DisplayOutcome, ErrorCode, TaskError, TaskResult};
use crate::runtime::node::ServiceNode;

/// Direction of a disk operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AioType {
    #[default]
    Invalid,
    Read,
    Write,
}

/// Opaque file handle owned by the disk engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(pub u64);

/// Description of one disk operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskAio {
    pub file: Option<FileHandle>,
    /// Source for writes, destination for reads.
    pub buffer: Vec<u8>,
    /// Bytes to transfer.
    pub buffer_size: usize,
    pub file_offset: u64,
    pub aio_type: AioType,
}

type Callback = Box<dyn FnOnce(ErrorCode, usize) + Send>;

pub(crate) struct AioBody {
    aio: Mutex<DiskAio>,
    unmerged: Mutex<SmallVec<[Vec<u8>; 4]>>,
    transferred: AtomicUsize,
    cb: Mutex<Option<Callback>>,
}

impl AioBody {
    pub(crate) fn execute(
        &self,
        task: &Task,
    ) -> Execution {
        let cb = self.cb.lock().take();
        let transferred = self.transferred.load(Ordering::Acquire);
        trace!(task = %task.id(), outcome = %DisplayOutcome(task.error(), transferred), "aio completed");
        if let Some(cb) = cb {
            cb(task.error(), transferred);
        }
        Execution::Done
    }

    pub(crate) fn release(&self) {
        self.cb.lock().take();
    }
}

/// A disk operation and its completion callback.
#[derive(Clone)]
pub struct AioTask(Arc<Task>);

task_handle!(AioTask);

impl AioTask {
    /// Create a task on the calling thread's node.
    #[track_caller]
    pub fn new<F>(
        code: TaskCode,
        cb: F,
    ) -> Self
    where
        F: FnOnce(ErrorCode, usize) + Send + 'static,
    {
        Self::with_node(code, cb, 0, None)
    }

    /// Create a task with an explicit hash and node.
    #[track_caller]
    pub fn with_node<F>(
        code: TaskCode,
        cb: F,
        hash: u64,
        node: Option<Arc<ServiceNode>>,
    ) -> Self
    where
        F: FnOnce(ErrorCode, usize) + Send + 'static,
    {
        let body = AioBody {
            aio: Mutex::new(DiskAio::default()),
            unmerged: Mutex::new(SmallVec::new()),
            transferred: AtomicUsize::new(0),
            cb: Mutex::new(Some(Box::new(cb))),
        };
        AioTask(Task::with_payload(code, hash, node, Payload::Aio(body)))
    }

    fn body(&self) -> &AioBody {
        match self.0.payload() {
            Payload::Aio(body) => body,
            _ => unreachable!("AioTask always wraps an aio payload"),
        }
    }

    /// Read the descriptor.
    pub fn with_aio<R>(
        &self,
        f: impl FnOnce(&DiskAio) -> R,
    ) -> R {
        f(&self.body().aio.lock())
    }

    /// Fill in or adjust the descriptor.
    pub fn with_aio_mut<R>(
        &self,
        f: impl FnOnce(&mut DiskAio) -> R,
    ) -> R {
        f(&mut self.body().aio.lock())
    }

    /// Append a write fragment. The descriptor becomes a write whose size is
    /// the sum of all fragments.
    pub fn push_write_buffer(
        &self,
        fragment: Vec<u8>,
    ) {
        let mut aio = self.body().aio.lock();
        aio.aio_type = AioType::Write;
        aio.buffer_size += fragment.len();
        self.body().unmerged.lock().push(fragment);
    }

    /// Number of fragments not yet merged.
    pub fn unmerged_count(&self) -> usize {
        self.body().unmerged.lock().len()
    }

    /// Total bytes the descriptor or its fragments hold.
    fn image_len(
        aio: &DiskAio,
        unmerged: &[Vec<u8>],
    ) -> usize {
        if unmerged.is_empty() {
            aio.buffer_size.min(aio.buffer.len())
        } else {
            unmerged.iter().map(Vec::len).sum()
        }
    }

    /// Gather the data into `dest` without touching the task: the fragments
    /// in order, or the descriptor buffer when there are none. Returns the
    /// number of bytes copied.
    pub fn copy_to(
        &self,
        dest: &mut [u8],
    ) -> TaskResult<usize> {
        let aio = self.body().aio.lock();
        let unmerged = self.body().unmerged.lock();
        let needed = Self::image_len(&aio, &unmerged);
        if dest.len() < needed {
            return Err(TaskError::BufferTooSmall {
                needed,
                available: dest.len(),
            });
        }

        if unmerged.is_empty() {
            dest[..needed].copy_from_slice(&aio.buffer[..needed]);
        } else {
            let mut offset = 0;
            for fragment in unmerged.iter() {
                dest[offset..offset + fragment.len()].copy_from_slice(fragment);
                offset += fragment.len();
            }
        }
        Ok(needed)
    }

    /// Merge the write fragments into one contiguous buffer and point the
    /// descriptor at it. A no-op without fragments.
    pub fn collapse(&self) {
        let mut aio = self.body().aio.lock();
        let mut unmerged = self.body().unmerged.lock();
        if unmerged.is_empty() {
            return;
        }

        let total = unmerged.iter().map(Vec::len).sum();
        let mut merged = Vec::with_capacity(total);
        for fragment in unmerged.drain(..) {
            merged.extend_from_slice(&fragment);
        }
        aio.buffer = merged;
        aio.buffer_size = total;
    }

    /// Record the completion and admit the task. Called once by the disk
    /// engine.
    pub fn enqueue_aio(
        &self,
        err: ErrorCode,
        transferred_size: usize,
    ) {
        self.0.set_error(err);
        self.body()
            .transferred
            .store(transferred_size, Ordering::Release);
        self.0.enqueue();
    }

    /// Bytes the engine reported as transferred.
    #[inline]
    pub fn transferred_size(&self) -> usize {
        self.body().transferred.load(Ordering::Acquire)
    }
}
