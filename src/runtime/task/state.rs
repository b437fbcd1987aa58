//! Task lifecycle state.
//!
//! The state lives in one atomic byte. The low bits hold the [`TaskState`];
//! the top bit records that a cancel arrived while the task was running, so
//! the executing thread can turn any further admission (retry, next timer
//! cycle) into `Cancelled` with a single compare-exchange.

use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU8, Ordering};

use super::Execution;

const STATE_MASK: u8 = 0x7f;
const CANCEL_REQUESTED: u8 = 0x80;

/// Task state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Admitted (or about to be) and waiting for a worker.
    Ready = 0,
    /// Executing on a worker thread.
    Running = 1,
    /// Ran to completion.
    Finished = 2,
    /// Cancelled before or instead of another admission.
    Cancelled = 3,
}

impl TaskState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val & STATE_MASK {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            2 => TaskState::Finished,
            _ => TaskState::Cancelled,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// `Finished` or `Cancelled`.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Cancelled)
    }
}

pub(crate) struct StateCell {
    raw: CachePadded<AtomicU8>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            raw: CachePadded::new(AtomicU8::new(TaskState::Ready.as_u8())),
        }
    }

    #[inline]
    pub(crate) fn load(&self) -> TaskState {
        TaskState::from_u8(self.raw.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn cancel_requested(&self) -> bool {
        self.raw.load(Ordering::Acquire) & CANCEL_REQUESTED != 0
    }

    /// Move `from -> to` if the state is exactly `from` with no pending
    /// cancel request.
    #[inline]
    pub(crate) fn transition(
        &self,
        from: TaskState,
        to: TaskState,
    ) -> bool {
        self.raw
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Flag a running task for cancellation. Returns false if the task was
    /// no longer running when the flag would have been set.
    pub(crate) fn request_cancel(&self) -> bool {
        self.raw
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |raw| {
                if TaskState::from_u8(raw) == TaskState::Running {
                    Some(raw | CANCEL_REQUESTED)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Leave `Running` according to what the execution asked for.
    ///
    /// Only the executing thread calls this; the loop absorbs a concurrent
    /// cancel request landing between the load and the exchange.
    pub(crate) fn complete(
        &self,
        outcome: &Execution,
    ) -> TaskState {
        let mut current = self.raw.load(Ordering::Acquire);
        loop {
            let next = match outcome {
                Execution::Done => TaskState::Finished,
                _ if current & CANCEL_REQUESTED != 0 => TaskState::Cancelled,
                _ => TaskState::Ready,
            };

            match self.raw.compare_exchange_weak(
                current,
                next.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}
