//! Primitives the pipeline contexts use to cooperate without locks.
//!
//! * [`Signal`]: a one-bit completion flag, raised by whoever finishes an
//!   operation and tested by the context that waits on it.
//! * [`ReflectCell`]: a one-word register written by one context and read by
//!   another, paired with a signal that says a new value arrived.
//! * [`ReorderStage`]: an ordering token relayed round robin through the
//!   contexts of one thread group.
//!
//! Every stage step reports how it went with [`Progress`], or stops the
//! stage with a [`Halt`] when an invariant that protects host-visible state
//! no longer holds.

#![no_std]

#[macro_use] extern crate log;

mod reflect;
mod reorder;
mod signal;

pub use reflect::ReflectCell;
pub use reorder::ReorderStage;
pub use signal::Signal;

use core::fmt;

/// The outcome of one non-blocking step of a stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Progress {
    /// The step did useful work.
    Worked,
    /// The step found nothing to do.
    Idle,
    /// The step is waiting on a token, a signal or a window and will resume
    /// where it left off.
    Blocked,
}

impl Progress {
    pub fn worked(self) -> bool {
        self == Progress::Worked
    }

    /// Combines the outcome of two sub-steps run in the same pass.
    pub fn or(self, other: Progress) -> Progress {
        match (self, other) {
            (Progress::Worked, _) | (_, Progress::Worked) => Progress::Worked,
            (Progress::Blocked, _) | (_, Progress::Blocked) => Progress::Blocked,
            _ => Progress::Idle,
        }
    }
}

/// The pipeline stage a [`Halt`] was raised in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Gather,
    IssueDma,
    Notify,
    CacheDesc,
    StageBatch,
    RxIssueDma,
    SendDesc,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Gather => "gather",
            Stage::IssueDma => "issue_dma",
            Stage::Notify => "notify",
            Stage::CacheDesc => "cache_desc",
            Stage::StageBatch => "stage_batch",
            Stage::RxIssueDma => "rx_issue_dma",
            Stage::SendDesc => "send_desc",
        })
    }
}

/// A broken pipeline invariant. Processing stops rather than risk fabricating
/// or losing packets.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Halt {
    /// The sequence counters say a batch is waiting but its hand-off ring is
    /// empty.
    HandoffRingEmpty { stage: Stage },
    /// A batch claimed a packet count outside `1..=4`.
    BatchSize { stage: Stage, size: u8 },
    /// An issued descriptor announced more LSO segments than the side ring
    /// holds.
    LsoRingEmpty,
}

impl Halt {
    pub fn stage(&self) -> Stage {
        match *self {
            Halt::HandoffRingEmpty { stage } | Halt::BatchSize { stage, .. } => stage,
            Halt::LsoRingEmpty => Stage::Notify,
        }
    }
}

impl fmt::Display for Halt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Halt::HandoffRingEmpty { stage } => {
                write!(f, "{}: hand-off ring empty with a batch outstanding", stage)
            }
            Halt::BatchSize { stage, size } => {
                write!(f, "{}: invalid batch size {}", stage, size)
            }
            Halt::LsoRingEmpty => f.write_str("notify: LSO ring empty with segments outstanding"),
        }
    }
}

/// Logs `halt` and returns it, for use as `return Err(halted(..))`.
pub fn halted(halt: Halt) -> Halt {
    error!("halting: {}", halt);
    halt
}
