use std::{sync::Arc, thread};
use std::sync::atomic::{AtomicBool, Ordering};
use nfd_sync::{Halt, Progress};
use pci_in::{IssueDma, IssueDmaCtx, Notify, NotifyCtx};
use pci_out::{RxIssueDma, RxIssueDmaCtx, SendDesc, SendDescCtx, StageBatch, StageBatchCtx};

/// One hardware context: something that can be stepped without blocking.
pub trait Context: Send {
    fn step(&mut self) -> Result<Progress, Halt>;
}

/// One context of a thread group: the stage its group shares and the
/// registers it owns.
pub struct Member<S, R> {
    stage: Arc<S>,
    regs: R,
}

impl<S, R> Member<S, R> {
    pub fn new(stage: Arc<S>, regs: R) -> Member<S, R> {
        Member { stage, regs }
    }

    pub fn regs(&self) -> &R {
        &self.regs
    }
}

macro_rules! member_context {
    ($stage:ty, $regs:ty) => {
        impl Context for Member<$stage, $regs> {
            fn step(&mut self) -> Result<Progress, Halt> {
                self.stage.step(&mut self.regs)
            }
        }
    };
}

member_context!(IssueDma, IssueDmaCtx);
member_context!(Notify, NotifyCtx);
member_context!(RxIssueDma, RxIssueDmaCtx);
member_context!(SendDesc, SendDescCtx);

impl Context for Member<StageBatch, StageBatchCtx> {
    fn step(&mut self) -> Result<Progress, Halt> {
        Ok(self.stage.step(&mut self.regs))
    }
}

/// A microengine: a fixed set of contexts sharing one thread, switched
/// round robin.
///
/// A context that has to wait returns from its step, so one pass gives every
/// context one turn. The first [`Halt`] stops the engine for good.
pub struct MicroEngine {
    name: String,
    contexts: Vec<Box<dyn Context>>,
    halted: Option<Halt>,
}

impl MicroEngine {
    pub fn new<N: Into<String>>(name: N) -> MicroEngine {
        MicroEngine { name: name.into(), contexts: Vec::new(), halted: None }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contexts(&self) -> usize {
        self.contexts.len()
    }

    pub fn halted(&self) -> Option<Halt> {
        self.halted
    }

    pub fn add<C: Context + 'static>(&mut self, ctx: C) {
        self.contexts.push(Box::new(ctx));
    }

    /// Steps every context once, in order.
    pub fn pass(&mut self) -> Result<Progress, Halt> {
        if let Some(halt) = self.halted {
            return Err(halt);
        }
        let mut progress = Progress::Idle;
        for ctx in self.contexts.iter_mut() {
            match ctx.step() {
                Ok(p) => progress = progress.or(p),
                Err(halt) => {
                    error!("{}: microengine stopped: {}", self.name, halt);
                    self.halted = Some(halt);
                    return Err(halt);
                }
            }
        }
        Ok(progress)
    }

    /// Runs passes until `stop` is raised or a context halts, giving up the
    /// thread after every pass that did no work.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<(), Halt> {
        debug!("{}: running {} contexts", self.name, self.contexts.len());
        while !stop.load(Ordering::Acquire) {
            if !self.pass()?.worked() {
                thread::yield_now();
            }
        }
        debug!("{}: stopped", self.name);
        Ok(())
    }
}
