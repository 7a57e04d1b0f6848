use std::{
    mem,
    panic,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};
use nfd_cfg::{CfgMsg, NfdConfig, VnicQueue};
use nfd_hw::{Hw, ResetState};
use nfd_sync::{Halt, Progress};
use pci_in::PciIn;
use pci_out::{PciOut, RxPath};

use crate::{CfgMailbox, Context, Member, MicroEngine};

/// Configuration messages the inbox holds.
pub const CFG_INBOX_SIZE: usize = 64;

/// Both data-plane pipelines, assembled over one set of hardware blocks.
///
/// Gather and cache_desc run one context each and are the only stages that
/// own per-queue setup, so they share the *service* context with
/// configuration handling and the PCIe reset watch. Every other stage is a
/// thread group of [`Member`] contexts on a microengine of its own.
pub struct Nfd {
    pub pci_in: PciIn,
    pub pci_out: PciOut,
    cfg: NfdConfig,
    mailbox: Arc<CfgMailbox>,
    reset: Arc<dyn ResetState>,
    in_reset: bool,
}

impl Nfd {
    /// Bytes of on-chip memory both pipelines use from their base address.
    pub fn local_bytes(cfg: &NfdConfig) -> u64 {
        PciIn::local_bytes(&cfg.pci_in) + PciOut::local_bytes(&cfg.pci_out)
    }

    /// Builds both pipelines, PCI.IN's descriptor storage at `local_base`
    /// and PCI.OUT's cache and staging ring right after it.
    pub fn new(cfg: NfdConfig, hw: &Hw, local_base: u64) -> Result<Nfd, &'static str> {
        if let Err(e) = cfg.validate() {
            error!("NFD configuration rejected: {}", e);
            return Err("nfd: invalid configuration");
        }
        let pci_in = PciIn::new(&cfg.pci_in, hw, local_base)?;
        let pci_out = PciOut::new(&cfg.pci_out, hw, local_base + PciIn::local_bytes(&cfg.pci_in))?;
        let mailbox = Arc::new(CfgMailbox::new(CFG_INBOX_SIZE)?);
        info!("NFD: {} queues, {:#x} bytes of local memory from {:#x}",
            cfg.vnics.total_queues(), Self::local_bytes(&cfg), local_base);
        Ok(Nfd {
            pci_in,
            pci_out,
            cfg,
            mailbox,
            reset: hw.reset.clone(),
            in_reset: hw.reset.in_reset(),
        })
    }

    pub fn config(&self) -> &NfdConfig {
        &self.cfg
    }

    /// Where configuration messages are posted and collected.
    pub fn mailbox(&self) -> Arc<CfgMailbox> {
        self.mailbox.clone()
    }

    /// The PCI.OUT state packet producers offer packets and take credits
    /// through.
    pub fn rx_path(&self) -> Arc<RxPath> {
        self.pci_out.path.clone()
    }

    /// Applies `msg` to every stage in pipeline order and completes it.
    ///
    /// A message that fails validation changes no queue state.
    pub fn apply_cfg(&mut self, msg: &mut CfgMsg) -> nfd_cfg::Result<VnicQueue> {
        let result = self.cfg.resolve(msg);
        if let Ok(queue) = &result {
            self.pci_in.vnic_setup(&queue.tx);
            self.pci_out.vnic_setup(&queue.fl);
        }
        msg.complete(&result);
        result
    }

    /// Returns `true` if both pipelines hold the idle state for `natq`.
    pub fn queue_is_idle(&self, natq: u8) -> bool {
        self.pci_in.queue_is_idle(natq) && self.pci_out.queue_is_idle(natq)
    }

    /// One pass of the service context.
    pub fn service(&mut self) -> Progress {
        let mut progress = Progress::Idle;
        while let Some(mut msg) = self.mailbox.next() {
            // The outcome travels back in the message.
            let _ = self.apply_cfg(&mut msg);
            self.mailbox.complete(msg);
            progress = Progress::Worked;
        }
        progress
            .or(self.watch_reset())
            .or(self.pci_in.gather.step())
            .or(self.pci_out.cache.step())
    }

    fn watch_reset(&mut self) -> Progress {
        let in_reset = self.reset.in_reset();
        if in_reset == self.in_reset {
            return Progress::Idle;
        }
        self.in_reset = in_reset;
        if in_reset {
            warn!("PCIe reset: holding new host DMAs");
            Progress::Idle
        } else {
            info!("PCIe reset cleared");
            self.pci_in.gather.complete_reset();
            Progress::Worked
        }
    }

    /// Lays the pipelines out on microengines: the service engine first,
    /// then one engine per thread group in pipeline order.
    pub fn microengines(self) -> Vec<MicroEngine> {
        let mut engines = Vec::new();
        for stages in &self.pci_in.lanes {
            let lane = stages.lane.id;
            let mut issue = MicroEngine::new(format!("pci_in.issue_dma{}", lane));
            for regs in stages.issue.contexts() {
                issue.add(Member::new(stages.issue.clone(), regs));
            }
            let mut notify = MicroEngine::new(format!("pci_in.notify{}", lane));
            for regs in stages.notify.contexts() {
                notify.add(Member::new(stages.notify.clone(), regs));
            }
            engines.push(issue);
            engines.push(notify);
        }

        let out = &self.pci_out;
        let mut stage = MicroEngine::new("pci_out.stage_batch");
        for regs in out.stage.contexts() {
            stage.add(Member::new(out.stage.clone(), regs));
        }
        let mut rx_dma = MicroEngine::new("pci_out.issue_dma");
        for regs in out.rx_dma.contexts() {
            rx_dma.add(Member::new(out.rx_dma.clone(), regs));
        }
        let mut send = MicroEngine::new("pci_out.send_desc");
        for regs in out.send.contexts() {
            send.add(Member::new(out.send.clone(), regs));
        }
        engines.push(stage);
        engines.push(rx_dma);
        engines.push(send);

        let mut service = MicroEngine::new("service");
        service.add(self);
        engines.insert(0, service);
        engines
    }

    /// Runs every microengine on its own thread.
    pub fn start(self) -> Result<Running, &'static str> {
        let mut running = Running { stop: Arc::new(AtomicBool::new(false)), engines: Vec::new() };
        for mut engine in self.microengines() {
            let stop = running.stop.clone();
            let spawned = thread::Builder::new()
                .name(engine.name().to_string())
                .spawn(move || engine.run(&stop));
            match spawned {
                Ok(handle) => running.engines.push(handle),
                Err(_) => {
                    let _ = running.stop();
                    return Err("nfd: couldn't spawn a microengine thread");
                }
            }
        }
        info!("NFD: started {} microengines", running.engines.len());
        Ok(running)
    }
}

impl Context for Nfd {
    fn step(&mut self) -> Result<Progress, Halt> {
        Ok(self.service())
    }
}

/// Microengines running on their own threads.
///
/// Dropping this asks them to stop without waiting.
pub struct Running {
    stop: Arc<AtomicBool>,
    engines: Vec<JoinHandle<Result<(), Halt>>>,
}

impl Running {
    pub fn microengines(&self) -> usize {
        self.engines.len()
    }

    /// Returns `true` if a microengine stopped on its own.
    pub fn any_stopped(&self) -> bool {
        self.engines.iter().any(|handle| handle.is_finished())
    }

    /// Stops every microengine and waits for it, returning the first halt
    /// one of them stopped on.
    pub fn stop(mut self) -> Result<(), Halt> {
        self.stop.store(true, Ordering::Release);
        let mut result = Ok(());
        for handle in mem::take(&mut self.engines) {
            match handle.join() {
                Ok(Err(halt)) if result.is_ok() => result = Err(halt),
                Ok(_) => {}
                Err(payload) => panic::resume_unwind(payload),
            }
        }
        result
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
