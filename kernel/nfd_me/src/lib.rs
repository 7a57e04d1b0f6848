//! Runs the NFD data plane.
//!
//! The pipelines in `pci_in` and `pci_out` are made of stages whose steps
//! never block. This crate gives them somewhere to run: a [`MicroEngine`]
//! owns a few [`Context`]s and switches between them round robin on one
//! thread, the way a hardware microengine switches its thread contexts.
//! [`Nfd`] assembles both pipelines, dispatches configuration messages to
//! their stages and lays them out on microengines, one OS thread each once
//! started.

#[macro_use] extern crate log;
extern crate spin;
extern crate logger;
extern crate hw_ring;
extern crate nfd_sync;
extern crate nfd_hw;
extern crate nfd_cfg;
extern crate pci_in;
extern crate pci_out;

mod engine;
mod mailbox;
mod nfd;

pub use engine::{Context, Member, MicroEngine};
pub use mailbox::CfgMailbox;
pub use nfd::{Nfd, Running, CFG_INBOX_SIZE};

use core::fmt;
use log::LevelFilter;
use std::io::Write as _;

struct Stderr;

impl fmt::Write for Stderr {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        std::io::stderr().write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

/// Sends log records at or above `level` to standard error.
pub fn init_logging(level: LevelFilter) -> Result<(), &'static str> {
    logger::init(level, Box::new(Stderr))
}
