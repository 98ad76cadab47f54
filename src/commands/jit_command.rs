//! `jit` subcommand: the DBI layer alone, no dual execution or taint
//! checking, for isolating translator/terminator bugs (spec.md §2, §6).
//! Grounded on original_source's `src/jit-main.cc`, which drives exactly
//! one tracee through the patcher's run loop and otherwise gets out of
//! the way.

use crate::commands::setup;
use crate::commands::ToolCommand;
use crate::error::Result;
use crate::flags::Flags;
use crate::interrupt;
use crate::patcher::PatcherEvent;

pub struct JitCommand {
    prog: String,
    args: Vec<String>,
    flags: Flags,
}

impl JitCommand {
    pub fn new(prog: String, args: Vec<String>, flags: Flags) -> JitCommand {
        JitCommand { prog, args, flags }
    }
}

impl ToolCommand for JitCommand {
    fn run(&mut self) -> Result<i32> {
        let preload = if self.flags.no_preload { None } else { Some("libmemcheck_preload.so") };
        let mut session = setup::bring_up(&self.prog, &self.args, preload, self.flags.prediction_mode)?;

        loop {
            if interrupt::take() {
                if let Some(path) = &self.flags.maps_dump_file {
                    let _ = session.patcher.tracees[0].dump_maps(path);
                }
                return Ok(interrupt::SIGINT_EXIT);
            }
            let events = session.patcher.step()?;
            for ev in events {
                match ev {
                    PatcherEvent::Exited { status, .. } => {
                        return Ok(status.exit_status().unwrap_or(1));
                    }
                    PatcherEvent::Forked { .. } => {
                        // No dual execution in jit mode: a traced fork is
                        // just left running untranslated by this loop,
                        // since only tracee 0 is ever resumed below.
                    }
                    PatcherEvent::PreSyscall { .. }
                    | PatcherEvent::PostSyscall { .. }
                    | PatcherEvent::TrackerPre { .. }
                    | PatcherEvent::TrackerPost { .. }
                    | PatcherEvent::JccResolved { .. }
                    | PatcherEvent::CallEntered { .. }
                    | PatcherEvent::RetCompleted { .. }
                    | PatcherEvent::EntryReached { .. } => {}
                }
            }
            if session.patcher.tracees.is_empty() {
                return Ok(0);
            }
        }
    }
}
