//! `fork` subcommand: a dual-tracee smoke test exercising the
//! remote-fork/attach plumbing with no taint checking, to validate that
//! machinery on its own before layering the syscall checker on top
//! (spec.md §2, §6). Grounded on original_source's `src/fork-main.cc`.

use crate::commands::setup;
use crate::commands::ToolCommand;
use crate::error::Result;
use crate::flags::Flags;
use crate::interrupt;
use crate::patcher::PatcherEvent;

pub struct ForkCommand {
    prog: String,
    args: Vec<String>,
    flags: Flags,
}

impl ForkCommand {
    pub fn new(prog: String, args: Vec<String>, flags: Flags) -> ForkCommand {
        ForkCommand { prog, args, flags }
    }
}

impl ToolCommand for ForkCommand {
    fn run(&mut self) -> Result<i32> {
        let preload = if self.flags.no_preload { None } else { Some("libmemcheck_preload.so") };
        let mut session = setup::bring_up(&self.prog, &self.args, preload, self.flags.prediction_mode)?;
        let mut primary_exit = 0;

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
                    PatcherEvent::Exited { tracee_idx, status } => {
                        if tracee_idx == 0 {
                            primary_exit = status.exit_status().unwrap_or(1);
                        }
                    }
                    PatcherEvent::Forked { child, .. } => {
                        crate::log!(
                            crate::log::LogLevel::LogInfo,
                            "secondary {} attached (smoke test, no taint checking)",
                            child.tid
                        );
                        session.patcher.tracees.push(child);
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
                return Ok(primary_exit);
            }
        }
    }
}
