//! Binary entry point. Parses CLI flags into `Flags`, wires up logging
//! and the SIGINT handler, dispatches to the selected `ToolCommand`, and
//! propagates its exit code (spec.md §6: "the primary tracee's exit
//! status, or 1 on driver failure").

use std::fs::File;

use structopt::StructOpt;

mod arena;
mod block;
mod block_pool;
mod block_translator;
mod breakpoint;
mod cksum;
mod commands;
mod decoder;
mod elf;
mod encode;
mod error;
mod extra_registers;
mod flags;
mod inst;
mod interrupt;
mod kernel_abi;
mod launch;
mod log;
mod memcheck_driver;
mod pageset;
mod patcher;
mod registers;
mod remote_ptr;
mod snapshot;
mod syscall_checker;
mod terminator;
mod tracee;
mod trackers;
mod usermem;
mod wait_status;

use commands::cli_options::{CliOptions, ToolSubCommand};
use commands::fork_command::ForkCommand;
use commands::jit_command::JitCommand;
use commands::memcheck_command::MemCheckCommand;
use commands::ToolCommand;
use log::LogLevel;

fn verbosity_to_level(v: u32) -> LogLevel {
    match v {
        0 => LogLevel::LogWarn,
        1 => LogLevel::LogInfo,
        _ => LogLevel::LogDebug,
    }
}

fn main() {
    let opts = CliOptions::from_args();
    log::set_verbosity(verbosity_to_level(opts.verbosity));
    if let Some(path) = &opts.log_file {
        match File::create(path) {
            Ok(f) => log::redirect_to_file(f),
            Err(e) => eprintln!("warning: could not open log file {}: {}", path, e),
        }
    }

    interrupt::install();

    let flags = opts.to_flags();
    let exit_code = match opts.cmd {
        ToolSubCommand::Memcheck { prog, args } => {
            MemCheckCommand::new(prog, args, flags).run()
        }
        ToolSubCommand::Jit { prog, args } => JitCommand::new(prog, args, flags).run(),
        ToolSubCommand::Fork { prog, args } => ForkCommand::new(prog, args, flags).run(),
    };

    match exit_code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            crate::log!(LogLevel::LogError, "{}", e);
            std::process::exit(1);
        }
    }
}
