//! Top-level entry points, one per subcommand (spec.md §6). Replaces the
//! teacher's `RdCommand`/`rd_options` pair: `ToolCommand` plays the same
//! role `RdCommand` did (`run(&mut self) -> Result<i32>`, returning the
//! process exit code rather than stopping at `io::Result<()>`, since
//! spec.md §6 ties the exit code to the primary tracee's own status).

use crate::error::Result;

pub mod cli_options;
pub mod fork_command;
pub mod jit_command;
pub mod memcheck_command;
pub mod setup;

pub trait ToolCommand {
    fn run(&mut self) -> Result<i32>;
}
