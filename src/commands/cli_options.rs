//! CLI flags (spec.md §6), parsed with `structopt` into `Flags`
//! (`crate::flags`), the way the teacher's `rd_options.rs` parses into
//! `RdOptions` for `RdCommand::run` to consume.

use structopt::StructOpt;

use crate::flags::Flags;
use crate::terminator::PredictionMode;

#[derive(StructOpt, Debug)]
#[structopt(name = "memcheck-dbi", about = "A dual-execution DBI memory checker")]
pub struct CliOptions {
    /// -g: on fatal, detach and transfer control to `gdb <prog> <pid>`.
    #[structopt(short = "g")]
    pub gdb_on_fatal: bool,
    /// -p: enable CPU profiling output.
    #[structopt(short = "p")]
    pub profile: bool,
    /// -s: single-step every instruction.
    #[structopt(short = "s")]
    pub singlestep_everything: bool,
    /// -x: emit an execution trace.
    #[structopt(short = "x")]
    pub trace_execution: bool,
    /// -d: (with -x) emit in diff-friendly form.
    #[structopt(short = "d")]
    pub trace_execution_diff: bool,
    /// -b: dump single-step breakpoint hits.
    #[structopt(short = "b")]
    pub dump_singlestep_bkpts: bool,
    /// -j: dump conditional-branch breakpoint decisions.
    #[structopt(short = "j")]
    pub dump_jcc_bkpts: bool,
    /// -l FILE: redirect diagnostic log to FILE.
    #[structopt(short = "l")]
    pub log_file: Option<String>,
    /// -m FILE: on interrupt/fatal, save tracee maps to FILE.
    #[structopt(short = "m")]
    pub maps_dump_file: Option<String>,
    /// -v, repeatable: increase verbosity.
    #[structopt(short = "v", parse(from_occurrences))]
    pub verbosity: u32,
    /// --prediction-mode=MODE, one of none|iclass|iform|dir|last_iclass.
    #[structopt(long = "prediction-mode", default_value = "none")]
    pub prediction_mode: PredictionMode,
    /// --ss-syscall=SYS,N: after N occurrences of SYS, enable -s -x.
    #[structopt(long = "ss-syscall", parse(try_from_str = parse_ss_syscall))]
    pub ss_syscall: Option<(String, u32)>,
    /// --no-preload: skip installing LD_PRELOAD to the libc shim.
    #[structopt(long = "no-preload")]
    pub no_preload: bool,

    #[structopt(subcommand)]
    pub cmd: ToolSubCommand,
}

fn parse_ss_syscall(s: &str) -> Result<(String, u32), String> {
    let (name, count) = s
        .split_once(',')
        .ok_or_else(|| format!("expected SYS,N, got {}", s))?;
    let n: u32 = count
        .parse()
        .map_err(|_| format!("expected an integer count, got {}", count))?;
    Ok((name.to_string(), n))
}

#[derive(StructOpt, Debug)]
pub enum ToolSubCommand {
    /// The full dual-execution MemCheck tool.
    Memcheck { prog: String, args: Vec<String> },
    /// DBI layer only, no dual execution; useful for isolating
    /// translator bugs in isolation from the taint checker.
    Jit { prog: String, args: Vec<String> },
    /// Dual-tracee smoke test with no taint checking, to validate the
    /// remote-fork and round-driver plumbing on its own.
    Fork { prog: String, args: Vec<String> },
}

impl CliOptions {
    pub fn to_flags(&self) -> Flags {
        Flags {
            gdb_on_fatal: self.gdb_on_fatal,
            profile: self.profile,
            singlestep_everything: self.singlestep_everything,
            trace_execution: self.trace_execution,
            trace_execution_diff: self.trace_execution_diff,
            dump_singlestep_bkpts: self.dump_singlestep_bkpts,
            dump_jcc_bkpts: self.dump_jcc_bkpts,
            log_file: self.log_file.clone(),
            maps_dump_file: self.maps_dump_file.clone(),
            verbosity: self.verbosity,
            prediction_mode: self.prediction_mode,
            ss_syscall: self.ss_syscall.clone(),
            no_preload: self.no_preload,
            ..Flags::default()
        }
        .from_env_override()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ss_syscall_parses_name_and_count() {
        assert_eq!(
            parse_ss_syscall("write,3").unwrap(),
            ("write".to_string(), 3)
        );
        assert!(parse_ss_syscall("write").is_err());
        assert!(parse_ss_syscall("write,x").is_err());
    }
}
