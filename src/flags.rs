use crate::error::ViolationPolicy;
use crate::terminator::PredictionMode;

/// Driver-wide configuration, built once from parsed CLI options and
/// passed by reference to the Patcher and MemCheck driver. Unlike the
/// teacher's `Flags`, which lives behind a `lazy_static!` global, this is
/// a plain construction parameter (spec.md §9, "Global mutable state").
#[derive(Clone)]
pub struct Flags {
    /// `-g`: on fatal, detach and transfer control to `gdb <prog> <pid>`.
    pub gdb_on_fatal: bool,
    /// `-p`: enable CPU profiling output.
    pub profile: bool,
    /// `-s`: single-step every instruction.
    pub singlestep_everything: bool,
    /// `-x` / `-d`: emit an execution trace, optionally diff-friendly.
    pub trace_execution: bool,
    pub trace_execution_diff: bool,
    /// `-b`: dump single-step breakpoint hits.
    pub dump_singlestep_bkpts: bool,
    /// `-j`: dump conditional-branch breakpoint decisions.
    pub dump_jcc_bkpts: bool,
    /// `-l FILE`: diagnostic log redirection target.
    pub log_file: Option<String>,
    /// `-m FILE`: maps dump target on interrupt/fatal.
    pub maps_dump_file: Option<String>,
    /// `-v` repeated: verbosity level.
    pub verbosity: u32,
    /// `--prediction-mode=MODE`.
    pub prediction_mode: PredictionMode,
    /// `--ss-syscall=SYS,N`: after N occurrences of SYS, enable `-s -x`.
    pub ss_syscall: Option<(String, u32)>,
    /// `--no-preload`: skip installing `LD_PRELOAD` to the libc shim.
    pub no_preload: bool,
    /// What to do on a tool-detected taint violation, keyed by category.
    pub on_tainted_base_index_reg: ViolationPolicy,
    pub on_write_below_sp: ViolationPolicy,
    pub on_unmodeled_syscall: ViolationPolicy,
    /// `ABORT_ON_TAINT` environment override used by scenario B/C in
    /// spec.md §8: if false, a tainted syscall argument warns instead of
    /// aborting.
    pub abort_on_taint: bool,
}

impl Default for Flags {
    fn default() -> Flags {
        Flags {
            gdb_on_fatal: false,
            profile: false,
            singlestep_everything: false,
            trace_execution: false,
            trace_execution_diff: false,
            dump_singlestep_bkpts: false,
            dump_jcc_bkpts: false,
            log_file: None,
            maps_dump_file: None,
            verbosity: 0,
            prediction_mode: PredictionMode::None,
            ss_syscall: None,
            no_preload: false,
            on_tainted_base_index_reg: ViolationPolicy::Abort,
            on_write_below_sp: ViolationPolicy::Warn,
            on_unmodeled_syscall: ViolationPolicy::Stub,
            abort_on_taint: true,
        }
    }
}

impl Flags {
    pub fn from_env_override(mut self) -> Flags {
        if let Ok(v) = std::env::var("ABORT_ON_TAINT") {
            self.abort_on_taint = v == "true" || v == "1";
        }
        self
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_policy_matches_spec_scenarios() {
        let f = Flags::default();
        assert_eq!(f.on_tainted_base_index_reg, ViolationPolicy::Abort);
        assert_eq!(f.on_write_below_sp, ViolationPolicy::Warn);
        assert_eq!(f.on_unmodeled_syscall, ViolationPolicy::Stub);
    }

    #[test]
    fn env_override_disables_abort() {
        std::env::set_var("ABORT_ON_TAINT", "false");
        let f = Flags::default().from_env_override();
        assert!(!f.abort_on_taint);
        std::env::remove_var("ABORT_ON_TAINT");
    }
}
