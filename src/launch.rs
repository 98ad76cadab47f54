//! Spawn the target program under trace. Grounded on original_source's
//! `src/main.cc`, whose `main()` does exactly this by hand: `fork()`,
//! child calls `PTRACE_TRACEME` then `execve`s the program, parent
//! `wait()`s for the SIGTRAP the kernel raises at the ensuing `execve`.

use std::ffi::CString;

use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{execvp, fork, ForkResult};

use crate::error::{Error, Result};
use crate::tracee::Tracee;

/// `fork()` + `PTRACE_TRACEME` + `execvp(prog, args)`, returning a
/// `Tracee` attached at the post-exec SIGTRAP. `LD_PRELOAD` is set in
/// the child's environment unless `preload_lib` is `None` (spec.md §6
/// `--no-preload`).
pub fn spawn_traced(prog: &str, args: &[String], preload_lib: Option<&str>) -> Result<Tracee> {
    let prog_c = CString::new(prog)
        .map_err(|e| Error::Fatal(format!("program name contains NUL: {}", e)))?;
    let mut argv_c: Vec<CString> = Vec::with_capacity(args.len() + 1);
    argv_c.push(prog_c.clone());
    for a in args {
        argv_c.push(
            CString::new(a.as_str())
                .map_err(|e| Error::Fatal(format!("argument contains NUL: {}", e)))?,
        );
    }

    match unsafe { fork() }.map_err(|e| Error::Fatal(format!("fork: {}", e)))? {
        ForkResult::Child => {
            ptrace::traceme().expect("PTRACE_TRACEME in freshly forked child");
            if let Some(lib) = preload_lib {
                std::env::set_var("LD_PRELOAD", lib);
            }
            let _ = execvp(&prog_c, &argv_c);
            // execvp only returns on failure; the child has no useful
            // recovery path left.
            std::process::exit(127);
        }
        ForkResult::Parent { child } => {
            match waitpid(child, None) {
                Ok(WaitStatus::Stopped(_, nix::sys::signal::Signal::SIGTRAP)) => {}
                other => {
                    return Err(Error::Fatal(format!(
                        "expected post-exec SIGTRAP from {}, got {:?}",
                        prog, other
                    )))
                }
            }
            Tracee::attach(child.as_raw())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_nul_program_name() {
        assert!(spawn_traced("bad\0prog", &[], None).is_err());
    }
}
