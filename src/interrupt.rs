//! `SIGINT` plumbing (spec.md §4.10 "Cancellation", §9 "Global mutable
//! state"). The source keeps a raw `cur_memcheck` pointer so its handler
//! can reach into the live session and flush `-m FILE` directly; here
//! the handler only flips a flag, and each subcommand's run loop —
//! which already owns its `Flags` and `Tracee`s as constructed values —
//! polls it and does the dump itself once safely outside signal context.

use std::cell::RefCell;

use nix::sys::signal::{self, SigHandler, Signal};

thread_local! {
    static FLAG: RefCell<bool> = RefCell::new(false);
}

extern "C" fn on_sigint(_: i32) {
    FLAG.with(|f| *f.borrow_mut() = true);
}

/// Installs the handler. Call once at startup.
pub fn install() {
    unsafe {
        let _ = signal::signal(Signal::SIGINT, SigHandler::Handler(on_sigint));
    }
}

/// True the first time it's polled after a `SIGINT`; consumes the flag.
pub fn take() -> bool {
    FLAG.with(|f| {
        let v = *f.borrow();
        *f.borrow_mut() = false;
        v
    })
}

/// Exit code for a signal-terminated process, shell convention.
pub const SIGINT_EXIT: i32 = 128 + Signal::SIGINT as i32;
