/// A thin wrapper around the raw status word returned by `waitpid`,
/// mirroring the teacher's `WaitStatus` (distinct from `nix`'s enum of the
/// same name, which doesn't expose `PTRACE_EVENT_*` cleanly).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct WaitStatus(i32);

impl WaitStatus {
    pub fn from_raw(raw: i32) -> WaitStatus {
        WaitStatus(raw)
    }

    pub fn raw(&self) -> i32 {
        self.0
    }

    pub fn exited(&self) -> bool {
        libc::WIFEXITED(self.0)
    }

    pub fn exit_status(&self) -> Option<i32> {
        if self.exited() {
            Some(libc::WEXITSTATUS(self.0))
        } else {
            None
        }
    }

    pub fn signaled(&self) -> bool {
        libc::WIFSIGNALED(self.0)
    }

    pub fn term_sig(&self) -> Option<i32> {
        if self.signaled() {
            Some(libc::WTERMSIG(self.0))
        } else {
            None
        }
    }

    pub fn stopped(&self) -> bool {
        libc::WIFSTOPPED(self.0)
    }

    pub fn stop_sig(&self) -> Option<i32> {
        if self.stopped() {
            Some(libc::WSTOPSIG(self.0))
        } else {
            None
        }
    }

    /// True when the stop signal is `SIGTRAP` and the upper bits carry a
    /// `PTRACE_EVENT_*` code (`status >> 8`).
    pub fn ptrace_event(&self) -> Option<i32> {
        if self.stop_sig() == Some(libc::SIGTRAP) {
            let event = self.0 >> 8;
            if event != 0 {
                return Some(event);
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_exit_status() {
        // WIFEXITED/WEXITSTATUS encoding: low byte 0, status in next byte.
        let raw = 7 << 8;
        let ws = WaitStatus::from_raw(raw);
        assert!(ws.exited());
        assert_eq!(ws.exit_status(), Some(7));
    }
}
