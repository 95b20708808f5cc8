//! Process groups of launched units
//!
//! Every unit runs as the leader of its own process group, so signalling
//! the group reaches whatever the command started underneath it.

use std::time::Duration;

#[cfg(unix)]
use nix::{
    errno::Errno,
    sys::signal::{killpg, Signal},
    unistd::Pid,
};
#[cfg(unix)]
use tracing::debug;

/// Handle on one unit's process group
///
/// Dropping an armed handle SIGKILLs the group, which covers slot tasks that
/// are aborted before they could terminate their unit.
#[derive(Debug)]
pub struct ProcessGroup {
    #[cfg(unix)]
    pgid: Option<Pid>,
    armed: bool,
}

#[cfg(unix)]
impl ProcessGroup {
    /// Group led by the freshly spawned process `pid`
    pub fn led_by(pid: Option<u32>) -> Self {
        Self {
            pgid: pid.and_then(|pid| i32::try_from(pid).ok()).map(Pid::from_raw),
            armed: true,
        }
    }

    /// Ask every member to exit; false when there is no group to signal
    pub fn terminate(&self) -> bool {
        self.signal(Signal::SIGTERM)
    }

    pub fn kill(&self) -> bool {
        self.signal(Signal::SIGKILL)
    }

    fn signal(&self, signal: Signal) -> bool {
        let Some(pgid) = self.pgid else {
            return false;
        };
        match killpg(pgid, signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                debug!("Cannot send {} to process group {}: {}", signal, pgid, e);
                false
            }
        }
    }

    /// Wait until no member is left, at most `limit`
    pub async fn wait_empty(&self, limit: Duration) -> bool {
        let Some(pgid) = self.pgid else {
            return true;
        };
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if matches!(killpg(pgid, None), Err(Errno::ESRCH)) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Leave the group alone on drop
    pub fn release(&mut self) {
        self.armed = false;
    }
}

#[cfg(not(unix))]
impl ProcessGroup {
    pub fn led_by(_pid: Option<u32>) -> Self {
        Self { armed: false }
    }

    pub fn terminate(&self) -> bool {
        false
    }

    pub fn kill(&self) -> bool {
        false
    }

    pub async fn wait_empty(&self, _limit: Duration) -> bool {
        true
    }

    pub fn release(&mut self) {
        self.armed = false;
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.armed {
            self.kill();
        }
    }
}
