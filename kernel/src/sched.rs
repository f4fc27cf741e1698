//! Scheduler boundary for the IPC layer.
//!
//! The IPC subsystem never suspends a process by itself. Whenever a send
//! or receive has to wait it goes through [`SchedPort`], a small contract
//! the scheduler implements: sleep the calling process on a channel, wake
//! every sleeper of a channel, and tell the subsystem who is calling.
//!
//! A woken sleeper holds no guarantee beyond "something changed": callers
//! re-validate their condition in a loop, so spurious wakes are harmless
//! and no fairness is promised.

use crate::ipc::registry::IpcId;

/// Process identifier as the scheduler reports it.
pub type Pid = u32;

/// Effective credentials of the calling process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
}

impl Cred {
    pub const ROOT: Cred = Cred { uid: 0, gid: 0 };
}

/// Which side of a resource a process sleeps on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSide {
    Send,
    Recv,
}

/// Sleep channel scoped to one IPC resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitChannel {
    pub resource: u64,
    pub side: WaitSide,
}

impl WaitChannel {
    pub fn send(id: IpcId) -> Self {
        Self { resource: id.to_raw(), side: WaitSide::Send }
    }

    pub fn recv(id: IpcId) -> Self {
        Self { resource: id.to_raw(), side: WaitSide::Recv }
    }
}

/// How a sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The channel was woken; the caller re-checks its condition.
    Woken,
    /// The wait was cancelled (signal, process exit).
    Interrupted,
}

/// Contract the scheduler implements for the IPC layer.
///
/// `sleep_on` is always called with no IPC lock held, so wakers are free
/// to enter the subsystem from another process while a sleeper is parked.
pub trait SchedPort: Send + Sync {
    fn current_pid(&self) -> Pid;
    fn current_cred(&self) -> Cred;

    /// Suspend the calling process until `chan` is woken or the wait is
    /// cancelled.
    fn sleep_on(&self, chan: WaitChannel) -> WaitOutcome;

    /// Wake every process sleeping on `chan`.
    fn wake_all(&self, chan: WaitChannel);
}

/// Port used before the scheduler is up (early boot, unit tests).
///
/// It cannot park anything, so every sleep reports a cancelled wait.
pub struct NullSched;

impl SchedPort for NullSched {
    fn current_pid(&self) -> Pid {
        0
    }

    fn current_cred(&self) -> Cred {
        Cred::ROOT
    }

    fn sleep_on(&self, _chan: WaitChannel) -> WaitOutcome {
        WaitOutcome::Interrupted
    }

    fn wake_all(&self, _chan: WaitChannel) {}
}
