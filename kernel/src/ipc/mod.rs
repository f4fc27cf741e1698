//! Inter-Process Communication (IPC)
//!
//! System V IPC: message queues, semaphore sets, shared memory.
//!
//! All three kinds share one vocabulary: a caller-chosen [`IpcKey`] (or
//! [`IPC_PRIVATE`]) resolved to a generation-tagged identifier by a `get`
//! call, the [`IpcFlags`] bit-field, and a permission record whose lower
//! nine bits behave like a file mode.

use alloc::sync::Arc;

use bitflags::bitflags;

use crate::sched::{Cred, SchedPort};

pub mod msg;
pub mod registry;
pub mod seg;
pub mod sem;
pub mod shm;

pub use msg::{msg_get, msg_recv, msg_remove, msg_send, msg_set, msg_stat};
pub use registry::IpcId;
pub use sem::{sem_get, sem_op, sem_remove, sem_stat, SemOpPort};
pub use shm::{shm_at, shm_dt, shm_get, shm_remove, shm_stat, ShmMapperPort};

/// IPC key for creating/finding objects.
pub type IpcKey = i32;

/// Private key: never matched by lookup, always creates a new object.
pub const IPC_PRIVATE: IpcKey = 0;

bitflags! {
    /// Flag vocabulary shared by all three kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IpcFlags: u32 {
        /// Create the object if the key names no live one.
        const CREATE = 0o1000;
        /// With CREATE: fail if the key already names a live object.
        const EXCLUSIVE = 0o2000;
        /// Fail instead of blocking.
        const NO_WAIT = 0o4000;
        /// Semaphore ops only: roll the operation back on process exit.
        const UNDO = 0o10000;
    }
}

/// Permission record shared by all kinds (low 9 bits like file permissions).
#[derive(Debug, Clone, Copy)]
pub struct IpcPerm {
    pub key: IpcKey,
    pub uid: u32,
    pub gid: u32,
    pub cuid: u32, // Creator UID
    pub cgid: u32, // Creator GID
    pub mode: u16, // Permissions
}

impl IpcPerm {
    fn new(key: IpcKey, cred: Cred, mode: u16) -> Self {
        Self {
            key,
            uid: cred.uid,
            gid: cred.gid,
            cuid: cred.uid,
            cgid: cred.gid,
            mode: mode & 0o777,
        }
    }

    /// Check if the caller can read the object
    pub fn can_read(&self, cred: Cred) -> bool {
        if cred.uid == 0 { return true; } // Root
        if cred.uid == self.uid { return self.mode & 0o400 != 0; }
        if cred.gid == self.gid { return self.mode & 0o040 != 0; }
        self.mode & 0o004 != 0
    }

    /// Check if the caller can write the object
    pub fn can_write(&self, cred: Cred) -> bool {
        if cred.uid == 0 { return true; } // Root
        if cred.uid == self.uid { return self.mode & 0o200 != 0; }
        if cred.gid == self.gid { return self.mode & 0o020 != 0; }
        self.mode & 0o002 != 0
    }

    /// Owner or root may set attributes and remove the object.
    pub fn is_owner(&self, cred: Cred) -> bool {
        cred.uid == 0 || cred.uid == self.uid || cred.uid == self.cuid
    }
}

/// Attributes replaceable through the `set` control command.
#[derive(Debug, Clone, Copy)]
pub struct IpcSetAttrs {
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
}

/// Initialize the IPC subsystem with the kernel's collaborator ports.
pub fn init(
    sched: Arc<dyn SchedPort>,
    sem_ops: Arc<dyn sem::SemOpPort>,
    mapper: Arc<dyn shm::ShmMapperPort>,
) {
    msg::init(sched.clone());
    sem::init(sched.clone(), sem_ops);
    shm::init(sched, mapper);
    log::info!("ipc: IPC subsystem initialized (msg, sem, shm)");
}

/// Initialize with the built-in defaults: no scheduler (sleeps are
/// reported as interrupted), eager semaphore ops, flat mapping.
pub fn init_default() {
    init(
        Arc::new(crate::sched::NullSched),
        Arc::new(sem::EagerSemOps),
        Arc::new(shm::FlatMapper),
    );
}
