//! System V Shared Memory
//!
//! Implementation of shmget, shmat, shmdt, shmctl semantics for
//! inter-process communication via shared memory segments.
//!
//! Segments are carved out of one bounded arena by a bump cursor that
//! never rewinds; removing a segment leaks its range (the arena is
//! monotonically consumed). Mapping a segment into an address space is
//! the business of [`ShmMapperPort`]; this manager owns the descriptors,
//! the arena cursor and the attachment bookkeeping.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use super::registry::{IpcId, Registry, RegistryObject};
use super::{IpcFlags, IpcKey, IpcPerm, IpcSetAttrs};
use crate::sched::{Pid, SchedPort};
use crate::time;
use crate::util::{IpcError, IpcResult};

/// Maximum number of shared memory segments.
pub const SHMMNI: usize = 128;

/// Total bytes of the shared-memory arena.
pub const SHMALL: usize = 4 * 1024 * 1024;

/// Mapping collaborator contract.
///
/// Implementations translate an arena range into process mappings. They
/// must not re-enter the IPC layer from these calls.
pub trait ShmMapperPort: Send + Sync {
    /// Map `size` bytes at arena offset `start` into `pid`'s address
    /// space; returns the address the process sees.
    fn map(&self, pid: Pid, start: usize, size: usize, readonly: bool) -> IpcResult<usize>;

    /// Undo a previous `map`.
    fn unmap(&self, pid: Pid, addr: usize, size: usize) -> IpcResult<()>;

    /// Pin the range against eviction.
    fn pin(&self, start: usize, size: usize) -> IpcResult<()>;

    /// Release a pin.
    fn unpin(&self, start: usize, size: usize) -> IpcResult<()>;
}

/// Single-address-space mapper: every process sees a segment at its arena
/// offset. Pinning is a no-op because nothing is ever evicted.
pub struct FlatMapper;

impl ShmMapperPort for FlatMapper {
    fn map(&self, _pid: Pid, start: usize, _size: usize, _readonly: bool) -> IpcResult<usize> {
        Ok(start)
    }

    fn unmap(&self, _pid: Pid, _addr: usize, _size: usize) -> IpcResult<()> {
        Ok(())
    }

    fn pin(&self, _start: usize, _size: usize) -> IpcResult<()> {
        Ok(())
    }

    fn unpin(&self, _start: usize, _size: usize) -> IpcResult<()> {
        Ok(())
    }
}

/// Snapshot returned by `stat`.
#[derive(Debug, Clone)]
pub struct ShmStat {
    pub shm_perm: IpcPerm,
    /// Segment size in bytes
    pub shm_segsz: usize,
    /// Last attach time
    pub shm_atime: u64,
    /// Last detach time
    pub shm_dtime: u64,
    /// Creation or last `set` time
    pub shm_ctime: u64,
    /// Creator PID
    pub shm_cpid: Pid,
    /// Last shmat/shmdt PID
    pub shm_lpid: Pid,
    /// Current number of attaches
    pub shm_nattch: usize,
    /// Pinned against eviction
    pub shm_locked: bool,
}

struct ShmInner {
    perm: IpcPerm,
    /// Offset of the segment inside the arena.
    start: usize,
    /// Size in bytes; zero marks a destroyed segment.
    size: usize,
    cpid: Pid,
    lpid: Pid,
    nattch: usize,
    locked: bool,
    atime: u64,
    dtime: u64,
    ctime: u64,
}

/// One shared-memory descriptor.
pub struct ShmSegment {
    key: IpcKey,
    inner: Mutex<ShmInner>,
}

impl ShmSegment {
    fn new(key: IpcKey, perm: IpcPerm, start: usize, size: usize, cpid: Pid) -> Self {
        Self {
            key,
            inner: Mutex::new(ShmInner {
                perm,
                start,
                size,
                cpid,
                lpid: cpid,
                nattch: 0,
                locked: false,
                atime: 0,
                dtime: 0,
                ctime: time::ticks(),
            }),
        }
    }
}

impl RegistryObject for ShmSegment {
    fn key(&self) -> IpcKey {
        self.key
    }

    fn is_alive(&self) -> bool {
        self.inner.lock().size != 0
    }
}

/// Attachment record (which process attached where).
#[derive(Debug, Clone, Copy)]
struct Attach {
    pid: Pid,
    addr: usize,
    size: usize,
}

struct Arena {
    limit: usize,
    /// Bump cursor; never rewinds.
    cursor: usize,
}

/// Segment registry plus the arena cursor and attachment table.
pub struct ShmManager {
    registry: Mutex<Registry<ShmSegment>>,
    arena: Mutex<Arena>,
    /// Keyed by raw id; records survive removal so a late detach still
    /// resolves.
    attaches: Mutex<BTreeMap<u64, Vec<Attach>>>,
    mapper: Arc<dyn ShmMapperPort>,
    sched: Arc<dyn SchedPort>,
}

impl ShmManager {
    pub fn new(sched: Arc<dyn SchedPort>, mapper: Arc<dyn ShmMapperPort>) -> Self {
        Self::with_limits(sched, mapper, SHMMNI, SHMALL)
    }

    pub fn with_limits(
        sched: Arc<dyn SchedPort>,
        mapper: Arc<dyn ShmMapperPort>,
        segments: usize,
        arena_bytes: usize,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry::new(segments)),
            arena: Mutex::new(Arena { limit: arena_bytes, cursor: 0 }),
            attaches: Mutex::new(BTreeMap::new()),
            mapper,
            sched,
        }
    }

    /// shmget: resolve a key or carve a new segment from the arena.
    pub fn get(&self, key: IpcKey, size: usize, flags: IpcFlags, mode: u16) -> IpcResult<IpcId> {
        if size == 0 {
            return Err(IpcError::InvalidArgument);
        }
        let cred = self.sched.current_cred();
        let pid = self.sched.current_pid();
        let mut registry = self.registry.lock();
        let id = registry.get_or_create(key, flags, || {
            let mut arena = self.arena.lock();
            if arena.cursor + size > arena.limit {
                // The arena never shrinks back; over-asking is a caller
                // error, not transient pressure.
                return Err(IpcError::InvalidArgument);
            }
            let start = arena.cursor;
            arena.cursor += size;
            Ok(Arc::new(ShmSegment::new(key, IpcPerm::new(key, cred, mode), start, size, pid)))
        })?;
        let seg = registry.lookup(id)?;
        let s = seg.inner.lock();
        if !s.perm.can_read(cred) && !s.perm.can_write(cred) {
            return Err(IpcError::PermissionDenied);
        }
        Ok(id)
    }

    fn resolve(&self, id: IpcId) -> IpcResult<Arc<ShmSegment>> {
        self.registry.lock().lookup(id)
    }

    /// shmat: map the segment for the calling process.
    ///
    /// Returns the address the mapper chose. A read-only attach needs
    /// read permission, a writable one needs write permission.
    pub fn attach(&self, id: IpcId, readonly: bool) -> IpcResult<usize> {
        let seg = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let pid = self.sched.current_pid();

        let (start, size) = {
            let s = seg.inner.lock();
            if s.size == 0 {
                return Err(IpcError::InvalidArgument);
            }
            let allowed = if readonly { s.perm.can_read(cred) } else { s.perm.can_write(cred) };
            if !allowed {
                return Err(IpcError::PermissionDenied);
            }
            (s.start, s.size)
        };

        let addr = self.mapper.map(pid, start, size, readonly)?;

        let mut s = seg.inner.lock();
        if s.size == 0 {
            // Removed between the permission check and the mapping.
            drop(s);
            let _ = self.mapper.unmap(pid, addr, size);
            return Err(IpcError::Removed);
        }
        s.nattch += 1;
        s.atime = time::ticks();
        s.lpid = pid;
        drop(s);

        self.attaches
            .lock()
            .entry(id.to_raw())
            .or_default()
            .push(Attach { pid, addr, size });
        Ok(addr)
    }

    /// shmdt: undo an attach by address.
    pub fn detach(&self, addr: usize) -> IpcResult<()> {
        let pid = self.sched.current_pid();

        let (raw, record) = {
            let mut attaches = self.attaches.lock();
            let found = attaches.iter_mut().find_map(|(raw, records)| {
                records
                    .iter()
                    .position(|a| a.pid == pid && a.addr == addr)
                    .map(|i| (*raw, records.remove(i)))
            });
            let (raw, record) = found.ok_or(IpcError::InvalidArgument)?;
            if attaches.get(&raw).is_some_and(|v| v.is_empty()) {
                attaches.remove(&raw);
            }
            (raw, record)
        };

        self.mapper.unmap(pid, record.addr, record.size)?;

        // Bookkeeping only if the segment still exists; a segment removed
        // with live attaches simply loses its records one by one.
        if let Ok(seg) = self.registry.lock().lookup(IpcId::from_raw(raw)) {
            let mut s = seg.inner.lock();
            s.nattch = s.nattch.saturating_sub(1);
            s.dtime = time::ticks();
            s.lpid = pid;
        }
        Ok(())
    }

    /// shmctl IPC_STAT.
    pub fn stat(&self, id: IpcId) -> IpcResult<ShmStat> {
        let seg = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let s = seg.inner.lock();
        if s.size == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if !s.perm.can_read(cred) {
            return Err(IpcError::PermissionDenied);
        }
        Ok(ShmStat {
            shm_perm: s.perm,
            shm_segsz: s.size,
            shm_atime: s.atime,
            shm_dtime: s.dtime,
            shm_ctime: s.ctime,
            shm_cpid: s.cpid,
            shm_lpid: s.lpid,
            shm_nattch: s.nattch,
            shm_locked: s.locked,
        })
    }

    /// shmctl IPC_SET: owner replaces mode bits and ownership.
    pub fn set(&self, id: IpcId, attrs: &IpcSetAttrs) -> IpcResult<()> {
        let seg = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let mut s = seg.inner.lock();
        if s.size == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if !s.perm.is_owner(cred) {
            return Err(IpcError::PermissionDenied);
        }
        s.perm.uid = attrs.uid;
        s.perm.gid = attrs.gid;
        s.perm.mode = attrs.mode & 0o777;
        s.ctime = time::ticks();
        Ok(())
    }

    /// shmctl IPC_RMID: mark the segment destroyed and unlink it. The
    /// arena range is not reclaimed; live attaches keep their mappings
    /// until they detach.
    pub fn remove(&self, id: IpcId) -> IpcResult<()> {
        let seg = self.resolve(id)?;
        let cred = self.sched.current_cred();
        {
            let mut s = seg.inner.lock();
            if s.size == 0 {
                return Err(IpcError::InvalidArgument);
            }
            if !s.perm.is_owner(cred) {
                return Err(IpcError::PermissionDenied);
            }
            if s.locked {
                if let Err(e) = self.mapper.unpin(s.start, s.size) {
                    log::warn!("ipc: unpin on removal failed: {:?}", e);
                }
            }
            s.size = 0;
        }
        self.registry.lock().remove(id)?;
        log::debug!("ipc: shm segment removed (slot {})", id.slot());
        Ok(())
    }

    /// shmctl SHM_LOCK: pin the segment. Idempotent.
    pub fn lock(&self, id: IpcId) -> IpcResult<()> {
        let seg = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let mut s = seg.inner.lock();
        if s.size == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if !s.perm.is_owner(cred) {
            return Err(IpcError::PermissionDenied);
        }
        if !s.locked {
            self.mapper.pin(s.start, s.size)?;
            s.locked = true;
        }
        Ok(())
    }

    /// shmctl SHM_UNLOCK: release the pin. Idempotent.
    pub fn unlock(&self, id: IpcId) -> IpcResult<()> {
        let seg = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let mut s = seg.inner.lock();
        if s.size == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if !s.perm.is_owner(cred) {
            return Err(IpcError::PermissionDenied);
        }
        if s.locked {
            self.mapper.unpin(s.start, s.size)?;
            s.locked = false;
        }
        Ok(())
    }
}

static SHM: Once<ShmManager> = Once::new();

/// Install the global manager. Called once from `ipc::init`.
pub(super) fn init(sched: Arc<dyn SchedPort>, mapper: Arc<dyn ShmMapperPort>) {
    SHM.call_once(|| ShmManager::new(sched, mapper));
    log::info!("ipc: shared memory subsystem initialized");
}

fn manager() -> &'static ShmManager {
    SHM.get().expect("ipc: shm subsystem used before init")
}

/// shmget entry point.
pub fn shm_get(key: IpcKey, size: usize, flags: IpcFlags, mode: u16) -> IpcResult<IpcId> {
    manager().get(key, size, flags, mode)
}

/// shmat entry point.
pub fn shm_at(id: IpcId, readonly: bool) -> IpcResult<usize> {
    manager().attach(id, readonly)
}

/// shmdt entry point.
pub fn shm_dt(addr: usize) -> IpcResult<()> {
    manager().detach(addr)
}

/// shmctl IPC_STAT entry point.
pub fn shm_stat(id: IpcId) -> IpcResult<ShmStat> {
    manager().stat(id)
}

/// shmctl IPC_SET entry point.
pub fn shm_set(id: IpcId, attrs: &IpcSetAttrs) -> IpcResult<()> {
    manager().set(id, attrs)
}

/// shmctl IPC_RMID entry point.
pub fn shm_remove(id: IpcId) -> IpcResult<()> {
    manager().remove(id)
}

/// shmctl SHM_LOCK entry point.
pub fn shm_lock(id: IpcId) -> IpcResult<()> {
    manager().lock(id)
}

/// shmctl SHM_UNLOCK entry point.
pub fn shm_unlock(id: IpcId) -> IpcResult<()> {
    manager().unlock(id)
}
