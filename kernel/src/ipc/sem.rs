//! System V Semaphore Sets
//!
//! The manager owns identifier/key allocation and the carving of slot
//! ranges out of one bounded global array; the wait/signal algorithm
//! itself (atomic multi-slot adjustment, undo on exit, wait-for-zero)
//! lives behind [`SemOpPort`]. Slot ranges are handed out by a cursor
//! that only moves forward: removing a set zeroes its slots but does not
//! return the range to the pool.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use super::registry::{IpcId, Registry, RegistryObject};
use super::{IpcFlags, IpcKey, IpcPerm, IpcSetAttrs};
use crate::sched::{Pid, SchedPort};
use crate::time;
use crate::util::{IpcError, IpcResult};

/// Maximum number of semaphore sets.
pub const SEMMNI: usize = 128;

/// Semaphore slots in the global pool, shared by all sets.
pub const SEMMNS: usize = 512;

/// Maximum slots in one set.
pub const SEMMSL: usize = 64;

/// Maximum semaphore value.
pub const SEMVMX: i32 = 32767;

/// One semaphore slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct SemSlot {
    /// Current value, `0..=SEMVMX`.
    pub semval: i32,
    /// PID of the last process that operated on the slot.
    pub sempid: Pid,
    /// Processes waiting for the value to grow; maintained by the op port.
    pub semncnt: u16,
    /// Processes waiting for the value to reach zero; maintained by the op port.
    pub semzcnt: u16,
}

/// One step of a semop request.
#[derive(Debug, Clone, Copy)]
pub struct SemOp {
    /// Slot index within the set.
    pub sem_num: u16,
    /// Delta to apply; zero means wait-for-zero.
    pub sem_op: i16,
    /// NO_WAIT and UNDO are meaningful here.
    pub sem_flg: IpcFlags,
}

/// Contract implemented by the wait/signal collaborator.
///
/// `semop` receives the set's slot slice exclusively borrowed, so the
/// whole call is one atomic step from the caller's point of view. An
/// implementation must not re-enter the IPC layer; one that has to wait
/// returns `WouldBlock` or `Interrupted` instead of suspending here, and
/// maintains `semncnt`/`semzcnt` through its own bookkeeping.
pub trait SemOpPort: Send + Sync {
    fn semop(&self, slots: &mut [SemSlot], ops: &[SemOp], pid: Pid) -> IpcResult<()>;
}

/// Reference collaborator: apply every op or none, never wait.
///
/// The request is simulated first; an unsatisfiable step fails the whole
/// call with `WouldBlock` and nothing is applied.
pub struct EagerSemOps;

impl SemOpPort for EagerSemOps {
    fn semop(&self, slots: &mut [SemSlot], ops: &[SemOp], pid: Pid) -> IpcResult<()> {
        let mut vals: Vec<i32> = slots.iter().map(|s| s.semval).collect();
        for op in ops {
            let val = vals
                .get_mut(op.sem_num as usize)
                .ok_or(IpcError::InvalidArgument)?;
            let delta = op.sem_op as i32;
            if delta == 0 {
                if *val != 0 {
                    return Err(IpcError::WouldBlock);
                }
            } else {
                let next = *val + delta;
                if next < 0 {
                    return Err(IpcError::WouldBlock);
                }
                if next > SEMVMX {
                    return Err(IpcError::InvalidArgument);
                }
                *val = next;
            }
        }
        for (slot, val) in slots.iter_mut().zip(vals) {
            slot.semval = val;
        }
        for op in ops {
            slots[op.sem_num as usize].sempid = pid;
        }
        Ok(())
    }
}

/// Snapshot returned by `stat`.
#[derive(Debug, Clone)]
pub struct SemStat {
    pub sem_perm: IpcPerm,
    /// Time of last semop
    pub sem_otime: u64,
    /// Time of creation or last `set`
    pub sem_ctime: u64,
    /// Slots in the set
    pub sem_nsems: usize,
}

struct SemSetInner {
    perm: IpcPerm,
    /// First slot of the range carved for this set.
    base: usize,
    /// Slot count; zero marks a destroyed set.
    nsems: usize,
    otime: u64,
    ctime: u64,
}

/// One semaphore-set descriptor.
pub struct SemSet {
    key: IpcKey,
    inner: Mutex<SemSetInner>,
}

impl SemSet {
    fn new(key: IpcKey, perm: IpcPerm, base: usize, nsems: usize) -> Self {
        Self {
            key,
            inner: Mutex::new(SemSetInner {
                perm,
                base,
                nsems,
                otime: 0,
                ctime: time::ticks(),
            }),
        }
    }
}

impl RegistryObject for SemSet {
    fn key(&self) -> IpcKey {
        self.key
    }

    fn is_alive(&self) -> bool {
        self.inner.lock().nsems != 0
    }
}

struct SlotPool {
    slots: Vec<SemSlot>,
    /// Bump cursor; never rewinds.
    cursor: usize,
}

/// Set registry plus the global slot pool.
pub struct SemManager {
    registry: Mutex<Registry<SemSet>>,
    pool: Mutex<SlotPool>,
    ops: Arc<dyn SemOpPort>,
    sched: Arc<dyn SchedPort>,
}

impl SemManager {
    pub fn new(sched: Arc<dyn SchedPort>, ops: Arc<dyn SemOpPort>) -> Self {
        Self::with_limits(sched, ops, SEMMNI, SEMMNS)
    }

    pub fn with_limits(
        sched: Arc<dyn SchedPort>,
        ops: Arc<dyn SemOpPort>,
        sets: usize,
        slots: usize,
    ) -> Self {
        let mut pool = Vec::with_capacity(slots);
        pool.resize_with(slots, SemSlot::default);
        Self {
            registry: Mutex::new(Registry::new(sets)),
            pool: Mutex::new(SlotPool { slots: pool, cursor: 0 }),
            ops,
            sched,
        }
    }

    /// semget: resolve a key or create a set of `nsems` zeroed slots.
    ///
    /// `nsems` must be positive and, when resolving an existing set, must
    /// not exceed the slots the set actually holds.
    pub fn get(&self, key: IpcKey, nsems: usize, flags: IpcFlags, mode: u16) -> IpcResult<IpcId> {
        if nsems == 0 || nsems > SEMMSL {
            return Err(IpcError::InvalidArgument);
        }
        let cred = self.sched.current_cred();
        let mut registry = self.registry.lock();
        let id = registry.get_or_create(key, flags, || {
            let mut pool = self.pool.lock();
            if pool.cursor + nsems > pool.slots.len() {
                // The pool never shrinks back; once the cursor passes the
                // end no set can be created again.
                return Err(IpcError::InvalidArgument);
            }
            let base = pool.cursor;
            pool.cursor += nsems;
            for slot in &mut pool.slots[base..base + nsems] {
                *slot = SemSlot::default();
            }
            Ok(Arc::new(SemSet::new(key, IpcPerm::new(key, cred, mode), base, nsems)))
        })?;
        let set = registry.lookup(id)?;
        let s = set.inner.lock();
        if !s.perm.can_read(cred) && !s.perm.can_write(cred) {
            return Err(IpcError::PermissionDenied);
        }
        if nsems > s.nsems {
            return Err(IpcError::InvalidArgument);
        }
        Ok(id)
    }

    fn resolve(&self, id: IpcId) -> IpcResult<Arc<SemSet>> {
        self.registry.lock().lookup(id)
    }

    /// semop: delegate an atomic multi-slot adjustment to the op port.
    pub fn op(&self, id: IpcId, ops: &[SemOp]) -> IpcResult<()> {
        if ops.is_empty() {
            return Err(IpcError::InvalidArgument);
        }
        let set = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let pid = self.sched.current_pid();
        let mut s = set.inner.lock();
        if s.nsems == 0 {
            return Err(IpcError::InvalidArgument);
        }
        let alters = ops.iter().any(|op| op.sem_op != 0);
        let allowed = if alters { s.perm.can_write(cred) } else { s.perm.can_read(cred) };
        if !allowed {
            return Err(IpcError::PermissionDenied);
        }
        if ops.iter().any(|op| op.sem_num as usize >= s.nsems) {
            return Err(IpcError::InvalidArgument);
        }

        let (base, nsems) = (s.base, s.nsems);
        let result = {
            let mut pool = self.pool.lock();
            self.ops.semop(&mut pool.slots[base..base + nsems], ops, pid)
        };
        if result.is_ok() {
            s.otime = time::ticks();
        }
        result
    }

    /// semctl IPC_STAT.
    pub fn stat(&self, id: IpcId) -> IpcResult<SemStat> {
        let set = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let s = set.inner.lock();
        if s.nsems == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if !s.perm.can_read(cred) {
            return Err(IpcError::PermissionDenied);
        }
        Ok(SemStat {
            sem_perm: s.perm,
            sem_otime: s.otime,
            sem_ctime: s.ctime,
            sem_nsems: s.nsems,
        })
    }

    /// semctl IPC_SET: owner replaces mode bits and ownership.
    pub fn set(&self, id: IpcId, attrs: &IpcSetAttrs) -> IpcResult<()> {
        let set = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let mut s = set.inner.lock();
        if s.nsems == 0 {
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

    /// semctl IPC_RMID: zero the slot range, mark the set destroyed and
    /// unlink the descriptor. The range itself is not reclaimed.
    pub fn remove(&self, id: IpcId) -> IpcResult<()> {
        let set = self.resolve(id)?;
        let cred = self.sched.current_cred();
        {
            let mut s = set.inner.lock();
            if s.nsems == 0 {
                return Err(IpcError::InvalidArgument);
            }
            if !s.perm.is_owner(cred) {
                return Err(IpcError::PermissionDenied);
            }
            let mut pool = self.pool.lock();
            let (base, nsems) = (s.base, s.nsems);
            for slot in &mut pool.slots[base..base + nsems] {
                *slot = SemSlot::default();
            }
            s.nsems = 0;
        }
        self.registry.lock().remove(id)?;
        log::debug!("ipc: sem set removed (slot {})", id.slot());
        Ok(())
    }

    /// Run `f` over one validated slot of the set.
    fn with_slot<R>(
        &self,
        id: IpcId,
        sem_num: usize,
        write: bool,
        f: impl FnOnce(&mut SemSlot) -> R,
    ) -> IpcResult<R> {
        let set = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let s = set.inner.lock();
        if s.nsems == 0 || sem_num >= s.nsems {
            return Err(IpcError::InvalidArgument);
        }
        let allowed = if write { s.perm.can_write(cred) } else { s.perm.can_read(cred) };
        if !allowed {
            return Err(IpcError::PermissionDenied);
        }
        let mut pool = self.pool.lock();
        Ok(f(&mut pool.slots[s.base + sem_num]))
    }

    /// semctl GETVAL.
    pub fn get_value(&self, id: IpcId, sem_num: usize) -> IpcResult<i32> {
        self.with_slot(id, sem_num, false, |slot| slot.semval)
    }

    /// semctl SETVAL.
    pub fn set_value(&self, id: IpcId, sem_num: usize, value: i32) -> IpcResult<()> {
        if !(0..=SEMVMX).contains(&value) {
            return Err(IpcError::InvalidArgument);
        }
        let pid = self.sched.current_pid();
        self.with_slot(id, sem_num, true, |slot| {
            slot.semval = value;
            slot.sempid = pid;
        })?;
        self.bump_ctime(id)
    }

    /// semctl GETPID: pid of the last process that operated on the slot.
    pub fn get_pid(&self, id: IpcId, sem_num: usize) -> IpcResult<Pid> {
        self.with_slot(id, sem_num, false, |slot| slot.sempid)
    }

    /// semctl GETNCNT: waiters for the value to grow.
    pub fn get_ncnt(&self, id: IpcId, sem_num: usize) -> IpcResult<u16> {
        self.with_slot(id, sem_num, false, |slot| slot.semncnt)
    }

    /// semctl GETZCNT: waiters for the value to reach zero.
    pub fn get_zcnt(&self, id: IpcId, sem_num: usize) -> IpcResult<u16> {
        self.with_slot(id, sem_num, false, |slot| slot.semzcnt)
    }

    /// semctl GETALL.
    pub fn get_all(&self, id: IpcId) -> IpcResult<Vec<i32>> {
        let set = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let s = set.inner.lock();
        if s.nsems == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if !s.perm.can_read(cred) {
            return Err(IpcError::PermissionDenied);
        }
        let pool = self.pool.lock();
        Ok(pool.slots[s.base..s.base + s.nsems].iter().map(|slot| slot.semval).collect())
    }

    /// semctl SETALL.
    pub fn set_all(&self, id: IpcId, values: &[i32]) -> IpcResult<()> {
        if values.iter().any(|v| !(0..=SEMVMX).contains(v)) {
            return Err(IpcError::InvalidArgument);
        }
        let set = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let pid = self.sched.current_pid();
        let mut s = set.inner.lock();
        if s.nsems == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if values.len() != s.nsems {
            return Err(IpcError::InvalidArgument);
        }
        if !s.perm.can_write(cred) {
            return Err(IpcError::PermissionDenied);
        }
        {
            let mut pool = self.pool.lock();
            for (slot, value) in pool.slots[s.base..s.base + s.nsems].iter_mut().zip(values) {
                slot.semval = *value;
                slot.sempid = pid;
            }
        }
        s.ctime = time::ticks();
        Ok(())
    }

    fn bump_ctime(&self, id: IpcId) -> IpcResult<()> {
        let set = self.resolve(id)?;
        let mut s = set.inner.lock();
        s.ctime = time::ticks();
        Ok(())
    }
}

static SEM: Once<SemManager> = Once::new();

/// Install the global manager. Called once from `ipc::init`.
pub(super) fn init(sched: Arc<dyn SchedPort>, ops: Arc<dyn SemOpPort>) {
    SEM.call_once(|| SemManager::new(sched, ops));
    log::info!("ipc: semaphore subsystem initialized");
}

fn manager() -> &'static SemManager {
    SEM.get().expect("ipc: sem subsystem used before init")
}

/// semget entry point.
pub fn sem_get(key: IpcKey, nsems: usize, flags: IpcFlags, mode: u16) -> IpcResult<IpcId> {
    manager().get(key, nsems, flags, mode)
}

/// semop entry point.
pub fn sem_op(id: IpcId, ops: &[SemOp]) -> IpcResult<()> {
    manager().op(id, ops)
}

/// semctl IPC_STAT entry point.
pub fn sem_stat(id: IpcId) -> IpcResult<SemStat> {
    manager().stat(id)
}

/// semctl IPC_SET entry point.
pub fn sem_set(id: IpcId, attrs: &IpcSetAttrs) -> IpcResult<()> {
    manager().set(id, attrs)
}

/// semctl IPC_RMID entry point.
pub fn sem_remove(id: IpcId) -> IpcResult<()> {
    manager().remove(id)
}

/// semctl GETVAL entry point.
pub fn sem_get_value(id: IpcId, sem_num: usize) -> IpcResult<i32> {
    manager().get_value(id, sem_num)
}

/// semctl SETVAL entry point.
pub fn sem_set_value(id: IpcId, sem_num: usize, value: i32) -> IpcResult<()> {
    manager().set_value(id, sem_num, value)
}

/// semctl GETPID entry point.
pub fn sem_get_pid(id: IpcId, sem_num: usize) -> IpcResult<Pid> {
    manager().get_pid(id, sem_num)
}

/// semctl GETNCNT entry point.
pub fn sem_get_ncnt(id: IpcId, sem_num: usize) -> IpcResult<u16> {
    manager().get_ncnt(id, sem_num)
}

/// semctl GETZCNT entry point.
pub fn sem_get_zcnt(id: IpcId, sem_num: usize) -> IpcResult<u16> {
    manager().get_zcnt(id, sem_num)
}

/// semctl GETALL entry point.
pub fn sem_get_all(id: IpcId) -> IpcResult<Vec<i32>> {
    manager().get_all(id)
}

/// semctl SETALL entry point.
pub fn sem_set_all(id: IpcId, values: &[i32]) -> IpcResult<()> {
    manager().set_all(id, values)
}
