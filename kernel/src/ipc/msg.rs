//! System V Message Queues
//!
//! Implementation of msgget, msgsnd, msgrcv, msgctl semantics for
//! inter-process communication via message queues.
//!
//! A send splits its payload into fixed-size segments (see [`super::seg`])
//! and appends the whole chain to the queue in one step; a receive drains
//! the entire queue as one transfer, copying up to the caller's buffer
//! size and discarding the rest. Senders block while the queue lacks room,
//! receivers block while it is empty; both re-validate their condition on
//! every wake and observe `Removed` when the queue is destroyed under
//! them.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cmp::min;

use spin::{Mutex, Once};

use super::registry::{IpcId, Registry, RegistryObject};
use super::seg::{Segment, SegmentPool, MSGSEG};
use super::{IpcFlags, IpcKey, IpcPerm};
use crate::sched::{Pid, SchedPort, WaitChannel, WaitOutcome};
use crate::time;
use crate::util::{IpcError, IpcResult};

/// Default capacity of a new queue, in payload bytes.
pub const MSGMNB: usize = 16384;

/// Maximum number of message queues.
pub const MSGMNI: usize = 128;

/// Read-only snapshot returned by `stat`.
///
/// A snapshot is a value copy; later traffic on the queue never changes a
/// snapshot already handed out.
#[derive(Debug, Clone)]
pub struct MsqStat {
    pub msg_perm: IpcPerm,
    /// Time of last send
    pub msg_stime: u64,
    /// Time of last receive
    pub msg_rtime: u64,
    /// Time of creation or last `set`
    pub msg_ctime: u64,
    /// Payload bytes currently queued
    pub msg_cbytes: usize,
    /// Segments currently queued
    pub msg_qsegs: usize,
    /// Capacity in payload bytes
    pub msg_qbytes: usize,
    /// PID of last sender
    pub msg_lspid: Pid,
    /// PID of last receiver
    pub msg_lrpid: Pid,
}

/// Attributes replaceable via `set`.
#[derive(Debug, Clone, Copy)]
pub struct MsqSetAttrs {
    pub uid: u32,
    pub gid: u32,
    pub mode: u16,
    /// New capacity; shrinking below the current contents only affects
    /// future sends.
    pub qbytes: usize,
}

struct MsqInner {
    perm: IpcPerm,
    /// Segment chain, oldest first. Exclusively owned by the queue.
    chain: VecDeque<Segment>,
    /// Invariant: equals the payload bytes physically in `chain`.
    total_bytes: usize,
    /// Invariant: equals `chain.len()`.
    total_segments: usize,
    /// Capacity in payload bytes; zero marks a destroyed queue.
    max_bytes: usize,
    lspid: Pid,
    lrpid: Pid,
    stime: u64,
    rtime: u64,
    ctime: u64,
}

/// One queue descriptor.
///
/// The mutex guards every list mutation and is never held across a sleep,
/// so contention on one queue cannot stall another.
pub struct MsgQueue {
    key: IpcKey,
    inner: Mutex<MsqInner>,
}

impl MsgQueue {
    fn new(key: IpcKey, perm: IpcPerm) -> Self {
        Self {
            key,
            inner: Mutex::new(MsqInner {
                perm,
                chain: VecDeque::new(),
                total_bytes: 0,
                total_segments: 0,
                max_bytes: MSGMNB,
                lspid: 0,
                lrpid: 0,
                stime: 0,
                rtime: 0,
                ctime: time::ticks(),
            }),
        }
    }
}

impl RegistryObject for MsgQueue {
    fn key(&self) -> IpcKey {
        self.key
    }

    fn is_alive(&self) -> bool {
        self.inner.lock().max_bytes != 0
    }
}

/// Pop every segment, copying payload into `dest` until it is full.
/// Returns (bytes drained, segments drained, bytes copied).
fn drain_chain(chain: &mut VecDeque<Segment>, dest: &mut [u8]) -> (usize, usize, usize) {
    let mut bytes = 0;
    let mut segs = 0;
    let mut copied = 0;
    while let Some(seg) = chain.pop_front() {
        let take = min(seg.len(), dest.len() - copied);
        dest[copied..copied + take].copy_from_slice(&seg.bytes()[..take]);
        copied += take;
        bytes += seg.len();
        segs += 1;
    }
    (bytes, segs, copied)
}

/// Queue registry plus the shared segment budget.
pub struct MsgManager {
    registry: Mutex<Registry<MsgQueue>>,
    pool: SegmentPool,
    sched: Arc<dyn SchedPort>,
}

impl MsgManager {
    pub fn new(sched: Arc<dyn SchedPort>) -> Self {
        Self::with_limits(sched, MSGMNI, MSGSEG)
    }

    pub fn with_limits(sched: Arc<dyn SchedPort>, queues: usize, segments: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::new(queues)),
            pool: SegmentPool::new(segments),
            sched,
        }
    }

    /// msgget: resolve a key or create a new queue.
    pub fn get(&self, key: IpcKey, flags: IpcFlags, mode: u16) -> IpcResult<IpcId> {
        let cred = self.sched.current_cred();
        let mut registry = self.registry.lock();
        let id = registry.get_or_create(key, flags, || {
            Ok(Arc::new(MsgQueue::new(key, IpcPerm::new(key, cred, mode))))
        })?;
        // Resolving an existing queue needs some access to it.
        let queue = registry.lookup(id)?;
        let q = queue.inner.lock();
        if !q.perm.can_read(cred) && !q.perm.can_write(cred) {
            return Err(IpcError::PermissionDenied);
        }
        Ok(id)
    }

    fn resolve(&self, id: IpcId) -> IpcResult<Arc<MsgQueue>> {
        self.registry.lock().lookup(id)
    }

    /// msgsnd: enqueue `payload`, blocking while the queue lacks room.
    ///
    /// A payload larger than the queue capacity can never be admitted and
    /// fails immediately. A zero-length payload is accepted: it stamps the
    /// sender but contributes no segments and no bytes.
    pub fn send(&self, id: IpcId, payload: &[u8], flags: IpcFlags) -> IpcResult<()> {
        let queue = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let pid = self.sched.current_pid();
        let mut slept = false;
        loop {
            let mut q = queue.inner.lock();
            if q.max_bytes == 0 {
                // Destroyed: a stale handle before the first sleep, a
                // removal seen from inside the wait afterwards.
                return Err(if slept { IpcError::Removed } else { IpcError::InvalidArgument });
            }
            if !q.perm.can_write(cred) {
                return Err(IpcError::PermissionDenied);
            }
            if payload.len() > q.max_bytes {
                // Will not fit even in an empty queue.
                return Err(IpcError::InvalidArgument);
            }

            if q.total_bytes + payload.len() <= q.max_bytes {
                // Admitted. The chain is fully materialized before any
                // queue state changes, so an allocation failure here
                // leaves queue and counters untouched.
                let chain = self.pool.build_chain(payload)?;
                q.total_bytes += payload.len();
                q.total_segments += chain.len();
                q.chain.extend(chain);
                q.lspid = pid;
                q.stime = time::ticks();
                drop(q);
                self.sched.wake_all(WaitChannel::recv(id));
                return Ok(());
            }

            if flags.contains(IpcFlags::NO_WAIT) {
                return Err(IpcError::WouldBlock);
            }
            drop(q);
            match self.sched.sleep_on(WaitChannel::send(id)) {
                WaitOutcome::Woken => slept = true,
                WaitOutcome::Interrupted => return Err(IpcError::Interrupted),
            }
            // Another sender may have won the race; re-validate.
        }
    }

    /// msgrcv: drain the whole queue into `dest`, blocking while empty.
    ///
    /// One receive takes every queued segment; bytes beyond `dest` are
    /// dropped, not requeued. Returns the number of bytes copied.
    pub fn recv(&self, id: IpcId, dest: &mut [u8], flags: IpcFlags) -> IpcResult<usize> {
        let queue = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let pid = self.sched.current_pid();
        let mut slept = false;
        loop {
            let mut q = queue.inner.lock();
            if q.max_bytes == 0 {
                return Err(if slept { IpcError::Removed } else { IpcError::InvalidArgument });
            }
            if !q.perm.can_read(cred) {
                return Err(IpcError::PermissionDenied);
            }

            if q.chain.is_empty() {
                assert!(
                    q.total_bytes == 0 && q.total_segments == 0,
                    "msg: counters out of sync with empty chain"
                );
                if flags.contains(IpcFlags::NO_WAIT) {
                    return Err(IpcError::NoMessage);
                }
                drop(q);
                match self.sched.sleep_on(WaitChannel::recv(id)) {
                    WaitOutcome::Woken => slept = true,
                    WaitOutcome::Interrupted => return Err(IpcError::Interrupted),
                }
                continue;
            }

            let (bytes, segs, copied) = drain_chain(&mut q.chain, dest);
            assert_eq!(bytes, q.total_bytes, "msg: byte counter out of sync with chain");
            assert_eq!(segs, q.total_segments, "msg: segment counter out of sync with chain");
            q.total_bytes = 0;
            q.total_segments = 0;
            q.lrpid = pid;
            q.rtime = time::ticks();
            self.pool.release(segs);
            drop(q);
            self.sched.wake_all(WaitChannel::send(id));
            return Ok(copied);
        }
    }

    /// msgctl IPC_STAT: value snapshot of the descriptor.
    pub fn stat(&self, id: IpcId) -> IpcResult<MsqStat> {
        let queue = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let q = queue.inner.lock();
        if q.max_bytes == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if !q.perm.can_read(cred) {
            return Err(IpcError::PermissionDenied);
        }
        Ok(MsqStat {
            msg_perm: q.perm,
            msg_stime: q.stime,
            msg_rtime: q.rtime,
            msg_ctime: q.ctime,
            msg_cbytes: q.total_bytes,
            msg_qsegs: q.total_segments,
            msg_qbytes: q.max_bytes,
            msg_lspid: q.lspid,
            msg_lrpid: q.lrpid,
        })
    }

    /// msgctl IPC_SET: owner replaces mode bits, ownership and capacity.
    pub fn set(&self, id: IpcId, attrs: &MsqSetAttrs) -> IpcResult<()> {
        let queue = self.resolve(id)?;
        let cred = self.sched.current_cred();
        let mut q = queue.inner.lock();
        if q.max_bytes == 0 {
            return Err(IpcError::InvalidArgument);
        }
        if !q.perm.is_owner(cred) {
            return Err(IpcError::PermissionDenied);
        }
        if attrs.qbytes == 0 {
            // Zero capacity is the destroyed marker; removal goes through
            // `remove`.
            return Err(IpcError::InvalidArgument);
        }
        q.perm.uid = attrs.uid;
        q.perm.gid = attrs.gid;
        q.perm.mode = attrs.mode & 0o777;
        q.max_bytes = attrs.qbytes;
        q.ctime = time::ticks();
        Ok(())
    }

    /// msgctl IPC_RMID: drain every segment, mark the queue destroyed,
    /// wake both wait sides and unlink the descriptor.
    pub fn remove(&self, id: IpcId) -> IpcResult<()> {
        let queue = self.resolve(id)?;
        let cred = self.sched.current_cred();
        {
            let mut q = queue.inner.lock();
            if q.max_bytes == 0 {
                return Err(IpcError::InvalidArgument);
            }
            if !q.perm.is_owner(cred) {
                return Err(IpcError::PermissionDenied);
            }
            let mut bytes = 0;
            let mut segs = 0;
            while let Some(seg) = q.chain.pop_front() {
                bytes += seg.len();
                segs += 1;
            }
            assert_eq!(bytes, q.total_bytes, "msg: byte counter out of sync at removal");
            assert_eq!(segs, q.total_segments, "msg: segment counter out of sync at removal");
            q.total_bytes = 0;
            q.total_segments = 0;
            // Blocked senders and receivers observe this on their next wake.
            q.max_bytes = 0;
            self.pool.release(segs);
        }
        self.sched.wake_all(WaitChannel::send(id));
        self.sched.wake_all(WaitChannel::recv(id));
        self.registry.lock().remove(id)?;
        log::debug!("ipc: msg queue removed (slot {})", id.slot());
        Ok(())
    }

    #[cfg(test)]
    fn pool_available(&self) -> usize {
        self.pool.available()
    }
}

static MSG: Once<MsgManager> = Once::new();

/// Install the global manager. Called once from `ipc::init`.
pub(super) fn init(sched: Arc<dyn SchedPort>) {
    MSG.call_once(|| MsgManager::new(sched));
    log::info!("ipc: message queue subsystem initialized");
}

fn manager() -> &'static MsgManager {
    MSG.get().expect("ipc: msg subsystem used before init")
}

/// msgget entry point.
pub fn msg_get(key: IpcKey, flags: IpcFlags, mode: u16) -> IpcResult<IpcId> {
    manager().get(key, flags, mode)
}

/// msgsnd entry point.
pub fn msg_send(id: IpcId, payload: &[u8], flags: IpcFlags) -> IpcResult<()> {
    manager().send(id, payload, flags)
}

/// msgrcv entry point.
pub fn msg_recv(id: IpcId, dest: &mut [u8], flags: IpcFlags) -> IpcResult<usize> {
    manager().recv(id, dest, flags)
}

/// msgctl IPC_STAT entry point.
pub fn msg_stat(id: IpcId) -> IpcResult<MsqStat> {
    manager().stat(id)
}

/// msgctl IPC_SET entry point.
pub fn msg_set(id: IpcId, attrs: &MsqSetAttrs) -> IpcResult<()> {
    manager().set(id, attrs)
}

/// msgctl IPC_RMID entry point.
pub fn msg_remove(id: IpcId) -> IpcResult<()> {
    manager().remove(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::seg::MSGSSZ;
    use crate::ipc::IPC_PRIVATE;
    use crate::sched::Cred;
    use alloc::boxed::Box;
    use alloc::vec;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicUsize, Ordering};

    type SleepHook = Box<dyn Fn(WaitChannel) + Send + Sync>;

    /// Scripted scheduler: each sleep pops the next outcome (default
    /// Interrupted so a runaway loop terminates) after running the
    /// installed hook, which stands in for the waker process.
    struct TestSched {
        pid: Pid,
        cred: Cred,
        outcomes: Mutex<VecDeque<WaitOutcome>>,
        hook: Mutex<Option<SleepHook>>,
        sleeps: AtomicUsize,
        wakes: Mutex<Vec<WaitChannel>>,
    }

    impl TestSched {
        fn new(pid: Pid) -> Arc<Self> {
            Arc::new(Self {
                pid,
                cred: Cred { uid: 100, gid: 10 },
                outcomes: Mutex::new(VecDeque::new()),
                hook: Mutex::new(None),
                sleeps: AtomicUsize::new(0),
                wakes: Mutex::new(Vec::new()),
            })
        }

        fn script(&self, outcomes: &[WaitOutcome]) {
            self.outcomes.lock().extend(outcomes.iter().copied());
        }

        fn on_sleep(&self, hook: SleepHook) {
            *self.hook.lock() = Some(hook);
        }

        fn sleep_count(&self) -> usize {
            self.sleeps.load(Ordering::Relaxed)
        }

        fn woken_channels(&self) -> Vec<WaitChannel> {
            self.wakes.lock().clone()
        }
    }

    impl SchedPort for TestSched {
        fn current_pid(&self) -> Pid {
            self.pid
        }

        fn current_cred(&self) -> Cred {
            self.cred
        }

        fn sleep_on(&self, chan: WaitChannel) -> WaitOutcome {
            self.sleeps.fetch_add(1, Ordering::Relaxed);
            if let Some(hook) = self.hook.lock().as_ref() {
                hook(chan);
            }
            self.outcomes.lock().pop_front().unwrap_or(WaitOutcome::Interrupted)
        }

        fn wake_all(&self, chan: WaitChannel) {
            self.wakes.lock().push(chan);
        }
    }

    fn small_queue(mgr: &MsgManager, qbytes: usize) -> IpcId {
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();
        let st = mgr.stat(id).unwrap();
        mgr.set(
            id,
            &MsqSetAttrs { uid: st.msg_perm.uid, gid: st.msg_perm.gid, mode: 0o600, qbytes },
        )
        .unwrap();
        id
    }

    #[test]
    fn roundtrip_preserves_payload_across_segments() {
        let sched = TestSched::new(7);
        let mgr = MsgManager::new(sched);
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();

        let payload: Vec<u8> = (0..(2 * MSGSSZ + 77)).map(|i| (i * 31) as u8).collect();
        mgr.send(id, &payload, IpcFlags::empty()).unwrap();

        let st = mgr.stat(id).unwrap();
        assert_eq!(st.msg_cbytes, payload.len());
        assert_eq!(st.msg_qsegs, 3);

        let mut dest = vec![0u8; payload.len()];
        let got = mgr.recv(id, &mut dest, IpcFlags::empty()).unwrap();
        assert_eq!(got, payload.len());
        assert_eq!(dest, payload);

        let st = mgr.stat(id).unwrap();
        assert_eq!(st.msg_cbytes, 0);
        assert_eq!(st.msg_qsegs, 0);
    }

    #[test]
    fn private_queues_are_distinct_and_stable() {
        let mgr = MsgManager::new(TestSched::new(1));
        let a = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();
        let b = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();
        assert_ne!(a, b);
        assert!(mgr.stat(a).is_ok());
        assert!(mgr.stat(b).is_ok());
    }

    #[test]
    fn key_semantics_match_get_contract() {
        let mgr = MsgManager::new(TestSched::new(1));
        let a = mgr.get(0x5155, IpcFlags::CREATE, 0o600).unwrap();
        assert_eq!(mgr.get(0x5155, IpcFlags::empty(), 0o600).unwrap(), a);
        assert_eq!(
            mgr.get(0x5155, IpcFlags::CREATE | IpcFlags::EXCLUSIVE, 0o600).unwrap_err(),
            IpcError::AlreadyExists
        );
        assert_eq!(
            mgr.get(0x5156, IpcFlags::empty(), 0o600).unwrap_err(),
            IpcError::NotFound
        );
    }

    #[test]
    fn full_queue_with_no_wait_reports_would_block() {
        let sched = TestSched::new(3);
        let mgr = MsgManager::new(sched.clone());
        let id = small_queue(&mgr, 100);

        mgr.send(id, &[1u8; 40], IpcFlags::empty()).unwrap();
        assert_eq!(
            mgr.send(id, &[2u8; 70], IpcFlags::NO_WAIT).unwrap_err(),
            IpcError::WouldBlock
        );
        assert_eq!(sched.sleep_count(), 0);

        // The failed send left the queue untouched.
        let st = mgr.stat(id).unwrap();
        assert_eq!(st.msg_cbytes, 40);
        assert_eq!(st.msg_qsegs, 1);

        let mut dest = [0u8; 200];
        assert_eq!(mgr.recv(id, &mut dest, IpcFlags::empty()).unwrap(), 40);
        let st = mgr.stat(id).unwrap();
        assert_eq!(st.msg_cbytes, 0);
        assert_eq!(st.msg_qsegs, 0);
    }

    #[test]
    fn oversized_payload_always_invalid() {
        let mgr = MsgManager::new(TestSched::new(3));
        let id = small_queue(&mgr, 100);
        // Empty queue, payload still larger than the whole capacity.
        assert_eq!(
            mgr.send(id, &[0u8; 101], IpcFlags::empty()).unwrap_err(),
            IpcError::InvalidArgument
        );
        let st = mgr.stat(id).unwrap();
        assert_eq!(st.msg_cbytes, 0);
    }

    #[test]
    fn empty_queue_with_no_wait_reports_no_message() {
        let sched = TestSched::new(3);
        let mgr = MsgManager::new(sched.clone());
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();
        let mut dest = [0u8; 16];
        assert_eq!(
            mgr.recv(id, &mut dest, IpcFlags::NO_WAIT).unwrap_err(),
            IpcError::NoMessage
        );
        assert_eq!(sched.sleep_count(), 0);
    }

    #[test]
    fn short_destination_truncates_and_discards() {
        let mgr = MsgManager::new(TestSched::new(3));
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();
        let payload: Vec<u8> = (0..200u32).map(|i| i as u8).collect();
        mgr.send(id, &payload, IpcFlags::empty()).unwrap();

        let mut dest = [0u8; 64];
        assert_eq!(mgr.recv(id, &mut dest, IpcFlags::empty()).unwrap(), 64);
        assert_eq!(&dest[..], &payload[..64]);

        // The excess is gone, not requeued.
        let st = mgr.stat(id).unwrap();
        assert_eq!(st.msg_cbytes, 0);
        assert_eq!(st.msg_qsegs, 0);
    }

    #[test]
    fn zero_length_send_stamps_but_queues_nothing() {
        let sched = TestSched::new(99);
        let mgr = MsgManager::new(sched);
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();
        time::tick();
        mgr.send(id, &[], IpcFlags::empty()).unwrap();

        let st = mgr.stat(id).unwrap();
        assert_eq!(st.msg_cbytes, 0);
        assert_eq!(st.msg_qsegs, 0);
        assert_eq!(st.msg_lspid, 99);
        assert!(st.msg_stime > 0);
    }

    #[test]
    fn failed_allocation_leaves_queue_untouched() {
        let sched = TestSched::new(3);
        // Budget of 2 segments shared by the whole manager.
        let mgr = MsgManager::with_limits(sched, 4, 2);
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();

        mgr.send(id, &[1u8; MSGSSZ], IpcFlags::empty()).unwrap();
        assert_eq!(
            mgr.send(id, &[2u8; 2 * MSGSSZ], IpcFlags::empty()).unwrap_err(),
            IpcError::OutOfMemory
        );

        let st = mgr.stat(id).unwrap();
        assert_eq!(st.msg_cbytes, MSGSSZ);
        assert_eq!(st.msg_qsegs, 1);
        assert_eq!(mgr.pool_available(), 1);
    }

    #[test]
    fn blocked_sender_completes_after_drain() {
        let sched = TestSched::new(3);
        let mgr = Arc::new(MsgManager::new(sched.clone()));
        let id = small_queue(&mgr, 100);
        mgr.send(id, &[1u8; 80], IpcFlags::empty()).unwrap();

        // The "receiver process" drains the queue while our sender sleeps.
        let drainer = Arc::clone(&mgr);
        sched.script(&[WaitOutcome::Woken]);
        sched.on_sleep(Box::new(move |_chan| {
            let mut dest = [0u8; 128];
            drainer.recv(id, &mut dest, IpcFlags::empty()).unwrap();
        }));

        mgr.send(id, &[2u8; 50], IpcFlags::empty()).unwrap();
        assert_eq!(sched.sleep_count(), 1);

        let st = mgr.stat(id).unwrap();
        assert_eq!(st.msg_cbytes, 50);
        assert_eq!(st.msg_qsegs, 1);
    }

    #[test]
    fn blocked_receiver_completes_after_send() {
        let sched = TestSched::new(3);
        let mgr = Arc::new(MsgManager::new(sched.clone()));
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();

        let sender = Arc::clone(&mgr);
        sched.script(&[WaitOutcome::Woken]);
        sched.on_sleep(Box::new(move |_chan| {
            sender.send(id, b"wake up", IpcFlags::empty()).unwrap();
        }));

        let mut dest = [0u8; 32];
        let got = mgr.recv(id, &mut dest, IpcFlags::empty()).unwrap();
        assert_eq!(&dest[..got], b"wake up");
        assert_eq!(sched.sleep_count(), 1);
    }

    #[test]
    fn sender_sees_removal_from_inside_the_wait() {
        let sched = TestSched::new(3);
        let mgr = Arc::new(MsgManager::new(sched.clone()));
        let id = small_queue(&mgr, 100);
        mgr.send(id, &[1u8; 80], IpcFlags::empty()).unwrap();

        let remover = Arc::clone(&mgr);
        sched.script(&[WaitOutcome::Woken]);
        sched.on_sleep(Box::new(move |_chan| {
            remover.remove(id).unwrap();
        }));

        assert_eq!(
            mgr.send(id, &[2u8; 50], IpcFlags::empty()).unwrap_err(),
            IpcError::Removed
        );
        // The stale identifier no longer resolves at all.
        assert_eq!(mgr.stat(id).unwrap_err(), IpcError::InvalidArgument);
    }

    #[test]
    fn interrupted_wait_is_distinct_and_harmless() {
        let sched = TestSched::new(3);
        let mgr = MsgManager::new(sched.clone());
        let id = small_queue(&mgr, 100);
        mgr.send(id, &[1u8; 80], IpcFlags::empty()).unwrap();

        // No script: the default outcome is an interrupted wait.
        assert_eq!(
            mgr.send(id, &[2u8; 50], IpcFlags::empty()).unwrap_err(),
            IpcError::Interrupted
        );
        let st = mgr.stat(id).unwrap();
        assert_eq!(st.msg_cbytes, 80);
        assert_eq!(st.msg_qsegs, 1);
    }

    #[test]
    fn send_wakes_receive_side_and_recv_wakes_send_side() {
        let sched = TestSched::new(3);
        let mgr = MsgManager::new(sched.clone());
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();

        mgr.send(id, b"ping", IpcFlags::empty()).unwrap();
        let mut dest = [0u8; 8];
        mgr.recv(id, &mut dest, IpcFlags::empty()).unwrap();

        let wakes = sched.woken_channels();
        assert_eq!(wakes.len(), 2);
        assert_eq!(wakes[0], WaitChannel::recv(id));
        assert_eq!(wakes[1], WaitChannel::send(id));
    }

    #[test]
    fn remove_drains_fully_and_wakes_both_sides() {
        let sched = TestSched::new(3);
        let mgr = MsgManager::new(sched.clone());
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();
        let budget = mgr.pool_available();
        mgr.send(id, &[1u8; 3 * MSGSSZ], IpcFlags::empty()).unwrap();
        mgr.send(id, &[2u8; 10], IpcFlags::empty()).unwrap();

        mgr.remove(id).unwrap();

        // Every segment went back to the pool and both sides were woken.
        assert_eq!(mgr.pool_available(), budget);
        let wakes = sched.woken_channels();
        assert!(wakes.contains(&WaitChannel::send(id)));
        assert!(wakes.contains(&WaitChannel::recv(id)));
        assert_eq!(mgr.stat(id).unwrap_err(), IpcError::InvalidArgument);
        assert_eq!(mgr.remove(id).unwrap_err(), IpcError::InvalidArgument);
    }

    #[test]
    fn stat_is_a_snapshot_not_a_live_view() {
        let mgr = MsgManager::new(TestSched::new(3));
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();
        let before = mgr.stat(id).unwrap();
        mgr.send(id, &[9u8; 30], IpcFlags::empty()).unwrap();
        assert_eq!(before.msg_cbytes, 0);
        assert_eq!(mgr.stat(id).unwrap().msg_cbytes, 30);
    }

    #[test]
    fn set_updates_mode_capacity_and_ctime() {
        let mgr = MsgManager::new(TestSched::new(3));
        let id = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o600).unwrap();
        let before = mgr.stat(id).unwrap();
        time::tick();
        mgr.set(
            id,
            &MsqSetAttrs { uid: before.msg_perm.uid, gid: before.msg_perm.gid, mode: 0o644, qbytes: 4096 },
        )
        .unwrap();
        let after = mgr.stat(id).unwrap();
        assert_eq!(after.msg_perm.mode, 0o644);
        assert_eq!(after.msg_qbytes, 4096);
        assert!(after.msg_ctime > before.msg_ctime);

        // Capacity zero would forge the destroyed marker.
        assert_eq!(
            mgr.set(id, &MsqSetAttrs { uid: 0, gid: 0, mode: 0o600, qbytes: 0 }).unwrap_err(),
            IpcError::InvalidArgument
        );
    }

    #[test]
    fn mode_bits_gate_send_and_recv() {
        let sched = TestSched::new(3);
        let mgr = MsgManager::new(sched);
        let wo = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o200).unwrap();
        let mut dest = [0u8; 8];
        assert_eq!(
            mgr.recv(wo, &mut dest, IpcFlags::NO_WAIT).unwrap_err(),
            IpcError::PermissionDenied
        );
        let ro = mgr.get(IPC_PRIVATE, IpcFlags::empty(), 0o400).unwrap();
        assert_eq!(
            mgr.send(ro, b"x", IpcFlags::empty()).unwrap_err(),
            IpcError::PermissionDenied
        );
    }
}
