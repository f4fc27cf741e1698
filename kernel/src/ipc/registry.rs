//! Generation-tagged registries for IPC objects.
//!
//! Each resource kind owns one fixed-capacity table of descriptor slots.
//! An identifier is the pair (slot index, slot generation); removal bumps
//! the generation, so an identifier held across an unrelated removal stays
//! valid while an identifier for the removed object becomes detectably
//! stale instead of silently resolving to a reused slot.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::{IpcFlags, IpcKey, IPC_PRIVATE};
use crate::util::{IpcError, IpcResult};

/// Identifier handed to callers: slot index plus slot generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpcId {
    slot: u32,
    gen: u32,
}

impl IpcId {
    /// Raw encoding for the syscall boundary.
    pub fn to_raw(self) -> u64 {
        (self.gen as u64) << 32 | self.slot as u64
    }

    pub fn from_raw(raw: u64) -> Self {
        Self { slot: raw as u32, gen: (raw >> 32) as u32 }
    }

    pub fn slot(self) -> usize {
        self.slot as usize
    }
}

/// Object stored in a registry slot.
///
/// Destroyed objects report `is_alive() == false` and are treated as
/// absent by lookup; their capacity field is the alive flag, so a
/// descriptor is never handed out half-initialized.
pub trait RegistryObject {
    fn key(&self) -> IpcKey;
    fn is_alive(&self) -> bool;
}

struct Slot<T> {
    gen: u32,
    entry: Option<Arc<T>>,
}

/// Fixed-capacity table of one kind's descriptors.
pub struct Registry<T> {
    slots: Vec<Slot<T>>,
}

impl<T: RegistryObject> Registry<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot { gen: 0, entry: None });
        }
        Self { slots }
    }

    fn find_key(&self, key: IpcKey) -> Option<IpcId> {
        self.slots.iter().enumerate().find_map(|(i, s)| {
            let entry = s.entry.as_ref()?;
            (entry.is_alive() && entry.key() == key)
                .then(|| IpcId { slot: i as u32, gen: s.gen })
        })
    }

    /// `get`-style entry point: resolve a key or create a new object.
    ///
    /// `IPC_PRIVATE` implies creation. For public keys the CREATE and
    /// EXCLUSIVE flags select between lookup, creation and exclusive
    /// creation. `make` runs only once a free slot is secured, so a
    /// factory failure leaves the table unchanged.
    pub fn get_or_create<F>(&mut self, key: IpcKey, flags: IpcFlags, make: F) -> IpcResult<IpcId>
    where
        F: FnOnce() -> IpcResult<Arc<T>>,
    {
        if key != IPC_PRIVATE {
            if let Some(id) = self.find_key(key) {
                if flags.contains(IpcFlags::CREATE | IpcFlags::EXCLUSIVE) {
                    return Err(IpcError::AlreadyExists);
                }
                return Ok(id);
            }
            if !flags.contains(IpcFlags::CREATE) {
                return Err(IpcError::NotFound);
            }
        }

        let slot = self
            .slots
            .iter()
            .position(|s| s.entry.is_none())
            .ok_or(IpcError::NoSpace)?;
        let obj = make()?;
        let s = &mut self.slots[slot];
        s.entry = Some(obj);
        Ok(IpcId { slot: slot as u32, gen: s.gen })
    }

    /// Resolve an identifier. Out-of-range slots, stale generations and
    /// destroyed descriptors all resolve to `InvalidArgument`.
    pub fn lookup(&self, id: IpcId) -> IpcResult<Arc<T>> {
        let s = self.slots.get(id.slot()).ok_or(IpcError::InvalidArgument)?;
        if s.gen != id.gen {
            return Err(IpcError::InvalidArgument);
        }
        let entry = s.entry.as_ref().ok_or(IpcError::InvalidArgument)?;
        if !entry.is_alive() {
            return Err(IpcError::InvalidArgument);
        }
        Ok(Arc::clone(entry))
    }

    /// Unlink a descriptor and bump its slot generation.
    ///
    /// The caller has already released everything the descriptor owned;
    /// this only detaches it from the table.
    pub fn remove(&mut self, id: IpcId) -> IpcResult<Arc<T>> {
        let s = self.slots.get_mut(id.slot()).ok_or(IpcError::InvalidArgument)?;
        if s.gen != id.gen {
            return Err(IpcError::InvalidArgument);
        }
        let entry = s.entry.take().ok_or(IpcError::InvalidArgument)?;
        s.gen = s.gen.wrapping_add(1);
        Ok(entry)
    }

    /// Number of live descriptors.
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.entry.as_ref().is_some_and(|e| e.is_alive()))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct Dummy {
        key: IpcKey,
        alive: AtomicBool,
    }

    impl Dummy {
        fn new(key: IpcKey) -> Arc<Self> {
            Arc::new(Self { key, alive: AtomicBool::new(true) })
        }
    }

    impl RegistryObject for Dummy {
        fn key(&self) -> IpcKey {
            self.key
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::Relaxed)
        }
    }

    fn create(reg: &mut Registry<Dummy>, key: IpcKey, flags: IpcFlags) -> IpcResult<IpcId> {
        reg.get_or_create(key, flags, || Ok(Dummy::new(key)))
    }

    #[test]
    fn private_keys_always_create_distinct_objects() {
        let mut reg = Registry::new(4);
        let a = create(&mut reg, IPC_PRIVATE, IpcFlags::empty()).unwrap();
        let b = create(&mut reg, IPC_PRIVATE, IpcFlags::empty()).unwrap();
        assert_ne!(a, b);
        assert!(reg.lookup(a).is_ok());
        assert!(reg.lookup(b).is_ok());
    }

    #[test]
    fn key_lookup_and_exclusive_create() {
        let mut reg = Registry::new(4);
        let a = create(&mut reg, 7, IpcFlags::CREATE).unwrap();
        // Plain lookup finds the same object.
        let b = create(&mut reg, 7, IpcFlags::empty()).unwrap();
        assert_eq!(a, b);
        // Exclusive creation on a live key fails.
        assert_eq!(
            create(&mut reg, 7, IpcFlags::CREATE | IpcFlags::EXCLUSIVE),
            Err(IpcError::AlreadyExists)
        );
        // Lookup of an unknown key without CREATE fails.
        assert_eq!(create(&mut reg, 8, IpcFlags::empty()), Err(IpcError::NotFound));
    }

    #[test]
    fn table_exhaustion_reports_no_space() {
        let mut reg = Registry::new(2);
        create(&mut reg, IPC_PRIVATE, IpcFlags::empty()).unwrap();
        create(&mut reg, IPC_PRIVATE, IpcFlags::empty()).unwrap();
        assert_eq!(
            create(&mut reg, IPC_PRIVATE, IpcFlags::empty()),
            Err(IpcError::NoSpace)
        );
    }

    #[test]
    fn removed_identifier_is_detectably_stale() {
        let mut reg = Registry::new(2);
        let a = create(&mut reg, 1, IpcFlags::CREATE).unwrap();
        let b = create(&mut reg, 2, IpcFlags::CREATE).unwrap();
        reg.remove(a).unwrap();

        // The removed identifier no longer resolves, the unrelated one does.
        assert_eq!(reg.lookup(a).unwrap_err(), IpcError::InvalidArgument);
        assert!(reg.lookup(b).is_ok());

        // Slot reuse hands out a fresh generation; the stale identifier
        // still fails.
        let c = create(&mut reg, 3, IpcFlags::CREATE).unwrap();
        assert_eq!(c.slot(), a.slot());
        assert_ne!(c, a);
        assert_eq!(reg.lookup(a).unwrap_err(), IpcError::InvalidArgument);
    }

    #[test]
    fn dead_entries_are_invisible_to_key_lookup() {
        let mut reg = Registry::new(2);
        let a = create(&mut reg, 9, IpcFlags::CREATE).unwrap();
        reg.lookup(a).unwrap().alive.store(false, Ordering::Relaxed);

        assert_eq!(reg.lookup(a).unwrap_err(), IpcError::InvalidArgument);
        // The key is free again: CREATE builds a new object in another slot.
        let b = create(&mut reg, 9, IpcFlags::CREATE).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn raw_encoding_roundtrips() {
        let mut reg = Registry::new(2);
        let a = create(&mut reg, 1, IpcFlags::CREATE).unwrap();
        reg.remove(a).unwrap();
        let b = create(&mut reg, 1, IpcFlags::CREATE).unwrap();
        assert_eq!(IpcId::from_raw(b.to_raw()), b);
        assert_ne!(b.to_raw(), a.to_raw());
    }

    #[test]
    fn live_counts_only_alive_entries() {
        let mut reg = Registry::new(4);
        let a = create(&mut reg, 1, IpcFlags::CREATE).unwrap();
        create(&mut reg, 2, IpcFlags::CREATE).unwrap();
        assert_eq!(reg.live(), 2);
        reg.lookup(a).unwrap().alive.store(false, Ordering::Relaxed);
        assert_eq!(reg.live(), 1);
    }
}
