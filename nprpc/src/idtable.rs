// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Lock-free generational slot table.
//!
//! An id packs `(generation << 32) | slot_index`. The free list is a
//! Treiber stack threaded through the slots; its head is a packed
//! `(index, epoch)` word where the epoch increments on every successful
//! pop and push, which defeats ABA on the head. A lookup is valid only
//! while the slot's generation matches the id's; `remove` bumps the
//! generation *before* pushing the slot back so a racing `get` sees
//! either the old generation (still valid) or a newer one (absent), never
//! an unrelated payload.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

struct Slot<T> {
    gen: AtomicU32,
    next: AtomicU32,
    // Payload access is a pointer-sized clone; the spin flag bounds it.
    busy: AtomicBool,
    val: UnsafeCell<Option<T>>,
}

unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

/// Allocation policy chosen at construction: `new` hands out
/// runtime-assigned slots from the free list; `with_user_ids` lets the
/// caller claim specific slot indices and never touches the free list.
pub struct IdTable<T> {
    head: AtomicU64,
    slots: Box<[Slot<T>]>,
    user_ids: bool,
}

#[inline]
const fn index_of(id: u64) -> u32 {
    (id & 0xFFFF_FFFF) as u32
}

#[inline]
const fn generation_of(id: u64) -> u32 {
    ((id >> 32) & 0xFFFF_FFFF) as u32
}

#[inline]
const fn pack(idx: u32, epoch: u32) -> u64 {
    ((epoch as u64) << 32) | idx as u64
}

impl<T: Clone> IdTable<T> {
    pub fn new(max_size: u32) -> Self {
        Self::build(max_size, false)
    }

    pub fn with_user_ids(max_size: u32) -> Self {
        Self::build(max_size, true)
    }

    fn build(max_size: u32, user_ids: bool) -> Self {
        assert!(max_size > 0);

        let slots: Box<[Slot<T>]> = (0..max_size)
            .map(|i| Slot {
                gen: AtomicU32::new(0),
                next: AtomicU32::new(i + 1),
                busy: AtomicBool::new(false),
                val: UnsafeCell::new(None),
            })
            .collect();

        Self {
            head: AtomicU64::new(pack(0, 0)),
            slots,
            user_ids,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.slots.len() as u32
    }

    fn lock_slot(&self, idx: u32) -> &Slot<T> {
        let slot = &self.slots[idx as usize];
        while slot
            .busy
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        slot
    }

    fn unlock_slot(slot: &Slot<T>) {
        slot.busy.store(false, Ordering::Release);
    }

    /// Pop a free slot, store `val`, and return the encoded id. `None`
    /// when the table is full.
    pub fn add(&self, val: T) -> Option<u64> {
        assert!(!self.user_ids, "table uses caller-chosen ids");

        let mut old = self.head.load(Ordering::Relaxed);
        let idx = loop {
            let idx = index_of(old);
            if idx == self.capacity() {
                return None;
            }
            let next = self.slots[idx as usize].next.load(Ordering::Relaxed);
            let new = pack(next, generation_of(old).wrapping_add(1));
            // acq_rel: acquire the popped slot's link, release our claim.
            match self
                .head
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break idx,
                Err(actual) => old = actual,
            }
        };

        let slot = self.lock_slot(idx);
        let gen = slot.gen.load(Ordering::Relaxed);
        unsafe { *slot.val.get() = Some(val) };
        Self::unlock_slot(slot);

        Some(((gen as u64) << 32) | idx as u64)
    }

    /// Claim a specific slot index (user-supplied id policy). Returns the
    /// encoded id, or `None` if the index is out of range or occupied.
    pub fn claim(&self, idx: u32, val: T) -> Option<u64> {
        assert!(self.user_ids, "table uses runtime-assigned ids");

        if idx >= self.capacity() {
            return None;
        }

        let slot = self.lock_slot(idx);
        let occupied = unsafe { (*slot.val.get()).is_some() };
        if occupied {
            Self::unlock_slot(slot);
            return None;
        }
        let gen = slot.gen.load(Ordering::Relaxed);
        unsafe { *slot.val.get() = Some(val) };
        Self::unlock_slot(slot);

        Some(((gen as u64) << 32) | idx as u64)
    }

    /// Invalidate `id` and recycle its slot. Returns the payload if the id
    /// was current.
    pub fn remove(&self, id: u64) -> Option<T> {
        let idx = index_of(id);
        if idx >= self.capacity() {
            return None;
        }

        let slot = self.lock_slot(idx);
        if slot.gen.load(Ordering::Relaxed) != generation_of(id) {
            Self::unlock_slot(slot);
            return None;
        }

        // Generation bump first: a concurrent get() now misses before the
        // slot can be handed out again.
        slot.gen.fetch_add(1, Ordering::Release);
        let val = unsafe { (*slot.val.get()).take() };
        Self::unlock_slot(slot);

        if !self.user_ids {
            let mut old = self.head.load(Ordering::Relaxed);
            loop {
                self.slots[idx as usize]
                    .next
                    .store(index_of(old), Ordering::Relaxed);
                let new = pack(idx, generation_of(old).wrapping_add(1));
                match self
                    .head
                    .compare_exchange_weak(old, new, Ordering::Release, Ordering::Relaxed)
                {
                    Ok(_) => break,
                    Err(actual) => old = actual,
                }
            }
        }

        val
    }

    /// Look up `id`; absent if the slot was freed or reused since the id
    /// was handed out.
    pub fn get(&self, id: u64) -> Option<T> {
        let idx = index_of(id);
        if idx >= self.capacity() {
            return None;
        }

        if self.slots[idx as usize].gen.load(Ordering::Acquire) != generation_of(id) {
            return None;
        }

        let slot = self.lock_slot(idx);
        let val = if slot.gen.load(Ordering::Relaxed) == generation_of(id) {
            unsafe { (*slot.val.get()).clone() }
        } else {
            None
        };
        Self::unlock_slot(slot);
        val
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_get_remove() {
        let table = IdTable::new(8);
        let id = table.add("hello").unwrap();
        assert_eq!(table.get(id), Some("hello"));
        assert_eq!(table.remove(id), Some("hello"));
        assert_eq!(table.get(id), None);
    }

    #[test]
    fn stale_generation_misses() {
        let table = IdTable::new(2);
        let id = table.add(1u32).unwrap();
        table.remove(id);

        // Reuse of the slot yields a distinct id; the old one stays dead.
        let id2 = table.add(2u32).unwrap();
        assert_ne!(id, id2);
        assert_eq!(table.get(id), None);
        assert_eq!(table.get(id2), Some(2));
    }

    #[test]
    fn overflow_returns_none() {
        let table = IdTable::new(2);
        assert!(table.add(0u8).is_some());
        assert!(table.add(1u8).is_some());
        assert!(table.add(2u8).is_none());
    }

    #[test]
    fn remove_twice_is_noop() {
        let table = IdTable::new(4);
        let id = table.add(5i64).unwrap();
        assert_eq!(table.remove(id), Some(5));
        assert_eq!(table.remove(id), None);
    }

    #[test]
    fn user_supplied_ids_claim_exact_slots() {
        let table = IdTable::with_user_ids(4);
        let id = table.claim(0, "ns").unwrap();
        assert_eq!(id, 0);
        assert_eq!(table.get(0), Some("ns"));

        // Same slot cannot be claimed twice.
        assert!(table.claim(0, "other").is_none());
        assert!(table.claim(4, "oob").is_none());

        table.remove(id);
        assert_eq!(table.get(id), None);
        // Reclaim gets a fresh generation.
        let id2 = table.claim(0, "again").unwrap();
        assert_eq!(index_of(id2), 0);
        assert_ne!(id, id2);
    }

    #[test]
    fn concurrent_add_remove_yields_unique_live_ids() {
        let table = Arc::new(IdTable::new(64));
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                for i in 0..1000u32 {
                    if let Some(id) = table.add(t * 10_000 + i) {
                        assert_eq!(table.get(id), Some(t * 10_000 + i));
                        assert_eq!(table.remove(id), Some(t * 10_000 + i));
                        assert_eq!(table.get(id), None);
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }
    }
}
