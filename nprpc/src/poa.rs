// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The Portable Object Adapter: a fixed-capacity container of activated
//! servants, registered in the process-wide POA vector.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use log::*;

use crate::idtable::IdTable;
use crate::object::{ObjectActivationFlags, ObjectId, Servant};
use crate::runtime::Runtime;
use crate::Error;

/// Who assigns object ids in this POA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectIdPolicy {
    /// Runtime-assigned from the slot table's free list.
    System,
    /// Caller-chosen slot indices (`activate_object_with_id`).
    UserSupplied,
}

/// Whether references outlive this process. `Persistent` is a promise by
/// the application to rebuild the same `(poa_idx, oid)` on restart; the
/// runtime itself stores nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifespan {
    Transient,
    Persistent,
}

#[derive(Clone)]
pub struct ObjectEntry {
    pub servant: Arc<dyn Servant>,
    pub refs: Arc<AtomicU32>,
}

pub struct Poa {
    index: u16,
    policy: ObjectIdPolicy,
    lifespan: Lifespan,
    table: IdTable<ObjectEntry>,
    runtime: Weak<Runtime>,
}

impl Poa {
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn lifespan(&self) -> Lifespan {
        self.lifespan
    }

    pub fn object_id_policy(&self) -> ObjectIdPolicy {
        self.policy
    }

    /// Activate `servant` under a runtime-assigned oid and return its
    /// globally routable identity.
    pub fn activate_object(
        &self,
        servant: Arc<dyn Servant>,
        flags: ObjectActivationFlags,
    ) -> Result<ObjectId, Error> {
        if self.policy != ObjectIdPolicy::System {
            return Err(Error::BadInput);
        }

        let entry = ObjectEntry {
            servant,
            refs: Arc::new(AtomicU32::new(0)),
        };
        let class_id = entry.servant.class_id();
        let oid = self.table.add(entry).ok_or(Error::NoBufferSpace)?;

        self.object_id_for(oid, class_id, flags)
    }

    /// Activate `servant` at the caller-chosen slot `idx`
    /// (`UserSupplied` policy).
    pub fn activate_object_with_id(
        &self,
        idx: u32,
        servant: Arc<dyn Servant>,
        flags: ObjectActivationFlags,
    ) -> Result<ObjectId, Error> {
        if self.policy != ObjectIdPolicy::UserSupplied {
            return Err(Error::BadInput);
        }

        let entry = ObjectEntry {
            servant,
            refs: Arc::new(AtomicU32::new(0)),
        };
        let class_id = entry.servant.class_id();
        let oid = self.table.claim(idx, entry).ok_or(Error::BadInput)?;

        self.object_id_for(oid, class_id, flags)
    }

    fn object_id_for(
        &self,
        oid: u64,
        class_id: &str,
        flags: ObjectActivationFlags,
    ) -> Result<ObjectId, Error> {
        let runtime = self.runtime.upgrade().ok_or(Error::CommFailure)?;

        debug!(
            "activated object {class_id} at poa {} oid {oid:#x}",
            self.index
        );

        Ok(ObjectId {
            object_id: oid,
            poa_idx: self.index,
            flags: flags.0 as u16,
            class_id: class_id.to_string(),
            urls: runtime.advertised_urls(flags),
        })
    }

    /// Destroy the incarnation behind `oid`. The slot's generation bumps,
    /// so outstanding references to the old id observe `ObjectNotExist`.
    pub fn deactivate_object(&self, oid: u64) -> bool {
        self.table.remove(oid).is_some()
    }

    pub fn get_object(&self, oid: u64) -> Option<ObjectEntry> {
        self.table.get(oid)
    }

    pub(crate) fn add_object_reference(&self, oid: u64) -> bool {
        match self.table.get(oid) {
            Some(entry) => {
                entry.refs.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }

    pub(crate) fn release_object_reference(&self, oid: u64) {
        if let Some(entry) = self.table.get(oid) {
            entry.refs.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// How many remote references are currently held on `oid` (across all
    /// sessions).
    pub fn reference_count(&self, oid: u64) -> u32 {
        self.table
            .get(oid)
            .map(|e| e.refs.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Fluent POA construction; the built POA is appended to the runtime's
/// POA vector and lives for the process.
pub struct PoaBuilder {
    runtime: Arc<Runtime>,
    max_objects: u32,
    policy: ObjectIdPolicy,
    lifespan: Lifespan,
}

impl PoaBuilder {
    pub fn new(runtime: &Arc<Runtime>) -> Self {
        Self {
            runtime: Arc::clone(runtime),
            max_objects: 16,
            policy: ObjectIdPolicy::System,
            lifespan: Lifespan::Transient,
        }
    }

    pub fn with_max_objects(mut self, n: u32) -> Self {
        self.max_objects = n;
        self
    }

    pub fn with_object_id_policy(mut self, policy: ObjectIdPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_lifespan(mut self, lifespan: Lifespan) -> Self {
        self.lifespan = lifespan;
        self
    }

    pub fn build(self) -> Arc<Poa> {
        let table = match self.policy {
            ObjectIdPolicy::System => IdTable::new(self.max_objects),
            ObjectIdPolicy::UserSupplied => IdTable::with_user_ids(self.max_objects),
        };

        self.runtime.register_poa(|index| Poa {
            index,
            policy: self.policy,
            lifespan: self.lifespan,
            table,
            runtime: Arc::downgrade(&self.runtime),
        })
    }
}
