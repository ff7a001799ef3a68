// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! The in-memory nameserver implementation and its activation helper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::*;

use nprpc::{
    Error, Lifespan, ObjectActivationFlags, ObjectId, ObjectIdPolicy, PoaBuilder, Runtime,
};

use crate::{NameserverServant, NameserverService, NAMESERVER_OID};

/// Name → object-id map. Rebinding a name replaces the previous entry.
#[derive(Default)]
pub struct NameserverImpl {
    objects: Mutex<HashMap<String, ObjectId>>,
}

impl NameserverImpl {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NameserverService for NameserverImpl {
    fn bind(&self, obj: ObjectId, name: &str) {
        debug!("binding object {:#x} as {name:?}", obj.object_id);
        self.objects.lock().unwrap().insert(name.to_string(), obj);
    }

    fn resolve(&self, name: &str) -> Option<ObjectId> {
        let found = self.objects.lock().unwrap().get(name).cloned();
        debug!(
            "resolving {name:?}: {}",
            if found.is_some() { "found" } else { "missing" }
        );
        found
    }
}

/// Activate a nameserver in `rt` at its well-known identity (POA 0,
/// oid 0, user-supplied, persistent) and return the activated object id.
pub fn activate(rt: &Arc<Runtime>) -> Result<ObjectId, Error> {
    let poa = PoaBuilder::new(rt)
        .with_max_objects(1)
        .with_object_id_policy(ObjectIdPolicy::UserSupplied)
        .with_lifespan(Lifespan::Persistent)
        .build();

    poa.activate_object_with_id(
        NAMESERVER_OID as u32,
        Arc::new(NameserverServant::new(NameserverImpl::new())),
        ObjectActivationFlags::ALLOW_TCP | ObjectActivationFlags::ALLOW_WEBSOCKET,
    )
}
