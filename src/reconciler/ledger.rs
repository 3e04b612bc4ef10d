// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::RwLock;

/// The last status write this controller issued for one cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusGenRecord {
    pub uid: String,
    /// Set once a reconcile pass has observed the write come back.
    pub validated: bool,
}

/// Per-cluster status generation bookkeeping, keyed by cluster UID.
///
/// Lives for the controller's lifetime and is never persisted; the
/// generation UID embedded in each cluster's status is the only trace of it
/// outside this process.
#[derive(Debug, Default)]
pub struct StatusGenLedger {
    gens: RwLock<HashMap<String, StatusGenRecord>>,
}

impl StatusGenLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self, key: &str) -> Option<StatusGenRecord> {
        self.gens.read().ok()?.get(key).cloned()
    }

    /// Records a new write; it is unvalidated until observed.
    pub fn write(&self, key: &str, uid: &str) {
        if let Ok(mut gens) = self.gens.write() {
            gens.insert(
                key.to_string(),
                StatusGenRecord {
                    uid: uid.to_string(),
                    validated: false,
                },
            );
        }
    }

    pub fn validate(&self, key: &str) {
        if let Ok(mut gens) = self.gens.write() {
            if let Some(rec) = gens.get_mut(key) {
                rec.validated = true;
            }
        }
    }

    pub fn delete(&self, key: &str) {
        if let Ok(mut gens) = self.gens.write() {
            gens.remove(key);
        }
    }

    pub fn len(&self) -> usize {
        self.gens.read().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a reconcile trigger is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    /// The trigger predates a write this controller already made.
    Stale,
    /// First sight of a brand-new cluster; only its state gets initialized.
    New,
}

impl StatusGenLedger {
    pub fn admit(&self, key: &str, incoming_uid: &str) -> Admission {
        match self.read(key) {
            Some(rec) if rec.uid == incoming_uid => {
                if !rec.validated {
                    self.validate(key);
                }
                Admission::Proceed
            }
            Some(_) => Admission::Stale,
            None if incoming_uid.is_empty() => Admission::New,
            None => {
                // Controller restart: adopt what the cluster says.
                self.write(key, incoming_uid);
                self.validate(key);
                Admission::Proceed
            }
        }
    }
}
