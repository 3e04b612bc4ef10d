// Copyright 2022 VMware, Inc.
// SPDX-License-Identifier: MIT
// Tests for status generation admission
use crate::reconciler::{Admission, StatusGenLedger, StatusGenRecord};

#[test]
pub fn test_admit_new_cluster() {
    let ledger = StatusGenLedger::new();
    assert_eq!(ledger.admit("uid-1", ""), Admission::New);
    assert!(ledger.is_empty());
}

#[test]
pub fn test_admit_after_restart() {
    let ledger = StatusGenLedger::new();
    assert_eq!(ledger.admit("uid-1", "gen-a"), Admission::Proceed);
    assert_eq!(
        ledger.read("uid-1"),
        Some(StatusGenRecord {
            uid: "gen-a".to_string(),
            validated: true
        })
    );
}

#[test]
pub fn test_admit_own_write() {
    let ledger = StatusGenLedger::new();
    ledger.write("uid-1", "gen-b");
    assert!(!ledger.read("uid-1").unwrap().validated);
    assert_eq!(ledger.admit("uid-1", "gen-b"), Admission::Proceed);
    assert!(ledger.read("uid-1").unwrap().validated);
    // Replaying the same trigger changes nothing.
    assert_eq!(ledger.admit("uid-1", "gen-b"), Admission::Proceed);
    assert_eq!(ledger.len(), 1);
}

#[test]
pub fn test_admit_stale() {
    let ledger = StatusGenLedger::new();
    ledger.write("uid-1", "gen-c");
    assert_eq!(ledger.admit("uid-1", "gen-b"), Admission::Stale);
    assert_eq!(ledger.admit("uid-1", ""), Admission::Stale);
    assert_eq!(ledger.read("uid-1").unwrap().uid, "gen-c");
}

#[test]
pub fn test_delete() {
    let ledger = StatusGenLedger::new();
    ledger.write("uid-1", "gen-a");
    ledger.write("uid-2", "gen-a");
    ledger.delete("uid-1");
    assert_eq!(ledger.read("uid-1"), None);
    assert_eq!(ledger.len(), 1);
}
