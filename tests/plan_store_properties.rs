// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Plan store properties: atomicity under a concurrent reader, round-trip
//! stability, and status-twin enforcement.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use autoforge::plan::{Plan, PlanStore, PLAN_FILE};
use autoforge::types::{ExecutionPhase, TaskKind, TaskPriority, TaskStatus, XstateState};
use tempfile::TempDir;

/// A reader at any instant sees either the pre-image or a schema-valid
/// post-image, never a partial write.
#[test]
fn concurrent_reader_never_sees_partial_write() {
    let dir = TempDir::new().unwrap();
    let store = PlanStore::new(dir.path());
    store
        .save(&Plan::queued(TaskKind::Impl, TaskPriority::Normal))
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reader_stop = Arc::clone(&stop);
    let plan_path = dir.path().join(PLAN_FILE);

    let reader = std::thread::spawn(move || {
        let mut reads = 0u32;
        while !reader_stop.load(Ordering::Relaxed) {
            let bytes = std::fs::read(&plan_path).expect("plan must always exist");
            let parsed: serde_json::Value =
                serde_json::from_slice(&bytes).expect("plan must always be valid JSON");
            assert!(parsed.get("status").is_some());
            assert!(parsed.get("xstateState").is_some());
            reads += 1;
        }
        reads
    });

    // Hammer the writer through many status transitions.
    for _ in 0..200 {
        store
            .update_status(
                TaskStatus::InProgress,
                XstateState::Coding,
                ExecutionPhase::Coding,
            )
            .unwrap();
        store
            .update_status(TaskStatus::Queue, XstateState::Backlog, ExecutionPhase::Backlog)
            .unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    let reads = reader.join().unwrap();
    assert!(reads > 0, "reader should have observed the file");
}

/// Writing a plan, reading it, and writing the same object again produces
/// identical bytes.
#[test]
fn write_read_write_is_byte_stable() {
    let dir = TempDir::new().unwrap();
    let store = PlanStore::new(dir.path());

    // Include unknown fields to prove they survive in stable positions.
    let raw = serde_json::json!({
        "status": "queue",
        "xstateState": "backlog",
        "executionPhase": "backlog",
        "kind": "frontend",
        "priority": 1,
        "dependsOn": ["001-base"],
        "uiLayoutHints": {"column": 2},
        "legacyField": "keep",
    });
    std::fs::write(store.path(), serde_json::to_string_pretty(&raw).unwrap()).unwrap();

    let first = store.load().unwrap();
    store.save(&first).unwrap();
    let bytes_one = std::fs::read(store.path()).unwrap();

    let second = store.load().unwrap();
    store.save(&second).unwrap();
    let bytes_two = std::fs::read(store.path()).unwrap();

    assert_eq!(bytes_one, bytes_two);

    let survived = store.load_raw().unwrap();
    assert_eq!(survived["uiLayoutHints"]["column"], 2);
    assert_eq!(survived["legacyField"], "keep");
}

/// The twin fields are only ever written together in permitted pairs.
#[test]
fn status_twin_pairs_enforced() {
    let dir = TempDir::new().unwrap();
    let store = PlanStore::new(dir.path());
    store
        .save(&Plan::queued(TaskKind::Impl, TaskPriority::Normal))
        .unwrap();

    // Every legal transition from the fixed map.
    let legal = [
        (TaskStatus::InProgress, XstateState::Planning, ExecutionPhase::Planning),
        (TaskStatus::InProgress, XstateState::Coding, ExecutionPhase::Coding),
        (TaskStatus::AiReview, XstateState::QaReview, ExecutionPhase::QaReview),
        (TaskStatus::QaFixing, XstateState::QaFixing, ExecutionPhase::QaFixing),
        (
            TaskStatus::HumanReview,
            XstateState::HumanReview,
            ExecutionPhase::Complete,
        ),
        (TaskStatus::Done, XstateState::Done, ExecutionPhase::Complete),
    ];
    for (status, xstate, phase) in legal {
        store.update_status(status, xstate, phase).unwrap();
    }

    // An illegal pair is refused and leaves the previous image intact.
    let before = std::fs::read(store.path()).unwrap();
    let result = store.update_status(
        TaskStatus::Queue,
        XstateState::Done,
        ExecutionPhase::Complete,
    );
    assert!(result.is_err());
    let after = std::fs::read(store.path()).unwrap();
    assert_eq!(before, after);
}

/// An unparsable plan is reported, never overwritten.
#[test]
fn unreadable_plan_is_left_untouched() {
    let dir = TempDir::new().unwrap();
    let store = PlanStore::new(dir.path());
    std::fs::write(store.path(), "{ this is not json").unwrap();

    assert!(store.load().is_err());
    let content = std::fs::read_to_string(store.path()).unwrap();
    assert_eq!(content, "{ this is not json");
}
