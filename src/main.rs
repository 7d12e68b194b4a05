// Copyright the hydria authors
// Licensed under the MIT and Apache-2.0 licenses.

pub use hydria::*;

#[cfg(test)]
mod test;

// We have these tests external from the crate for two reasons:
//
//  1. to make sure the public API is usable without accidentally relying on
//     crate-level-visibility stuff.
//
//  2. to exercise whole-transaction scenarios -- the interleaving of batches,
//     readiness, heartbeats and commit -- rather than single modules.

#[test]
fn read_only_commit() {
    test::read_only_commit();
}

#[test]
fn prepare_queues_until_ready() {
    test::prepare_queues_until_ready();
}

#[test]
fn second_prepare_carries_id_only() {
    test::second_prepare_carries_id_only();
}

#[test]
fn retriable_conflict_aborts() {
    test::retriable_conflict_aborts();
}

#[test]
fn child_roundtrip() {
    test::child_roundtrip();
}

#[test]
fn waiters_fire_in_order() {
    test::waiters_fire_in_order();
}

#[test]
fn heartbeat_retries_transient_failures() {
    test::heartbeat_retries_transient_failures();
}

#[test]
fn heartbeat_expiry_surfaces_in_commit() {
    test::heartbeat_expiry_surfaces_in_commit();
}

#[test]
fn restart_after_conflict() {
    test::restart_after_conflict();
}

#[test]
fn terminal_states_reject_reuse() {
    test::terminal_states_reject_reuse();
}

#[test]
fn resolution_failure_fails_waiters() {
    test::resolution_failure_fails_waiters();
}

#[test]
fn serializable_defers_read_time() {
    test::serializable_defers_read_time();
}

pub fn main() {
    println!("please run `cargo test` instead");
}
