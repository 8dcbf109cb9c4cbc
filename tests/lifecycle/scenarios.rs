//! BDD scenarios for the session lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{LifecycleContext, lifecycle_context};

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Provision instances for a manual environment"
)]
fn scenario_manual_session(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Start and stop virtual domains"
)]
fn scenario_virtualized_session(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Collect diagnostics when the workload fails"
)]
fn scenario_workload_failure(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Upgrade the environment after the workload"
)]
fn scenario_upgrade(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}

#[scenario(
    path = "tests/features/lifecycle.feature",
    name = "Stop every domain the session touched when a start fails"
)]
fn scenario_acquisition_failure(lifecycle_context: LifecycleContext) {
    let _ = lifecycle_context;
}
