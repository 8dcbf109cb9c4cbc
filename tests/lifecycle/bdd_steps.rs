//! BDD step definitions for the session lifecycle.

use rstest_bdd_macros::{given, then, when};
use stackrun::test_support::{ControlCall, DomainCall, ScriptedWorkload};
use stackrun::{InstanceRecord, LifecyclePhase};
use tokio::runtime::Builder;

use super::test_helpers::{LifecycleContext, SessionSummary, domain_ref};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a \"{provider}\" environment")]
fn environment_of_type(
    mut lifecycle_context: LifecycleContext,
    provider: String,
) -> LifecycleContext {
    lifecycle_context.provider = provider;
    lifecycle_context
}

#[given("the batch service starts three instances")]
fn batch_starts_three_instances(lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.instances.push_run(vec![
        InstanceRecord::new("i-1", "10.0.0.1"),
        InstanceRecord::new("i-2", "10.0.0.2"),
        InstanceRecord::new("i-3", "10.0.0.3"),
    ]);
    lifecycle_context
}

fn with_domain(
    mut lifecycle_context: LifecycleContext,
    name: &str,
    running: bool,
) -> LifecycleContext {
    lifecycle_context.domains = lifecycle_context.domains.clone().with_domain(name, running);
    lifecycle_context.machines.push(domain_ref(name));
    lifecycle_context
}

#[given("domain \"{name}\" is already running")]
fn domain_running(lifecycle_context: LifecycleContext, name: String) -> LifecycleContext {
    with_domain(lifecycle_context, &name, true)
}

#[given("domain \"{name}\" is shut off")]
fn domain_shut_off(lifecycle_context: LifecycleContext, name: String) -> LifecycleContext {
    with_domain(lifecycle_context, &name, false)
}

#[given("domain \"{name}\" fails to start")]
fn domain_fails_to_start(lifecycle_context: LifecycleContext, name: String) -> LifecycleContext {
    lifecycle_context.domains.fail_start(&name);
    lifecycle_context
}

#[given("bootstrap writes an environment descriptor")]
fn bootstrap_writes_descriptor(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.control = lifecycle_context.control.clone().writing_descriptor();
    lifecycle_context
}

#[given("the workload fails with \"{message}\"")]
fn workload_fails(mut lifecycle_context: LifecycleContext, message: String) -> LifecycleContext {
    lifecycle_context.workload =
        ScriptedWorkload::failing(&message).with_log(lifecycle_context.log.clone());
    lifecycle_context
}

#[given("the session requests an upgrade")]
fn upgrade_requested(mut lifecycle_context: LifecycleContext) -> LifecycleContext {
    lifecycle_context.upgrade = true;
    lifecycle_context.workload = lifecycle_context
        .workload
        .clone()
        .with_log(lifecycle_context.log.clone());
    lifecycle_context
}

#[when("the session runs")]
fn run_session(mut lifecycle_context: LifecycleContext) -> Result<LifecycleContext, StepError> {
    let runtime = Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let lifecycle = lifecycle_context.lifecycle();
    let environment = lifecycle_context.environment();
    let request = lifecycle_context.request();
    let workload = lifecycle_context.workload.clone();
    let outcome =
        runtime.block_on(async move { lifecycle.run(environment, &request, &workload).await });
    lifecycle_context.summary = Some(SessionSummary::from(&outcome));
    Ok(lifecycle_context)
}

fn summary(lifecycle_context: &LifecycleContext) -> Result<&SessionSummary, StepError> {
    lifecycle_context
        .summary
        .as_ref()
        .ok_or_else(|| StepError::Assertion(String::from("session has not run")))
}

fn expect(condition: bool, message: impl FnOnce() -> String) -> Result<(), StepError> {
    if condition {
        Ok(())
    } else {
        Err(StepError::Assertion(message()))
    }
}

#[then("the session succeeds")]
fn session_succeeds(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let result = summary(lifecycle_context)?;
    expect(
        result.error_kind.is_none()
            && result.exit_code == 0
            && result.phase == LifecyclePhase::Done,
        || format!("expected success, got {result:?}"),
    )
}

#[then("the session fails with \"{kind}\"")]
fn session_fails_with(lifecycle_context: &LifecycleContext, kind: String) -> Result<(), StepError> {
    let result = summary(lifecycle_context)?;
    expect(
        result.error_kind == Some(kind.as_str()) && result.exit_code == 1,
        || format!("expected {kind} failure, got {result:?}"),
    )
}

#[then("{count:usize} machines are added to the environment")]
fn machines_added(lifecycle_context: &LifecycleContext, count: usize) -> Result<(), StepError> {
    let added = lifecycle_context
        .control
        .juju_commands()
        .into_iter()
        .filter(|(command, _)| command == "add-machine")
        .count();
    expect(added == count, || {
        format!("expected {count} add-machine calls, got {added}")
    })
}

#[then("the environment is destroyed before the instances are terminated")]
fn destroyed_before_terminated(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let destroy = lifecycle_context.position("control.destroy_environment");
    let terminate = lifecycle_context.position("batch.terminate");
    expect(destroy < terminate, || {
        format!("destroy at {destroy}, terminate at {terminate}")
    })?;
    let terminations = lifecycle_context.instances.terminations();
    expect(terminations.len() == 1, || {
        format!("expected one termination batch, got {terminations:?}")
    })
}

#[then("the agents are upgraded after the workload")]
fn upgraded_after_workload(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let workload = lifecycle_context.position("workload.run");
    let upgrade = lifecycle_context.position("control.upgrade_juju");
    let started = lifecycle_context.position("control.wait_for_started");
    expect(workload < upgrade && upgrade < started, || {
        format!("workload at {workload}, upgrade at {upgrade}, started at {started}")
    })
}

#[then("only domain \"{name}\" was started")]
fn only_domain_started(
    lifecycle_context: &LifecycleContext,
    name: String,
) -> Result<(), StepError> {
    let starts = lifecycle_context.domains.starts();
    expect(starts == vec![name.clone()], || {
        format!("expected only {name} to start, got {starts:?}")
    })
}

#[then("domains \"{first}\" and \"{second}\" are stopped after the environment is destroyed")]
fn domains_stopped(
    lifecycle_context: &LifecycleContext,
    first: String,
    second: String,
) -> Result<(), StepError> {
    let stops = lifecycle_context.domains.stops();
    expect(stops == vec![first.clone(), second.clone()], || {
        format!("expected {first} and {second} to stop, got {stops:?}")
    })?;
    let destroy = lifecycle_context.position("control.destroy_environment");
    let stop = lifecycle_context.position("domain.stop");
    expect(destroy < stop, || {
        format!("destroy at {destroy}, first stop at {stop}")
    })
}

#[then("domains \"{first}\" and \"{second}\" are both stopped")]
fn domains_stopped_in_order(
    lifecycle_context: &LifecycleContext,
    first: String,
    second: String,
) -> Result<(), StepError> {
    let stops = lifecycle_context.domains.stops();
    expect(stops == vec![first.clone(), second.clone()], || {
        format!("expected {first} and {second} to stop, got {stops:?}")
    })
}

#[then("domain \"{name}\" was never touched")]
fn domain_untouched(lifecycle_context: &LifecycleContext, name: String) -> Result<(), StepError> {
    let calls = lifecycle_context.domains.calls();
    let touched = calls.iter().any(|call| match call {
        DomainCall::Verify(domain) | DomainCall::Start(domain) | DomainCall::Stop(domain) => {
            domain == &name
        }
    });
    expect(!touched, || format!("{name} was touched: {calls:?}"))
}

#[then("diagnostics were collected")]
fn diagnostics_collected(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let result = summary(lifecycle_context)?;
    expect(
        result.diagnostics && result.phase == LifecyclePhase::AbortedWithDiagnostics,
        || format!("expected diagnostics, got {result:?}"),
    )
}

#[then("the environment is destroyed once")]
fn destroyed_once(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let destroys = lifecycle_context
        .control
        .count(|call| matches!(call, ControlCall::DestroyEnvironment(_)));
    expect(destroys == 1, || format!("expected one destroy, got {destroys}"))
}

#[then("the control plane was never called")]
fn control_plane_untouched(lifecycle_context: &LifecycleContext) -> Result<(), StepError> {
    let calls = lifecycle_context.control.calls();
    expect(calls.is_empty(), || format!("unexpected control calls: {calls:?}"))
}
