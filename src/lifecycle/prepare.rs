//! Post-bootstrap preparation: agent version convergence and machine
//! enlistment, plus the optional upgrade run after the workload.

use std::collections::{BTreeMap, BTreeSet};

use crate::control::{ControlPlane, ControlPlaneError, UNKNOWN};
use crate::environment::Environment;
use crate::poll::Deadline;

use super::LifecycleTimings;

/// Returns `true` when exactly one known version is reported and it is
/// `target`.
#[must_use]
pub fn versions_converged(versions: &BTreeMap<String, BTreeSet<String>>, target: &str) -> bool {
    versions.len() == 1 && versions.contains_key(target) && !versions.contains_key(UNKNOWN)
}

/// Waits briefly for agents to settle on one version, issues a single
/// `upgrade-juju` when they did not settle on the client's version, then
/// waits for every agent to report it. Returns the target version.
///
/// # Errors
///
/// Returns [`ControlPlaneError`] when a status query, the upgrade or the
/// final wait fails.
pub async fn reconcile_agent_versions<C>(
    client: &C,
    env: &Environment,
    timings: &LifecycleTimings,
) -> Result<String, ControlPlaneError>
where
    C: ControlPlane + ?Sized,
{
    let target = client.matching_agent_version().await?;
    let mut versions = BTreeMap::new();
    let mut deadline = Deadline::new(timings.reconcile, timings.poll_interval);
    while deadline.tick().await.is_some() {
        versions = client
            .get_status(env, timings.status_timeout)
            .await?
            .agent_versions();
        if versions.len() == 1 && !versions.contains_key(UNKNOWN) {
            break;
        }
    }

    if !versions_converged(&versions, &target) {
        let current = versions.keys().cloned().collect::<Vec<_>>().join(", ");
        tracing::warn!(current = %current, target = %target, "agent versions differ; upgrading");
        let args = [String::from("--version"), target.clone()];
        client.juju(env, "upgrade-juju", &args).await?;
    }

    client
        .wait_for_version(env, &target, timings.version_wait)
        .await?;
    Ok(target)
}

/// Enlists each machine with `add-machine ssh:<address>`.
///
/// # Errors
///
/// Returns [`ControlPlaneError`] on the first failing enlistment.
pub async fn add_machines<C>(
    client: &C,
    env: &Environment,
    machines: &[String],
) -> Result<(), ControlPlaneError>
where
    C: ControlPlane + ?Sized,
{
    for machine in machines {
        tracing::info!(machine = %machine, "adding machine");
        let args = [format!("ssh:{machine}")];
        client.juju(env, "add-machine", &args).await?;
    }
    Ok(())
}

/// Runs [`reconcile_agent_versions`] followed by [`add_machines`].
///
/// # Errors
///
/// Returns the first [`ControlPlaneError`] raised.
pub async fn prepare_environment<C>(
    client: &C,
    env: &Environment,
    machines: &[String],
    timings: &LifecycleTimings,
) -> Result<(), ControlPlaneError>
where
    C: ControlPlane + ?Sized,
{
    reconcile_agent_versions(client, env, timings).await?;
    add_machines(client, env, machines).await
}

/// Upgrades a running environment to the client's agent version.
///
/// Prints the current status, points the environment at the testing tools
/// metadata, issues `upgrade-juju`, then waits for every agent to report the
/// client's version and every unit to start. Returns the target version.
///
/// # Errors
///
/// Returns the first [`ControlPlaneError`] raised.
pub async fn assess_upgrade<C>(
    client: &C,
    env: &Environment,
    timings: &LifecycleTimings,
) -> Result<String, ControlPlaneError>
where
    C: ControlPlane + ?Sized,
{
    let status = client.juju(env, "status", &[]).await?;
    tracing::info!(status = %status, "status before upgrade");
    client.set_testing_tools_metadata_url(env).await?;
    client.upgrade_juju(env).await?;

    let target = client.matching_agent_version().await?;
    let limit = timings.upgrade_wait_for(env.provider());
    tracing::info!(target = %target, seconds = limit.as_secs(), "waiting for upgrade");
    client.wait_for_version(env, &target, limit).await?;
    client.wait_for_started(env, limit).await?;
    Ok(target)
}
