//! Parsed `juju status --format json` output.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use super::ControlPlaneError;

/// Version or state reported when an agent has not reported one.
pub const UNKNOWN: &str = "unknown";

const STARTED: &str = "started";

/// Per-machine entry of the status document.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
pub struct MachineStatus {
    /// Public address of the machine.
    #[serde(rename = "dns-name", default)]
    pub dns_name: Option<String>,
    /// Version of the machine agent.
    #[serde(rename = "agent-version", default)]
    pub agent_version: Option<String>,
    /// State of the machine agent.
    #[serde(rename = "agent-state", default)]
    pub agent_state: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct UnitStatus {
    #[serde(rename = "agent-version", default)]
    agent_version: Option<String>,
    #[serde(rename = "agent-state", default)]
    agent_state: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct ServiceStatus {
    #[serde(default)]
    units: BTreeMap<String, UnitStatus>,
}

/// Environment status: machines by id, services left unparsed.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Status {
    /// Machines keyed by machine id.
    #[serde(default)]
    pub machines: BTreeMap<String, MachineStatus>,
    /// Service section as reported by the client.
    #[serde(default)]
    pub services: serde_json::Value,
}

impl Status {
    /// Parses a JSON status document.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError::Status`] when the document is malformed.
    pub fn parse(text: &str) -> Result<Self, ControlPlaneError> {
        serde_json::from_str(text).map_err(|err| ControlPlaneError::Status(err.to_string()))
    }

    /// Address of machine `id`, if it has one.
    #[must_use]
    pub fn machine_address(&self, id: &str) -> Option<&str> {
        self.machines
            .get(id)
            .and_then(|machine| machine.dns_name.as_deref())
            .filter(|address| !address.is_empty())
    }

    /// `(id, address)` for every machine reporting an address.
    #[must_use]
    pub fn machine_addresses(&self) -> BTreeMap<String, String> {
        self.machines
            .keys()
            .filter_map(|id| {
                self.machine_address(id)
                    .map(|address| (id.clone(), address.to_owned()))
            })
            .collect()
    }

    fn units(&self) -> Vec<(String, UnitStatus)> {
        let Ok(services) =
            serde_json::from_value::<BTreeMap<String, ServiceStatus>>(self.services.clone())
        else {
            return Vec::new();
        };
        services
            .into_values()
            .flat_map(|service| service.units)
            .collect()
    }

    /// Agents grouped by reported version; agents with no version are
    /// grouped under [`UNKNOWN`]. Covers machine and unit agents.
    #[must_use]
    pub fn agent_versions(&self) -> BTreeMap<String, BTreeSet<String>> {
        let machines = self.machines.iter().map(|(id, machine)| {
            (format!("machine-{id}"), machine.agent_version.clone())
        });
        let units = self
            .units()
            .into_iter()
            .map(|(name, unit)| (name, unit.agent_version));
        group_by(machines.chain(units))
    }

    /// Agents grouped by reported state, as for [`Self::agent_versions`].
    #[must_use]
    pub fn agent_states(&self) -> BTreeMap<String, BTreeSet<String>> {
        let machines = self.machines.iter().map(|(id, machine)| {
            (format!("machine-{id}"), machine.agent_state.clone())
        });
        let units = self
            .units()
            .into_iter()
            .map(|(name, unit)| (name, unit.agent_state));
        group_by(machines.chain(units))
    }

    /// Returns `true` when every agent reports `started`.
    #[must_use]
    pub fn all_started(&self) -> bool {
        self.agent_states()
            .keys()
            .all(|state| state == STARTED)
    }
}

fn group_by(
    agents: impl Iterator<Item = (String, Option<String>)>,
) -> BTreeMap<String, BTreeSet<String>> {
    let mut grouped = BTreeMap::<String, BTreeSet<String>>::new();
    for (agent, value) in agents {
        let key = value
            .filter(|text| !text.is_empty())
            .unwrap_or_else(|| UNKNOWN.to_owned());
        grouped.entry(key).or_default().insert(agent);
    }
    grouped
}
