//! Parsing of euca2ools tab-separated output.

use super::InstanceRecord;

const INSTANCE_ROW: &str = "INSTANCE";

/// Extracts `(id, address)` pairs from euca2ools output.
///
/// Only rows whose first field is `INSTANCE` are considered; the id is the
/// second field and the public address the fourth. Rows too short to carry
/// an address yield an empty one, as pending instances do.
#[must_use]
pub fn parse_euca(output: &str) -> Vec<InstanceRecord> {
    output
        .lines()
        .filter_map(|line| {
            let fields = line.split('\t').collect::<Vec<_>>();
            if fields.first() != Some(&INSTANCE_ROW) {
                return None;
            }
            let id = fields.get(1).filter(|value| !value.is_empty())?;
            let address = fields.get(3).copied().unwrap_or_default();
            Some(InstanceRecord::new(*id, address))
        })
        .collect()
}
