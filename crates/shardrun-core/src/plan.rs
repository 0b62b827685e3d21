//! Pairing shard hosts with their commands.

use crate::{CommandBuilder, CommandTemplate, ConfigError, HostDirectory, RunMode, RunSpec, Task};

/// Build one task per shard from the first `shard_count` directory hosts.
///
/// Every config problem surfaces here, before anything is dispatched.
pub fn plan_tasks(
    directory: &HostDirectory,
    spec: &RunSpec,
    template: &CommandTemplate,
) -> Result<Vec<Task>, ConfigError> {
    let total = spec.shard_count();
    let hosts = directory.shard_hosts(total)?;

    let peers = match spec.mode() {
        RunMode::Execute => directory.peer_addresses(total)?,
        RunMode::GitUpdate => Vec::new(),
    };
    let builder = CommandBuilder::new(template.clone(), peers);

    hosts
        .iter()
        .enumerate()
        .map(|(index, host)| {
            let command = builder.build(spec, index, total)?;
            Ok(Task::new(index, host.clone(), command))
        })
        .collect()
}
