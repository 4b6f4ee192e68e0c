//! Wiring of task kinds to units of work.

use tracing::info;

use curator_core::unit::{LibraryScanFactory, UnitRegistry};
use curator_core::worker::CommandWorkerFactory;

use crate::config::WorkerSpec;

/// Build the unit registry: the built-in library scan, then one subprocess
/// worker per configured `[workers.<kind>]` section. A configured worker
/// replaces the built-in unit for its kind.
pub fn build_units(workers: &[WorkerSpec]) -> UnitRegistry {
    let mut units = UnitRegistry::new();
    units.register(LibraryScanFactory);

    for worker in workers {
        let replaced = units.register(CommandWorkerFactory::new(
            worker.kind,
            worker.command.clone(),
            worker.args.clone(),
        ));
        info!(
            kind = %worker.kind,
            command = %worker.command,
            replaced_builtin = replaced.is_some(),
            "registered subprocess worker"
        );
    }

    units
}

#[cfg(test)]
mod tests {
    use super::*;
    use curator_core::unit::TaskWork;
    use curator_core::TaskRequest;
    use curator_model::TaskKind;
    use serde_json::json;

    #[test]
    fn builtin_scan_is_always_present() {
        let units = build_units(&[]);
        assert_eq!(units.kinds(), vec![TaskKind::LibraryScan]);
    }

    #[test]
    fn configured_worker_replaces_builtin() {
        let units = build_units(&[
            WorkerSpec {
                kind: TaskKind::LibraryScan,
                command: "scan-worker".to_owned(),
                args: vec![],
            },
            WorkerSpec {
                kind: TaskKind::MediaAnalysis,
                command: "probe".to_owned(),
                args: vec!["--json".to_owned()],
            },
        ]);
        assert_eq!(units.len(), 2);

        let request = TaskRequest::new(TaskKind::LibraryScan).with_params(json!({"paths": ["/m"]}));
        let work = units.get(TaskKind::LibraryScan).unwrap().build(&request).unwrap();
        assert!(matches!(work, TaskWork::Isolated(_)));
    }
}
