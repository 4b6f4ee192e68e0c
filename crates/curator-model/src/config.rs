use std::env;
use std::time::Duration;

/// Scheduler configuration.
///
/// Reads `CURATOR_MAX_PARALLEL_TASKS` and `CURATOR_CLEANUP_GRACE_SECS` from
/// the environment, falling back to the defaults below. Unparseable or zero
/// parallelism values are ignored with a warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Upper bound on tasks in the running state at once. Always >= 1.
    pub max_parallel_tasks: usize,
    /// How long a terminal task stays visible before it is evicted.
    pub cleanup_grace: Duration,
}

impl SchedulerConfig {
    pub const DEFAULT_MAX_PARALLEL_TASKS: usize = 2;
    pub const DEFAULT_CLEANUP_GRACE: Duration = Duration::from_secs(300);

    pub const MAX_PARALLEL_ENV: &str = "CURATOR_MAX_PARALLEL_TASKS";
    pub const CLEANUP_GRACE_ENV: &str = "CURATOR_CLEANUP_GRACE_SECS";

    /// Build a config from the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default_values();

        if let Some(raw) = lookup(Self::MAX_PARALLEL_ENV) {
            match raw.trim().parse::<usize>() {
                Ok(n) if n >= 1 => cfg.max_parallel_tasks = n,
                _ => tracing::warn!(
                    var = Self::MAX_PARALLEL_ENV,
                    value = %raw,
                    "ignoring invalid max parallel tasks value"
                ),
            }
        }

        if let Some(raw) = lookup(Self::CLEANUP_GRACE_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => cfg.cleanup_grace = Duration::from_secs(secs),
                Err(_) => tracing::warn!(
                    var = Self::CLEANUP_GRACE_ENV,
                    value = %raw,
                    "ignoring invalid cleanup grace value"
                ),
            }
        }

        cfg
    }

    /// Build a config from explicit values (useful for tests and CLI flags).
    /// A parallelism of zero is raised to one.
    pub fn new(max_parallel_tasks: usize, cleanup_grace: Duration) -> Self {
        Self {
            max_parallel_tasks: max_parallel_tasks.max(1),
            cleanup_grace,
        }
    }

    fn default_values() -> Self {
        Self {
            max_parallel_tasks: Self::DEFAULT_MAX_PARALLEL_TASKS,
            cleanup_grace: Self::DEFAULT_CLEANUP_GRACE,
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = SchedulerConfig::from_lookup(lookup(&[]));
        assert_eq!(cfg.max_parallel_tasks, 2);
        assert_eq!(cfg.cleanup_grace, Duration::from_secs(300));
    }

    #[test]
    fn values_from_lookup() {
        let cfg = SchedulerConfig::from_lookup(lookup(&[
            ("CURATOR_MAX_PARALLEL_TASKS", "4"),
            ("CURATOR_CLEANUP_GRACE_SECS", "10"),
        ]));
        assert_eq!(cfg.max_parallel_tasks, 4);
        assert_eq!(cfg.cleanup_grace, Duration::from_secs(10));
    }

    #[test]
    fn zero_and_garbage_are_ignored() {
        let cfg = SchedulerConfig::from_lookup(lookup(&[
            ("CURATOR_MAX_PARALLEL_TASKS", "0"),
            ("CURATOR_CLEANUP_GRACE_SECS", "soon"),
        ]));
        assert_eq!(cfg.max_parallel_tasks, SchedulerConfig::DEFAULT_MAX_PARALLEL_TASKS);
        assert_eq!(cfg.cleanup_grace, SchedulerConfig::DEFAULT_CLEANUP_GRACE);
    }

    #[test]
    fn explicit_new_raises_zero() {
        let cfg = SchedulerConfig::new(0, Duration::from_secs(1));
        assert_eq!(cfg.max_parallel_tasks, 1);
    }
}
