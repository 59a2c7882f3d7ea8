//! Request-scoped execution context
//!
//! The force flag lives here instead of in ambient process state. It is read
//! from the environment once, at the CLI boundary, and serialized back into
//! the environment only when spawning a child process.

use std::collections::BTreeMap;

/// Environment variable that carries the force flag into nested invocations
pub const FORCE_ENV_VAR: &str = "GAUNTLET_FORCE";

/// Context threaded through cache lookups and process spawns
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Bypass cache reads; stores still happen
    pub force: bool,
    /// Extra environment for spawned steps
    pub env: BTreeMap<String, String>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `--force` flag and an environment lookup
    ///
    /// The lookup is injected so callers decide where ambient state comes from.
    pub fn from_env_with<F>(force_flag: bool, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_force = lookup(FORCE_ENV_VAR)
            .map(|value| is_truthy(&value))
            .unwrap_or(false);

        Self {
            force: force_flag || env_force,
            env: BTreeMap::new(),
        }
    }

    /// Build from a `--force` flag and the process environment
    pub fn from_process_env(force_flag: bool) -> Self {
        Self::from_env_with(force_flag, |key| std::env::var(key).ok())
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Environment to apply to a spawned child
    ///
    /// The force flag is always written, so a child never inherits a stale
    /// value from the parent's own environment.
    pub fn child_env(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .env
            .iter()
            .filter(|(key, _)| key.as_str() != FORCE_ENV_VAR)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push((
            FORCE_ENV_VAR.to_string(),
            if self.force { "1" } else { "0" }.to_string(),
        ));
        env
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_force_from_env() {
        let ctx = ExecutionContext::from_env_with(false, |key| {
            (key == FORCE_ENV_VAR).then(|| "true".to_string())
        });
        assert!(ctx.force);
    }

    #[test]
    fn test_force_flag_wins_over_unset_env() {
        let ctx = ExecutionContext::from_env_with(true, |_| None);
        assert!(ctx.force);

        let ctx = ExecutionContext::from_env_with(false, |_| Some("0".to_string()));
        assert!(!ctx.force);
    }

    #[test]
    fn test_child_env_propagates_force() {
        let ctx = ExecutionContext::new()
            .with_force(true)
            .with_env(FORCE_ENV_VAR, "0")
            .with_env("CI", "1");
        let env = ctx.child_env();

        assert!(env.contains(&(FORCE_ENV_VAR.to_string(), "1".to_string())));
        assert!(env.contains(&("CI".to_string(), "1".to_string())));
        assert_eq!(env.iter().filter(|(k, _)| k == FORCE_ENV_VAR).count(), 1);
    }
}
