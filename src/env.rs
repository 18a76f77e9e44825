//! Ordered environment variables and their late-bound resolution.

use std::borrow::Cow;
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::error::PlayfileError;

/// A single `KEY=VALUE` pair. Order relative to other [`EnvVar`]s is kept by
/// the containing [`EnvVars`], since later values may reference earlier keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Renders this variable as a shell `export` statement, e.g. `export K=V;`,
    /// quoting `value` only where the shell requires it.
    pub fn as_export(&self) -> String {
        format!("export {}={};", self.key, shell_escape::escape(Cow::Borrowed(self.value.as_str())))
    }
}

/// An ordered sequence of [`EnvVar`]s with unique keys.
///
/// Order matters: [`EnvVars::resolve_values`] evaluates each value through a
/// shell with every earlier (already-resolved) variable exported, so a later
/// value may reference an earlier one via `$NAME`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvVars(Vec<EnvVar>);

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates the value of `key` in place, or appends a new entry if it is
    /// not already present.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|v| v.key == key) {
            Some(existing) => existing.value = value,
            None => self.0.push(EnvVar::new(key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find(|v| v.key == key).map(|v| v.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvVar> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Extends `self` with the entries of `other`, `set`-ing each one so
    /// duplicate keys are overridden rather than duplicated.
    pub fn extend(&mut self, other: &EnvVars) {
        for var in other.iter() {
            self.set(var.key.clone(), var.value.clone());
        }
    }

    /// Joins every entry's [`EnvVar::as_export`] into a single prelude string.
    pub fn as_export(&self) -> String {
        self.0.iter().map(EnvVar::as_export).collect()
    }

    /// `KEY=VALUE` pairs suitable for a subprocess's environment table.
    pub fn slice(&self) -> Vec<(String, String)> {
        self.0.iter().map(|v| (v.key.clone(), v.value.clone())).collect()
    }

    /// Evaluates each value through `bash -c`, with every earlier variable
    /// already exported, replacing each value with the captured stdout.
    ///
    /// Fails on the first variable whose shell evaluation exits non-zero,
    /// naming the offending key.
    pub fn resolve_values(&mut self) -> Result<(), PlayfileError> {
        let mut exports = String::new();
        for var in self.0.iter_mut() {
            let script = format!("{exports}echo -n \"{}\";", var.value);
            let output = Command::new("bash")
                .arg("-c")
                .arg(&script)
                .output()
                .map_err(|e| PlayfileError::EnvResolve(var.key.clone(), e.to_string()))?;
            if !output.status.success() {
                return Err(PlayfileError::EnvResolve(
                    var.key.clone(),
                    String::from_utf8_lossy(&output.stderr).into_owned(),
                ));
            }
            let resolved = String::from_utf8_lossy(&output.stdout).into_owned();
            exports.push_str(&EnvVar::new(var.key.clone(), resolved.clone()).as_export());
            var.value = resolved;
        }
        Ok(())
    }
}

impl FromIterator<EnvVar> for EnvVars {
    fn from_iter<T: IntoIterator<Item = EnvVar>>(iter: T) -> Self {
        let mut vars = EnvVars::new();
        for var in iter {
            vars.set(var.key, var.value);
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_updates_in_place() {
        let mut vars = EnvVars::new();
        vars.set("A", "1");
        vars.set("B", "2");
        vars.set("A", "3");
        assert_eq!(vars.len(), 2);
        assert_eq!(vars.get("A"), Some("3"));
        assert_eq!(vars.iter().next().unwrap().key, "A");
    }

    #[test]
    fn as_export_joins_in_order() {
        let mut vars = EnvVars::new();
        vars.set("A", "1");
        vars.set("B", "2");
        assert_eq!(vars.as_export(), "export A=1;export B=2;");
    }

    #[test]
    fn as_export_quotes_values_needing_it() {
        let var = EnvVar::new("A", "hello world");
        assert_eq!(var.as_export(), "export A='hello world';");
    }

    #[test]
    fn resolve_values_sees_earlier_vars() {
        let mut vars = EnvVars::new();
        vars.set("A", "x");
        vars.set("B", "$A-y");
        vars.resolve_values().unwrap();
        assert_eq!(vars.get("A"), Some("x"));
        assert_eq!(vars.get("B"), Some("x-y"));
    }
}
