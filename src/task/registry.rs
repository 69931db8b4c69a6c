//! Registry of job kinds.
//!
//! Maps the `kind` string stored in a [`TaskRecord`](super::TaskRecord) back
//! to a decoder for the concrete job type, and builds tasks from the
//! `kind:{json}` / `kind:[json]` notation used on the command line.

use std::collections::HashMap;

use serde_json::Value;

use super::job::{DynJob, Job};
use super::Task;
use crate::error::RegistryError;

type Decoder = fn(Value) -> Result<Box<dyn DynJob>, serde_json::Error>;

fn decode_job<J: Job>(value: Value) -> Result<Box<dyn DynJob>, serde_json::Error> {
    let job: J = serde_json::from_value(value)?;
    Ok(Box::new(job))
}

/// Known job kinds.
#[derive(Clone, Default)]
pub struct JobRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the job kinds shipped in [`crate::jobs`].
    pub fn with_builtin_jobs() -> Self {
        crate::jobs::builtin(Self::new())
    }

    /// Registers a job kind.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateKind` if the kind is already taken.
    pub fn register<J: Job>(&mut self) -> Result<(), RegistryError> {
        if self.decoders.contains_key(J::KIND) {
            return Err(RegistryError::DuplicateKind(J::KIND.to_string()));
        }
        self.decoders.insert(J::KIND, decode_job::<J>);
        Ok(())
    }

    /// Builder form of [`register`](Self::register); a repeated kind replaces
    /// the earlier entry.
    pub fn with_job<J: Job>(mut self) -> Self {
        self.decoders.insert(J::KIND, decode_job::<J>);
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }

    /// Registered kinds, sorted.
    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.decoders.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Decodes a stored payload into a job.
    pub fn decode(&self, kind: &str, payload: Value) -> Result<Box<dyn DynJob>, RegistryError> {
        let decoder = self
            .decoders
            .get(kind)
            .ok_or_else(|| RegistryError::UnknownKind(kind.to_string()))?;
        decoder(payload).map_err(|e| RegistryError::InvalidArguments {
            kind: kind.to_string(),
            message: e.to_string(),
        })
    }

    /// Builds a job from user arguments.
    ///
    /// An object maps onto named fields, an array onto fields in declaration
    /// order, and `null` means "all defaults".
    pub fn instantiate(&self, kind: &str, args: Value) -> Result<Box<dyn DynJob>, RegistryError> {
        match args {
            Value::Null => self.decode(kind, Value::Object(Default::default())),
            Value::Object(_) | Value::Array(_) => self.decode(kind, args),
            other => Err(RegistryError::InvalidArguments {
                kind: kind.to_string(),
                message: format!("expected a JSON object or array, got {}", other),
            }),
        }
    }

    /// Parses `kind`, `kind:{...}` or `kind:[...]` into a task.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let registry = JobRegistry::with_builtin_jobs();
    /// let task = registry.hydrate(r#"sum:{"values":[1,2,3]}"#)?;
    /// ```
    pub fn hydrate(&self, spec: &str) -> Result<Task, RegistryError> {
        let spec = spec.trim();
        let (kind, args) = match spec.split_once(':') {
            Some((kind, raw)) => (kind.trim(), serde_json::from_str(raw)?),
            None => (spec, Value::Null),
        };
        if kind.is_empty() {
            return Err(RegistryError::InvalidArguments {
                kind: spec.to_string(),
                message: "missing job kind".to_string(),
            });
        }
        Ok(Task::from_dyn(self.instantiate(kind, args)?))
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Echo, Sum};

    #[test]
    fn test_register_rejects_duplicates() {
        let mut registry = JobRegistry::new();
        registry.register::<Echo>().unwrap();
        let err = registry.register::<Echo>().unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateKind(kind) if kind == "echo"));
    }

    #[test]
    fn test_unknown_kind() {
        let registry = JobRegistry::new();
        let err = registry.decode("nope", Value::Null).err().unwrap();
        assert!(matches!(err, RegistryError::UnknownKind(_)));
    }

    #[test]
    fn test_hydrate_named_fields() {
        let registry = JobRegistry::with_builtin_jobs();
        let task = registry.hydrate(r#"sum:{"values":[1,2,3]}"#).unwrap();
        assert_eq!(task.kind(), "sum");
        assert_eq!(task.job::<Sum>().unwrap().values, vec![1, 2, 3]);
    }

    #[test]
    fn test_hydrate_positional_fields() {
        let registry = JobRegistry::with_builtin_jobs();
        let task = registry.hydrate(r#"echo:["hello"]"#).unwrap();
        assert_eq!(task.job::<Echo>().unwrap().message, "hello");
    }

    #[test]
    fn test_hydrate_bare_kind_uses_defaults() {
        let registry = JobRegistry::with_builtin_jobs();
        let task = registry.hydrate("echo").unwrap();
        assert_eq!(task.job::<Echo>().unwrap().message, "");
    }

    #[test]
    fn test_hydrate_rejects_scalars() {
        let registry = JobRegistry::with_builtin_jobs();
        let err = registry.hydrate("echo:42").unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArguments { .. }));
    }

    #[test]
    fn test_kinds_sorted() {
        let registry = JobRegistry::with_builtin_jobs();
        assert_eq!(registry.kinds(), vec!["echo", "fail", "sleep", "sum"]);
    }
}
