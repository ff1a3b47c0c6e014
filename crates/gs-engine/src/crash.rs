//! CrashRecoverer: a JSON-backed hint file marking "a batch died mid-apply"
//! so the next run refuses to proceed silently (spec §4.10 / §6 crash hint
//! file). Mirrors the Python `CrashRecoverer` + `cr_critical_section`
//! context manager with a scoped guard instead of a `with` block.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::{GsError, GsResult};

pub struct CrashRecoverer {
    path: PathBuf,
}

impl CrashRecoverer {
    /// `/tmp/{mode}_deltaupdate_{raw_keyspace}_{transformed_keyspace}_crashreport.err`
    /// (spec §6).
    pub fn new(mode: &str, raw_keyspace: &str, transformed_keyspace: &str) -> Self {
        let filename = format!("{mode}_deltaupdate_{raw_keyspace}_{transformed_keyspace}_crashreport.err");
        CrashRecoverer {
            path: std::env::temp_dir().join(filename),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_in_recovery_mode(&self) -> bool {
        self.path.exists()
    }

    pub fn get_recovery_hint(&self) -> GsResult<Value> {
        let text = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn enter_recovery_mode(&self, hint: &Value) -> GsResult<()> {
        if self.is_in_recovery_mode() {
            return Err(GsError::AlreadyInRecoveryMode(self.path.display().to_string()));
        }
        let text = serde_json::to_string_pretty(hint)?;
        fs::write(&self.path, text)?;
        Ok(())
    }

    pub fn leave_recovery_mode(&self) -> GsResult<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Runs `body`; on `Err`, records a hint built from the error's display
    /// string and re-raises. Replaces the Python context manager's
    /// try/except-and-reraise with an explicit scope.
    pub fn run_critical_section<T>(
        &self,
        extra_hint: Value,
        body: impl FnOnce() -> GsResult<T>,
    ) -> GsResult<T> {
        if self.is_in_recovery_mode() {
            return Err(GsError::AlreadyInRecoveryMode(self.path.display().to_string()));
        }
        match body() {
            Ok(v) => Ok(v),
            Err(e) => {
                let mut hint = extra_hint;
                if let Value::Object(ref mut map) = hint {
                    map.insert("exception".to_string(), Value::String(e.to_string()));
                    map.insert(
                        "exception_type".to_string(),
                        Value::String(format!("{e:?}").split('(').next().unwrap_or("unknown").to_string()),
                    );
                }
                self.enter_recovery_mode(&hint)?;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recoverer() -> CrashRecoverer {
        CrashRecoverer::new("apply-test", "raw_eth", "trf_eth")
    }

    #[test]
    fn round_trips_hint_through_recovery_mode() {
        let cr = recoverer();
        let _ = cr.leave_recovery_mode();
        assert!(!cr.is_in_recovery_mode());

        cr.enter_recovery_mode(&json!({"block": 100})).unwrap();
        assert!(cr.is_in_recovery_mode());
        assert_eq!(cr.get_recovery_hint().unwrap()["block"], 100);

        cr.leave_recovery_mode().unwrap();
        assert!(!cr.is_in_recovery_mode());
    }

    #[test]
    fn double_entry_is_rejected() {
        let cr = recoverer();
        let _ = cr.leave_recovery_mode();
        cr.enter_recovery_mode(&json!({})).unwrap();
        let result = cr.enter_recovery_mode(&json!({}));
        assert!(matches!(result, Err(GsError::AlreadyInRecoveryMode(_))));
        cr.leave_recovery_mode().unwrap();
    }

    #[test]
    fn critical_section_records_hint_on_error() {
        let cr = CrashRecoverer::new("apply-test2", "raw_eth", "trf_eth");
        let _ = cr.leave_recovery_mode();

        let result: GsResult<()> =
            cr.run_critical_section(json!({"block": 42}), || Err(GsError::AssertionFailure("boom".to_string())));
        assert!(result.is_err());
        assert!(cr.is_in_recovery_mode());
        assert_eq!(cr.get_recovery_hint().unwrap()["block"], 42);

        cr.leave_recovery_mode().unwrap();
    }
}
