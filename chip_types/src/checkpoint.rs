//! Resumable stages.
//!
//! A stage that finished for an entity leaves a marker file in its output
//! directory. The marker holds a snapshot of the entity's mutable fields, so a
//! later run restores the entity instead of redoing the work.

use crate::errors::PipelineError;
use anyhow::{Context, Result};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;

/// Name of the marker file written into a completed stage directory.
pub const CHECKPOINT_FILENAME: &str = "checkpoint.json";

const CHECKPOINT_VERSION: u32 = 1;

// Restores mutate object graphs reachable from several concurrent units.
static RESTORE_LOCK: Mutex<()> = Mutex::new(());

/// An entity whose progress can be saved to and restored from a marker.
pub trait Checkpointable {
    /// Serializable form of the mutable fields.
    type State: Serialize + DeserializeOwned;

    /// Capture the current mutable fields.
    fn snapshot(&self) -> Self::State;

    /// Merge a previously captured state onto this entity.
    fn restore(&mut self, state: Self::State);
}

/// Field-by-field merge of a restored value onto a live one.
pub trait Merge {
    fn merge(&mut self, restored: Self);
}

/// Merge onto an existing value, or adopt the restored value if there is none.
/// A restored `None` leaves the live value alone.
pub fn merge_option<T: Merge>(live: &mut Option<T>, restored: Option<T>) {
    match (live.as_mut(), restored) {
        (Some(current), Some(r)) => current.merge(r),
        (None, Some(r)) => *live = Some(r),
        (_, None) => {}
    }
}

/// Positional merge: overlapping elements are merged, surplus restored
/// elements are appended.
pub fn merge_list<T: Merge>(live: &mut Vec<T>, restored: Vec<T>) {
    let mut restored = restored.into_iter();
    for current in live.iter_mut() {
        match restored.next() {
            Some(r) => current.merge(r),
            None => break,
        }
    }
    live.extend(restored);
}

/// Overwrite `live` only when something was restored.
pub fn replace_if_some<T>(live: &mut Option<T>, restored: Option<T>) {
    if restored.is_some() {
        *live = restored;
    }
}

#[derive(Serialize, Deserialize)]
struct Marker<S> {
    version: u32,
    state: S,
}

fn read_marker<S: DeserializeOwned>(path: &Path) -> Result<Option<S>> {
    if !path.is_file() {
        return Ok(None);
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading checkpoint {}", path.display()))?;
    let raw: Marker<serde_json::Value> = serde_json::from_str(&text)
        .with_context(|| format!("parsing checkpoint {}", path.display()))?;
    if raw.version != CHECKPOINT_VERSION {
        warn!(
            "ignoring checkpoint {} with version {} (expected {CHECKPOINT_VERSION})",
            path.display(),
            raw.version
        );
        return Ok(None);
    }
    let state = serde_json::from_value(raw.state)
        .with_context(|| format!("decoding checkpoint state in {}", path.display()))?;
    Ok(Some(state))
}

fn write_marker<S: Serialize>(dir: &Path, state: &S) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating checkpoint in {}", dir.display()))?;
    let marker = Marker {
        version: CHECKPOINT_VERSION,
        state,
    };
    serde_json::to_writer_pretty(&mut tmp, &marker)?;
    let path = dir.join(CHECKPOINT_FILENAME);
    tmp.persist(&path)
        .with_context(|| format!("writing checkpoint {}", path.display()))?;
    Ok(())
}

/// Run `produce` for `entity` in `out_dir` at most once.
///
/// With a marker present the entity is restored from it and `produce` is not
/// called. Otherwise `produce` runs; `Ok(true)` writes the marker, `Ok(false)`
/// leaves none so the stage is retried on the next run. A missing or empty
/// directory is rejected before touching the filesystem.
pub fn checkpointed<E, F>(entity: &mut E, out_dir: Option<&Path>, produce: F) -> Result<bool>
where
    E: Checkpointable + Display + ?Sized,
    F: FnOnce(&Path, &mut E) -> Result<bool>,
{
    let out_dir = match out_dir {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => return Err(PipelineError::MissingOutputDir(entity.to_string()).into()),
    };

    let marker = out_dir.join(CHECKPOINT_FILENAME);
    {
        let _guard = RESTORE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = read_marker::<E::State>(&marker)? {
            entity.restore(state);
            debug!("{entity}: restored from {}", marker.display());
            return Ok(true);
        }
    }

    fs::create_dir_all(out_dir)
        .with_context(|| format!("creating {}", out_dir.display()))?;
    if !produce(out_dir, entity)? {
        return Ok(false);
    }
    write_marker(out_dir, &entity.snapshot())?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use pretty_assertions::assert_eq;
    use std::cell::Cell;
    use std::fmt;
    use std::path::PathBuf;

    #[derive(Debug, Default)]
    struct Counter {
        value: Option<u32>,
        history: Vec<String>,
    }

    #[derive(Serialize, Deserialize)]
    struct CounterState {
        value: Option<u32>,
        history: Vec<String>,
    }

    impl fmt::Display for Counter {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "counter")
        }
    }

    impl Checkpointable for Counter {
        type State = CounterState;
        fn snapshot(&self) -> CounterState {
            CounterState {
                value: self.value,
                history: self.history.clone(),
            }
        }
        fn restore(&mut self, state: CounterState) {
            replace_if_some(&mut self.value, state.value);
            self.history.extend(state.history);
        }
    }

    #[test]
    fn second_call_restores_without_producing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let calls = Cell::new(0);

        let mut first = Counter::default();
        let ok = checkpointed(&mut first, Some(dir.path()), |_, c| {
            calls.set(calls.get() + 1);
            c.value = Some(7);
            c.history.push("ran".into());
            Ok(true)
        })?;
        assert!(ok);
        assert!(dir.path().join(CHECKPOINT_FILENAME).is_file());

        let mut second = Counter::default();
        let ok = checkpointed(&mut second, Some(dir.path()), |_, _| {
            calls.set(calls.get() + 1);
            Ok(true)
        })?;
        assert!(ok);
        assert_eq!(calls.get(), 1);
        assert_eq!(second.value, Some(7));
        assert_eq!(second.history, vec!["ran".to_string()]);
        Ok(())
    }

    #[test]
    fn falsy_produce_leaves_no_marker() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut c = Counter::default();
        assert!(!checkpointed(&mut c, Some(dir.path()), |_, _| Ok(false))?);
        assert!(!dir.path().join(CHECKPOINT_FILENAME).exists());

        // retried on the next attempt
        assert!(checkpointed(&mut c, Some(dir.path()), |_, _| Ok(true))?);
        assert!(dir.path().join(CHECKPOINT_FILENAME).exists());
        Ok(())
    }

    #[test]
    fn failing_produce_propagates() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut c = Counter::default();
        let r = checkpointed(&mut c, Some(dir.path()), |_, _| bail!("tool crashed"));
        assert!(r.is_err());
        assert!(!dir.path().join(CHECKPOINT_FILENAME).exists());
        Ok(())
    }

    #[test]
    fn missing_dir_is_rejected_without_work() {
        let calls = Cell::new(0);
        let mut c = Counter::default();
        for dir in [None, Some(PathBuf::new())] {
            let r = checkpointed(&mut c, dir.as_deref(), |_, _| {
                calls.set(calls.get() + 1);
                Ok(true)
            });
            let err = r.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::MissingOutputDir(_))
            ));
        }
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn unknown_version_reruns_stage() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join(CHECKPOINT_FILENAME),
            r#"{"version": 99, "state": {"value": 1, "history": []}}"#,
        )?;
        let mut c = Counter::default();
        let ok = checkpointed(&mut c, Some(dir.path()), |_, c| {
            c.value = Some(3);
            Ok(true)
        })?;
        assert!(ok);
        assert_eq!(c.value, Some(3));
        Ok(())
    }

    #[derive(Debug, PartialEq)]
    struct Item(u32, Option<u32>);

    impl Merge for Item {
        fn merge(&mut self, restored: Self) {
            self.0 = restored.0;
            replace_if_some(&mut self.1, restored.1);
        }
    }

    #[test]
    fn list_merge_is_positional_and_extends() {
        let mut live = vec![Item(1, Some(10)), Item(2, None)];
        merge_list(&mut live, vec![Item(5, None), Item(6, Some(60)), Item(7, None)]);
        assert_eq!(live, vec![Item(5, Some(10)), Item(6, Some(60)), Item(7, None)]);

        let mut live = vec![Item(1, None), Item(2, None)];
        merge_list(&mut live, vec![Item(9, None)]);
        assert_eq!(live, vec![Item(9, None), Item(2, None)]);
    }

    #[test]
    fn option_merge_never_erases() {
        let mut live = Some(Item(1, Some(1)));
        merge_option(&mut live, None);
        assert_eq!(live, Some(Item(1, Some(1))));
        let mut empty = None;
        merge_option(&mut empty, Some(Item(3, None)));
        assert_eq!(empty, Some(Item(3, None)));
    }
}
