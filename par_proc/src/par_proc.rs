use anyhow::Result;
use crossbeam_channel::{unbounded, Receiver};
use crossbeam_utils::thread::{Scope, ScopedJoinHandle};
use log::{debug, warn};
use std::any::Any;
use std::fmt::Display;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Accumulates failure messages from the units of one fan-out call.
/// Units running on different threads push into the same sink.
#[derive(Debug, Default)]
pub struct ErrorSink {
    errors: Mutex<Vec<String>>,
}

impl ErrorSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    // A unit that panicked while holding the lock has already been reported,
    // the messages themselves are still intact.
    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        self.errors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one message.
    pub fn push(&self, msg: impl Into<String>) {
        self.lock().push(msg.into());
    }

    /// Move every message of `other` into this sink.
    pub fn absorb(&self, other: ErrorSink) {
        let moved = other.into_errors();
        self.lock().extend(moved);
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of recorded messages.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Copy of the recorded messages, in arrival order.
    pub fn messages(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Consume the sink and return the recorded messages.
    pub fn into_errors(self) -> Vec<String> {
        self.errors
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// Run one unit, converting errors and panics into a message tagged with the item.
// Returns true iff the unit succeeded.
fn run_unit<T, F>(item: T, work: &F, sink: &ErrorSink) -> bool
where
    T: Display,
    F: Fn(T) -> Result<bool>,
{
    let label = item.to_string();
    match catch_unwind(AssertUnwindSafe(|| work(item))) {
        Ok(Ok(true)) => true,
        Ok(Ok(false)) => {
            debug!("{label}: unit reported failure");
            false
        }
        Ok(Err(err)) => {
            let msg = format!("{label}: {err:#}");
            warn!("{msg}");
            sink.push(msg);
            false
        }
        Err(panic) => {
            let msg = format!("{label}: panicked: {}", decipher_panic(panic));
            warn!("{msg}");
            sink.push(msg);
            false
        }
    }
}

// Pull items until the channel is drained; returns the number of failed units.
fn drain<T, F>(recv: Receiver<T>, work: &F, sink: &ErrorSink) -> usize
where
    T: Display,
    F: Fn(T) -> Result<bool>,
{
    let mut failed = 0;
    while let Ok(item) = recv.recv() {
        if !run_unit(item, work, sink) {
            failed += 1;
        }
    }
    failed
}

fn start_workers<'a, 'env, T, F>(
    num_workers: usize,
    recv: &Receiver<T>,
    work: &'env F,
    sink: &'env ErrorSink,
    scope: &'a Scope<'env>,
) -> Vec<ScopedJoinHandle<'a, usize>>
where
    T: 'env + Send + Display,
    F: Fn(T) -> Result<bool> + Sync,
{
    (0..num_workers)
        .map(|_| {
            let recv = recv.clone();
            scope.spawn(move |_| drain(recv, work, sink))
        })
        .collect()
}

fn collect_failures(handles: Vec<ScopedJoinHandle<'_, usize>>, sink: &ErrorSink) -> usize {
    let mut failed = 0;
    for h in handles {
        match h.join() {
            Ok(n) => failed += n,
            Err(e) => {
                sink.push(format!("worker panicked: {}", decipher_panic(e)));
                failed += 1;
            }
        }
    }
    failed
}

/// Run `work` on every item and wait for all of them.
///
/// At most `max_workers` units run at the same time; `None` runs one worker per
/// item. A unit fails if it returns `Ok(false)`, returns an error, or panics.
/// Errors and panics are recorded in `sink` prefixed with the item's display
/// form; a failing unit never stops its siblings. When any unit fails, one
/// extra summary message is recorded after all units have finished.
///
/// Returns true iff every unit succeeded.
pub fn fan_out<I, T, F>(items: I, max_workers: Option<usize>, sink: &ErrorSink, work: F) -> bool
where
    I: IntoIterator<Item = T>,
    T: Send + Display,
    F: Fn(T) -> Result<bool> + Sync,
{
    let items: Vec<T> = items.into_iter().collect();
    let total = items.len();
    if total == 0 {
        return true;
    }
    let num_workers = max_workers.map_or(total, |m| m.clamp(1, total));

    let (send, recv) = unbounded();
    for item in items {
        // the receiver is alive until the end of this function
        if send.send(item).is_err() {
            break;
        }
    }
    // Close the send channel - workers exit once the queue is drained
    drop(send);

    let work = &work;
    let r = crossbeam_utils::thread::scope(|s| {
        let handles = start_workers(num_workers, &recv, work, sink, s);
        collect_failures(handles, sink)
    });

    let failed = match r {
        Ok(n) => n,
        Err(e) => {
            sink.push(format!("fan-out aborted: {}", decipher_panic(e)));
            total
        }
    };

    if failed > 0 {
        sink.push(format!("{failed} of {total} units failed"));
        false
    } else {
        true
    }
}

fn decipher_panic(p: Box<dyn Any + 'static + Send>) -> String {
    if let Some(&s) = p.downcast_ref::<&'static str>() {
        s.to_string()
    } else if let Ok(s) = p.downcast::<String>() {
        *s
    } else {
        "unknown panic payload".to_string()
    }
}
