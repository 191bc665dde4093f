//! Start-and-wait handles around per-node calls.
//!
//! The shape is deliberately minimal: `spawn(label, f)` returns a handle,
//! `result()` blocks for the outcome. Fan-out call sites submit one task
//! per node and then collect.

use std::fmt;
use std::thread;
use std::time;

use crossbeam_channel as chan;

use crate::error::Error;

/// Handle to a call running on its own thread.
pub struct Task<T> {
    rx: chan::Receiver<T>,
}

/// Spawn a named OS thread running `f`, returning a handle to its result.
pub fn spawn<D, F, T>(label: D, f: F) -> Task<T>
where
    D: fmt::Display,
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = chan::bounded(1);

    thread::Builder::new()
        .name(format!("{label}"))
        .spawn(move || {
            tx.send(f()).ok();
        })
        .expect("thread::spawn: thread label must not contain NULL bytes");

    Task { rx }
}

impl<T> Task<T> {
    /// Block until the task completes. A task that died without producing
    /// a value reports `Cancelled`.
    pub fn result(self) -> Result<T, Error> {
        self.rx.recv().map_err(|_| Error::Cancelled)
    }

    /// Block until the task completes or the deadline passes.
    pub fn result_timeout(self, timeout: time::Duration) -> Result<T, Error> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            chan::RecvTimeoutError::Timeout => Error::Cancelled,
            chan::RecvTimeoutError::Disconnected => Error::Cancelled,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_result() {
        let task = spawn("answer", || 42);
        assert_eq!(task.result().unwrap(), 42);
    }

    #[test]
    fn test_panicked_task_is_cancelled() {
        let task: Task<()> = spawn("doomed", || panic!("worker died"));
        assert!(matches!(task.result(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_result_timeout() {
        let task = spawn("slow", || {
            thread::sleep(time::Duration::from_secs(5));
        });
        let result = task.result_timeout(time::Duration::from_millis(10));
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
