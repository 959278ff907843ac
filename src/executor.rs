//! Bounded pool of image worker threads
//!
//! Workers pull jobs from one shared queue. Each job completes a
//! [`TransformHandle`], which the caller can block on or turn into a task on
//! the host main thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use flume::{Receiver, Sender};
use log::{debug, error};

use crate::error::{MapError, Result};
use crate::host::MainThread;
use crate::settings::Settings;

type Job = Box<dyn FnOnce() + Send + 'static>;
type Callback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

enum WorkerRequest {
    Run(Job),
    Shutdown,
}

enum State<T> {
    Pending(Option<Callback<T>>),
    Done(Result<T>),
    Taken,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of a job running on the pool
pub struct TransformHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> TransformHandle<T> {
    fn pending() -> (Self, Completer<T>) {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::Pending(None)),
            ready: Condvar::new(),
        });
        (
            Self {
                shared: shared.clone(),
            },
            Completer {
                shared: Some(shared),
            },
        )
    }

    /// Handle that is already finished with `result`
    pub fn ready(result: Result<T>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Done(result)),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(*self.shared.lock(), State::Pending(_))
    }

    /// Take the result if the job has finished
    pub fn try_take(&self) -> Option<Result<T>> {
        let mut state = self.shared.lock();
        take_done(&mut *state)
    }

    /// Block until the job finishes
    pub fn wait(self) -> Result<T> {
        let state = self.shared.lock();
        let mut state = self
            .shared
            .ready
            .wait_while(state, |s| matches!(s, State::Pending(_)))
            .unwrap_or_else(PoisonError::into_inner);
        take_done(&mut *state)
            .unwrap_or_else(|| Err(MapError::transform("transform result was already taken")))
    }

    /// Block for at most `timeout`; `None` when the job is still running
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let state = self.shared.lock();
        let (mut state, _) = self
            .shared
            .ready
            .wait_timeout_while(state, timeout, |s| matches!(s, State::Pending(_)))
            .unwrap_or_else(PoisonError::into_inner);
        take_done(&mut *state)
    }

    /// Deliver the result to `callback` as a task on the main thread
    pub fn then_on_main<F>(self, main: Arc<dyn MainThread>, callback: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let deliver: Callback<T> = Box::new(move |result| {
            main.run_on_main_thread(Box::new(move || callback(result)));
        });

        let mut state = self.shared.lock();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Pending(_) => *state = State::Pending(Some(deliver)),
            State::Done(result) => {
                drop(state);
                deliver(result);
            }
            State::Taken => {
                drop(state);
                deliver(Err(MapError::transform("transform result was already taken")));
            }
        }
    }
}

fn take_done<T>(state: &mut State<T>) -> Option<Result<T>> {
    match std::mem::replace(state, State::Taken) {
        State::Done(result) => Some(result),
        other => {
            *state = other;
            None
        }
    }
}

/// Worker side of a [`TransformHandle`]. Dropping it unfinished fails the
/// handle.
struct Completer<T> {
    shared: Option<Arc<Shared<T>>>,
}

impl<T> Completer<T> {
    fn complete(mut self, result: Result<T>) {
        if let Some(shared) = self.shared.take() {
            finish(&shared, result);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            finish(
                &shared,
                Err(MapError::transform("transform was dropped before it ran")),
            );
        }
    }
}

fn finish<T>(shared: &Shared<T>, result: Result<T>) {
    let mut state = shared.lock();
    match std::mem::replace(&mut *state, State::Taken) {
        State::Pending(Some(callback)) => {
            drop(state);
            callback(result);
        }
        State::Pending(None) => {
            *state = State::Done(result);
            drop(state);
            shared.ready.notify_all();
        }
        done => *state = done,
    }
}

pub struct TransformExecutor {
    request_tx: Sender<WorkerRequest>,
    workers: Vec<JoinHandle<()>>,
}

impl TransformExecutor {
    /// Spawn `num_workers` threads, at least one
    pub fn new(num_workers: usize) -> Result<Self> {
        // flume receivers can be cloned, so every worker pulls from one queue.
        let (request_tx, request_rx) = flume::unbounded();

        let mut workers = Vec::with_capacity(num_workers.max(1));
        for index in 1..=num_workers.max(1) {
            let rx = request_rx.clone();
            let worker = thread::Builder::new()
                .name(format!("Image IO - #{index}"))
                .spawn(move || worker_loop(rx))
                .map_err(|e| MapError::transform(format!("cannot start image worker: {e}")))?;
            workers.push(worker);
        }
        debug!("Started {} image workers", workers.len());

        Ok(Self {
            request_tx,
            workers,
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Self::new(settings.worker_count())
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job` on the pool. A panic inside it fails the handle.
    pub fn submit<T, F>(&self, job: F) -> TransformHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (handle, completer) = TransformHandle::pending();
        let run: Job = Box::new(move || {
            let result = match panic::catch_unwind(AssertUnwindSafe(job)) {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    error!(
                        "Image worker {} panicked: {message}",
                        thread::current().name().unwrap_or("<unnamed>")
                    );
                    Err(MapError::transform(format!("image worker crashed: {message}")))
                }
            };
            completer.complete(result);
        });

        // On a closed queue the job is dropped and its completer fails the handle.
        if self.request_tx.send(WorkerRequest::Run(run)).is_err() {
            error!("Image worker queue is closed");
        }
        handle
    }

    /// Stop the workers after the jobs already queued
    pub fn shutdown(&mut self) {
        for _ in 0..self.workers.len() {
            let _ = self.request_tx.send(WorkerRequest::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("<unnamed>").to_string();
            if worker.join().is_err() {
                error!("Image worker {name} exited with a panic");
            }
        }
    }
}

impl Drop for TransformExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<WorkerRequest>) {
    while let Ok(request) = rx.recv() {
        match request {
            WorkerRequest::Run(job) => job(),
            WorkerRequest::Shutdown => break,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TickQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn wait_returns_job_result() {
        let executor = TransformExecutor::new(2).unwrap();
        let handle = executor.submit(|| Ok(21 * 2));
        assert_eq!(handle.wait().unwrap(), 42);
    }

    #[test]
    fn panics_become_failures() {
        let executor = TransformExecutor::new(1).unwrap();
        let handle = executor.submit::<(), _>(|| panic!("decoder exploded"));
        let err = handle.wait().unwrap_err();
        assert!(err.to_string().contains("decoder exploded"));

        // The worker survives the panic.
        assert_eq!(executor.submit(|| Ok(1)).wait().unwrap(), 1);
    }

    #[test]
    fn worker_threads_are_named() {
        let executor = TransformExecutor::new(1).unwrap();
        let name = executor
            .submit(|| Ok(thread::current().name().map(str::to_string)))
            .wait()
            .unwrap();
        assert_eq!(name.as_deref(), Some("Image IO - #1"));
    }

    #[test]
    fn try_take_and_wait_timeout() {
        let executor = TransformExecutor::new(1).unwrap();
        let (gate_tx, gate_rx) = flume::bounded::<()>(0);
        let handle = executor.submit(move || {
            let _ = gate_rx.recv();
            Ok("done")
        });

        assert!(!handle.is_finished());
        assert!(handle.try_take().is_none());
        assert!(handle.wait_timeout(Duration::from_millis(10)).is_none());

        gate_tx.send(()).unwrap();
        let result = handle.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(result.unwrap(), "done");
        assert!(handle.try_take().is_none());
    }

    #[test]
    fn then_on_main_runs_callback_on_tick() {
        let executor = TransformExecutor::new(1).unwrap();
        let queue = TickQueue::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        let d = delivered.clone();
        executor
            .submit(|| Ok(7usize))
            .then_on_main(Arc::new(queue.handle()), move |result| {
                d.store(result.unwrap(), Ordering::SeqCst);
            });

        assert!(queue.pump_until(Duration::from_secs(5), || {
            delivered.load(Ordering::SeqCst) == 7
        }));
    }

    #[test]
    fn ready_handle_is_finished() {
        let handle = TransformHandle::ready(Err::<(), _>(MapError::not_found("x")));
        assert!(handle.is_finished());
        assert!(matches!(handle.wait(), Err(MapError::MapNotFound { .. })));
    }

    #[test]
    fn shutdown_fails_queued_jobs() {
        let mut executor = TransformExecutor::new(1).unwrap();
        executor.shutdown();
        let handle = executor.submit(|| Ok(()));
        assert!(handle.wait().is_err());
    }
}
