//! Tick-driven task queue for the host main thread
//!
//! Any thread may post tasks through a [`MainThreadHandle`]. They only run
//! when the owner of the [`TickQueue`] calls [`TickQueue::tick`] or
//! [`TickQueue::run_pending`], which it does from its own thread.

use std::cell::{Cell, RefCell};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};

use super::{MainTask, MainThread};
use crate::error::{MapError, Result};

enum Scheduled {
    Now(MainTask),
    After(u32, MainTask),
}

/// Cloneable sender side of a [`TickQueue`]
#[derive(Clone)]
pub struct MainThreadHandle {
    sender: Sender<Scheduled>,
}

impl MainThread for MainThreadHandle {
    fn run_on_main_thread(&self, task: MainTask) {
        if self.sender.send(Scheduled::Now(task)).is_err() {
            warn!("Main thread queue is gone, dropping task");
        }
    }

    fn run_on_main_thread_after(&self, ticks: u32, task: MainTask) {
        if self.sender.send(Scheduled::After(ticks, task)).is_err() {
            warn!("Main thread queue is gone, dropping delayed task");
        }
    }
}

/// The main thread's side of the queue. Not `Sync`: it stays on the thread
/// that runs the tasks.
pub struct TickQueue {
    sender: Sender<Scheduled>,
    receiver: Receiver<Scheduled>,
    current_tick: Cell<u64>,
    delayed: RefCell<Vec<(u64, MainTask)>>,
}

impl Default for TickQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TickQueue {
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender,
            receiver,
            current_tick: Cell::new(0),
            delayed: RefCell::new(Vec::new()),
        }
    }

    pub fn handle(&self) -> MainThreadHandle {
        MainThreadHandle {
            sender: self.sender.clone(),
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.current_tick.get()
    }

    /// Tasks posted but not run yet, delayed ones included
    pub fn pending(&self) -> usize {
        self.receiver.len() + self.delayed.borrow().len()
    }

    /// Run every task posted for now, including the ones those tasks post.
    /// Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(scheduled) = self.receiver.try_recv() {
            if self.dispatch(scheduled) {
                ran += 1;
            }
        }
        ran
    }

    /// Advance one tick: release delayed tasks that are due, then run
    /// everything pending
    pub fn tick(&self) -> usize {
        let now = self.current_tick.get() + 1;
        self.current_tick.set(now);

        let due: Vec<MainTask> = {
            let mut delayed = self.delayed.borrow_mut();
            let (due, later): (Vec<_>, Vec<_>) =
                delayed.drain(..).partition(|(at, _)| *at <= now);
            *delayed = later;
            due.into_iter().map(|(_, task)| task).collect()
        };

        let mut ran = due.len();
        for task in due {
            task();
        }
        ran += self.run_pending();
        ran
    }

    /// Keep running tasks as they arrive until `done` returns true or
    /// `timeout` passes. Returns whether `done` was reached.
    pub fn pump_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.tick();
            if done() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Wake up at least every few milliseconds to advance delayed tasks.
            let wait = (deadline - now).min(Duration::from_millis(5));
            match self.receiver.recv_timeout(wait) {
                Ok(scheduled) => {
                    self.dispatch(scheduled);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return done(),
            }
        }
    }

    fn dispatch(&self, scheduled: Scheduled) -> bool {
        match scheduled {
            Scheduled::Now(task) => {
                task();
                true
            }
            Scheduled::After(ticks, task) => {
                let at = self.current_tick.get() + u64::from(ticks.max(1));
                debug!("Delaying main thread task to tick {at}");
                self.delayed.borrow_mut().push((at, task));
                false
            }
        }
    }
}

/// Run `f` on the main thread and wait for its result.
///
/// Must not be called from the main thread itself: the task could never run
/// and the call would only end at `timeout`.
pub fn call_on_main<T, F>(main: &dyn MainThread, timeout: Duration, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    call_on_main_or_undo(main, timeout, f, drop)
}

/// Like [`call_on_main`], but once the caller has given up waiting the task
/// no longer hands its result to anyone. If it has not started yet it is
/// skipped. If it finishes after the caller left, `undo` receives the result
/// on the main thread.
pub fn call_on_main_or_undo<T, F, U>(
    main: &dyn MainThread,
    timeout: Duration,
    f: F,
    undo: U,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
    U: FnOnce(T) + Send + 'static,
{
    let abandoned = Arc::new(Mutex::new(false));
    let (reply_tx, reply_rx) = flume::bounded(1);

    let flag = abandoned.clone();
    main.run_on_main_thread(Box::new(move || {
        if *lock(&flag) {
            debug!("Skipping main thread task, its caller gave up");
            return;
        }
        let value = f();
        let gone = lock(&flag);
        if *gone {
            drop(gone);
            debug!("Main thread task finished after its caller gave up, undoing it");
            undo(value);
        } else {
            let _ = reply_tx.send(value);
        }
    }));

    match reply_rx.recv_timeout(timeout) {
        Ok(value) => Ok(value),
        Err(RecvTimeoutError::Timeout) => {
            let mut gone = lock(&abandoned);
            *gone = true;
            // The reply may have landed between the timeout and the flag.
            if let Ok(value) = reply_rx.try_recv() {
                return Ok(value);
            }
            Err(MapError::SurfaceUnavailable(format!(
                "main thread did not answer within {}s",
                timeout.as_secs_f32()
            )))
        }
        Err(RecvTimeoutError::Disconnected) => Err(MapError::SurfaceUnavailable(
            "main thread dropped the task".to_string(),
        )),
    }
}

fn lock(flag: &Mutex<bool>) -> MutexGuard<'_, bool> {
    flag.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn tasks_run_only_when_pumped() {
        let queue = TickQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        queue.handle().run_on_main_thread(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(queue.run_pending(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delayed_tasks_wait_for_ticks() {
        let queue = TickQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        queue.handle().run_on_main_thread_after(
            2,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        );

        queue.tick();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        queue.tick();
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        queue.tick();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn call_on_main_hands_back_result() {
        let queue = TickQueue::new();
        let handle = queue.handle();
        let worker = std::thread::spawn(move || {
            call_on_main(&handle, Duration::from_secs(5), || 6 * 7)
        });

        assert!(queue.pump_until(Duration::from_secs(5), || worker.is_finished()));
        assert_eq!(worker.join().unwrap().unwrap(), 42);
    }

    #[test]
    fn call_on_main_times_out_without_pumping() {
        let queue = TickQueue::new();
        let err = call_on_main(&queue.handle(), Duration::from_millis(20), || ()).unwrap_err();
        assert!(matches!(err, MapError::SurfaceUnavailable(_)));
    }

    #[test]
    fn late_result_is_undone_after_the_caller_gave_up() {
        let queue = TickQueue::new();
        let handle = queue.handle();
        let undone = Arc::new(AtomicUsize::new(0));
        let u = undone.clone();
        let worker = std::thread::spawn(move || {
            call_on_main_or_undo(
                &handle,
                Duration::from_millis(50),
                || {
                    std::thread::sleep(Duration::from_millis(300));
                    7
                },
                move |value| {
                    u.fetch_add(value, Ordering::SeqCst);
                },
            )
        });

        assert!(queue.pump_until(Duration::from_secs(5), || worker.is_finished()));
        assert!(matches!(
            worker.join().unwrap(),
            Err(MapError::SurfaceUnavailable(_))
        ));
        queue.run_pending();
        assert_eq!(undone.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn task_is_skipped_once_abandoned() {
        let queue = TickQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();
        let err = call_on_main_or_undo(
            &queue.handle(),
            Duration::from_millis(20),
            move || {
                r.fetch_add(1, Ordering::SeqCst);
            },
            |()| panic!("nothing to undo"),
        )
        .unwrap_err();
        assert!(matches!(err, MapError::SurfaceUnavailable(_)));

        assert_eq!(queue.run_pending(), 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
