//! Execution handler: concurrent supervision of PUT processes.
//!
//! A single supervisory thread owns every running test. Tests arrive over a
//! channel, are admitted up to the concurrency cap, polled once per cycle
//! (output drain, exit check, memory watchdog, fragment acknowledgment,
//! timeouts), and leave through their completion callback. The loop sleeps
//! for whatever remains of its period; when it falls behind it skips whole
//! periods instead of catching up.
//!
//! Fragment mode feeds the sequence one element at a time and counts any
//! bytes read between two writes as acknowledgment of the outstanding
//! fragment. Whole-input mode writes everything up front and relies on the
//! overall timeout alone.

pub mod test;

pub use test::{ExitReason, Test, TestCommand, TestState};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Knobs of the supervisory loop.
#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub max_concurrent_tests: usize,
    /// Polling period; the loop sleeps the remainder of it each cycle.
    pub period: Duration,
    pub memory_limit: Option<u64>,
    pub test_timeout: Option<Duration>,
    pub fragment_timeout: Option<Duration>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tests: 8,
            period: Duration::from_secs(1),
            memory_limit: None,
            test_timeout: None,
            fragment_timeout: None,
        }
    }
}

pub type CompletionCallback = Box<dyn FnOnce(Test) + Send>;

struct Submission {
    test: Test,
    callback: CompletionCallback,
}

#[derive(Default)]
struct FreezeState {
    requested: bool,
    acked: bool,
}

struct Shared {
    running: AtomicUsize,
    waiting: AtomicUsize,
    initialized: AtomicU64,
    completed: AtomicU64,
    stopping: AtomicBool,
    freeze: Mutex<FreezeState>,
    freeze_cv: Condvar,
    last_cycle: Mutex<Instant>,
}

/// Handle to the supervisory thread.
pub struct ExecutionHandler {
    config: ExecConfig,
    tx: Sender<Submission>,
    rx: Receiver<Submission>,
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutionHandler {
    pub fn new(config: ExecConfig) -> Arc<Self> {
        let (tx, rx) = unbounded();
        Arc::new(Self {
            config,
            tx,
            rx,
            shared: Arc::new(Shared {
                running: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                initialized: AtomicU64::new(0),
                completed: AtomicU64::new(0),
                stopping: AtomicBool::new(false),
                freeze: Mutex::new(FreezeState::default()),
                freeze_cv: Condvar::new(),
                last_cycle: Mutex::new(Instant::now()),
            }),
            thread: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Starts (or restarts) the supervisory thread.
    pub fn start(self: &Arc<Self>) {
        let mut guard = self.thread.lock().expect("exec thread lock poisoned");
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                warn!(target: "exec", "start_ignored_already_running");
                return;
            }
        }
        self.shared.stopping.store(false, Ordering::Release);
        let this = Arc::clone(self);
        *guard = Some(
            std::thread::Builder::new()
                .name("exec-handler".into())
                .spawn(move || this.supervise())
                .expect("failed to spawn exec handler thread"),
        );
        info!(target: "exec", max_concurrent = self.config.max_concurrent_tests, "handler_started");
    }

    /// Queues a test for execution.
    pub fn submit(&self, test: Test, callback: CompletionCallback) {
        if self.shared.stopping.load(Ordering::Acquire) {
            let mut test = test;
            test.exit_reasons |= ExitReason::INIT_ERROR;
            test.invalidate();
            callback(test);
            return;
        }
        self.shared.waiting.fetch_add(1, Ordering::AcqRel);
        let _ = self.tx.send(Submission { test, callback });
    }

    fn freeze_cv_ref(&self) -> (&Mutex<FreezeState>, &Condvar) {
        (&self.shared.freeze, &self.shared.freeze_cv)
    }

    /// Blocks new admissions and returns once the loop acknowledged the
    /// request. Running PUT processes keep running unpolled until thaw.
    pub fn freeze(&self) {
        let (lock, cv) = self.freeze_cv_ref();
        let mut state = lock.lock().expect("freeze lock poisoned");
        state.requested = true;
        cv.notify_all();
        while !state.acked {
            let (next, timeout) = cv
                .wait_timeout(state, Duration::from_millis(50))
                .expect("freeze lock poisoned");
            state = next;
            // A stopped or never-started handler cannot acknowledge.
            if timeout.timed_out() && !self.supervisor_alive() {
                state.acked = true;
            }
        }
        info!(target: "exec", "handler_frozen");
    }

    pub fn thaw(&self) {
        let (lock, cv) = self.freeze_cv_ref();
        let mut state = lock.lock().expect("freeze lock poisoned");
        state.requested = false;
        state.acked = false;
        cv.notify_all();
        info!(target: "exec", "handler_thawed");
    }

    fn supervisor_alive(&self) -> bool {
        self.thread
            .lock()
            .expect("exec thread lock poisoned")
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stops the loop, terminating running tests and completing everything
    /// through the callbacks.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::Release);
        self.shared.freeze_cv.notify_all();
        let handle = self
            .thread
            .lock()
            .expect("exec thread lock poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        // Anything still in the channel never ran.
        while let Ok(submission) = self.rx.try_recv() {
            self.shared.waiting.fetch_sub(1, Ordering::AcqRel);
            let mut test = submission.test;
            test.exit_reasons |= ExitReason::INIT_ERROR;
            test.invalidate();
            (submission.callback)(test);
        }
        info!(target: "exec", completed = self.completed_tests(), "handler_stopped");
    }

    /// Whether the last polling cycle finished within `window`. The session
    /// watchdog uses this to detect a wedged handler.
    pub fn last_cycle_within(&self, window: Duration) -> bool {
        self.shared
            .last_cycle
            .lock()
            .expect("cycle lock poisoned")
            .elapsed()
            <= window
    }

    /// Respawns the supervisory thread after a stall was detected.
    pub fn reinitialize(self: &Arc<Self>) {
        if self.supervisor_alive() {
            return;
        }
        warn!(target: "exec", "reinitializing_supervisor");
        self.start();
    }

    pub fn running_tests(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn waiting_tests(&self) -> usize {
        self.shared.waiting.load(Ordering::Acquire)
    }

    pub fn initialized_tests(&self) -> u64 {
        self.shared.initialized.load(Ordering::Acquire)
    }

    pub fn completed_tests(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.running_tests() == 0 && self.waiting_tests() == 0
    }

    fn supervise(self: Arc<Self>) {
        let mut running: Vec<(Test, CompletionCallback)> = Vec::new();
        info!(target: "exec.loop", "supervisor_started");

        loop {
            let cycle_start = Instant::now();
            *self
                .shared
                .last_cycle
                .lock()
                .expect("cycle lock poisoned") = cycle_start;

            if self.shared.stopping.load(Ordering::Acquire) {
                for (mut test, callback) in running.drain(..) {
                    test.kill();
                    test.invalidate();
                    self.shared.running.fetch_sub(1, Ordering::AcqRel);
                    self.shared.completed.fetch_add(1, Ordering::AcqRel);
                    callback(test);
                }
                break;
            }

            // Freeze gate, checked at the top of each iteration.
            {
                let mut state = self.shared.freeze.lock().expect("freeze lock poisoned");
                if state.requested {
                    state.acked = true;
                    self.shared.freeze_cv.notify_all();
                    while state.requested && !self.shared.stopping.load(Ordering::Acquire) {
                        let (next, _) = self
                            .shared
                            .freeze_cv
                            .wait_timeout(state, Duration::from_millis(50))
                            .expect("freeze lock poisoned");
                        state = next;
                    }
                    continue;
                }
            }

            // 1. Admit waiting tests while below the cap.
            while running.len() < self.config.max_concurrent_tests {
                match self.rx.try_recv() {
                    Ok(submission) => {
                        self.shared.waiting.fetch_sub(1, Ordering::AcqRel);
                        self.admit(submission, &mut running);
                    }
                    Err(_) => break,
                }
            }

            // 2. Idle wait: park on the channel until a submission or the
            //    period elapses.
            if running.is_empty() {
                match self.rx.recv_timeout(self.config.period) {
                    Ok(submission) => {
                        self.shared.waiting.fetch_sub(1, Ordering::AcqRel);
                        self.admit(submission, &mut running);
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
                continue;
            }

            // 3. Poll running tests.
            let mut finished: Vec<usize> = Vec::new();
            for (idx, (test, _)) in running.iter_mut().enumerate() {
                test.drain_output();

                if let Some(code) = test.try_exit() {
                    test.exit_reasons |= ExitReason::NATURAL;
                    debug!(target: "exec.loop", id = test.identifier, code, "exited");
                    finished.push(idx);
                    continue;
                }

                if let Some(limit) = self.config.memory_limit {
                    if test.memory_consumption() > limit {
                        test.exit_reasons |= ExitReason::MEMORY;
                        test.kill();
                        finished.push(idx);
                        continue;
                    }
                }

                if test.fragment_mode {
                    if test.fragment_acknowledged() {
                        match test.write_next() {
                            Ok(true) => {}
                            Ok(false) => {
                                if test.all_delivered() {
                                    test.exit_reasons |= ExitReason::LAST_INPUT;
                                    test.kill();
                                    finished.push(idx);
                                    continue;
                                }
                            }
                            Err(err) => {
                                debug!(target: "exec.loop", id = test.identifier, ?err, "pipe_failed");
                                test.exit_reasons |= ExitReason::PIPE;
                                test.kill();
                                finished.push(idx);
                                continue;
                            }
                        }
                    } else if let (Some(limit), Some(elapsed)) =
                        (self.config.fragment_timeout, test.time_since_write())
                    {
                        if elapsed > limit {
                            test.exit_reasons |= ExitReason::FRAGMENT_TIMEOUT;
                            test.kill();
                            finished.push(idx);
                            continue;
                        }
                    }
                }

                if let Some(limit) = self.config.test_timeout {
                    if test.runtime() > limit {
                        test.exit_reasons |= ExitReason::TIMEOUT;
                        test.kill();
                        finished.push(idx);
                    }
                }
            }

            // 4. Complete finished tests outside the poll loop.
            for idx in finished.into_iter().rev() {
                let (mut test, callback) = running.swap_remove(idx);
                test.drain_output();
                test.invalidate();
                self.shared.running.fetch_sub(1, Ordering::AcqRel);
                self.shared.completed.fetch_add(1, Ordering::AcqRel);
                callback(test);
            }

            // 5. Sleep out the period. When the cycle overran, skip the
            //    missed periods entirely.
            let elapsed = cycle_start.elapsed();
            if elapsed < self.config.period {
                std::thread::sleep(self.config.period - elapsed);
            } else {
                debug!(
                    target: "exec.loop",
                    behind_ms = elapsed.as_millis() as u64,
                    "cycle_overrun"
                );
            }
        }
        info!(target: "exec.loop", "supervisor_stopped");
    }

    fn admit(&self, submission: Submission, running: &mut Vec<(Test, CompletionCallback)>) {
        let Submission { mut test, callback } = submission;
        self.shared.initialized.fetch_add(1, Ordering::AcqRel);

        if let Err(err) = test.spawn() {
            warn!(target: "exec", id = test.identifier, ?err, "spawn_failed");
            test.exit_reasons |= ExitReason::INIT_ERROR;
            test.invalidate();
            self.shared.completed.fetch_add(1, Ordering::AcqRel);
            callback(test);
            return;
        }

        let startup = if test.fragment_mode {
            test.write_next().map(|_| ())
        } else {
            test.write_all()
        };
        if let Err(err) = startup {
            warn!(target: "exec", id = test.identifier, ?err, "initial_write_failed");
            test.exit_reasons |= ExitReason::PIPE;
            test.kill();
            test.invalidate();
            self.shared.completed.fetch_add(1, Ordering::AcqRel);
            callback(test);
            return;
        }

        self.shared.running.fetch_add(1, Ordering::AcqRel);
        running.push((test, callback));
    }
}
