//! Orderly, idempotent session shutdown: on demand via [`ThreadedCloser::request_close`],
//! or automatically after an idle or lifetime timeout.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Idle/lifetime deadlines tracked by the closer thread, in terms of an
/// `Instant` baseline rather than an absolute clock so tests can reason
/// about elapsed time without depending on wall time.
struct Timers {
    idle_deadline: Option<Instant>,
    life_deadline: Option<Instant>,
    idle_timeout: Option<Duration>,
    closing: bool,
}

struct Shared {
    timers: Mutex<Timers>,
    wake: Condvar,
    closed: Mutex<bool>,
    done: Condvar,
    at_close: Mutex<Vec<Box<dyn FnMut() + Send>>>,
}

/// Runs a background thread that watches idle/lifetime deadlines and fires
/// a caller-supplied close routine once, whichever comes first: a deadline,
/// or an explicit [`ThreadedCloser::request_close`].
///
/// Composed into [`crate::session::Session`] rather than inherited, so the
/// session's close routine can reach back into its own reader/writer/
/// outstanding-table state without the closer needing to know about any of
/// it.
pub struct ThreadedCloser {
    shared: Arc<Shared>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ThreadedCloser {
    pub fn new(idle_timeout: Option<Duration>, lifetime: Option<Duration>) -> Self {
        let now = Instant::now();
        ThreadedCloser {
            shared: Arc::new(Shared {
                timers: Mutex::new(Timers {
                    idle_deadline: idle_timeout.map(|d| now + d),
                    life_deadline: lifetime.map(|d| now + d),
                    idle_timeout,
                    closing: false,
                }),
                wake: Condvar::new(),
                closed: Mutex::new(false),
                done: Condvar::new(),
                at_close: Mutex::new(Vec::new()),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Register a callback to run during `close`, after the transport and
    /// threads have been torn down. Callbacks run in reverse registration
    /// order, as destructors would.
    pub fn at_close(&self, f: impl FnMut() + Send + 'static) {
        self.shared.at_close.lock().unwrap().push(Box::new(f));
    }

    /// Spawn the background watcher thread. `do_close` runs exactly once,
    /// either when a deadline elapses or [`request_close`](Self::request_close)
    /// is called.
    pub fn start(&self, do_close: impl FnOnce() + Send + 'static) {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("cc-closer".into())
            .spawn(move || {
                {
                    let mut timers = shared.timers.lock().unwrap();
                    loop {
                        if timers.closing {
                            break;
                        }
                        let deadline = [timers.idle_deadline, timers.life_deadline]
                            .into_iter()
                            .flatten()
                            .min();
                        let Some(deadline) = deadline else {
                            timers = shared.wake.wait(timers).unwrap();
                            continue;
                        };
                        let now = Instant::now();
                        if now >= deadline {
                            timers.closing = true;
                            break;
                        }
                        let (guard, timeout) =
                            shared.wake.wait_timeout(timers, deadline - now).unwrap();
                        timers = guard;
                        let _ = timeout;
                    }
                }

                run_at_close_and_finish(&shared, do_close);
            })
            .expect("spawning the closer thread");
        *self.thread.lock().unwrap() = Some(handle);
    }

    /// Signal the closer thread to stop waiting and run `do_close` now,
    /// without blocking for it to finish.
    pub fn request_close(&self) {
        self.shared.timers.lock().unwrap().closing = true;
        self.shared.wake.notify_all();
    }

    /// Block (up to `timeout`, or indefinitely if `None`) until `do_close`
    /// has finished running.
    pub fn close(&self, timeout: Option<Duration>) {
        self.request_close();
        let guard = self.shared.closed.lock().unwrap();
        let _guard = match timeout {
            Some(t) => self.shared.done.wait_timeout_while(guard, t, |c| !*c).unwrap().0,
            None => self.shared.done.wait_while(guard, |c| !*c).unwrap(),
        };
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn is_closing(&self) -> bool {
        self.shared.timers.lock().unwrap().closing || *self.shared.closed.lock().unwrap()
    }

    /// Reset the idle deadline, as if activity had just occurred.
    pub fn not_idle(&self) {
        let mut timers = self.shared.timers.lock().unwrap();
        if let Some(d) = timers.idle_timeout {
            timers.idle_deadline = Some(Instant::now() + d);
            self.shared.wake.notify_all();
        }
    }

    pub fn set_idletime(&self, timeout: Option<Duration>) {
        let mut timers = self.shared.timers.lock().unwrap();
        timers.idle_timeout = timeout;
        timers.idle_deadline = timeout.map(|d| Instant::now() + d);
        self.shared.wake.notify_all();
    }

    pub fn set_lifetime(&self, lifetime: Option<Duration>) {
        let mut timers = self.shared.timers.lock().unwrap();
        timers.life_deadline = lifetime.map(|d| Instant::now() + d);
        self.shared.wake.notify_all();
    }
}

fn run_at_close_and_finish(shared: &Arc<Shared>, do_close: impl FnOnce()) {
    do_close();
    let mut callbacks = shared.at_close.lock().unwrap();
    while let Some(mut cb) = callbacks.pop() {
        cb();
    }
    drop(callbacks);
    *shared.closed.lock().unwrap() = true;
    shared.done.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn request_close_runs_do_close_once() {
        let closer = ThreadedCloser::new(None, None);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        closer.start(move || ran2.store(true, Ordering::SeqCst));
        closer.close(Some(Duration::from_secs(1)));
        assert!(ran.load(Ordering::SeqCst));
        assert!(closer.is_closing());
    }

    #[test]
    fn at_close_callbacks_run_in_reverse_order() {
        let closer = ThreadedCloser::new(None, None);
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        closer.at_close(move || o1.lock().unwrap().push(1));
        closer.at_close(move || o2.lock().unwrap().push(2));
        closer.start(|| {});
        closer.close(Some(Duration::from_secs(1)));
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn idle_timeout_triggers_close_without_request() {
        let closer = ThreadedCloser::new(Some(Duration::from_millis(20)), None);
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        closer.start(move || ran2.store(true, Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(200));
        assert!(ran.load(Ordering::SeqCst));
    }
}
