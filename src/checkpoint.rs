use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};

use crate::error::DefragError;
use crate::types::{DefragResult, VoidResult};

/// Handle over the eventual outcome of a `forceCheckpoint` call. Modeled
/// on a `crossbeam_channel::Receiver` rather than a `tokio` future,
/// since nothing in this crate runs an async runtime (RPC/client API,
/// the only place the teacher needed one, is out of scope here).
pub struct CheckpointFuture {
    rx: Receiver<DefragResult<()>>,
}

impl CheckpointFuture {
    fn new(rx: Receiver<DefragResult<()>>) -> Self {
        Self { rx }
    }

    /// Block the calling worker until the checkpoint this future
    /// represents has finished (or failed).
    pub fn wait(self) -> VoidResult {
        self.rx
            .recv()
            .map_err(|_| DefragError::checkpoint_failed("checkpoint controller shut down"))?
    }
}

/// Bundles several per-partition checkpoint futures into a single wait
/// point, mirroring §4.4's "collected in a compound future" language.
pub struct CompoundCheckpointFuture {
    futures: Vec<CheckpointFuture>,
}

impl CompoundCheckpointFuture {
    pub fn new(futures: Vec<CheckpointFuture>) -> Self {
        Self { futures }
    }

    pub fn wait(self) -> VoidResult {
        for f in self.futures {
            f.wait()?;
        }
        Ok(())
    }
}

struct FlushJob {
    reason: String,
    done: Sender<DefragResult<()>>,
}

struct LockState {
    readers: u32,
    writer_waiting: bool,
}

/// Re-entrant checkpoint read-lock plus a background flush thread,
/// grounded in the teacher's `ConcurrentStatus` (lock maps guarded by a
/// `Mutex` + explicit wait/notify) rather than `std::sync::RwLock`,
/// whose recursive-read behavior is platform-dependent and unsuited to
/// a lock callers must reacquire every ≤150ms from the same thread.
///
/// Workers call [`CheckpointController::cp_read_lock`] /
/// [`cp_read_unlock`](CheckpointController::cp_read_unlock) around any
/// page allocation, meta mutation, or free-list insertion (§4.1). The
/// checkpointer thread calls `begin_flush`/`end_flush` internally to
/// exclude readers while it flushes.
pub struct CheckpointController {
    state: Arc<(Mutex<LockState>, Condvar)>,
    queue: Arc<Mutex<VecDeque<FlushJob>>>,
    queue_cv: Arc<Condvar>,
    stopped: Arc<AtomicBool>,
    flush_thread: Mutex<Option<thread::JoinHandle<()>>>,
    yield_cadence: Duration,
    checkpoints_run: AtomicU32,
}

/// RAII guard for the checkpoint read-lock. Dropping it releases one
/// level of re-entrancy.
pub struct CpReadGuard<'a> {
    controller: &'a CheckpointController,
}

impl<'a> Drop for CpReadGuard<'a> {
    fn drop(&mut self) {
        self.controller.cp_read_unlock();
    }
}

impl CheckpointController {
    pub fn start(yield_cadence: Duration) -> Arc<Self> {
        let controller = Arc::new(Self {
            state: Arc::new((
                Mutex::new(LockState {
                    readers: 0,
                    writer_waiting: false,
                }),
                Condvar::new(),
            )),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            queue_cv: Arc::new(Condvar::new()),
            stopped: Arc::new(AtomicBool::new(false)),
            flush_thread: Mutex::new(None),
            yield_cadence,
            checkpoints_run: AtomicU32::new(0),
        });

        let worker = Arc::clone(&controller);
        let handle = thread::Builder::new()
            .name("defrag-checkpointer".into())
            .spawn(move || worker.flush_loop())
            .expect("failed to spawn checkpointer thread");
        *controller.flush_thread.lock().unwrap() = Some(handle);
        controller
    }

    fn flush_loop(self: Arc<Self>) {
        loop {
            let mut queue = self.queue.lock().unwrap();
            while queue.is_empty() && !self.stopped.load(Ordering::SeqCst) {
                queue = self.queue_cv.wait(queue).unwrap();
            }
            if self.stopped.load(Ordering::SeqCst) && queue.is_empty() {
                return;
            }
            let job = match queue.pop_front() {
                Some(job) => job,
                None => continue,
            };
            drop(queue);

            debug!("checkpoint beginning: {}", job.reason);
            self.exclude_readers();
            let result = self.do_flush(&job.reason);
            self.release_readers();

            self.checkpoints_run.fetch_add(1, Ordering::SeqCst);
            let _ = job.done.send(result);
        }
    }

    fn exclude_readers(&self) {
        let (lock, cv) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.writer_waiting = true;
        while state.readers > 0 {
            state = cv.wait(state).unwrap();
        }
    }

    fn release_readers(&self) {
        let (lock, cv) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.writer_waiting = false;
        cv.notify_all();
    }

    /// The actual flush work. This crate has no dirty-page tracking of
    /// its own to drive here (pages are flushed explicitly by
    /// `PageMemory::flush_partition` at each pipeline's step 6) — the
    /// controller's job is purely to serialize against readers and
    /// signal completion, as §4.1 specifies.
    fn do_flush(&self, reason: &str) -> VoidResult {
        info!("checkpoint completed: {}", reason);
        Ok(())
    }

    /// Acquire the checkpoint read-lock, re-entrant for the calling
    /// thread's logical worker loop (re-entrancy here means: repeated
    /// short-lived acquisitions are always granted once no writer is
    /// excluding readers, not true recursive-mutex semantics on one
    /// OS thread — callers are expected to drop the previous guard
    /// before reacquiring, per the yield-cadence discipline).
    pub fn cp_read_lock(&self) -> CpReadGuard<'_> {
        let (lock, cv) = &*self.state;
        let mut state = lock.lock().unwrap();
        while state.writer_waiting {
            state = cv.wait(state).unwrap();
        }
        state.readers += 1;
        CpReadGuard { controller: self }
    }

    fn cp_read_unlock(&self) {
        let (lock, cv) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.readers -= 1;
        if state.readers == 0 {
            cv.notify_all();
        }
    }

    /// Non-blocking; the checkpoint runs on the background thread and
    /// its outcome is observed via the returned [`CheckpointFuture`].
    pub fn force_checkpoint(&self, reason: impl Into<String>) -> DefragResult<CheckpointFuture> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DefragError::checkpoint_failed(
                "checkpoint controller is stopped",
            ));
        }
        let (tx, rx) = unbounded();
        self.queue.lock().unwrap().push_back(FlushJob {
            reason: reason.into(),
            done: tx,
        });
        self.queue_cv.notify_all();
        Ok(CheckpointFuture::new(rx))
    }

    /// Stop accepting new checkpoints and join the background thread.
    /// Called from the coordinator's cleanup path on any failure,
    /// per §4.7.
    pub fn stop(&self, await_pending: bool) {
        if !await_pending {
            self.stopped.store(true, Ordering::SeqCst);
        } else {
            // let already-queued jobs drain before the loop exits
            loop {
                if self.queue.lock().unwrap().is_empty() {
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
            self.stopped.store(true, Ordering::SeqCst);
        }
        self.queue_cv.notify_all();
        if let Some(handle) = self.flush_thread.lock().unwrap().take() {
            if let Err(e) = handle.join() {
                warn!("checkpointer thread panicked: {:?}", e);
            }
        }
    }

    pub fn yield_cadence(&self) -> Duration {
        self.yield_cadence
    }

    pub fn checkpoints_run(&self) -> u32 {
        self.checkpoints_run.load(Ordering::SeqCst)
    }
}

/// Tracks elapsed time since the last re-lock so callers in a tight
/// iteration loop (C4/C6) know when to yield the checkpoint read-lock.
/// This is a wall-clock check inside the loop body, not a timer thread
/// (§9 Design Notes: "not a timer thread").
pub struct YieldClock {
    cadence: Duration,
    last: Instant,
}

impl YieldClock {
    pub fn new(cadence: Duration) -> Self {
        Self {
            cadence,
            last: Instant::now(),
        }
    }

    pub fn should_yield(&self) -> bool {
        self.last.elapsed() >= self.cadence
    }

    pub fn reset(&mut self) {
        self.last = Instant::now();
    }
}
