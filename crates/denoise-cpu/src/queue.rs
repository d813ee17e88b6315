// HostQueue — the CPU device's single ordered queue
//
// One dedicated worker thread pops jobs in submission order and runs them to
// completion before taking the next one. Jobs that need parallelism fan out
// onto the device's rayon pool from inside the job, so ordering between jobs
// is never relaxed.
//
// ERRORS:
//
//   A job returns Result<()>. The first error (or panic) since the last
//   wait() is kept and reported by the next wait(); later jobs still run.
//   wait() clears the stored error.
//
// SHUTDOWN:
//
//   Dropping the queue lets the worker finish every queued job, then joins it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use denoise_core::{Error, Result};

/// A unit of queued work.
pub type Job = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

#[derive(Default)]
struct State {
    jobs: VecDeque<Job>,
    running: bool,
    error: Option<Error>,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    work_ready: Condvar,
    drained: Condvar,
}

/// Ordered single-consumer job queue.
pub struct HostQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl HostQueue {
    /// Start the worker thread.
    pub fn new(name: &str) -> Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&worker_shared))
            .map_err(|e| Error::msg(format!("failed to spawn queue worker: {e}")))?;
        Ok(HostQueue {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Append a job. Never blocks on the job itself.
    pub fn submit(&self, job: Job) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(Error::logic("queue has been shut down"));
        }
        state.jobs.push_back(job);
        self.shared.work_ready.notify_one();
        Ok(())
    }

    /// Block until every submitted job has finished; report the first error.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        while !state.jobs.is_empty() || state.running {
            self.shared.drained.wait(&mut state);
        }
        match state.error.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Number of jobs not yet started.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().jobs.len()
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.work_ready.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::warn!(target: "denoise::cpu", "queue worker terminated abnormally");
            }
        }
        if let Some(e) = self.shared.state.lock().error.take() {
            tracing::warn!(target: "denoise::cpu", error = %e, "dropping unreported queue error");
        }
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    state.running = true;
                    break job;
                }
                if state.shutdown {
                    return;
                }
                shared.work_ready.wait(&mut state);
            }
        };

        let outcome = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            Ok(result) => result,
            Err(payload) => {
                let what = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "(non-string panic)".to_string());
                Err(Error::msg(format!("queued task panicked: {what}")))
            }
        };

        let mut state = shared.state.lock();
        state.running = false;
        if let Err(e) = outcome {
            tracing::warn!(target: "denoise::cpu", error = %e, "queued task failed");
            if state.error.is_none() {
                state.error = Some(e);
            }
        }
        if state.jobs.is_empty() {
            shared.drained.notify_all();
        }
    }
}
