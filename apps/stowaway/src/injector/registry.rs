use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

use crate::arbitration::WorkerId;
use crate::transport::SessionChannel;

#[derive(Clone)]
pub struct LiveWorker {
    pub id: WorkerId,
    pub remote: SocketAddr,
    pub channel: Arc<dyn SessionChannel>,
}

#[derive(Default)]
struct RegistryInner {
    live: HashMap<WorkerId, LiveWorker>,
    handles: Vec<(WorkerId, JoinHandle<()>)>,
    reaped: usize,
    sealed: bool,
}

/// Live injector workers and the threads running them, behind one lock.
///
/// Workers remove themselves when they stop; the thread handles stay until
/// they are reaped or joined at teardown. Iteration always works on a
/// snapshot so removal never races a walk over the set.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    inner: Arc<Mutex<RegistryInner>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, worker: LiveWorker) {
        self.inner.lock().live.insert(worker.id, worker);
    }

    pub fn attach(&self, id: WorkerId, handle: JoinHandle<()>) {
        self.inner.lock().handles.push((id, handle));
    }

    /// Returns false when the worker was already gone.
    pub fn remove(&self, id: WorkerId) -> bool {
        self.inner.lock().live.remove(&id).is_some()
    }

    /// Detaches a worker from outside its thread by closing its channel.
    pub fn terminate(&self, id: WorkerId) -> bool {
        let removed = self.inner.lock().live.remove(&id);
        match removed {
            Some(worker) => {
                worker.channel.close();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: WorkerId) -> bool {
        self.inner.lock().live.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().live.is_empty()
    }

    pub fn channel(&self, id: WorkerId) -> Option<Arc<dyn SessionChannel>> {
        self.inner
            .lock()
            .live
            .get(&id)
            .map(|worker| Arc::clone(&worker.channel))
    }

    pub fn snapshot(&self) -> Vec<LiveWorker> {
        self.inner.lock().live.values().cloned().collect()
    }

    /// Joins worker threads that already finished. Does nothing once the
    /// registry is sealed.
    pub fn reap_finished(&self) -> usize {
        let finished = {
            let mut inner = self.inner.lock();
            if inner.sealed {
                return 0;
            }
            take_finished(&mut inner)
        };
        self.join_reaped(finished)
    }

    /// Reaps what already finished and stops any further reaping, so every
    /// thread still tracked is left for `join_all`.
    pub fn seal(&self) -> usize {
        let finished = {
            let mut inner = self.inner.lock();
            inner.sealed = true;
            take_finished(&mut inner)
        };
        self.join_reaped(finished)
    }

    fn join_reaped(&self, finished: Vec<(WorkerId, JoinHandle<()>)>) -> usize {
        let count = finished.len();
        for (id, handle) in finished {
            if handle.join().is_err() {
                warn!(target = "stowaway::injector", worker = %id, "injector thread panicked");
            }
        }
        self.inner.lock().reaped += count;
        count
    }

    /// Worker threads joined by reaping rather than by `join_all`.
    pub fn reaped_total(&self) -> usize {
        self.inner.lock().reaped
    }

    /// Joins every worker thread still tracked and clears the registry.
    ///
    /// The session must already be closed, otherwise the workers never exit.
    pub fn join_all(&self) -> usize {
        let handles = std::mem::take(&mut self.inner.lock().handles);
        let mut joined = 0;
        for (id, handle) in handles {
            if handle.join().is_err() {
                warn!(target = "stowaway::injector", worker = %id, "injector thread panicked");
            }
            joined += 1;
        }
        let leftover: Vec<LiveWorker> = self.inner.lock().live.drain().map(|(_, w)| w).collect();
        for worker in leftover {
            debug!(target = "stowaway::injector", worker = %worker.id, "closing orphaned injector channel");
            worker.channel.close();
        }
        joined
    }
}

fn take_finished(inner: &mut RegistryInner) -> Vec<(WorkerId, JoinHandle<()>)> {
    let (done, running): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.handles)
        .into_iter()
        .partition(|(_, handle)| handle.is_finished());
    inner.handles = running;
    done
}
