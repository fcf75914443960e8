//! Reusable pool of extraction workers.

use std::collections::HashMap;

use filmstrip_core::{RequestId, WorkerId};
use tokio::sync::mpsc;

use crate::protocol::{ExtractRequest, WorkerEvent, WorkerRequest, WorkerResponse};
use crate::worker::{WorkerContext, WorkerHandle};

/// Hands out workers to sessions and keeps a few idle ones warm.
///
/// A worker is either idle or busy. Busy workers belong to exactly one
/// assignment until they are released back or retired.
pub struct WorkerPool {
    ctx: WorkerContext,
    events: mpsc::UnboundedSender<WorkerEvent>,
    idle: Vec<WorkerHandle>,
    busy: HashMap<WorkerId, WorkerHandle>,
    idle_capacity: usize,
    next_id: u64,
}

impl WorkerPool {
    pub fn new(
        ctx: WorkerContext,
        events: mpsc::UnboundedSender<WorkerEvent>,
        idle_capacity: usize,
    ) -> Self {
        Self {
            ctx,
            events,
            idle: Vec::new(),
            busy: HashMap::new(),
            idle_capacity,
            next_id: 0,
        }
    }

    /// Take an idle worker or spawn a new one, and mark it busy.
    pub fn acquire(&mut self) -> WorkerId {
        let handle = loop {
            match self.idle.pop() {
                Some(handle) if !handle.is_finished() => break handle,
                Some(dead) => dead.terminate(),
                None => {
                    self.next_id += 1;
                    break WorkerHandle::spawn(
                        WorkerId::new(self.next_id),
                        self.ctx.clone(),
                        self.events.clone(),
                    );
                }
            }
        };
        let id = handle.id();
        self.busy.insert(id, handle);
        id
    }

    /// Send an extract request to a busy worker.
    ///
    /// Delivery failures come back through the event channel as an error
    /// response, so callers handle them like any other worker failure.
    pub fn dispatch(&mut self, worker_id: WorkerId, request: ExtractRequest) {
        let request_id = request.request_id;
        let delivered = self
            .busy
            .get(&worker_id)
            .is_some_and(|h| h.send(WorkerRequest::Extract(request)).is_ok());
        if !delivered {
            tracing::warn!(worker = %worker_id, request = %request_id, "Worker unreachable");
            let _ = self.events.send(WorkerEvent {
                worker_id,
                response: WorkerResponse::Error {
                    request_id,
                    error: "worker channel closed".into(),
                },
            });
        }
    }

    /// Return a worker whose assignment finished.
    pub fn release(&mut self, worker_id: WorkerId) {
        let Some(handle) = self.busy.remove(&worker_id) else {
            return;
        };
        if self.idle.len() < self.idle_capacity && !handle.is_finished() {
            self.idle.push(handle);
        } else {
            handle.terminate();
        }
    }

    /// Stop a busy worker, telling it to abort `request_id` first.
    pub fn retire(&mut self, worker_id: WorkerId, request_id: Option<RequestId>) {
        let Some(handle) = self.busy.remove(&worker_id) else {
            return;
        };
        if let Some(request_id) = request_id {
            let _ = handle.send(WorkerRequest::Abort { request_id });
        }
        handle.terminate();
    }

    /// Change how many idle workers are kept, terminating the excess.
    pub fn set_idle_capacity(&mut self, capacity: usize) {
        self.idle_capacity = capacity;
        while self.idle.len() > capacity {
            if let Some(handle) = self.idle.pop() {
                handle.terminate();
            }
        }
    }

    pub fn idle_capacity(&self) -> usize {
        self.idle_capacity
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    pub fn live_count(&self) -> usize {
        self.idle.len() + self.busy.len()
    }

    /// Workers spawned over the pool's lifetime.
    pub fn spawned_count(&self) -> u64 {
        self.next_id
    }

    pub fn shutdown(&mut self) {
        for handle in self.idle.drain(..) {
            handle.terminate();
        }
        for (_, handle) in self.busy.drain() {
            handle.terminate();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
