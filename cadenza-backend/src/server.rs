//! A long running compile server: one background worker draining a
//! deadline ordered queue. Jobs run to completion once started; a
//! source edit invalidates queued jobs under the same lock that
//! guards the queue.

use anyhow::{anyhow, Result};
use arcstr::ArcStr;
use log::{debug, info};
use parking_lot::{Condvar, Mutex};
use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::Arc,
    thread,
    time::Instant,
};

enum JobState<T> {
    Pending,
    Done(Result<T>),
    Cancelled,
    Taken,
}

/// shared handle to an in flight job's result
pub struct JobHandle<T> {
    state: Arc<(Mutex<JobState<T>>, Condvar)>,
}

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        JobHandle { state: Arc::clone(&self.state) }
    }
}

impl<T> JobHandle<T> {
    fn new() -> Self {
        JobHandle { state: Arc::new((Mutex::new(JobState::Pending), Condvar::new())) }
    }

    fn complete(&self, r: Result<T>) {
        let (lock, cond) = &*self.state;
        *lock.lock() = JobState::Done(r);
        cond.notify_all();
    }

    fn cancel(&self) {
        let (lock, cond) = &*self.state;
        let mut st = lock.lock();
        if matches!(*st, JobState::Pending) {
            *st = JobState::Cancelled;
        }
        cond.notify_all();
    }

    /// block until the job finishes; the result can be taken once
    pub fn wait(&self) -> Result<T> {
        let (lock, cond) = &*self.state;
        let mut st = lock.lock();
        loop {
            match std::mem::replace(&mut *st, JobState::Taken) {
                JobState::Pending => {
                    *st = JobState::Pending;
                    cond.wait(&mut st);
                }
                JobState::Done(r) => return r,
                JobState::Cancelled => return Err(anyhow!("job cancelled")),
                JobState::Taken => return Err(anyhow!("job result already taken")),
            }
        }
    }
}

struct QueuedJob<T> {
    key: ArcStr,
    deadline: Instant,
    seq: u64,
    work: Box<dyn FnOnce() -> Result<T> + Send>,
    handle: JobHandle<T>,
}

impl<T> PartialEq for QueuedJob<T> {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl<T> Eq for QueuedJob<T> {}

impl<T> PartialOrd for QueuedJob<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueuedJob<T> {
    // max-heap: the greatest element is the earliest deadline
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State<T> {
    heap: BinaryHeap<QueuedJob<T>>,
    shutdown: bool,
    seq: u64,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

/// The compile server. Submitting returns a handle immediately; the
/// worker picks jobs earliest deadline first.
pub struct CompileServer<T: Send + 'static> {
    shared: Arc<Shared<T>>,
    worker: Option<thread::JoinHandle<()>>,
}

impl<T: Send + 'static> CompileServer<T> {
    pub fn start() -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                shutdown: false,
                seq: 0,
            }),
            cond: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("cadenza-compile".to_string())
            .spawn(move || worker_loop(worker_shared))
            .expect("failed to spawn compile worker");
        CompileServer { shared, worker: Some(worker) }
    }

    /// queue a job; jobs with earlier deadlines run first
    pub fn submit(
        &self,
        key: ArcStr,
        deadline: Instant,
        work: impl FnOnce() -> Result<T> + Send + 'static,
    ) -> JobHandle<T> {
        let handle = JobHandle::new();
        let mut st = self.shared.state.lock();
        st.seq += 1;
        let seq = st.seq;
        st.heap.push(QueuedJob {
            key,
            deadline,
            seq,
            work: Box::new(work),
            handle: handle.clone(),
        });
        drop(st);
        self.shared.cond.notify_one();
        handle
    }

    /// A source edit arrived: cancel every queued job compiled from
    /// `key`. A running job is never interrupted.
    pub fn invalidate(&self, key: &str) -> usize {
        let mut st = self.shared.state.lock();
        let jobs = std::mem::take(&mut st.heap);
        let mut dropped = 0;
        for j in jobs.into_iter() {
            if &*j.key == key {
                j.handle.cancel();
                dropped += 1;
            } else {
                st.heap.push(j);
            }
        }
        debug!("invalidated {dropped} queued jobs for {key}");
        dropped
    }

    pub fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }
}

impl<T: Send + 'static> Drop for CompileServer<T> {
    fn drop(&mut self) {
        {
            let mut st = self.shared.state.lock();
            st.shutdown = true;
            // unfinished work is dropped at shutdown
            for j in std::mem::take(&mut st.heap).into_iter() {
                j.handle.cancel();
            }
        }
        self.shared.cond.notify_all();
        if let Some(w) = self.worker.take() {
            let _ = w.join();
        }
        info!("compile server stopped");
    }
}

fn worker_loop<T: Send + 'static>(shared: Arc<Shared<T>>) {
    loop {
        let job = {
            let mut st = shared.state.lock();
            loop {
                if st.shutdown {
                    return;
                }
                if let Some(j) = st.heap.pop() {
                    break j;
                }
                shared.cond.wait(&mut st);
            }
        };
        // run outside the lock; a started job runs to completion
        let r = (job.work)();
        job.handle.complete(r);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    #[test]
    fn jobs_complete_in_deadline_order() {
        let server: CompileServer<u32> = CompileServer::start();
        let now = Instant::now();
        // stall the worker so both jobs queue up
        let gate = server.submit(arcstr::literal!("gate"), now, move || {
            thread::sleep(Duration::from_millis(30));
            Ok(0)
        });
        thread::sleep(Duration::from_millis(5));
        let order: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let late = server.submit(
            arcstr::literal!("late"),
            now + Duration::from_secs(10),
            move || {
                o1.lock().push(2);
                Ok(2)
            },
        );
        let o2 = Arc::clone(&order);
        let early = server.submit(
            arcstr::literal!("early"),
            now + Duration::from_secs(1),
            move || {
                o2.lock().push(1);
                Ok(1)
            },
        );
        assert_eq!(gate.wait().unwrap(), 0);
        assert_eq!(early.wait().unwrap(), 1);
        assert_eq!(late.wait().unwrap(), 2);
        assert_eq!(&*order.lock(), &[1, 2]);
    }

    #[test]
    fn invalidation_cancels_queued_jobs() {
        let server: CompileServer<u32> = CompileServer::start();
        let now = Instant::now();
        let _gate = server.submit(arcstr::literal!("gate"), now, move || {
            thread::sleep(Duration::from_millis(50));
            Ok(0)
        });
        thread::sleep(Duration::from_millis(5));
        let doomed =
            server.submit(arcstr::literal!("edited.cza"), now, move || Ok(7));
        let dropped = server.invalidate("edited.cza");
        assert_eq!(dropped, 1);
        assert!(doomed.wait().is_err());
    }

    #[test]
    fn shutdown_joins_the_worker() {
        let server: CompileServer<u32> = CompileServer::start();
        let h = server.submit(arcstr::literal!("a"), Instant::now(), || Ok(1));
        assert_eq!(h.wait().unwrap(), 1);
        drop(server);
    }
}
