//! The async command runner: two bounded queues and an optional helper
//! thread.
//!
//! Submissions travel RT → NRT over one channel, stage results travel back
//! NRT → RT over the other. The real-time side only ever uses `try_send`, so
//! posting a pipeline is wait-free; the non-real-time side may block on a full
//! return queue, which simply throttles the helper thread until the audio
//! thread drains its stages again.
//!
//! Two drive modes share all of the machinery:
//!
//! - **Threaded**: a dedicated helper thread owns the submission queue's
//!   receiving end. It is shut down with a message and joined when the runner
//!   goes away, which also drains every submission queued before the shutdown.
//! - **Manual**: no thread is spawned; the embedder (or a test) pumps queued
//!   non-real-time work explicitly. This gives tests full control over stage
//!   interleaving.

use std::mem;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use log::error;

use crate::pipeline::Task;
use crate::vm::VmBackend;

/// Which non-real-time stage a queued task is headed for.
#[derive(Debug, Clone, Copy)]
pub(crate) enum NrtPhase {
    Stage2,
    Stage4,
}

pub(crate) enum NrtMsg {
    Job { phase: NrtPhase, task: Task },
    Shutdown,
}

impl NrtMsg {
    fn into_task(self) -> Option<Task> {
        match self {
            NrtMsg::Job { task, .. } => Some(task),
            NrtMsg::Shutdown => None,
        }
    }
}

/// Work queued for the real-time thread, executed between audio blocks.
pub(crate) enum RtJob {
    Stage3(Task),
    Cleanup { task: Task, aborted: bool },
}

/// The real-time side's handle for posting new pipelines. Wait-free.
#[derive(Clone)]
pub(crate) struct Submitter {
    nrt_tx: Sender<NrtMsg>,
}

impl Submitter {
    /// Post a pipeline for stage 2. Returns false when the queue is full or
    /// the helper side is gone; the task is dropped in that case and the
    /// caller unwinds whatever state it had prepared.
    #[must_use]
    pub fn submit(&self, task: Task) -> bool {
        self.nrt_tx
            .try_send(NrtMsg::Job {
                phase: NrtPhase::Stage2,
                task,
            })
            .is_ok()
    }
}

pub(crate) struct CommandRunner {
    submitter: Submitter,
    rt_tx: Sender<RtJob>,
    rt_rx: Receiver<RtJob>,
    driver: NrtDriver,
}

enum NrtDriver {
    Threaded(WorkerHandle),
    Manual {
        nrt_rx: Receiver<NrtMsg>,
        backend: Arc<dyn VmBackend>,
    },
    /// The worker has already been joined during shutdown.
    Stopped,
}

struct WorkerHandle {
    nrt_tx: Sender<NrtMsg>,
    join_handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    fn shutdown(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            // The shutdown message queues behind every pending submission, so
            // joining also drains the queue
            let _ = self.nrt_tx.send(NrtMsg::Shutdown);
            if handle.join().is_err() {
                error!("helper thread panicked during shutdown");
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CommandRunner {
    /// Spawn the helper thread and return a runner in threaded mode.
    pub fn spawn(backend: Arc<dyn VmBackend>, queue_capacity: usize) -> Self {
        let (nrt_tx, nrt_rx) = channel::bounded(queue_capacity);
        let (rt_tx, rt_rx) = channel::bounded(queue_capacity);
        let worker_rt_tx = rt_tx.clone();
        let join_handle = thread::Builder::new()
            .name(String::from("scriptgen-nrt"))
            .spawn(move || worker(nrt_rx, worker_rt_tx, backend))
            .expect("could not spawn the non-real-time helper thread");

        Self {
            submitter: Submitter {
                nrt_tx: nrt_tx.clone(),
            },
            rt_tx,
            rt_rx,
            driver: NrtDriver::Threaded(WorkerHandle {
                nrt_tx,
                join_handle: Some(join_handle),
            }),
        }
    }

    /// A runner without a helper thread; queued non-real-time work runs when
    /// the embedder calls [`pump_nrt()`][Self::pump_nrt()].
    pub fn manual(backend: Arc<dyn VmBackend>, queue_capacity: usize) -> Self {
        let (nrt_tx, nrt_rx) = channel::bounded(queue_capacity);
        let (rt_tx, rt_rx) = channel::bounded(queue_capacity);
        Self {
            submitter: Submitter { nrt_tx },
            rt_tx,
            rt_rx,
            driver: NrtDriver::Manual { nrt_rx, backend },
        }
    }

    pub fn submitter(&self) -> &Submitter {
        &self.submitter
    }

    pub fn is_manual(&self) -> bool {
        matches!(self.driver, NrtDriver::Manual { .. })
    }

    /// Next pending real-time stage, if any.
    pub fn try_recv_rt(&self) -> Option<RtJob> {
        self.rt_rx.try_recv().ok()
    }

    /// Hand a task whose stage 3 just ran back to the helper side for stage 4.
    /// On failure the task is returned so the caller can run the remaining
    /// stages in place rather than leaking the pipeline.
    pub fn dispatch_stage4(&self, task: Task) -> Result<(), Task> {
        match self.submitter.nrt_tx.try_send(NrtMsg::Job {
            phase: NrtPhase::Stage4,
            task,
        }) {
            Ok(()) => Ok(()),
            Err(err) => {
                error!("non-real-time queue unavailable, running the reap stage in place");
                match err.into_inner().into_task() {
                    Some(task) => Err(task),
                    None => Ok(()),
                }
            }
        }
    }

    /// Manual mode only: run every queued non-real-time job on the calling
    /// thread. Returns the number of jobs executed.
    pub fn pump_nrt(&self) -> usize {
        let NrtDriver::Manual { nrt_rx, backend } = &self.driver else {
            return 0;
        };
        let mut ran = 0;
        while let Ok(msg) = nrt_rx.try_recv() {
            if let NrtMsg::Job { phase, task } = msg {
                run_nrt_phase(phase, task, &**backend, &self.rt_tx);
                ran += 1;
            }
        }
        ran
    }

    /// Threaded mode only: shut the helper thread down, draining its queue.
    pub fn join_worker(&mut self) {
        if matches!(self.driver, NrtDriver::Threaded(_)) {
            if let NrtDriver::Threaded(mut handle) =
                mem::replace(&mut self.driver, NrtDriver::Stopped)
            {
                handle.shutdown();
            }
        }
    }
}

fn run_nrt_phase(phase: NrtPhase, mut task: Task, backend: &dyn VmBackend, rt_tx: &Sender<RtJob>) {
    let rt_job = match phase {
        NrtPhase::Stage2 => {
            if task.stage2(backend) {
                RtJob::Stage3(task)
            } else {
                RtJob::Cleanup {
                    task,
                    aborted: true,
                }
            }
        }
        NrtPhase::Stage4 => {
            let _ = task.stage4();
            RtJob::Cleanup {
                task,
                aborted: false,
            }
        }
    };
    // May block on a full return queue; that back-pressure is deliberate
    if rt_tx.send(rt_job).is_err() {
        error!("real-time side disconnected, dropping a pipeline payload");
    }
}

fn worker(nrt_rx: Receiver<NrtMsg>, rt_tx: Sender<RtJob>, backend: Arc<dyn VmBackend>) {
    loop {
        match nrt_rx.recv() {
            Ok(NrtMsg::Job { phase, task }) => run_nrt_phase(phase, task, &*backend, &rt_tx),
            Ok(NrtMsg::Shutdown) | Err(_) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{FreeScriptTask, TaskKind};
    use crate::script::ScriptRecord;
    use crate::vm::expr::ExprBackend;

    #[test]
    fn stage2_only_task_goes_straight_to_cleanup() {
        let runner = CommandRunner::manual(Arc::new(ExprBackend), 16);
        let script = Arc::new(ScriptRecord::parse("out0 = 0", Vec::new()).unwrap());
        let weak = Arc::downgrade(&script);

        assert!(runner.submitter().submit(Task::FreeScript(FreeScriptTask {
            script: Some(script),
        })));
        assert_eq!(runner.pump_nrt(), 1);

        // The record was destroyed during stage 2, on the pumping thread
        assert!(weak.upgrade().is_none());
        match runner.try_recv_rt() {
            Some(RtJob::Cleanup { task, aborted }) => {
                assert!(aborted);
                assert_eq!(task.kind(), TaskKind::FreeScript);
            }
            _ => panic!("expected a cleanup job"),
        }
        assert!(runner.try_recv_rt().is_none());
    }
}
