// src/runtime/driver.rs
//! Worker threads
//!
//! Each worker loops over: progress the data requests of its memory node,
//! pop a task from one of its contexts, fetch the task's inputs, run the
//! kernel, feed the measured length back to the model, release the data and
//! terminate the job. A worker with nothing to do reports an idle cycle and,
//! when allowed, sleeps until a policy wakes it.

use crate::runtime::state::RuntimeState;
use crate::sched::worker::set_current_worker;
use crate::sched::{SchedContext, WorkerDescr};
use crate::task::{KernelContext, TaskRef, TaskStatus};
use crate::utils::errors::Result;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Start one thread per worker of the topology
pub(crate) fn spawn_workers(state: &Arc<RuntimeState>) -> Result<Vec<JoinHandle<()>>> {
    let mut threads = Vec::with_capacity(state.topology.len());
    for worker in state.topology.workers() {
        let state = Arc::clone(state);
        let descr = worker.clone();
        let thread = thread::Builder::new()
            .name(format!("taskweave-worker-{}", worker.id))
            .spawn(move || worker_loop(&state, &descr))?;
        threads.push(thread);
    }
    info!(nworkers = threads.len(), "Workers started");
    Ok(threads)
}

fn worker_loop(state: &RuntimeState, worker: &WorkerDescr) {
    set_current_worker(Some(worker.id));
    debug!(worker = %worker.id, name = %worker.name, node = %worker.memory_node, "Worker running");
    let idle_timeout = Duration::from_micros(state.config.workers.idle_timeout_us.max(1));

    loop {
        state.data.requests().progress(worker.memory_node, true);

        if let Some((ctx, task)) = state.contexts.pop_task(worker.id) {
            execute_job(state, worker, &ctx, task);
            continue;
        }

        if state.is_shut_down() && state.inflight() == 0 {
            break;
        }

        for ctx in state.contexts.of_worker(worker.id) {
            state.counters.notify_idle_cycle(ctx.id(), worker.id);
        }
        if state.config.workers.allow_sleep {
            state.sleep.sleep(worker.id, idle_timeout);
        } else {
            thread::yield_now();
        }
    }

    set_current_worker(None);
    debug!(worker = %worker.id, "Worker stopped");
}

/// Implementation to run: the policy's choice when it fits the worker,
/// otherwise the first one that does
fn pick_implementation(worker: &WorkerDescr, task: &TaskRef) -> Option<usize> {
    let codelet = task.codelet()?;
    let chosen = task.sched_info().implementation;
    if codelet.can_execute(worker.arch, chosen) {
        return Some(chosen);
    }
    (0..codelet.implementations.len()).find(|&index| codelet.can_execute(worker.arch, index))
}

fn execute_job(state: &RuntimeState, worker: &WorkerDescr, ctx: &Arc<SchedContext>, task: TaskRef) {
    let node = worker.memory_node;
    let policy = ctx.policy();
    policy.pre_exec_hook(&task, worker.id);
    task.set_status(TaskStatus::Running);

    let buffers = match state.data.fetch_task_input(&task, worker.id, node) {
        Ok(buffers) => buffers,
        Err(err) => {
            error!(task = %task.id(), worker = %worker.id, error = %err, "Task lost: input fetch failed");
            policy.post_exec_hook(&task, worker.id);
            state.terminate(&task, false);
            return;
        }
    };

    let length_us = match task.codelet() {
        Some(codelet) => match pick_implementation(worker, &task) {
            Some(implementation) => {
                let kernel = KernelContext {
                    worker: worker.id,
                    node,
                    buffers: &buffers,
                    backend: state.data.allocator().backend().as_ref(),
                };
                let start = Instant::now();
                (codelet.implementations[implementation].func)(&kernel);
                let length_us = start.elapsed().as_secs_f64() * 1e6;
                if let Some(model) = &codelet.model {
                    model.feed(&task, worker.perf_arch(), implementation, length_us);
                }
                trace!(task = %task.id(), worker = %worker.id, length_us, "Task executed");
                length_us
            }
            None => {
                warn!(task = %task.id(), worker = %worker.id, "Worker has no implementation for the task");
                0.0
            }
        },
        None => 0.0,
    };

    policy.post_exec_hook(&task, worker.id);
    state
        .counters
        .notify_post_exec_hook(ctx.id(), worker.id, length_us);
    state.data.push_task_output(&task, worker.id, node);
    state.terminate(&task, true);
}

