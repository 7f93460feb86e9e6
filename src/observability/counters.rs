// src/observability/counters.rs
//! Performance counter hooks
//!
//! Subsystems report through [`PerfCounters`]. Every hook defaults to a
//! no-op, so an observer (a context resizing policy, a test probe) only
//! implements what it cares about.

use crate::memory::NodeId;
use crate::sched::{CtxId, WorkerId};
use metrics::{counter, describe_counter, describe_histogram, histogram};

/// Observer of runtime events
pub trait PerfCounters: Send + Sync {
    fn notify_submitted_task(&self, _ctx: CtxId, _codelet: &str) {}

    fn notify_pushed_task(&self, _ctx: CtxId, _worker: Option<WorkerId>) {}

    fn notify_poped_task(&self, _ctx: CtxId, _worker: WorkerId) {}

    fn notify_idle_cycle(&self, _ctx: CtxId, _worker: WorkerId) {}

    fn notify_idle_end(&self, _ctx: CtxId, _worker: WorkerId) {}

    fn notify_post_exec_hook(&self, _ctx: CtxId, _worker: WorkerId, _length_us: f64) {}

    fn notify_transfer(&self, _src: NodeId, _dst: NodeId, _bytes: usize) {}

    fn notify_allocation(&self, _node: NodeId, _bytes: usize) {}

    fn notify_allocation_cache_hit(&self, _node: NodeId) {}

    fn notify_memory_reclaim(&self, _node: NodeId, _bytes: usize) {}

    fn notify_data_request(&self, _node: NodeId, _prefetch: bool) {}
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCounters;

impl PerfCounters for NoopCounters {}

/// Forwards events to the `metrics` facade
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsCounters;

pub(crate) fn describe_metrics() {
    describe_counter!("taskweave_tasks_submitted_total", "Tasks submitted");
    describe_counter!("taskweave_tasks_pushed_total", "Tasks pushed to a scheduling policy");
    describe_counter!("taskweave_tasks_popped_total", "Tasks popped by workers");
    describe_counter!("taskweave_idle_cycles_total", "Pops that found no task");
    describe_histogram!("taskweave_task_length_us", "Measured task length");
    describe_counter!("taskweave_transfer_bytes_total", "Bytes copied between memory nodes");
    describe_counter!("taskweave_allocations_total", "Buffers allocated by the runtime");
    describe_counter!("taskweave_allocation_cache_hits_total", "Allocations served from the memchunk cache");
    describe_counter!("taskweave_reclaimed_bytes_total", "Bytes freed by memory reclaim");
    describe_counter!("taskweave_data_requests_total", "Data requests posted");
}

impl PerfCounters for MetricsCounters {
    fn notify_submitted_task(&self, ctx: CtxId, codelet: &str) {
        counter!(
            "taskweave_tasks_submitted_total",
            "ctx" => ctx.to_string(),
            "codelet" => codelet.to_string()
        )
        .increment(1);
    }

    fn notify_pushed_task(&self, ctx: CtxId, _worker: Option<WorkerId>) {
        counter!("taskweave_tasks_pushed_total", "ctx" => ctx.to_string()).increment(1);
    }

    fn notify_poped_task(&self, ctx: CtxId, worker: WorkerId) {
        counter!(
            "taskweave_tasks_popped_total",
            "ctx" => ctx.to_string(),
            "worker" => worker.to_string()
        )
        .increment(1);
    }

    fn notify_idle_cycle(&self, _ctx: CtxId, worker: WorkerId) {
        counter!("taskweave_idle_cycles_total", "worker" => worker.to_string()).increment(1);
    }

    fn notify_post_exec_hook(&self, _ctx: CtxId, worker: WorkerId, length_us: f64) {
        histogram!("taskweave_task_length_us", "worker" => worker.to_string()).record(length_us);
    }

    fn notify_transfer(&self, src: NodeId, dst: NodeId, bytes: usize) {
        counter!(
            "taskweave_transfer_bytes_total",
            "src" => src.to_string(),
            "dst" => dst.to_string()
        )
        .increment(bytes as u64);
    }

    fn notify_allocation(&self, node: NodeId, _bytes: usize) {
        counter!("taskweave_allocations_total", "node" => node.to_string()).increment(1);
    }

    fn notify_allocation_cache_hit(&self, node: NodeId) {
        counter!("taskweave_allocation_cache_hits_total", "node" => node.to_string()).increment(1);
    }

    fn notify_memory_reclaim(&self, node: NodeId, bytes: usize) {
        counter!("taskweave_reclaimed_bytes_total", "node" => node.to_string()).increment(bytes as u64);
    }

    fn notify_data_request(&self, node: NodeId, prefetch: bool) {
        counter!(
            "taskweave_data_requests_total",
            "node" => node.to_string(),
            "prefetch" => prefetch.to_string()
        )
        .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TransferProbe {
        bytes: AtomicUsize,
    }

    impl PerfCounters for TransferProbe {
        fn notify_transfer(&self, _src: NodeId, _dst: NodeId, bytes: usize) {
            self.bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_default_hooks_are_noops() {
        let probe = TransferProbe::default();
        probe.notify_submitted_task(CtxId::INITIAL, "gemm");
        probe.notify_allocation(NodeId(1), 64);
        probe.notify_transfer(NodeId(0), NodeId(1), 128);
        assert_eq!(probe.bytes.load(Ordering::Relaxed), 128);
    }

    #[test]
    fn test_metrics_without_recorder() {
        // With no recorder installed the facade drops everything
        let sink = MetricsCounters;
        sink.notify_transfer(NodeId(0), NodeId(1), 64);
        sink.notify_post_exec_hook(CtxId::INITIAL, WorkerId(0), 12.5);
    }
}
