// src/sched/tree/mod.rs
//! Composable scheduling components
//!
//! Policies are assembled from small components arranged in a tree. Pushes
//! enter at the root and travel down through exactly one child per level;
//! pops start at the worker's leaf and climb through the fathers until
//! some queue has work.
//!
//! # Architecture
//!
//! ```text
//!                 push ──> [ root ]
//!                         ┌───┴────┐
//!                     [ queue ]  [ queue ]
//!                         │        │
//!                     [worker 0] [worker 1] <── pop
//! ```
//!
//! Components live in an arena owned by the tree. Structural changes take
//! the tree lock for writing; pushes and pops take it for reading and
//! revalidate what the task can run on.

mod heft;
mod queue;
mod select;
mod work_stealing;
mod worker;

pub use heft::HeftComponent;
pub use queue::QueueComponent;
pub use select::{PerfmodelBranches, RandomComponent};
pub use work_stealing::WorkStealingComponent;
pub use worker::WorkerComponent;

use crate::sched::env::SchedEnv;
use crate::sched::policy::worker_may_execute_task;
use crate::sched::worker::{WorkerId, WorkerMask};
use crate::task::{Task, TaskRef};
use crate::utils::errors::{Result, RuntimeError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Index of a component inside its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(pub usize);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Chain of components behaving as one
#[derive(Debug, Clone, Copy)]
pub struct Composed {
    /// Receives the pushes
    pub top: ComponentId,
    /// Where the rest of the tree is attached
    pub bottom: ComponentId,
}

/// Behaviour of a component
pub enum ComponentKind {
    Fifo(QueueComponent),
    Prio(QueueComponent),
    WorkStealing(WorkStealingComponent),
    Random(RandomComponent),
    /// First child with room
    Eager,
    PerfmodelSelect(PerfmodelBranches),
    BestImplementation,
    Heft(HeftComponent),
    Worker(WorkerComponent),
    Composed(Composed),
}

impl ComponentKind {
    pub fn label(&self) -> &'static str {
        match self {
            ComponentKind::Fifo(_) => "fifo",
            ComponentKind::Prio(_) => "prio",
            ComponentKind::WorkStealing(_) => "work_stealing",
            ComponentKind::Random(_) => "random",
            ComponentKind::Eager => "eager",
            ComponentKind::PerfmodelSelect(_) => "perfmodel_select",
            ComponentKind::BestImplementation => "best_implementation",
            ComponentKind::Heft(_) => "heft",
            ComponentKind::Worker(_) => "worker",
            ComponentKind::Composed(_) => "composed",
        }
    }
}

/// Recipe entry for [`SchedTree::create`] and [`SchedTree::compose`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComponentSpec {
    /// `bounded` queues stop reporting room above the thresholds
    Fifo { bounded: bool },
    Prio { bounded: bool },
    /// With `keep_local`, a worker pushing a task keeps it
    WorkStealing { keep_local: bool },
    Random,
    Eager,
    BestImplementation,
    Heft,
}

/// A node of the scheduling tree
pub struct SchedComponent {
    kind: ComponentKind,
    children: Vec<ComponentId>,
    /// Component pops are forwarded to
    father: Option<ComponentId>,
    /// Workers below this component
    workers: WorkerMask,
    /// Workers below this component that belong to the context
    workers_in_ctx: WorkerMask,
}

impl SchedComponent {
    fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            children: Vec::new(),
            father: None,
            workers: WorkerMask::new(),
            workers_in_ctx: WorkerMask::new(),
        }
    }
}

struct TreeInner {
    components: Vec<SchedComponent>,
    root: Option<ComponentId>,
    leaves: HashMap<WorkerId, ComponentId>,
    ctx_workers: WorkerMask,
}

impl TreeInner {
    fn get(&self, id: ComponentId) -> &SchedComponent {
        &self.components[id.0]
    }
}

/// Scheduling tree of one context
pub struct SchedTree {
    env: Arc<SchedEnv>,
    inner: RwLock<TreeInner>,
}

impl SchedTree {
    pub fn new(env: Arc<SchedEnv>) -> Self {
        Self {
            env,
            inner: RwLock::new(TreeInner {
                components: Vec::new(),
                root: None,
                leaves: HashMap::new(),
                ctx_workers: WorkerMask::new(),
            }),
        }
    }

    pub fn env(&self) -> &Arc<SchedEnv> {
        &self.env
    }

    /// Add a detached component built from `spec`
    pub fn create(&self, spec: ComponentSpec) -> ComponentId {
        let threshold = self.env.ntasks_threshold;
        let exp_len_threshold = self.env.config.exp_len_threshold;
        let now = self.env.now();
        let kind = match spec {
            ComponentSpec::Fifo { bounded } => ComponentKind::Fifo(QueueComponent::new(
                now,
                false,
                bounded.then_some((threshold, exp_len_threshold)),
            )),
            ComponentSpec::Prio { bounded } => ComponentKind::Prio(QueueComponent::new(
                now,
                true,
                bounded.then_some((threshold, exp_len_threshold)),
            )),
            ComponentSpec::WorkStealing { keep_local } => {
                ComponentKind::WorkStealing(WorkStealingComponent::new(keep_local))
            }
            ComponentSpec::Random => ComponentKind::Random(RandomComponent::new(self.env.config.seed)),
            ComponentSpec::Eager => ComponentKind::Eager,
            ComponentSpec::BestImplementation => ComponentKind::BestImplementation,
            ComponentSpec::Heft => ComponentKind::Heft(HeftComponent::new(now)),
        };
        self.insert(kind)
    }

    /// Build a chain from `recipe`, first entry on top, and wrap it in a
    /// single component
    ///
    /// Attach the rest of the tree below [`SchedTree::bottom`].
    pub fn compose(&self, recipe: &[ComponentSpec]) -> Option<ComponentId> {
        let chain: Vec<ComponentId> = recipe.iter().map(|spec| self.create(*spec)).collect();
        let (top, bottom) = (*chain.first()?, *chain.last()?);
        for pair in chain.windows(2) {
            self.add_child(pair[0], pair[1]);
        }
        let composed = self.insert(ComponentKind::Composed(Composed { top, bottom }));
        self.add_child(composed, top);
        Some(composed)
    }

    /// Where children of a composed component are attached
    pub fn bottom(&self, id: ComponentId) -> ComponentId {
        match &self.inner.read().get(id).kind {
            ComponentKind::Composed(composed) => composed.bottom,
            _ => id,
        }
    }

    /// Route between the calibration, no-model and model branches
    pub fn perfmodel_select(
        &self,
        calibrator: ComponentId,
        no_model: ComponentId,
        perfmodel: ComponentId,
    ) -> ComponentId {
        let id = self.insert(ComponentKind::PerfmodelSelect(PerfmodelBranches {
            calibrator,
            no_model,
            perfmodel,
        }));
        for branch in [calibrator, no_model, perfmodel] {
            self.add_child(id, branch);
        }
        id
    }

    /// Leaf of `worker`, created on first use
    pub fn worker_component(&self, worker: WorkerId) -> ComponentId {
        if let Some(id) = self.inner.read().leaves.get(&worker) {
            return *id;
        }
        let now = self.env.now();
        let mut inner = self.inner.write();
        if let Some(id) = inner.leaves.get(&worker) {
            return *id;
        }
        let id = ComponentId(inner.components.len());
        inner
            .components
            .push(SchedComponent::new(ComponentKind::Worker(WorkerComponent::new(worker, now))));
        inner.leaves.insert(worker, id);
        id
    }

    fn insert(&self, kind: ComponentKind) -> ComponentId {
        let mut inner = self.inner.write();
        let id = ComponentId(inner.components.len());
        inner.components.push(SchedComponent::new(kind));
        id
    }

    pub fn set_root(&self, root: ComponentId) {
        let mut inner = self.inner.write();
        inner.root = Some(root);
        Self::update_workers_locked(&mut inner);
    }

    pub fn root(&self) -> Option<ComponentId> {
        self.inner.read().root
    }

    /// Attach `child` below `parent`
    ///
    /// The first parent of a component is the one its pops are forwarded
    /// to; a component may be shared by several parents for pushes.
    pub fn add_child(&self, parent: ComponentId, child: ComponentId) {
        let mut inner = self.inner.write();
        if inner.components[parent.0].children.contains(&child) {
            return;
        }
        inner.components[parent.0].children.push(child);
        if let ComponentKind::WorkStealing(ws) = &mut inner.components[parent.0].kind {
            ws.add_child();
        }
        if inner.components[child.0].father.is_none() {
            inner.components[child.0].father = Some(parent);
        }
        Self::update_workers_locked(&mut inner);
    }

    /// Detach `child` from `parent`, returning the tasks `parent` kept for it
    pub fn remove_child(&self, parent: ComponentId, child: ComponentId) -> Vec<TaskRef> {
        let mut inner = self.inner.write();
        let Some(pos) = inner.components[parent.0]
            .children
            .iter()
            .position(|c| *c == child)
        else {
            return Vec::new();
        };
        inner.components[parent.0].children.remove(pos);
        let orphans = match &mut inner.components[parent.0].kind {
            ComponentKind::WorkStealing(ws) => ws.remove_child(pos),
            _ => Vec::new(),
        };
        if inner.components[child.0].father == Some(parent) {
            inner.components[child.0].father = None;
        }
        Self::update_workers_locked(&mut inner);
        orphans
    }

    /// Restrict the tree to the workers of its context
    pub fn set_ctx_workers(&self, workers: &WorkerMask) {
        let mut inner = self.inner.write();
        inner.ctx_workers = workers.clone();
        Self::update_workers_locked(&mut inner);
    }

    /// Recompute the worker masks bottom-up
    pub fn update_workers(&self) {
        Self::update_workers_locked(&mut self.inner.write());
    }

    fn update_workers_locked(inner: &mut TreeInner) {
        let Some(root) = inner.root else {
            return;
        };
        let mut done = vec![false; inner.components.len()];
        Self::compute_workers(inner, root, &mut done);
    }

    fn compute_workers(inner: &mut TreeInner, id: ComponentId, done: &mut [bool]) {
        if done[id.0] {
            return;
        }
        done[id.0] = true;
        let children = inner.components[id.0].children.clone();
        let mut workers = WorkerMask::new();
        if let ComponentKind::Worker(leaf) = &inner.components[id.0].kind {
            workers.insert(leaf.worker());
        }
        for child in children {
            Self::compute_workers(inner, child, done);
            workers.union_with(&inner.components[child.0].workers);
        }
        let workers_in_ctx: WorkerMask = workers
            .iter()
            .filter(|worker| inner.ctx_workers.contains(*worker))
            .collect();
        let component = &mut inner.components[id.0];
        component.workers = workers;
        component.workers_in_ctx = workers_in_ctx;
    }

    pub fn workers(&self, id: ComponentId) -> WorkerMask {
        self.inner.read().get(id).workers.clone()
    }

    pub fn workers_in_ctx(&self, id: ComponentId) -> WorkerMask {
        self.inner.read().get(id).workers_in_ctx.clone()
    }

    pub fn children(&self, id: ComponentId) -> Vec<ComponentId> {
        self.inner.read().get(id).children.clone()
    }

    pub fn father(&self, id: ComponentId) -> Option<ComponentId> {
        self.inner.read().get(id).father
    }

    pub fn label(&self, id: ComponentId) -> &'static str {
        self.inner.read().get(id).kind.label()
    }

    /// Push a task at the root
    pub fn push_task(&self, task: TaskRef) -> Result<()> {
        let inner = self.inner.read();
        let root = inner.root.ok_or(RuntimeError::NoDevice(task.id()))?;
        self.push_to(&inner, root, task)
    }

    /// Next task for `worker`, climbing from its leaf
    pub fn pop_task(&self, worker: WorkerId) -> Option<TaskRef> {
        let inner = self.inner.read();
        if !inner.ctx_workers.contains(worker) {
            return None;
        }
        let leaf = *inner.leaves.get(&worker)?;
        self.pop_from(&inner, leaf, worker)
    }

    pub fn can_execute(&self, id: ComponentId, task: &Task) -> bool {
        self.can_execute_in(&self.inner.read(), id, task)
    }

    pub fn estimated_load(&self, id: ComponentId) -> f64 {
        self.estimated_load_in(&self.inner.read(), id)
    }

    pub fn estimated_end(&self, id: ComponentId) -> f64 {
        self.estimated_end_in(&self.inner.read(), id)
    }

    /// Record that `worker` started `task`
    pub fn worker_started(&self, worker: WorkerId, task: &Task) {
        let inner = self.inner.read();
        if let Some(ComponentKind::Worker(leaf)) =
            inner.leaves.get(&worker).map(|id| &inner.get(*id).kind)
        {
            leaf.task_started(task, self.env.now());
        }
    }

    /// Record that `worker` is done with its task
    pub fn worker_finished(&self, worker: WorkerId) {
        let inner = self.inner.read();
        if let Some(ComponentKind::Worker(leaf)) =
            inner.leaves.get(&worker).map(|id| &inner.get(*id).kind)
        {
            leaf.task_finished(self.env.now());
        }
    }

    /// Remove the tasks stored in one component
    pub fn drain(&self, id: ComponentId) -> Vec<TaskRef> {
        Self::drain_component(self.inner.read().get(id))
    }

    /// Remove every stored task
    pub fn pop_every_task(&self) -> Vec<TaskRef> {
        let inner = self.inner.read();
        inner.components.iter().flat_map(Self::drain_component).collect()
    }

    /// Tasks stored anywhere in the tree
    pub fn ntasks(&self) -> usize {
        let inner = self.inner.read();
        inner
            .components
            .iter()
            .map(|component| match &component.kind {
                ComponentKind::Fifo(queue) | ComponentKind::Prio(queue) => queue.len(),
                ComponentKind::WorkStealing(ws) => ws.ntasks(),
                ComponentKind::Heft(heft) => heft.len(),
                ComponentKind::Worker(leaf) => leaf.len(),
                _ => 0,
            })
            .sum()
    }

    fn drain_component(component: &SchedComponent) -> Vec<TaskRef> {
        match &component.kind {
            ComponentKind::Fifo(queue) | ComponentKind::Prio(queue) => queue.drain(),
            ComponentKind::WorkStealing(ws) => ws.drain(),
            ComponentKind::Heft(heft) => heft.drain(),
            ComponentKind::Worker(leaf) => leaf.drain(),
            _ => Vec::new(),
        }
    }

    fn push_to(&self, inner: &TreeInner, id: ComponentId, task: TaskRef) -> Result<()> {
        if !self.can_execute_in(inner, id, &task) {
            return Err(RuntimeError::NoDevice(task.id()));
        }
        let component = inner.get(id);
        trace!(task = %task.id(), component = %id, kind = component.kind.label(), "Push");
        match &component.kind {
            ComponentKind::Fifo(queue) | ComponentKind::Prio(queue) => {
                queue.push(task);
                self.wake_workers(component);
                Ok(())
            }
            ComponentKind::Worker(leaf) => {
                leaf.push(task);
                self.env.waker.wake_worker(leaf.worker());
                Ok(())
            }
            ComponentKind::WorkStealing(ws) => self.work_stealing_push(inner, component, ws, task),
            ComponentKind::Random(random) => {
                let child = self.random_child(inner, component, random, &task)?;
                self.push_to(inner, child, task)
            }
            ComponentKind::Eager => {
                let child = self.eager_child(inner, component, &task)?;
                self.push_to(inner, child, task)
            }
            ComponentKind::PerfmodelSelect(branches) => {
                let child = self.perfmodel_branch(component, branches, &task);
                self.push_to(inner, child, task)
            }
            ComponentKind::BestImplementation => {
                let child = self.best_implementation_child(inner, component, &task)?;
                self.push_to(inner, child, task)
            }
            ComponentKind::Heft(heft) => {
                heft.push(task);
                self.heft_pump(inner, id);
                Ok(())
            }
            ComponentKind::Composed(composed) => self.push_to(inner, composed.top, task),
        }
    }

    fn pop_from(&self, inner: &TreeInner, id: ComponentId, worker: WorkerId) -> Option<TaskRef> {
        let component = inner.get(id);
        let descr = self.env.worker(worker)?;
        match &component.kind {
            ComponentKind::Fifo(queue) | ComponentKind::Prio(queue) => {
                let local = |queue: &QueueComponent| queue.pop(|task| worker_may_execute_task(descr, task));
                if let Some(task) = local(queue) {
                    self.room_freed(inner, component.father, queue.has_room());
                    return Some(task);
                }
                if let Some(task) = self.pop_father(inner, component, worker) {
                    return Some(task);
                }
                // A pump above may have refilled this queue
                let task = local(queue)?;
                self.room_freed(inner, component.father, queue.has_room());
                Some(task)
            }
            ComponentKind::Worker(leaf) => {
                if let Some(task) = leaf.pop() {
                    return Some(task);
                }
                if let Some(task) = self.pop_father(inner, component, worker) {
                    return Some(task);
                }
                leaf.pop()
            }
            ComponentKind::WorkStealing(ws) => self
                .work_stealing_pull(inner, component, ws, worker)
                .or_else(|| self.pop_father(inner, component, worker)),
            ComponentKind::Heft(_) => {
                self.heft_pump(inner, id);
                self.pop_father(inner, component, worker)
            }
            _ => self.pop_father(inner, component, worker),
        }
    }

    fn pop_father(&self, inner: &TreeInner, component: &SchedComponent, worker: WorkerId) -> Option<TaskRef> {
        component
            .father
            .and_then(|father| self.pop_from(inner, father, worker))
    }

    /// Tell the pushing ancestors that a queue below has room again
    fn room_freed(&self, inner: &TreeInner, from: Option<ComponentId>, has_room: bool) {
        if !has_room {
            return;
        }
        let mut next = from;
        while let Some(id) = next {
            let component = inner.get(id);
            match &component.kind {
                ComponentKind::Heft(_) => {
                    self.heft_pump(inner, id);
                    return;
                }
                ComponentKind::Fifo(_)
                | ComponentKind::Prio(_)
                | ComponentKind::WorkStealing(_)
                | ComponentKind::Worker(_) => return,
                _ => next = component.father,
            }
        }
    }

    fn wake_workers(&self, component: &SchedComponent) {
        for worker in component.workers_in_ctx.iter() {
            self.env.waker.wake_worker(worker);
        }
    }

    fn can_execute_in(&self, inner: &TreeInner, id: ComponentId, task: &Task) -> bool {
        inner.get(id).workers_in_ctx.iter().any(|worker| {
            self.env
                .worker(worker)
                .map_or(false, |descr| worker_may_execute_task(descr, task))
        })
    }

    fn has_room(&self, inner: &TreeInner, id: ComponentId) -> bool {
        let component = inner.get(id);
        match &component.kind {
            ComponentKind::Fifo(queue) | ComponentKind::Prio(queue) => queue.has_room(),
            ComponentKind::Worker(leaf) => leaf.len() == 0,
            ComponentKind::WorkStealing(_) | ComponentKind::Heft(_) => true,
            ComponentKind::Composed(composed) => self.has_room(inner, composed.top),
            _ => component
                .children
                .iter()
                .any(|child| self.has_room(inner, *child)),
        }
    }

    fn speedup_sum(&self, workers: &WorkerMask) -> f64 {
        let sum: f64 = workers
            .iter()
            .filter_map(|worker| self.env.worker(worker))
            .map(|descr| descr.relative_speedup())
            .sum();
        if sum > 0.0 {
            sum
        } else {
            1.0
        }
    }

    fn estimated_load_in(&self, inner: &TreeInner, id: ComponentId) -> f64 {
        let component = inner.get(id);
        let children: f64 = component
            .children
            .iter()
            .map(|child| self.estimated_load_in(inner, *child))
            .sum();
        let local = match &component.kind {
            ComponentKind::Fifo(queue) | ComponentKind::Prio(queue) => queue.len(),
            ComponentKind::WorkStealing(ws) => ws.ntasks(),
            ComponentKind::Heft(heft) => heft.len(),
            ComponentKind::Worker(leaf) => leaf.len(),
            _ => 0,
        };
        local as f64 / self.speedup_sum(&component.workers_in_ctx) + children
    }

    fn estimated_end_in(&self, inner: &TreeInner, id: ComponentId) -> f64 {
        let now = self.env.now();
        let component = inner.get(id);
        let children_end = component
            .children
            .iter()
            .map(|child| self.estimated_end_in(inner, *child))
            .reduce(f64::min)
            .unwrap_or(now);
        match &component.kind {
            ComponentKind::Fifo(queue) | ComponentKind::Prio(queue) => {
                let nworkers = component.workers_in_ctx.len().max(1) as f64;
                children_end.max(now) + queue.exp_len() / nworkers
            }
            ComponentKind::Worker(leaf) => leaf.estimated_end(now),
            ComponentKind::Composed(composed) => self.estimated_end_in(inner, composed.top),
            _ => children_end,
        }
    }
}

impl fmt::Debug for SchedTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("SchedTree")
            .field("components", &inner.components.len())
            .field("root", &inner.root)
            .field("workers", &inner.ctx_workers.len())
            .finish()
    }
}
