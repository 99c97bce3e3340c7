use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;

use dagops_core::{
    DomainError, DomainResult, ElementGroupId, JobApplication, JobId, JobName, JobType, State,
    TaskId, UserName,
};

use crate::submission::{JobSchedule, JobSettingsUpdate};
use crate::task::Task;
use crate::transition::Transition;

/// A DAG-structured unit of orchestration.
///
/// Tasks live in an arena addressed by [`TaskId`]; edges are kept in two
/// adjacency maps (outgoing transitions and incoming task ids) so the graph
/// can be walked in both directions without shared ownership.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    id: JobId,
    application: JobApplication,
    job_type: JobType,
    name: JobName,
    owner: Option<UserName>,
    group_id: Option<ElementGroupId>,
    state: State,
    schedule: JobSchedule,
    modified_at: DateTime<Utc>,

    tasks: Vec<Task>,
    index: HashMap<TaskId, usize>,
    successors: HashMap<TaskId, Vec<Transition>>,
    predecessors: HashMap<TaskId, Vec<TaskId>>,
    next_seq: u64,
}

/// Job and task states captured before a mutation.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    job: State,
    tasks: HashMap<TaskId, State>,
}

/// A state that differs from a [`StateSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateDelta {
    Job(State),
    Task(TaskId, State),
}

impl Job {
    /// Create an empty job in state NEW.
    pub fn new(id: JobId, application: JobApplication, job_type: JobType, name: JobName) -> Self {
        Self {
            id,
            application,
            job_type,
            name,
            owner: None,
            group_id: None,
            state: State::New,
            schedule: JobSchedule::default(),
            modified_at: Utc::now(),
            tasks: Vec::new(),
            index: HashMap::new(),
            successors: HashMap::new(),
            predecessors: HashMap::new(),
            next_seq: 0,
        }
    }

    pub fn with_owner(mut self, owner: UserName) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_group(mut self, group_id: ElementGroupId) -> Self {
        self.group_id = Some(group_id);
        self
    }

    pub fn with_schedule(mut self, schedule: JobSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Restore persisted state when rehydrating a job from storage.
    pub fn restore_state(mut self, state: State, modified_at: DateTime<Utc>) -> Self {
        self.state = state;
        self.modified_at = modified_at;
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn application(&self) -> &JobApplication {
        &self.application
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn name(&self) -> &JobName {
        &self.name
    }

    pub fn owner(&self) -> Option<&UserName> {
        self.owner.as_ref()
    }

    pub fn group_id(&self) -> Option<&ElementGroupId> {
        self.group_id.as_ref()
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn schedule(&self) -> &JobSchedule {
        &self.schedule
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    pub fn is_new(&self) -> bool {
        self.state == State::New
    }

    pub fn is_running(&self) -> bool {
        self.state == State::Active
    }

    pub fn is_terminated(&self) -> bool {
        self.state.is_terminal()
    }

    // ---- graph -----------------------------------------------------------

    /// Add a task to the arena. The task must belong to this job.
    pub fn add_task(&mut self, task: Task) -> DomainResult<()> {
        if task.job_id() != &self.id {
            return Err(DomainError::validation(format!(
                "task {} belongs to job {}, not {}",
                task.id(),
                task.job_id(),
                self.id
            )));
        }
        if self.index.contains_key(task.id()) {
            return Err(DomainError::validation(format!(
                "duplicate task id {} in job {}",
                task.id(),
                self.id
            )));
        }
        self.index.insert(task.id().clone(), self.tasks.len());
        self.tasks.push(task);
        Ok(())
    }

    pub fn task(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|&idx| &self.tasks[idx])
    }

    pub fn require_task(&self, id: &TaskId) -> DomainResult<&Task> {
        self.task(id)
            .ok_or_else(|| DomainError::not_found("task", id))
    }

    fn task_mut(&mut self, id: &TaskId) -> DomainResult<&mut Task> {
        match self.index.get(id) {
            Some(&idx) => Ok(&mut self.tasks[idx]),
            None => Err(DomainError::not_found("task", id)),
        }
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Create the transition `from -> to`, or relabel it if it already exists.
    pub fn add_successor(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        label: Option<String>,
    ) -> DomainResult<()> {
        let seq = self.next_seq;
        if self.link(from, to, label, seq)? {
            self.next_seq += 1;
        }
        Ok(())
    }

    /// Re-insert a persisted transition, keeping its original sequence.
    pub fn restore_transition(&mut self, transition: Transition) -> DomainResult<()> {
        let seq = transition.seq;
        self.link(&transition.from, &transition.to, transition.label, seq)?;
        self.next_seq = self.next_seq.max(seq + 1);
        Ok(())
    }

    /// Returns `true` when a new edge was created.
    fn link(
        &mut self,
        from: &TaskId,
        to: &TaskId,
        label: Option<String>,
        seq: u64,
    ) -> DomainResult<bool> {
        self.require_task(from)?;
        self.require_task(to)?;
        if from == to {
            return Err(DomainError::validation(format!(
                "task {from} cannot be its own successor"
            )));
        }

        let outgoing = self.successors.entry(from.clone()).or_default();
        if let Some(existing) = outgoing.iter_mut().find(|t| &t.to == to) {
            existing.label = label;
            return Ok(false);
        }
        let position = outgoing.partition_point(|t| t.seq < seq);
        outgoing.insert(position, Transition::new(from.clone(), to.clone(), label, seq));
        self.predecessors
            .entry(to.clone())
            .or_default()
            .push(from.clone());
        Ok(true)
    }

    /// Remove the transition `from -> to` in both directions.
    pub fn remove_successor(&mut self, from: &TaskId, to: &TaskId) -> bool {
        let removed = match self.successors.get_mut(from) {
            Some(outgoing) => {
                let before = outgoing.len();
                outgoing.retain(|t| &t.to != to);
                outgoing.len() != before
            }
            None => false,
        };
        if removed {
            if let Some(incoming) = self.predecessors.get_mut(to) {
                incoming.retain(|p| p != from);
            }
        }
        removed
    }

    /// Make `task` a successor of every task in `predecessors`.
    pub fn join(&mut self, task: &TaskId, predecessors: &[TaskId]) -> DomainResult<()> {
        for predecessor in predecessors {
            self.add_successor(predecessor, task, None)?;
        }
        Ok(())
    }

    /// Outgoing transitions in insertion order.
    pub fn successors(&self, id: &TaskId) -> &[Transition] {
        self.successors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn predecessors(&self, id: &TaskId) -> &[TaskId] {
        self.predecessors.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_fork(&self, id: &TaskId) -> bool {
        self.successors(id).len() > 1
    }

    pub fn is_join(&self, id: &TaskId) -> bool {
        self.predecessors(id).len() > 1
    }

    /// All transitions ordered by insertion sequence.
    pub fn transitions(&self) -> Vec<&Transition> {
        let mut all: Vec<&Transition> = self.successors.values().flatten().collect();
        all.sort_by_key(|t| t.seq);
        all
    }

    /// The task without predecessors. Submission validation guarantees there
    /// is exactly one.
    pub fn start_task(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|task| self.predecessors(task.id()).is_empty())
    }

    /// Depth-first walk from the start task. A task's successors are only
    /// expanded once every one of its predecessors has been visited.
    pub fn ordered_tasks(&self) -> Vec<&Task> {
        let Some(start) = self.start_task() else {
            return Vec::new();
        };
        let mut order = vec![start.id()];
        let mut seen: HashSet<&TaskId> = HashSet::from([start.id()]);
        let mut expanded: HashSet<&TaskId> = HashSet::new();
        self.traverse(start.id(), &mut order, &mut seen, &mut expanded);
        order.into_iter().filter_map(|id| self.task(id)).collect()
    }

    fn traverse<'a>(
        &'a self,
        id: &'a TaskId,
        order: &mut Vec<&'a TaskId>,
        seen: &mut HashSet<&'a TaskId>,
        expanded: &mut HashSet<&'a TaskId>,
    ) {
        if !self.predecessors(id).iter().all(|p| seen.contains(p)) {
            return;
        }
        if !expanded.insert(id) {
            return;
        }
        for transition in self.successors(id) {
            if seen.insert(&transition.to) {
                order.push(&transition.to);
            }
            self.traverse(&transition.to, order, seen, expanded);
        }
    }

    /// READY, or WAITING with every predecessor COMPLETED.
    pub fn is_eligible_for_execution(&self, id: &TaskId) -> bool {
        match self.task(id).map(Task::state) {
            Some(State::Ready) => true,
            Some(State::Waiting) => self.predecessors_completed(id),
            _ => false,
        }
    }

    fn predecessors_completed(&self, id: &TaskId) -> bool {
        self.predecessors(id)
            .iter()
            .all(|p| self.task(p).is_some_and(Task::is_succeeded))
    }

    /// Check the graph shape: at least one task, exactly one start task, no
    /// cycles and every task reachable from the start task.
    pub fn validate(&self) -> DomainResult<()> {
        if self.tasks.is_empty() {
            return Err(DomainError::validation(format!("job {} has no tasks", self.id)));
        }

        let roots: Vec<&TaskId> = self
            .tasks
            .iter()
            .map(Task::id)
            .filter(|id| self.predecessors(id).is_empty())
            .collect();
        let [start] = roots.as_slice() else {
            return Err(DomainError::validation(format!(
                "job {} must have exactly one start task, found {}",
                self.id,
                roots.len()
            )));
        };

        let graph = self.graph();
        if let Err(cycle) = toposort(&graph, None) {
            return Err(DomainError::validation(format!(
                "task graph of job {} contains a cycle through task {}",
                self.id,
                cycle.node_id()
            )));
        }

        let mut reachable = HashSet::new();
        let mut dfs = Dfs::new(&graph, *start);
        while let Some(id) = dfs.next(&graph) {
            reachable.insert(id);
        }
        if let Some(orphan) = self.tasks.iter().map(Task::id).find(|id| !reachable.contains(id)) {
            return Err(DomainError::validation(format!(
                "task {orphan} of job {} is not reachable from the start task",
                self.id
            )));
        }
        Ok(())
    }

    /// Tasks as nodes, transitions as edges.
    fn graph(&self) -> DiGraphMap<&TaskId, ()> {
        let mut graph = DiGraphMap::new();
        for task in &self.tasks {
            graph.add_node(task.id());
        }
        for transition in self.successors.values().flatten() {
            graph.add_edge(&transition.from, &transition.to, ());
        }
        graph
    }

    // ---- state -----------------------------------------------------------

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            job: self.state,
            tasks: self
                .tasks
                .iter()
                .map(|t| (t.id().clone(), t.state()))
                .collect(),
        }
    }

    /// Task changes in arena order, followed by the job change (if any).
    pub fn changes_since(&self, before: &StateSnapshot) -> Vec<StateDelta> {
        let mut changes: Vec<StateDelta> = self
            .tasks
            .iter()
            .filter(|t| before.tasks.get(t.id()) != Some(&t.state()))
            .map(|t| StateDelta::Task(t.id().clone(), t.state()))
            .collect();
        if before.job != self.state {
            changes.push(StateDelta::Job(self.state));
        }
        changes
    }

    fn set_job_state(&mut self, state: State) {
        self.state = state;
        self.modified_at = Utc::now();
    }

    /// Set a task's state and return the previous one.
    pub fn set_task_state(&mut self, id: &TaskId, state: State) -> DomainResult<State> {
        let now = Utc::now();
        let task = self.task_mut(id)?;
        let previous = task.state();
        task.set_state(state, now);
        self.modified_at = now;
        Ok(previous)
    }

    fn set_tasks_where(&mut self, from: impl Fn(State) -> bool, to: State) -> Vec<TaskId> {
        let now = Utc::now();
        let mut changed = Vec::new();
        for task in self.tasks.iter_mut().filter(|t| from(t.state())) {
            task.set_state(to, now);
            changed.push(task.id().clone());
        }
        if !changed.is_empty() {
            self.modified_at = now;
        }
        changed
    }

    pub fn has_task_in(&self, predicate: impl Fn(State) -> bool) -> bool {
        self.tasks.iter().any(|t| predicate(t.state()))
    }

    pub fn all_tasks_completed(&self) -> bool {
        self.tasks.iter().all(Task::is_succeeded)
    }

    /// NEW → READY with every task WAITING. Unscheduled jobs are scheduled for `now`.
    pub fn commit(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if !self.is_new() {
            return Err(DomainError::conflict(format!(
                "job {} ({}) cannot be committed in state {}",
                self.name, self.id, self.state
            )));
        }
        self.set_tasks_where(|_| true, State::Waiting);
        if self.schedule.scheduled.is_none() {
            self.schedule.scheduled = Some(now);
        }
        self.set_job_state(State::Ready);
        Ok(())
    }

    /// Only terminated jobs may be deleted.
    pub fn ensure_removable(&self) -> DomainResult<()> {
        if self.is_terminated() {
            return Ok(());
        }
        Err(DomainError::conflict(format!(
            "job {} ({}) is {}; only terminated jobs can be removed",
            self.name, self.id, self.state
        )))
    }

    /// Cancel the job and every task that has not terminated yet.
    pub fn cancel(&mut self) -> DomainResult<()> {
        if self.is_terminated() {
            return Err(DomainError::conflict(format!(
                "job {} ({}) is already {}",
                self.name, self.id, self.state
            )));
        }
        self.set_tasks_where(|s| !s.is_terminal(), State::Cancelled);
        self.set_job_state(State::Cancelled);
        Ok(())
    }

    /// Re-arm a FAILED or CANCELLED job. Returns `false` when there is nothing
    /// to resume.
    pub fn resume(&mut self) -> DomainResult<bool> {
        match self.state {
            State::Completed => Err(DomainError::conflict(format!(
                "job {} ({}) is completed and cannot be resumed",
                self.name, self.id
            ))),
            State::Failed | State::Cancelled => {
                self.set_tasks_where(|s| s.is_resumable(), State::Waiting);
                self.set_job_state(State::Active);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Mark the job FAILED and skip every task that has not started.
    pub fn failed(&mut self) -> Vec<TaskId> {
        let skipped =
            self.set_tasks_where(|s| matches!(s, State::Ready | State::Waiting), State::Skipped);
        self.set_job_state(State::Failed);
        skipped
    }

    /// Complete the job once every task has completed.
    pub fn completed(&mut self) -> bool {
        if self.is_terminated() || !self.all_tasks_completed() {
            return false;
        }
        self.set_job_state(State::Completed);
        true
    }

    /// Park the job until pending canary tasks are confirmed.
    pub fn await_confirmation(&mut self) {
        if self.state != State::Confirm {
            self.set_job_state(State::Confirm);
        }
    }

    /// CONFIRM → ACTIVE once no task awaits confirmation.
    pub fn confirmed(&mut self) -> bool {
        if self.state != State::Confirm || self.has_task_in(|s| s == State::Confirm) {
            return false;
        }
        self.set_job_state(State::Active);
        true
    }

    /// Move every CONFIRM task to COMPLETED.
    pub fn complete_confirmed_tasks(&mut self) -> Vec<TaskId> {
        self.set_tasks_where(|s| s == State::Confirm, State::Completed)
    }

    /// READY → ACTIVE once the scheduled time has arrived.
    pub fn start_if_due(&mut self, now: DateTime<Utc>) -> bool {
        let due = self.schedule.scheduled.is_none_or(|at| at <= now);
        if self.state != State::Ready || !due {
            return false;
        }
        self.set_job_state(State::Active);
        true
    }

    /// In an ACTIVE job, promote WAITING tasks whose predecessors all completed.
    pub fn mark_eligible_tasks_ready(&mut self) -> Vec<TaskId> {
        if !self.is_running() {
            return Vec::new();
        }
        let eligible: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.state() == State::Waiting && self.predecessors_completed(t.id()))
            .map(|t| t.id().clone())
            .collect();
        let now = Utc::now();
        for id in &eligible {
            if let Some(&idx) = self.index.get(id) {
                self.tasks[idx].set_state(State::Ready, now);
            }
        }
        if !eligible.is_empty() {
            self.modified_at = now;
        }
        eligible
    }

    /// Claim up to `limit` READY tasks of an ACTIVE job (READY → ACTIVE).
    pub fn claim_ready_tasks(&mut self, limit: usize) -> Vec<TaskId> {
        if !self.is_running() || limit == 0 {
            return Vec::new();
        }
        let now = Utc::now();
        let mut claimed = Vec::new();
        for task in self.tasks.iter_mut() {
            if claimed.len() == limit {
                break;
            }
            if task.state() == State::Ready {
                task.set_state(State::Active, now);
                claimed.push(task.id().clone());
            }
        }
        if !claimed.is_empty() {
            self.modified_at = now;
        }
        claimed
    }

    /// ACTIVE tasks last modified before `cutoff` become TIMEOUT.
    pub fn expire_tasks(&mut self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        let expired: Vec<TaskId> = self
            .tasks
            .iter()
            .filter(|t| t.state() == State::Active && t.modified_at() < cutoff)
            .map(|t| t.id().clone())
            .collect();
        let now = Utc::now();
        for id in &expired {
            if let Some(&idx) = self.index.get(id) {
                self.tasks[idx].set_state(State::Timeout, now);
            }
        }
        if !expired.is_empty() {
            self.modified_at = now;
        }
        expired
    }

    /// Replace a task's parameters while the job is not running and the task
    /// has not succeeded.
    pub fn set_task_parameters(
        &mut self,
        id: &TaskId,
        parameters: serde_json::Value,
    ) -> DomainResult<()> {
        if self.is_running() {
            return Err(DomainError::conflict(format!(
                "job {} ({}) is running; task parameters are immutable",
                self.name, self.id
            )));
        }
        let task = self.task_mut(id)?;
        if task.is_succeeded() {
            return Err(DomainError::conflict(format!(
                "task {id} already completed; parameters are immutable"
            )));
        }
        task.set_parameters(parameters);
        self.modified_at = Utc::now();
        Ok(())
    }

    /// Update name, schedule and owner. Not allowed for running or completed jobs.
    pub fn update_settings(
        &mut self,
        update: JobSettingsUpdate,
        owner: Option<UserName>,
    ) -> DomainResult<()> {
        if matches!(self.state, State::Active | State::Completed) {
            return Err(DomainError::conflict(format!(
                "settings of job {} ({}) must not be modified in state {}",
                self.name, self.id, self.state
            )));
        }
        self.name = update.name;
        self.schedule = update.schedule;
        if owner.is_some() {
            self.owner = owner;
        }
        self.modified_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    fn tid(id: &str) -> TaskId {
        id.parse().unwrap()
    }

    fn job_with(tasks: &[&str]) -> Job {
        let job_id: JobId = "job-1".parse().unwrap();
        let mut job = Job::new(
            job_id.clone(),
            "upgrade".into(),
            "rolling".into(),
            "upgrade leafs".into(),
        );
        for id in tasks {
            job.add_task(Task::new(job_id.clone(), tid(id), "noop".into(), (*id).into()))
                .unwrap();
        }
        job
    }

    /// start -> a, start -> b, a -> join, b -> join, join -> end
    fn fork_join() -> Job {
        let mut job = job_with(&["start", "a", "b", "join", "end"]);
        job.add_successor(&tid("start"), &tid("a"), None).unwrap();
        job.add_successor(&tid("start"), &tid("b"), None).unwrap();
        job.join(&tid("join"), &[tid("a"), tid("b")]).unwrap();
        job.add_successor(&tid("join"), &tid("end"), None).unwrap();
        job
    }

    fn ids(tasks: Vec<&Task>) -> Vec<String> {
        tasks.into_iter().map(|t| t.id().to_string()).collect()
    }

    #[test]
    fn add_successor_records_both_directions() {
        let job = fork_join();
        let successors: Vec<&TaskId> = job.successors(&tid("start")).iter().map(|t| &t.to).collect();
        assert_eq!(successors, vec![&tid("a"), &tid("b")]);
        assert_eq!(job.predecessors(&tid("join")), &[tid("a"), tid("b")]);
        assert!(job.is_fork(&tid("start")));
        assert!(job.is_join(&tid("join")));
    }

    #[test]
    fn adding_an_existing_edge_relabels_it() {
        let mut job = fork_join();
        job.add_successor(&tid("start"), &tid("a"), Some("primary".into()))
            .unwrap();
        let edges = job.successors(&tid("start"));
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].label.as_deref(), Some("primary"));
        assert_eq!(job.predecessors(&tid("a")).len(), 1);
    }

    #[test]
    fn remove_successor_drops_both_directions() {
        let mut job = fork_join();
        assert!(job.remove_successor(&tid("b"), &tid("join")));
        assert_eq!(job.predecessors(&tid("join")), &[tid("a")]);
        assert!(job.successors(&tid("b")).is_empty());
        assert!(!job.remove_successor(&tid("b"), &tid("join")));
    }

    #[test]
    fn self_loops_and_unknown_tasks_are_rejected() {
        let mut job = fork_join();
        assert!(matches!(
            job.add_successor(&tid("a"), &tid("a"), None),
            Err(DomainError::Validation(_))
        ));
        assert!(matches!(
            job.add_successor(&tid("a"), &tid("ghost"), None),
            Err(DomainError::NotFound { .. })
        ));
    }

    #[test]
    fn ordered_tasks_waits_for_all_predecessors_before_expanding() {
        let job = fork_join();
        assert_eq!(
            ids(job.ordered_tasks()),
            vec!["start", "a", "join", "b", "end"]
        );
    }

    #[test]
    fn successors_follow_insertion_order_after_restore() {
        let mut job = job_with(&["start", "x", "y"]);
        job.restore_transition(Transition::new(tid("start"), tid("y"), None, 7))
            .unwrap();
        job.restore_transition(Transition::new(tid("start"), tid("x"), None, 3))
            .unwrap();
        let order: Vec<&TaskId> = job.successors(&tid("start")).iter().map(|t| &t.to).collect();
        assert_eq!(order, vec![&tid("x"), &tid("y")]);

        job.add_successor(&tid("x"), &tid("y"), None).unwrap();
        assert_eq!(job.successors(&tid("x"))[0].seq, 8);
    }

    #[test]
    fn validate_rejects_cycles_and_multiple_starts() {
        let mut cyclic = job_with(&["start", "a", "b"]);
        cyclic.add_successor(&tid("start"), &tid("a"), None).unwrap();
        cyclic.add_successor(&tid("a"), &tid("b"), None).unwrap();
        cyclic.add_successor(&tid("b"), &tid("a"), None).unwrap();
        assert!(matches!(cyclic.validate(), Err(DomainError::Validation(m)) if m.contains("cycle through task")));

        let two_starts = job_with(&["start", "other"]);
        assert!(two_starts.validate().is_err());

        assert!(job_with(&[]).validate().is_err());
        assert!(fork_join().validate().is_ok());
    }

    #[test]
    fn waiting_task_without_predecessors_is_eligible() {
        let mut job = fork_join();
        job.commit(Utc::now()).unwrap();
        assert!(job.is_eligible_for_execution(&tid("start")));
        assert!(!job.is_eligible_for_execution(&tid("a")));
    }

    #[test]
    fn join_becomes_ready_only_after_every_branch_completes() {
        let mut job = fork_join();
        job.commit(Utc::now()).unwrap();
        assert!(job.start_if_due(Utc::now()));

        for id in ["start", "a"] {
            job.set_task_state(&tid(id), State::Completed).unwrap();
        }
        assert_eq!(job.mark_eligible_tasks_ready(), vec![tid("b")]);

        job.set_task_state(&tid("b"), State::Completed).unwrap();
        assert_eq!(job.mark_eligible_tasks_ready(), vec![tid("join")]);
        assert_eq!(job.task(&tid("end")).unwrap().state(), State::Waiting);

        job.set_task_state(&tid("join"), State::Completed).unwrap();
        assert_eq!(job.mark_eligible_tasks_ready(), vec![tid("end")]);
    }

    #[test]
    fn inactive_jobs_do_not_promote_tasks() {
        let mut job = fork_join();
        job.commit(Utc::now()).unwrap();
        assert!(job.mark_eligible_tasks_ready().is_empty());
        assert!(job.claim_ready_tasks(10).is_empty());
    }

    #[test]
    fn commit_only_from_new_and_defaults_schedule() {
        let mut job = fork_join();
        job.commit(Utc::now()).unwrap();
        assert_eq!(job.state(), State::Ready);
        assert!(job.schedule().scheduled.is_some());
        assert!(job.tasks().all(|t| t.state() == State::Waiting));
        assert!(matches!(job.commit(Utc::now()), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn future_jobs_are_not_started_early() {
        let mut job = fork_join().with_schedule(JobSchedule::at(Utc::now() + Duration::hours(1)));
        job.commit(Utc::now()).unwrap();
        assert!(!job.start_if_due(Utc::now()));
        assert!(job.start_if_due(Utc::now() + Duration::hours(2)));
    }

    #[test]
    fn failed_skips_ready_and_waiting_tasks() {
        let mut job = fork_join();
        job.commit(Utc::now()).unwrap();
        job.start_if_due(Utc::now());
        job.set_task_state(&tid("start"), State::Completed).unwrap();
        job.set_task_state(&tid("a"), State::Failed).unwrap();
        job.set_task_state(&tid("b"), State::Ready).unwrap();

        let skipped = job.failed();

        assert_eq!(job.state(), State::Failed);
        assert_eq!(skipped, vec![tid("b"), tid("join"), tid("end")]);
        assert_eq!(job.task(&tid("start")).unwrap().state(), State::Completed);
        assert_eq!(job.task(&tid("a")).unwrap().state(), State::Failed);
    }

    #[test]
    fn cancel_leaves_terminal_tasks_untouched() {
        let mut job = fork_join();
        job.commit(Utc::now()).unwrap();
        job.set_task_state(&tid("start"), State::Completed).unwrap();
        job.set_task_state(&tid("a"), State::Rejected).unwrap();

        job.cancel().unwrap();

        assert_eq!(job.state(), State::Cancelled);
        assert_eq!(job.task(&tid("start")).unwrap().state(), State::Completed);
        assert_eq!(job.task(&tid("a")).unwrap().state(), State::Rejected);
        for id in ["b", "join", "end"] {
            assert_eq!(job.task(&tid(id)).unwrap().state(), State::Cancelled);
        }
        assert!(matches!(job.cancel(), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn resume_rearms_only_resumable_tasks() {
        let mut job = fork_join();
        job.commit(Utc::now()).unwrap();
        job.set_task_state(&tid("start"), State::Completed).unwrap();
        job.set_task_state(&tid("a"), State::Active).unwrap();
        job.set_task_state(&tid("b"), State::Failed).unwrap();
        job.failed();

        assert!(job.resume().unwrap());

        assert_eq!(job.state(), State::Active);
        assert_eq!(job.task(&tid("start")).unwrap().state(), State::Completed);
        assert_eq!(job.task(&tid("a")).unwrap().state(), State::Active);
        for id in ["b", "join", "end"] {
            assert_eq!(job.task(&tid(id)).unwrap().state(), State::Waiting);
        }
    }

    #[test]
    fn resume_of_completed_job_conflicts() {
        let mut job = job_with(&["start"]);
        job.commit(Utc::now()).unwrap();
        job.set_task_state(&tid("start"), State::Completed).unwrap();
        assert!(job.completed());
        assert!(matches!(job.resume(), Err(DomainError::Conflict(_))));
    }

    #[test]
    fn confirmed_waits_for_the_last_confirm_task() {
        let mut job = fork_join();
        job.commit(Utc::now()).unwrap();
        job.set_task_state(&tid("a"), State::Confirm).unwrap();
        job.set_task_state(&tid("b"), State::Confirm).unwrap();
        job.await_confirmation();

        job.set_task_state(&tid("a"), State::Completed).unwrap();
        assert!(!job.confirmed());
        assert_eq!(job.state(), State::Confirm);

        job.set_task_state(&tid("b"), State::Completed).unwrap();
        assert!(job.confirmed());
        assert_eq!(job.state(), State::Active);
    }

    #[test]
    fn expire_tasks_uses_last_modification_time() {
        let job_id: JobId = "job-1".parse().unwrap();
        let now = Utc::now();
        let mut job = Job::new(job_id.clone(), "upgrade".into(), "rolling".into(), "n".into());
        job.add_task(
            Task::new(job_id.clone(), tid("old"), "noop".into(), "old".into())
                .restore_state(State::Active, now - Duration::minutes(20)),
        )
        .unwrap();
        job.add_task(
            Task::new(job_id.clone(), tid("fresh"), "noop".into(), "fresh".into())
                .restore_state(State::Active, now - Duration::minutes(5)),
        )
        .unwrap();
        let mut job = job.restore_state(State::Active, now - Duration::hours(1));

        let expired = job.expire_tasks(now - Duration::minutes(15));

        assert_eq!(expired, vec![tid("old")]);
        assert_eq!(job.task(&tid("old")).unwrap().state(), State::Timeout);
        assert_eq!(job.task(&tid("fresh")).unwrap().state(), State::Active);
        assert!(job.modified_at() >= now);

        let untouched = job.modified_at();
        assert!(job.expire_tasks(now - Duration::minutes(15)).is_empty());
        assert_eq!(job.modified_at(), untouched);
    }

    #[test]
    fn validate_names_the_task_on_a_cycle() {
        let mut looped = job_with(&["start", "a", "b", "c"]);
        looped.add_successor(&tid("start"), &tid("a"), None).unwrap();
        looped.add_successor(&tid("a"), &tid("b"), None).unwrap();
        looped.add_successor(&tid("b"), &tid("c"), None).unwrap();
        looped.add_successor(&tid("c"), &tid("a"), None).unwrap();

        let Err(DomainError::Validation(message)) = looped.validate() else {
            panic!("cycle accepted");
        };
        assert!(["a", "b", "c"].iter().any(|id| message.ends_with(&format!("task {id}"))));
    }

    #[test]
    fn parameters_are_frozen_while_running_or_after_success() {
        let mut job = fork_join();
        job.commit(Utc::now()).unwrap();
        job.set_task_parameters(&tid("a"), serde_json::json!({"image": "v2"}))
            .unwrap();
        assert_eq!(job.task(&tid("a")).unwrap().parameters()["image"], "v2");

        job.set_task_state(&tid("start"), State::Completed).unwrap();
        assert!(job.set_task_parameters(&tid("start"), serde_json::Value::Null).is_err());

        job.start_if_due(Utc::now());
        assert!(matches!(
            job.set_task_parameters(&tid("b"), serde_json::Value::Null),
            Err(DomainError::Conflict(_))
        ));
    }

    #[test]
    fn changes_since_reports_tasks_then_job() {
        let mut job = fork_join();
        let before = job.snapshot();
        job.commit(Utc::now()).unwrap();
        let changes = job.changes_since(&before);
        assert_eq!(changes.len(), 6);
        assert_eq!(changes[0], StateDelta::Task(tid("start"), State::Waiting));
        assert_eq!(changes[5], StateDelta::Job(State::Ready));
    }

    /// Random DAG over `n` tasks: edges only go from lower to higher index and
    /// every task > 0 gets at least one predecessor, so task 0 is the start.
    fn dag_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
        (2usize..12).prop_flat_map(|n| {
            let parents = (1..n)
                .map(|child| (0..child).prop_map(move |parent| (parent, child)))
                .collect::<Vec<_>>();
            let extra = prop::collection::vec((0..n, 0..n), 0..n * 2);
            (Just(n), parents, extra)
        })
        .prop_map(|(n, parents, extra)| {
            let mut edges = parents;
            edges.extend(extra.into_iter().filter(|(a, b)| a < b));
            (n, edges)
        })
    }

    fn build_dag(n: usize, edges: &[(usize, usize)]) -> Job {
        let names: Vec<String> = (0..n).map(|i| format!("t{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let mut job = job_with(&refs);
        for (from, to) in edges {
            job.add_successor(&tid(&names[*from]), &tid(&names[*to]), None)
                .unwrap();
        }
        job
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, ..ProptestConfig::default() })]

        #[test]
        fn generated_dags_validate_and_visit_every_task((n, edges) in dag_strategy()) {
            let job = build_dag(n, &edges);
            prop_assert!(job.validate().is_ok());
            let ordered = job.ordered_tasks();
            prop_assert_eq!(ordered.len(), n);
            prop_assert_eq!(ordered[0].id(), &tid("t0"));
        }

        #[test]
        fn waiting_task_eligibility_tracks_predecessors(
            (n, edges) in dag_strategy(),
            completed in prop::collection::vec(any::<bool>(), 12),
        ) {
            let mut job = build_dag(n, &edges);
            job.commit(Utc::now()).unwrap();
            for i in 0..n {
                if completed[i] {
                    job.set_task_state(&tid(&format!("t{i}")), State::Completed).unwrap();
                }
            }
            for i in 0..n {
                let id = tid(&format!("t{i}"));
                if job.task(&id).unwrap().state() != State::Waiting {
                    continue;
                }
                let all_done = job
                    .predecessors(&id)
                    .iter()
                    .all(|p| job.task(p).unwrap().state() == State::Completed);
                prop_assert_eq!(job.is_eligible_for_execution(&id), all_done);
            }
        }

        #[test]
        fn job_completes_iff_every_task_completed(
            (n, edges) in dag_strategy(),
            completed in prop::collection::vec(any::<bool>(), 12),
        ) {
            let mut job = build_dag(n, &edges);
            job.commit(Utc::now()).unwrap();
            for i in 0..n {
                if completed[i] {
                    job.set_task_state(&tid(&format!("t{i}")), State::Completed).unwrap();
                }
            }
            let expected = completed[..n].iter().all(|c| *c);
            prop_assert_eq!(job.completed(), expected);
            prop_assert_eq!(job.state() == State::Completed, expected);
        }
    }
}
