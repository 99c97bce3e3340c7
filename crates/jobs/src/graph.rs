//! Graphviz rendering of a job's execution graph.

use std::collections::HashSet;
use std::fmt::Write;

use dagops_core::{State, TaskId};

use crate::job::Job;
use crate::task::Task;
use crate::transition::Transition;

/// Render the graph reachable from the start task as a DOT document.
///
/// Each task is expanded once, on first visit; the edges leaving it are
/// written after the subtree below each of them. Successor order is the
/// insertion order, so the output is stable for a given job.
pub fn render_dot(job: &Job) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", escape(job.name().as_str()));
    out.push_str("  graph [rankdir=TB];\n");
    out.push_str("  node [shape=box, style=\"rounded,filled\", fontname=\"Helvetica\"];\n");

    if let Some(start) = job.start_task() {
        let mut expanded = HashSet::new();
        visit(job, start.id(), &mut expanded, &mut out);
    }

    out.push_str("}\n");
    out
}

fn visit<'a>(job: &'a Job, id: &'a TaskId, expanded: &mut HashSet<&'a TaskId>, out: &mut String) {
    if !expanded.insert(id) {
        return;
    }
    if let Some(task) = job.task(id) {
        write_node(task, out);
    }
    for transition in job.successors(id) {
        visit(job, &transition.to, expanded, out);
        write_edge(transition, out);
    }
}

fn write_edge(transition: &Transition, out: &mut String) {
    let _ = write!(
        out,
        "  \"{}\" -> \"{}\"",
        escape(transition.from.as_str()),
        escape(transition.to.as_str())
    );
    if let Some(label) = &transition.label {
        let _ = write!(out, " [label=\"{}\"]", escape(label));
    }
    out.push_str(";\n");
}

fn write_node(task: &Task, out: &mut String) {
    let _ = write!(
        out,
        "  \"{}\" [label=\"{}\\n{}\", fillcolor=\"{}\"",
        escape(task.id().as_str()),
        escape(task.name().as_str()),
        task.state(),
        fill_color(task.state())
    );
    if task.is_canary() {
        out.push_str(", peripheries=2");
    }
    out.push_str("];\n");
}

fn fill_color(state: State) -> &'static str {
    match state {
        State::New | State::Waiting => "#ffffff",
        State::Ready => "#e0f0ff",
        State::Active => "#7fb3ff",
        State::Confirm => "#ffd966",
        State::Timeout => "#ff9f40",
        State::Completed => "#8fd694",
        State::Failed | State::Rejected => "#ff6b6b",
        State::Cancelled | State::Skipped => "#d0d0d0",
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagops_core::JobId;

    fn tid(id: &str) -> TaskId {
        id.parse().unwrap()
    }

    fn diamond() -> Job {
        let job_id: JobId = "job-1".parse().unwrap();
        let mut job = Job::new(
            job_id.clone(),
            "upgrade".into(),
            "rolling".into(),
            "say \"hi\"".into(),
        );
        for id in ["start", "a", "b", "end"] {
            let task = Task::new(job_id.clone(), tid(id), "noop".into(), id.into())
                .with_canary(id == "a");
            job.add_task(task).unwrap();
        }
        job.add_successor(&tid("start"), &tid("a"), Some("first".into())).unwrap();
        job.add_successor(&tid("start"), &tid("b"), None).unwrap();
        job.join(&tid("end"), &[tid("a"), tid("b")]).unwrap();
        job
    }

    #[test]
    fn renders_each_node_and_edge_once() {
        let dot = render_dot(&diamond());

        assert!(dot.starts_with("digraph \"say \\\"hi\\\"\" {"));
        assert_eq!(dot.matches("\"end\" [label").count(), 1);
        assert_eq!(dot.matches(" -> ").count(), 4);
        assert!(dot.contains("\"start\" -> \"a\" [label=\"first\"];"));
        assert!(dot.contains("\"a\" [label=\"a\\nNEW\", fillcolor=\"#ffffff\", peripheries=2];"));
    }

    #[test]
    fn output_is_stable() {
        assert_eq!(render_dot(&diamond()), render_dot(&diamond()));
    }

    #[test]
    fn node_order_follows_successor_insertion() {
        let dot = render_dot(&diamond());
        let a = dot.find("\"a\" [label").unwrap();
        let end = dot.find("\"end\" [label").unwrap();
        let b = dot.find("\"b\" [label").unwrap();
        assert!(a < end && end < b);
    }

    /// `stages` sequential two-way fork/join blocks: join(i) -> {a, b} -> join(i+1).
    fn layered(stages: usize) -> Job {
        let job_id: JobId = "job-1".parse().unwrap();
        let mut job = Job::new(job_id.clone(), "upgrade".into(), "rolling".into(), "layers".into());
        let add = |job: &mut Job, id: String| {
            job.add_task(Task::new(job_id.clone(), tid(&id), "noop".into(), id.as_str().into()))
                .unwrap();
        };
        add(&mut job, "join-0".to_string());
        for stage in 0..stages {
            for side in ["a", "b"] {
                add(&mut job, format!("{side}-{stage}"));
                job.add_successor(&tid(&format!("join-{stage}")), &tid(&format!("{side}-{stage}")), None)
                    .unwrap();
            }
            add(&mut job, format!("join-{}", stage + 1));
            job.join(
                &tid(&format!("join-{}", stage + 1)),
                &[tid(&format!("a-{stage}")), tid(&format!("b-{stage}"))],
            )
            .unwrap();
        }
        job
    }

    #[test]
    fn deep_fork_join_chains_render_each_task_once() {
        let job = layered(64);
        job.validate().unwrap();

        let dot = render_dot(&job);

        assert_eq!(dot.matches(" [label=\"").count(), job.task_count());
        assert_eq!(dot.matches(" -> ").count(), 64 * 4);
        assert_eq!(dot.matches("\"join-64\" [label").count(), 1);
    }
}
