//! C3 — Dependency Planner.
//!
//! Kahn's-algorithm topological layering of a [`WorkflowDef`] into
//! sequential phases of concurrently-runnable stages. Grounded in the
//! teacher's `dag/builder.rs` + `dag/scheduler.rs` (`DagBuilder::build`,
//! `DagScheduler::compute_waves`) — same graph-index-then-layer shape,
//! generalized from phase numbers to named stages with priorities and
//! resource requirements.

use crate::error::PlannerError;
use crate::model::{StageDef, WorkflowDef};
use std::collections::{BTreeSet, HashMap, HashSet};

/// One phase of the execution plan: a set of stage names safe to run
/// concurrently, deterministically ordered by priority then name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phase {
    pub stages: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub phases: Vec<Phase>,
}

impl ExecutionPlan {
    pub fn phase_of(&self, stage: &str) -> Option<usize> {
        self.phases
            .iter()
            .position(|phase| phase.stages.iter().any(|s| s == stage))
    }
}

pub struct DependencyPlanner;

impl DependencyPlanner {
    /// Build an [`ExecutionPlan`] from a workflow, detecting dangling
    /// dependencies before layering and cycles after.
    pub fn plan(workflow: &WorkflowDef) -> Result<ExecutionPlan, PlannerError> {
        let mut seen = HashSet::new();
        for stage in &workflow.stages {
            if !seen.insert(stage.name.clone()) {
                return Err(PlannerError::DuplicateStage(stage.name.clone()));
            }
        }
        let names: HashSet<&str> = workflow.stages.iter().map(|s| s.name.as_str()).collect();
        for stage in &workflow.stages {
            for dep in &stage.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(PlannerError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let by_name: HashMap<&str, &StageDef> =
            workflow.stages.iter().map(|s| (s.name.as_str(), s)).collect();

        // in_degree counts unresolved dependencies; Kahn peels off stages
        // whose in_degree reaches zero, one layer ("phase") at a time.
        let mut in_degree: HashMap<&str, usize> = workflow
            .stages
            .iter()
            .map(|s| (s.name.as_str(), s.dependencies.len()))
            .collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
        for stage in &workflow.stages {
            for dep in &stage.dependencies {
                dependents.entry(dep.as_str()).or_default().push(&stage.name);
            }
        }

        let mut phases = Vec::new();
        let mut placed: HashSet<&str> = HashSet::new();

        loop {
            let mut ready: Vec<&str> = in_degree
                .iter()
                .filter(|(name, deg)| **deg == 0 && !placed.contains(*name))
                .map(|(name, _)| *name)
                .collect();
            if ready.is_empty() {
                break;
            }
            ready.sort_by(priority_then_name(&by_name));

            for &name in &ready {
                placed.insert(name);
                if let Some(deps) = dependents.get(name) {
                    for &dependent in deps {
                        if let Some(deg) = in_degree.get_mut(dependent) {
                            *deg = deg.saturating_sub(1);
                        }
                    }
                }
            }
            for name in &ready {
                in_degree.remove(name);
            }
            phases.push(Phase {
                stages: ready.into_iter().map(str::to_string).collect(),
            });
        }

        if placed.len() != workflow.stages.len() {
            let unresolved: BTreeSet<String> = workflow
                .stages
                .iter()
                .map(|s| s.name.clone())
                .filter(|n| !placed.contains(n.as_str()))
                .collect();
            return Err(PlannerError::Cycle {
                members: unresolved.into_iter().collect(),
            });
        }

        Ok(ExecutionPlan { phases })
    }

    /// Sum of the max estimated duration per phase — an optimistic parallel
    /// bound (§4.3 "EstimateTotalTime").
    pub fn estimate_total_time(
        workflow: &WorkflowDef,
        plan: &ExecutionPlan,
    ) -> std::time::Duration {
        let by_name: HashMap<&str, &StageDef> =
            workflow.stages.iter().map(|s| (s.name.as_str(), s)).collect();
        plan.phases
            .iter()
            .map(|phase| {
                phase
                    .stages
                    .iter()
                    .filter_map(|name| by_name.get(name.as_str()))
                    .map(|s| s.estimated_duration)
                    .max()
                    .unwrap_or_default()
            })
            .sum()
    }

    /// Union of required resources per phase, for early feasibility checks
    /// against the arbiter's pool capacities.
    pub fn required_resources(workflow: &WorkflowDef, plan: &ExecutionPlan) -> Vec<BTreeSet<String>> {
        let by_name: HashMap<&str, &StageDef> =
            workflow.stages.iter().map(|s| (s.name.as_str(), s)).collect();
        plan.phases
            .iter()
            .map(|phase| {
                let mut set = BTreeSet::new();
                for name in &phase.stages {
                    if let Some(stage) = by_name.get(name.as_str()) {
                        set.extend(stage.required_resources.iter().cloned());
                    }
                }
                set
            })
            .collect()
    }
}

fn priority_then_name<'a>(
    by_name: &'a HashMap<&str, &'a StageDef>,
) -> impl FnMut(&&str, &&str) -> std::cmp::Ordering + 'a {
    move |a, b| {
        let pa = by_name.get(*a).map(|s| s.priority).unwrap_or(0);
        let pb = by_name.get(*b).map(|s| s.priority).unwrap_or(0);
        pb.cmp(&pa).then_with(|| a.cmp(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FailurePolicy;
    use std::time::Duration;

    fn stage(name: &str, deps: &[&str]) -> StageDef {
        StageDef {
            name: name.to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            priority: 0,
            timeout: Duration::from_secs(60),
            required_resources: vec![],
            estimated_duration: Duration::from_secs(1),
            retry_count: 0,
            failure_policy: FailurePolicy::FailWorkflow,
        }
    }

    #[test]
    fn linear_pipeline_produces_three_phases() {
        let workflow = WorkflowDef {
            name: "w".into(),
            stages: vec![stage("a", &[]), stage("b", &["a"]), stage("c", &["b"])],
        };
        let plan = DependencyPlanner::plan(&workflow).unwrap();
        assert_eq!(plan.phases.len(), 3);
        assert_eq!(plan.phases[0].stages, vec!["a"]);
        assert_eq!(plan.phases[1].stages, vec!["b"]);
        assert_eq!(plan.phases[2].stages, vec!["c"]);
    }

    #[test]
    fn fan_out_fan_in_groups_siblings_in_one_phase() {
        let workflow = WorkflowDef {
            name: "w".into(),
            stages: vec![
                stage("root", &[]),
                stage("left", &["root"]),
                stage("right", &["root"]),
                stage("join", &["left", "right"]),
            ],
        };
        let plan = DependencyPlanner::plan(&workflow).unwrap();
        assert_eq!(plan.phases.len(), 3);
        assert_eq!(plan.phases[1].stages, vec!["left", "right"]);
    }

    #[test]
    fn cycle_is_detected() {
        let workflow = WorkflowDef {
            name: "w".into(),
            stages: vec![stage("a", &["c"]), stage("b", &["a"]), stage("c", &["b"])],
        };
        let err = DependencyPlanner::plan(&workflow).unwrap_err();
        match err {
            PlannerError::Cycle { members } => assert_eq!(members.len(), 3),
            _ => panic!("expected cycle error"),
        }
    }

    #[test]
    fn unknown_dependency_is_detected() {
        let workflow = WorkflowDef {
            name: "w".into(),
            stages: vec![stage("a", &["ghost"])],
        };
        let err = DependencyPlanner::plan(&workflow).unwrap_err();
        assert!(matches!(err, PlannerError::UnknownDependency { .. }));
    }

    #[test]
    fn ties_break_lexicographically() {
        let workflow = WorkflowDef {
            name: "w".into(),
            stages: vec![stage("zeta", &[]), stage("alpha", &[]), stage("mid", &[])],
        };
        let plan = DependencyPlanner::plan(&workflow).unwrap();
        assert_eq!(plan.phases[0].stages, vec!["alpha", "mid", "zeta"]);
    }

    #[test]
    fn higher_priority_sorts_first_within_a_phase() {
        let mut low = stage("low", &[]);
        low.priority = 0;
        let mut high = stage("high", &[]);
        high.priority = 10;
        let workflow = WorkflowDef {
            name: "w".into(),
            stages: vec![low, high],
        };
        let plan = DependencyPlanner::plan(&workflow).unwrap();
        assert_eq!(plan.phases[0].stages, vec!["high", "low"]);
    }

    #[test]
    fn estimate_total_time_sums_max_per_phase() {
        let mut a = stage("a", &[]);
        a.estimated_duration = Duration::from_secs(5);
        let mut b = stage("b", &["a"]);
        b.estimated_duration = Duration::from_secs(3);
        let mut c = stage("c", &["a"]);
        c.estimated_duration = Duration::from_secs(8);
        let workflow = WorkflowDef {
            name: "w".into(),
            stages: vec![a, b, c],
        };
        let plan = DependencyPlanner::plan(&workflow).unwrap();
        let total = DependencyPlanner::estimate_total_time(&workflow, &plan);
        assert_eq!(total, Duration::from_secs(5 + 8));
    }
}
