//! Worker registry: the validated, immutable description of all workers.
//!
//! Loading is all-or-nothing. Every problem found in the configuration is
//! collected and reported as one `Error::Validation`, and the daemon refuses
//! to start monitoring with a registry that did not load.

use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::config::{ProjectConfig, ProjectInfo};
use crate::{flog_debug, Error, Result};

/// Policy combining a worker's completion signals into a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusMode {
    Any,
    Strict,
    All,
}

impl fmt::Display for ConsensusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusMode::Any => write!(f, "any"),
            ConsensusMode::Strict => write!(f, "strict"),
            ConsensusMode::All => write!(f, "all"),
        }
    }
}

impl FromStr for ConsensusMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "any" => Ok(ConsensusMode::Any),
            "strict" => Ok(ConsensusMode::Strict),
            "all" => Ok(ConsensusMode::All),
            other => Err(Error::Validation(format!(
                "unknown completion mode '{}' (expected any, strict or all)",
                other
            ))),
        }
    }
}

/// A single worker: one agent process on one branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Worker {
    pub id: String,
    pub branch: String,
    pub agent: String,
    pub role: Option<String>,
    pub phase: u32,
    pub dependencies: Vec<String>,
    pub description: Option<String>,
    pub tmux_target: Option<String>,
    /// Position in the configuration, used to derive the tmux window.
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct Registry {
    project: ProjectInfo,
    active_phase: u32,
    mode: ConsensusMode,
    excluded_roles: HashSet<String>,
    workers: Vec<Worker>,
    by_id: HashMap<String, usize>,
}

impl Registry {
    /// Validate `config` and build the registry.
    pub fn load(config: &ProjectConfig) -> Result<Self> {
        let mut problems = Vec::new();

        let active_phase = match positive_phase(config.phase) {
            Some(p) => p,
            None => {
                problems.push(format!(
                    "phase must be a positive integer, got {}",
                    config.phase
                ));
                1
            }
        };

        let mode = match config.completion.mode.parse::<ConsensusMode>() {
            Ok(mode) => mode,
            Err(Error::Validation(msg)) => {
                problems.push(msg);
                ConsensusMode::Any
            }
            Err(e) => return Err(e),
        };

        let version = config.version_tag();
        if !is_plain_name(&version) {
            problems.push(format!(
                "project version '{}' must not contain '/', '\\' or '..'",
                version
            ));
        }

        let mut workers = Vec::with_capacity(config.workers.len());
        let mut by_id = HashMap::new();
        let mut branches: HashSet<(u32, String)> = HashSet::new();

        for (index, wc) in config.workers.iter().enumerate() {
            let id = wc.id.trim().to_string();
            if id.is_empty() {
                problems.push(format!("worker #{} has an empty id", index + 1));
                continue;
            }
            if by_id.contains_key(&id) {
                problems.push(format!("duplicate worker id '{}'", id));
                continue;
            }

            let phase = match wc.phase {
                None => active_phase,
                Some(raw) => match positive_phase(raw) {
                    Some(p) => p,
                    None => {
                        problems.push(format!(
                            "worker '{}': phase must be a positive integer, got {}",
                            id, raw
                        ));
                        continue;
                    }
                },
            };

            let branch = wc.branch.trim().to_string();
            if branch.is_empty() {
                problems.push(format!("worker '{}' has an empty branch", id));
            } else if !branches.insert((phase, branch.clone())) {
                problems.push(format!(
                    "worker '{}': branch '{}' is already used in phase {}",
                    id, branch, phase
                ));
            }

            by_id.insert(id.clone(), workers.len());
            workers.push(Worker {
                id,
                branch,
                agent: wc.agent.clone(),
                role: wc.role.clone(),
                phase,
                dependencies: wc.dependencies.iter().map(|d| d.trim().to_string()).collect(),
                description: wc.description.clone(),
                tmux_target: wc.tmux_target.clone(),
                index,
            });
        }

        let mut dangling = false;
        for worker in &workers {
            for dep in &worker.dependencies {
                if !by_id.contains_key(dep) {
                    dangling = true;
                    problems.push(format!(
                        "worker '{}' depends on unknown worker '{}'",
                        worker.id, dep
                    ));
                }
            }
        }

        if !dangling {
            if let Some(cycle_member) = find_dependency_cycle(&workers, &by_id) {
                problems.push(format!(
                    "dependency cycle detected involving worker '{}'",
                    cycle_member
                ));
            }
        }

        if !workers.iter().any(|w| w.phase == active_phase) {
            problems.push(format!("no workers configured for phase {}", active_phase));
        }

        if !problems.is_empty() {
            return Err(Error::Validation(problems.join("; ")));
        }

        flog_debug!(
            "Registry loaded: {} workers, phase={}, mode={}",
            workers.len(),
            active_phase,
            mode
        );

        Ok(Self {
            project: config.project.clone(),
            active_phase,
            mode,
            excluded_roles: config
                .completion
                .exclude_roles
                .iter()
                .map(|r| r.trim().to_lowercase())
                .collect(),
            workers,
            by_id,
        })
    }

    pub fn project(&self) -> &ProjectInfo {
        &self.project
    }

    pub fn active_phase(&self) -> u32 {
        self.active_phase
    }

    pub fn mode(&self) -> ConsensusMode {
        self.mode
    }

    pub fn workers(&self) -> &[Worker] {
        &self.workers
    }

    pub fn get(&self, id: &str) -> Option<&Worker> {
        self.by_id.get(id).map(|&i| &self.workers[i])
    }

    pub fn lookup(&self, id: &str) -> Result<&Worker> {
        self.get(id)
            .ok_or_else(|| Error::WorkerNotFound(id.to_string()))
    }

    pub fn workers_in_phase(&self, phase: u32) -> Vec<&Worker> {
        self.workers.iter().filter(|w| w.phase == phase).collect()
    }

    pub fn dependencies_of(&self, id: &str) -> Result<Vec<&Worker>> {
        let worker = self.lookup(id)?;
        worker
            .dependencies
            .iter()
            .map(|dep| self.lookup(dep))
            .collect()
    }

    /// Whether the worker's role keeps it out of the phase completion criterion.
    pub fn is_excluded(&self, worker: &Worker) -> bool {
        worker
            .role
            .as_deref()
            .map(|r| self.excluded_roles.contains(&r.trim().to_lowercase()))
            .unwrap_or(false)
    }
}

fn positive_phase(raw: i64) -> Option<u32> {
    if raw > 0 {
        u32::try_from(raw).ok()
    } else {
        None
    }
}

/// Returns the id of some worker on a dependency cycle, if there is one.
fn find_dependency_cycle(workers: &[Worker], by_id: &HashMap<String, usize>) -> Option<String> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = workers.iter().map(|w| graph.add_node(w.id.as_str())).collect();

    for (i, worker) in workers.iter().enumerate() {
        for dep in &worker.dependencies {
            if let Some(&j) = by_id.get(dep) {
                graph.add_edge(nodes[j], nodes[i], ());
            }
        }
    }

    if !is_cyclic_directed(&graph) {
        return None;
    }

    // Report a member of the first non-trivial strongly connected component
    petgraph::algo::kosaraju_scc(&graph)
        .into_iter()
        .find(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .and_then(|scc| scc.first().copied())
        .map(|n| graph[n].to_string())
}

/// Usable as a single path component (the archive directory is keyed by it).
fn is_plain_name(name: &str) -> bool {
    !name.contains(['/', '\\'])
        && !name.contains("..")
        && !name.chars().any(char::is_control)
}
