use crate::types::{AgentRole, Priority, ResourceRequest};
use foreman_core::{ForemanError, ForemanResult};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// An externally produced decomposition of a piece of work into tasks.
///
/// Tasks refer to each other by their plan-local `key`; ids are assigned
/// when the plan is submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPlan {
    pub name: String,
    /// Free-form category, e.g. `document_review` or `cost_estimation`.
    #[serde(default)]
    pub workflow_type: String,
    /// Opaque request details carried into the workflow record.
    #[serde(default)]
    pub details: serde_json::Value,
    pub tasks: Vec<PlannedTask>,
}

/// One task inside a [`WorkflowPlan`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedTask {
    pub key: String,
    pub description: String,
    pub agent: AgentRole,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub resources: Vec<ResourceRequest>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl PlannedTask {
    pub fn new(key: impl Into<String>, description: impl Into<String>, agent: AgentRole) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            agent,
            priority: Priority::default(),
            depends_on: Vec::new(),
            resources: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn depends_on(mut self, keys: &[&str]) -> Self {
        self.depends_on = keys.iter().map(|k| (*k).to_string()).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_resource(mut self, request: ResourceRequest) -> Self {
        self.resources.push(request);
        self
    }
}

impl WorkflowPlan {
    pub fn new(name: impl Into<String>, tasks: Vec<PlannedTask>) -> Self {
        Self {
            name: name.into(),
            workflow_type: String::new(),
            details: serde_json::Value::Null,
            tasks,
        }
    }

    /// Check structure: non-empty, unique keys, known acyclic dependencies,
    /// well-formed resource requests.
    pub fn validate(&self) -> ForemanResult<()> {
        if self.tasks.is_empty() {
            return Err(ForemanError::Validation(format!(
                "plan '{}' has no tasks",
                self.name
            )));
        }

        let mut keys = HashSet::new();
        for task in &self.tasks {
            if task.key.trim().is_empty() {
                return Err(ForemanError::Validation("task key must not be empty".into()));
            }
            if task.description.trim().is_empty() {
                return Err(ForemanError::Validation(format!(
                    "task '{}' has an empty description",
                    task.key
                )));
            }
            if !keys.insert(task.key.as_str()) {
                return Err(ForemanError::Validation(format!(
                    "duplicate task key '{}'",
                    task.key
                )));
            }
        }

        for task in &self.tasks {
            for dep in &task.depends_on {
                if dep == &task.key {
                    return Err(ForemanError::Validation(format!(
                        "task '{}' depends on itself",
                        task.key
                    )));
                }
                if !keys.contains(dep.as_str()) {
                    return Err(ForemanError::Validation(format!(
                        "task '{}' depends on unknown task '{dep}'",
                        task.key
                    )));
                }
            }
            for request in &task.resources {
                request.validate().map_err(|e| {
                    ForemanError::Validation(format!("task '{}': {e}", task.key))
                })?;
            }
        }

        if let Some(key) = self.find_cycle() {
            return Err(ForemanError::Validation(format!(
                "dependency cycle through task '{key}'"
            )));
        }
        Ok(())
    }

    /// Validate, then order tasks so every task follows its dependencies.
    /// Independent tasks keep their plan order.
    pub fn execution_order(&self) -> ForemanResult<Vec<&PlannedTask>> {
        self.validate()?;

        let index: HashMap<&str, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.key.as_str(), i))
            .collect();
        let mut indegree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.tasks.len()];
        for (i, task) in self.tasks.iter().enumerate() {
            for dep in &task.depends_on {
                if let Some(&d) = index.get(dep.as_str()) {
                    indegree[i] += 1;
                    dependents[d].push(i);
                }
            }
        }

        let mut queue: VecDeque<usize> = (0..self.tasks.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(i) = queue.pop_front() {
            order.push(&self.tasks[i]);
            for &next in &dependents[i] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        Ok(order)
    }

    fn find_cycle(&self) -> Option<&str> {
        let deps: HashMap<&str, &[String]> = self
            .tasks
            .iter()
            .map(|t| (t.key.as_str(), t.depends_on.as_slice()))
            .collect();
        let mut visited = HashMap::new();
        self.tasks
            .iter()
            .map(|t| t.key.as_str())
            .find(|key| dfs_cycle(*key, &deps, &mut visited))
    }
}

fn dfs_cycle<'a>(
    key: &'a str,
    deps: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashMap<&'a str, u8>,
) -> bool {
    match visited.get(key) {
        Some(1) => return true,  // back edge
        Some(2) => return false, // done
        _ => {}
    }
    visited.insert(key, 1);
    if let Some(&edges) = deps.get(key) {
        for dep in edges {
            if dfs_cycle(dep.as_str(), deps, visited) {
                return true;
            }
        }
    }
    visited.insert(key, 2);
    false
}
