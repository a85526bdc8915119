// Job Graph (DAG)
// Arena of job templates indexed by name, with validation and topological ordering

use crate::error::{EngineError, EngineResult};
use crate::model::JobTemplate;

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// Directed acyclic graph of job templates.
///
/// Templates are stored in declaration order. Edges point from a job to the
/// jobs it waits for: its `depends_on` list and the jobs its condition
/// inspects (`success(..)`, `failure(..)`).
#[derive(Debug, Clone, Default)]
pub struct JobGraph {
    templates: Vec<JobTemplate>,
    indices: HashMap<String, usize>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from templates and validate it
    pub fn from_templates(templates: impl IntoIterator<Item = JobTemplate>) -> EngineResult<Self> {
        let mut graph = Self::new();
        for template in templates {
            graph.add_job(template)?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Add a job template. Names must be unique.
    pub fn add_job(&mut self, template: JobTemplate) -> EngineResult<()> {
        if self.indices.contains_key(&template.name) {
            return Err(EngineError::DuplicateJob(template.name));
        }
        self.indices
            .insert(template.name.clone(), self.templates.len());
        self.templates.push(template);
        Ok(())
    }

    /// Record that `job` depends on `depends_on`. Both must already be declared.
    pub fn add_dependency(&mut self, job: &str, depends_on: &str) -> EngineResult<()> {
        let idx = self
            .index_of(job)
            .ok_or_else(|| EngineError::unknown_job(job))?;
        if !self.indices.contains_key(depends_on) {
            return Err(EngineError::unknown_job_referenced_by(depends_on, job));
        }

        let deps = &mut self.templates[idx].depends_on;
        if !deps.iter().any(|d| d == depends_on) {
            deps.push(depends_on.to_string());
        }
        Ok(())
    }

    /// Check that every referenced job exists and that dependencies are acyclic
    pub fn validate(&self) -> EngineResult<()> {
        for template in &self.templates {
            for dep in &template.depends_on {
                if !self.indices.contains_key(dep) {
                    return Err(EngineError::unknown_job_referenced_by(dep, &template.name));
                }
            }
            for job in template.condition.referenced_jobs() {
                if !self.indices.contains_key(job) {
                    return Err(EngineError::unknown_job_referenced_by(job, &template.name));
                }
            }
        }

        if let Some(cycle) = self.find_cycle() {
            return Err(EngineError::Cycle { cycle });
        }
        Ok(())
    }

    /// Iterative depth-first search with an explicit recursion stack.
    /// Returns the offending path, first node repeated at the end.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let adjacency = self.adjacency();
        let mut marks = vec![Mark::Unvisited; self.templates.len()];

        for root in 0..self.templates.len() {
            if marks[root] != Mark::Unvisited {
                continue;
            }

            // (node, index of the next edge to follow)
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            marks[root] = Mark::OnStack;

            while let Some(top) = stack.last_mut() {
                let (node, cursor) = *top;
                let Some(&dep) = adjacency[node].get(cursor) else {
                    marks[node] = Mark::Done;
                    stack.pop();
                    continue;
                };
                top.1 += 1;

                match marks[dep] {
                    Mark::Unvisited => {
                        marks[dep] = Mark::OnStack;
                        stack.push((dep, 0));
                    }
                    Mark::OnStack => {
                        let start = stack.iter().position(|&(n, _)| n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> = stack[start..]
                            .iter()
                            .map(|&(n, _)| self.templates[n].name.clone())
                            .collect();
                        cycle.push(self.templates[dep].name.clone());
                        return Some(cycle);
                    }
                    Mark::Done => {}
                }
            }
        }

        None
    }

    /// Dependency-respecting linearisation; ties broken by declaration order
    pub fn topological_order(&self) -> EngineResult<Vec<&JobTemplate>> {
        Ok(self
            .topological_indices()?
            .into_iter()
            .map(|idx| &self.templates[idx])
            .collect())
    }

    pub(crate) fn topological_indices(&self) -> EngineResult<Vec<usize>> {
        self.validate()?;

        // Kahn's algorithm with a min-heap on declaration index
        let n = self.templates.len();
        let mut in_degree = vec![0usize; n];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

        for (idx, deps) in self.adjacency().into_iter().enumerate() {
            for dep in deps {
                dependents[dep].push(idx);
                in_degree[idx] += 1;
            }
        }

        let mut heap: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, &deg)| deg == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect();

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(idx)) = heap.pop() {
            order.push(idx);
            for &next in &dependents[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    heap.push(Reverse(next));
                }
            }
        }

        Ok(order)
    }

    /// Templates grouped by dependency depth. Jobs within a level do not
    /// depend on each other.
    pub fn parallel_levels(&self) -> EngineResult<Vec<Vec<&JobTemplate>>> {
        let order = self.topological_indices()?;
        let mut depth = vec![0usize; self.templates.len()];
        let mut levels: Vec<Vec<&JobTemplate>> = Vec::new();

        for idx in order {
            let template = &self.templates[idx];
            let level = self
                .dependency_indices(template)
                .into_iter()
                .map(|dep| depth[dep] + 1)
                .max()
                .unwrap_or(0);
            depth[idx] = level;

            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(template);
        }

        Ok(levels)
    }

    /// Names of jobs that declare a dependency on `name`, in declaration order
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.templates
            .iter()
            .filter(|t| t.depends_on.iter().any(|d| d == name))
            .map(|t| t.name.as_str())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&JobTemplate> {
        self.index_of(name).map(|idx| &self.templates[idx])
    }

    /// All templates in declaration order
    pub fn templates(&self) -> &[JobTemplate] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.indices.get(name).copied()
    }

    /// Indices of the jobs a template waits for: its declared dependencies
    /// followed by jobs named in its condition, without duplicates
    pub(crate) fn dependency_indices(&self, template: &JobTemplate) -> Vec<usize> {
        let mut deps: Vec<usize> = Vec::new();
        let names = template
            .depends_on
            .iter()
            .map(String::as_str)
            .chain(template.condition.referenced_jobs());
        for name in names {
            if let Some(idx) = self.index_of(name) {
                if !deps.contains(&idx) {
                    deps.push(idx);
                }
            }
        }
        deps
    }

    fn adjacency(&self) -> Vec<Vec<usize>> {
        self.templates
            .iter()
            .map(|t| self.dependency_indices(t))
            .collect()
    }
}
