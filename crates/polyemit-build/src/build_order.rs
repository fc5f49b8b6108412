//! Project reference graph and build order using topological sort
use crate::error::{BuildError, BuildResult};
use polyemit_config::{ConfigLoader, ParsedConfig};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

/// A project in the reference graph
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectNode {
    pub config: ParsedConfig,

    /// Configuration files of the referenced projects
    pub dependencies: Vec<PathBuf>,
}

impl ProjectNode {
    pub fn new(config: ParsedConfig) -> Self {
        let dependencies = config
            .project_references
            .iter()
            .map(|reference| reference.path.clone())
            .collect();
        Self { config, dependencies }
    }

    pub fn config_path(&self) -> &Path {
        &self.config.config_path
    }
}

/// Projects keyed by configuration path
#[derive(Debug, Clone, Default)]
pub struct ProjectGraph {
    projects: BTreeMap<PathBuf, ProjectNode>,
}

impl ProjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `root` and every project it references, transitively
    pub fn load(root: &Path, loader: &mut ConfigLoader) -> BuildResult<Self> {
        let mut graph = Self::new();
        let mut queue = VecDeque::from([polyemit_config::normalize_path(root)]);

        while let Some(path) = queue.pop_front() {
            if graph.projects.contains_key(&path) {
                continue;
            }
            let node = ProjectNode::new(loader.load(&path)?);
            queue.extend(node.dependencies.iter().cloned());
            graph.add_project(node);
        }

        graph.validate()?;
        Ok(graph)
    }

    pub fn add_project(&mut self, project: ProjectNode) {
        self.projects
            .insert(project.config.config_path.clone(), project);
    }

    pub fn get(&self, config_path: &Path) -> Option<&ProjectNode> {
        self.projects.get(config_path)
    }

    pub fn len(&self) -> usize {
        self.projects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }

    /// Every dependency must be a project of the graph
    pub fn validate(&self) -> BuildResult<()> {
        for (path, project) in &self.projects {
            for dependency in &project.dependencies {
                if !self.projects.contains_key(dependency) {
                    return Err(BuildError::configuration(format!(
                        "Referenced project '{}' (required by {}) was not loaded",
                        dependency.display(),
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Configuration paths with every project after its dependencies
    ///
    /// Kahn's algorithm over sorted keys, so the order is deterministic.
    pub fn build_order(&self) -> BuildResult<Vec<PathBuf>> {
        let mut remaining: BTreeMap<&PathBuf, usize> = self
            .projects
            .iter()
            .map(|(path, project)| (path, project.dependencies.len()))
            .collect();

        let mut ready: BTreeSet<&PathBuf> = remaining
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(path, _)| *path)
            .collect();
        let mut order = Vec::with_capacity(self.projects.len());

        while let Some(path) = ready.pop_first() {
            remaining.remove(path);
            order.push(path.clone());

            for (dependent, project) in &self.projects {
                let edges = project.dependencies.iter().filter(|d| *d == path).count();
                if edges == 0 {
                    continue;
                }
                if let Some(degree) = remaining.get_mut(dependent) {
                    *degree -= edges;
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if order.len() != self.projects.len() {
            return Err(BuildError::CircularReference(self.find_cycle()));
        }
        Ok(order)
    }

    /// Projects that depend on `config_path`, directly or not
    pub fn dependents_of(&self, config_path: &Path) -> BTreeSet<PathBuf> {
        let mut found = BTreeSet::new();
        let mut queue = VecDeque::from([config_path.to_path_buf()]);

        while let Some(current) = queue.pop_front() {
            for (path, project) in &self.projects {
                if project.dependencies.contains(&current) && found.insert(path.clone()) {
                    queue.push_back(path.clone());
                }
            }
        }
        found
    }

    fn find_cycle(&self) -> String {
        let mut visited = BTreeSet::new();
        let mut stack = Vec::new();

        for path in self.projects.keys() {
            if let Some(cycle) = self.dfs_find_cycle(path, &mut visited, &mut stack) {
                return cycle;
            }
        }
        "unknown cycle".to_string()
    }

    fn dfs_find_cycle(
        &self,
        path: &PathBuf,
        visited: &mut BTreeSet<PathBuf>,
        stack: &mut Vec<PathBuf>,
    ) -> Option<String> {
        if let Some(start) = stack.iter().position(|p| p == path) {
            let mut cycle: Vec<String> = stack[start..].iter().map(|p| p.display().to_string()).collect();
            cycle.push(path.display().to_string());
            return Some(format!("Circular project references: {}", cycle.join(" -> ")));
        }
        if !visited.insert(path.clone()) {
            return None;
        }

        stack.push(path.clone());
        if let Some(project) = self.projects.get(path) {
            for dependency in &project.dependencies {
                if let Some(cycle) = self.dfs_find_cycle(dependency, visited, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        None
    }
}
