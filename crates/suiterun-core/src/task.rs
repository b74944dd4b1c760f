//! The suite/test tree of one file.
//!
//! A [`FileTree`] is an arena: nodes are addressed by [`NodeIdx`] and every
//! node except the root stores the index of its parent suite. Hook chains
//! and result aggregation walk indices, never references into the tree.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::failure::{ErrorInfo, ErrorKind};
use crate::ids::TaskId;
use crate::status::{RunMode, TaskState};

/// Index of a node inside its [`FileTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdx(usize);

impl NodeIdx {
    /// The file root suite.
    pub const ROOT: NodeIdx = NodeIdx(0);

    /// Position of the node in the arena.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Result of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub state: TaskState,
    /// Wall time in milliseconds, set once the task finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl TaskResult {
    /// Create a result in the given state.
    pub fn new(state: TaskState) -> Self {
        Self {
            state,
            duration_ms: None,
            error: None,
        }
    }
}

/// Wire form of an incremental update: `(task id, latest result)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPack(pub TaskId, pub Option<TaskResult>);

impl TaskPack {
    pub fn id(&self) -> &TaskId {
        &self.0
    }

    pub fn result(&self) -> Option<&TaskResult> {
        self.1.as_ref()
    }
}

/// Suite or test specific data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskKind {
    Suite {
        /// Declaration order; significant for sequential groups.
        children: Vec<NodeIdx>,
    },
    Test {
        /// Expected-failure test: the outcome is inverted.
        fails: bool,
    },
}

/// One suite or test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: TaskId,
    pub name: String,
    pub mode: RunMode,
    pub concurrent: bool,
    pub kind: TaskKind,
    /// Enclosing suite; `None` only for the file root.
    pub parent: Option<NodeIdx>,
    pub result: Option<TaskResult>,
}

impl TaskNode {
    pub fn is_suite(&self) -> bool {
        matches!(self.kind, TaskKind::Suite { .. })
    }

    pub fn is_test(&self) -> bool {
        matches!(self.kind, TaskKind::Test { .. })
    }

    /// Whether this is a test expected to fail.
    pub fn fails(&self) -> bool {
        matches!(self.kind, TaskKind::Test { fails: true })
    }

    /// Current state; a task without result is still queued.
    pub fn state(&self) -> TaskState {
        self.result
            .as_ref()
            .map(|r| r.state)
            .unwrap_or(TaskState::Queued)
    }

    /// Children of a suite, empty for tests.
    pub fn children(&self) -> &[NodeIdx] {
        match &self.kind {
            TaskKind::Suite { children } => children,
            TaskKind::Test { .. } => &[],
        }
    }
}

/// Collected task tree of a single file, rooted at the file suite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTree {
    filepath: PathBuf,
    nodes: Vec<TaskNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    collect_duration_ms: Option<f64>,
}

impl FileTree {
    /// Create a tree holding only the root suite of `filepath`.
    pub fn new(root: &Path, filepath: impl Into<PathBuf>) -> Self {
        let filepath = filepath.into();
        let name = filepath
            .strip_prefix(root)
            .unwrap_or(&filepath)
            .to_string_lossy()
            .into_owned();
        let root_node = TaskNode {
            id: TaskId::for_file(root, &filepath),
            name,
            mode: RunMode::Run,
            concurrent: false,
            kind: TaskKind::Suite {
                children: Vec::new(),
            },
            parent: None,
            result: None,
        };
        Self {
            filepath,
            nodes: vec![root_node],
            collect_duration_ms: None,
        }
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    /// Id of the file root suite.
    pub fn id(&self) -> &TaskId {
        &self.nodes[0].id
    }

    pub fn root(&self) -> NodeIdx {
        NodeIdx::ROOT
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn collect_duration_ms(&self) -> Option<f64> {
        self.collect_duration_ms
    }

    pub fn set_collect_duration(&mut self, ms: f64) {
        self.collect_duration_ms = Some(ms);
    }

    /// Access a node. Indices handed out by this tree are always valid.
    pub fn node(&self, idx: NodeIdx) -> &TaskNode {
        &self.nodes[idx.0]
    }

    pub fn get(&self, idx: NodeIdx) -> Option<&TaskNode> {
        self.nodes.get(idx.0)
    }

    fn get_mut(&mut self, idx: NodeIdx) -> Result<&mut TaskNode, CoreError> {
        self.nodes.get_mut(idx.0).ok_or(CoreError::UnknownNode(idx.0))
    }

    /// All nodes in arena order (root first).
    pub fn iter(&self) -> impl Iterator<Item = (NodeIdx, &TaskNode)> {
        self.nodes.iter().enumerate().map(|(i, n)| (NodeIdx(i), n))
    }

    /// Find a node by task id.
    pub fn find(&self, id: &TaskId) -> Option<NodeIdx> {
        self.nodes.iter().position(|n| &n.id == id).map(NodeIdx)
    }

    /// Append a suite under `parent`.
    pub fn add_suite(
        &mut self,
        parent: NodeIdx,
        name: impl Into<String>,
        mode: RunMode,
        concurrent: bool,
    ) -> Result<NodeIdx, CoreError> {
        self.push_child(
            parent,
            name.into(),
            mode,
            concurrent,
            TaskKind::Suite {
                children: Vec::new(),
            },
        )
    }

    /// Append a test under `parent`.
    pub fn add_test(
        &mut self,
        parent: NodeIdx,
        name: impl Into<String>,
        mode: RunMode,
        concurrent: bool,
        fails: bool,
    ) -> Result<NodeIdx, CoreError> {
        self.push_child(parent, name.into(), mode, concurrent, TaskKind::Test { fails })
    }

    fn push_child(
        &mut self,
        parent: NodeIdx,
        name: String,
        mode: RunMode,
        concurrent: bool,
        kind: TaskKind,
    ) -> Result<NodeIdx, CoreError> {
        let idx = NodeIdx(self.nodes.len());
        let parent_node = self.get_mut(parent)?;
        let TaskKind::Suite { children } = &mut parent_node.kind else {
            return Err(CoreError::WrongKind(parent_node.id.to_string()));
        };
        let id = parent_node.id.child(children.len());
        children.push(idx);
        self.nodes.push(TaskNode {
            id,
            name,
            mode,
            concurrent,
            kind,
            parent: Some(parent),
            result: None,
        });
        Ok(idx)
    }

    /// `idx` followed by its enclosing suites up to the root.
    pub fn ancestors(&self, idx: NodeIdx) -> Vec<NodeIdx> {
        let mut chain = Vec::new();
        let mut current = Some(idx);
        while let Some(i) = current {
            chain.push(i);
            current = self.get(i).and_then(|n| n.parent);
        }
        chain
    }

    /// Names from the outermost suite down to the task, excluding the file.
    pub fn full_name(&self, idx: NodeIdx) -> String {
        let mut names: Vec<&str> = self
            .ancestors(idx)
            .into_iter()
            .filter(|i| *i != NodeIdx::ROOT)
            .map(|i| self.node(i).name.as_str())
            .collect();
        names.reverse();
        names.join(" > ")
    }

    /// Split a suite's children into maximal runs sharing the same
    /// `concurrent` flag, preserving declaration order.
    pub fn partition_children(&self, suite: NodeIdx) -> Vec<Vec<NodeIdx>> {
        let mut groups: Vec<Vec<NodeIdx>> = Vec::new();
        let mut last: Option<bool> = None;
        for &child in self.node(suite).children() {
            let concurrent = self.node(child).concurrent;
            match groups.last_mut() {
                Some(group) if last == Some(concurrent) => group.push(child),
                _ => groups.push(vec![child]),
            }
            last = Some(concurrent);
        }
        groups
    }

    /// Every test below `idx` in declaration order.
    pub fn tests(&self, idx: NodeIdx) -> Vec<NodeIdx> {
        let mut out = Vec::new();
        let mut stack = vec![idx];
        while let Some(i) = stack.pop() {
            let node = self.node(i);
            if node.is_test() {
                out.push(i);
            }
            stack.extend(node.children().iter().rev());
        }
        out
    }

    /// Whether any test exists below `idx`, whatever its mode.
    pub fn has_tests(&self, idx: NodeIdx) -> bool {
        !self.tests(idx).is_empty()
    }

    /// Whether any descendant of `idx` finished in the `fail` state.
    pub fn has_failed(&self, idx: NodeIdx) -> bool {
        self.node(idx)
            .children()
            .iter()
            .any(|&c| self.node(c).state() == TaskState::Fail || self.has_failed(c))
    }

    fn contains_only(&self, idx: NodeIdx) -> bool {
        self.node(idx)
            .children()
            .iter()
            .any(|&c| self.node(c).mode == RunMode::Only || self.contains_only(c))
    }

    /// Resolve `only` modes: where any sibling is (or contains) an `only`
    /// task, the other runnable siblings are skipped; `only` becomes `run`.
    /// Suites that end up skipped propagate the skip to their children.
    pub fn interpret_only_mode(&mut self) {
        self.interpret_modes(NodeIdx::ROOT);
    }

    fn interpret_modes(&mut self, suite: NodeIdx) {
        let children = self.node(suite).children().to_vec();
        let has_only = children
            .iter()
            .any(|&c| self.node(c).mode == RunMode::Only || self.contains_only(c));
        if has_only {
            for &c in &children {
                let keep = self.contains_only(c);
                let node = &mut self.nodes[c.0];
                match node.mode {
                    RunMode::Only => node.mode = RunMode::Run,
                    RunMode::Run if !keep => node.mode = RunMode::Skip,
                    _ => {}
                }
            }
        }
        for &c in &children {
            if !self.node(c).is_suite() {
                continue;
            }
            match self.node(c).mode {
                RunMode::Skip | RunMode::Todo => self.skip_descendants(c),
                _ => self.interpret_modes(c),
            }
        }
    }

    fn skip_descendants(&mut self, suite: NodeIdx) {
        for c in self.node(suite).children().to_vec() {
            let node = &mut self.nodes[c.0];
            if node.mode.is_runnable() {
                node.mode = RunMode::Skip;
            }
            self.skip_descendants(c);
        }
    }

    pub fn result(&self, idx: NodeIdx) -> Option<&TaskResult> {
        self.get(idx).and_then(|n| n.result.as_ref())
    }

    /// Move a task to `state`, keeping duration and error.
    pub fn set_state(&mut self, idx: NodeIdx, state: TaskState) -> Result<(), CoreError> {
        let node = self.get_mut(idx)?;
        let from = node.state();
        if !from.can_transition_to(state) {
            return Err(CoreError::InvalidStateTransition {
                task: node.id.to_string(),
                from,
                to: state,
            });
        }
        match node.result.as_mut() {
            Some(result) => result.state = state,
            None => node.result = Some(TaskResult::new(state)),
        }
        Ok(())
    }

    /// Record the terminal result of a task in one step.
    pub fn finish(
        &mut self,
        idx: NodeIdx,
        state: TaskState,
        error: Option<ErrorInfo>,
        duration_ms: f64,
    ) -> Result<(), CoreError> {
        self.set_state(idx, state)?;
        let node = self.get_mut(idx)?;
        if let Some(result) = node.result.as_mut() {
            result.error = error;
            result.duration_ms = Some(duration_ms);
        }
        Ok(())
    }

    /// Mark the whole file as failed to collect.
    pub fn fail_collection(&mut self, error: ErrorInfo) {
        let root = &mut self.nodes[0];
        root.result = Some(TaskResult {
            state: TaskState::Fail,
            duration_ms: None,
            error: Some(ErrorInfo {
                kind: ErrorKind::Collection,
                ..error
            }),
        });
    }

    /// Incremental update for one task.
    pub fn pack(&self, idx: NodeIdx) -> TaskPack {
        let node = self.node(idx);
        TaskPack(node.id.clone(), node.result.clone())
    }

    /// Apply an update received from a worker.
    ///
    /// Returns `Ok(false)` when the task already holds a terminal result;
    /// terminal results are never overwritten.
    pub fn apply_pack(&mut self, pack: &TaskPack) -> Result<bool, CoreError> {
        let idx = self
            .find(pack.id())
            .ok_or_else(|| CoreError::TaskNotFound(pack.id().to_string()))?;
        let node = self.get_mut(idx)?;
        if node.state().is_terminal() {
            return Ok(false);
        }
        node.result = pack.1.clone();
        Ok(true)
    }
}
