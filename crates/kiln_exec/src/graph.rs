//! The build step graph.
//!
//! Steps live in an arena and refer to each other by [`StepId`]. A step is
//! either a command build step, wrapping one [`Command`], or a list build
//! step grouping child steps. Prerequisite/successor edges between any two
//! steps form a DAG; cycles are the caller's responsibility.

use crate::command::{Command, SharedCommand};
use crate::types::ExecError;
use kiln_core::{CommandResult, ObjectId, ObjectUrl, ResultStatus};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Index of a step in its [`BuildGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId(usize);

impl StepId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Command,
    List,
}

pub(crate) enum StepWork {
    Command(SharedCommand),
    List,
}

pub(crate) struct StepNode {
    pub(crate) work: StepWork,
    pub(crate) title: String,
    pub(crate) parent: Option<StepId>,
    /// Children of a list, or the steps spawned by a command
    pub(crate) children: Vec<StepId>,
    pub(crate) prerequisites: BTreeSet<StepId>,
    pub(crate) successors: BTreeSet<StepId>,
    pub(crate) status: ResultStatus,
    pub(crate) result: Option<CommandResult>,
    pub(crate) spawned: bool,
    pub(crate) retired: bool,
}

impl StepNode {
    fn new(work: StepWork, title: String, parent: Option<StepId>, spawned: bool) -> Self {
        Self {
            work,
            title,
            parent,
            children: Vec::new(),
            prerequisites: BTreeSet::new(),
            successors: BTreeSet::new(),
            status: ResultStatus::NotProcessed,
            result: None,
            spawned,
            retired: false,
        }
    }

    pub(crate) fn command(&self) -> Option<&SharedCommand> {
        match &self.work {
            StepWork::Command(command) => Some(command),
            StepWork::List => None,
        }
    }

    pub(crate) fn is_list(&self) -> bool {
        matches!(self.work, StepWork::List)
    }
}

/**
 * Arena of build steps with a root list step.
 */
pub struct BuildGraph {
    nodes: Vec<StepNode>,
    root: StepId,
}

impl Default for BuildGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildGraph {
    pub fn new() -> Self {
        Self {
            nodes: vec![StepNode::new(StepWork::List, "root".to_string(), None, false)],
            root: StepId(0),
        }
    }

    pub fn root(&self) -> StepId {
        self.root
    }

    /**
     * Add a command build step under a list step
     */
    pub fn add_command<C: Command + 'static>(
        &mut self,
        parent: StepId,
        command: C,
    ) -> Result<StepId, ExecError> {
        self.add_shared_command(parent, Arc::new(command))
    }

    pub fn add_shared_command(
        &mut self,
        parent: StepId,
        command: SharedCommand,
    ) -> Result<StepId, ExecError> {
        self.check_list(parent)?;
        Ok(self.push_command(parent, command, false))
    }

    /**
     * Add an empty list build step under another list step
     */
    pub fn add_list(&mut self, parent: StepId, title: impl Into<String>) -> Result<StepId, ExecError> {
        self.check_list(parent)?;
        Ok(self.push(StepNode::new(StepWork::List, title.into(), Some(parent), false)))
    }

    /**
     * Declare that `dependent` must not start before `prerequisite` is
     * terminal. Links must be declared before the build runs.
     */
    pub fn link(&mut self, prerequisite: StepId, dependent: StepId) -> Result<(), ExecError> {
        self.check(prerequisite)?;
        self.check(dependent)?;
        if prerequisite == dependent {
            return Err(ExecError::SelfDependency(dependent));
        }

        self.nodes[prerequisite.0].successors.insert(dependent);
        self.nodes[dependent.0].prerequisites.insert(prerequisite);
        Ok(())
    }

    pub fn contains(&self, id: StepId) -> bool {
        id.0 < self.nodes.len() && !self.nodes[id.0].retired
    }

    pub fn kind(&self, id: StepId) -> StepKind {
        match self.nodes[id.0].work {
            StepWork::Command(_) => StepKind::Command,
            StepWork::List => StepKind::List,
        }
    }

    pub fn status(&self, id: StepId) -> ResultStatus {
        self.nodes[id.0].status
    }

    pub fn result(&self, id: StepId) -> Option<&CommandResult> {
        self.nodes[id.0].result.as_ref()
    }

    pub fn title(&self, id: StepId) -> &str {
        &self.nodes[id.0].title
    }

    pub fn parent(&self, id: StepId) -> Option<StepId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: StepId) -> &[StepId] {
        &self.nodes[id.0].children
    }

    pub fn prerequisites(&self, id: StepId) -> impl Iterator<Item = StepId> + '_ {
        self.nodes[id.0].prerequisites.iter().copied()
    }

    pub fn successors(&self, id: StepId) -> impl Iterator<Item = StepId> + '_ {
        self.nodes[id.0].successors.iter().copied()
    }

    pub fn is_spawned(&self, id: StepId) -> bool {
        self.nodes[id.0].spawned
    }

    /// Every live step, in creation order
    pub fn step_ids(&self) -> impl Iterator<Item = StepId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !node.retired)
            .map(|(index, _)| StepId(index))
    }

    pub fn command_steps(&self) -> impl Iterator<Item = StepId> + '_ {
        self.step_ids()
            .filter(|id| self.kind(*id) == StepKind::Command)
    }

    /// Number of steps below the root
    pub fn len(&self) -> usize {
        self.step_ids().count() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /**
     * Outputs of every step of the last run, keyed by url
     */
    pub fn output_objects(&self) -> BTreeMap<ObjectUrl, ObjectId> {
        let mut outputs = BTreeMap::new();
        for id in self.command_steps() {
            if let Some(result) = self.result(id) {
                outputs.extend(result.output_objects.iter().map(|(url, oid)| (url.clone(), *oid)));
            }
        }
        outputs
    }

    fn check(&self, id: StepId) -> Result<(), ExecError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(ExecError::StepNotFound(id))
        }
    }

    fn check_list(&self, id: StepId) -> Result<(), ExecError> {
        self.check(id)?;
        if self.nodes[id.0].is_list() {
            Ok(())
        } else {
            Err(ExecError::NotAList(id))
        }
    }

    fn push(&mut self, node: StepNode) -> StepId {
        let id = StepId(self.nodes.len());
        if let Some(parent) = node.parent {
            self.nodes[parent.0].children.push(id);
        }
        self.nodes.push(node);
        id
    }

    pub(crate) fn push_command(&mut self, parent: StepId, command: SharedCommand, spawned: bool) -> StepId {
        let title = command.title();
        self.push(StepNode::new(StepWork::Command(command), title, Some(parent), spawned))
    }

    pub(crate) fn node(&self, id: StepId) -> &StepNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: StepId) -> &mut StepNode {
        &mut self.nodes[id.0]
    }

    pub(crate) fn capacity_len(&self) -> usize {
        self.nodes.len()
    }

    /**
     * Forget the statuses of a previous run and retire the steps it spawned.
     *
     * Retired steps at the end of the arena are dropped, so rerunning a
     * graph whose commands spawn does not grow it. Ids of spawned steps are
     * only valid until the next run.
     */
    pub(crate) fn reset_for_run(&mut self) {
        for index in 0..self.nodes.len() {
            if self.nodes[index].spawned && !self.nodes[index].retired {
                self.nodes[index].retired = true;
                if let Some(parent) = self.nodes[index].parent {
                    self.nodes[parent.0].children.retain(|child| child.0 != index);
                }
            }
        }

        let retired: BTreeSet<StepId> = (0..self.nodes.len())
            .filter(|index| self.nodes[*index].retired)
            .map(StepId)
            .collect();
        if !retired.is_empty() {
            for node in &mut self.nodes {
                node.prerequisites.retain(|id| !retired.contains(id));
                node.successors.retain(|id| !retired.contains(id));
            }
        }

        while self.nodes.len() > 1 && self.nodes.last().is_some_and(|node| node.retired) {
            self.nodes.pop();
        }

        for node in &mut self.nodes {
            node.status = ResultStatus::NotProcessed;
            node.result = None;
        }
    }

    /**
     * Link every command reading a content url after the command declaring
     * it as an output. Returns the content inputs no step produces.
     */
    pub(crate) fn link_content_references(&mut self) -> Vec<(StepId, ObjectUrl)> {
        let mut producers: HashMap<ObjectUrl, StepId> = HashMap::new();
        let commands: Vec<StepId> = self.command_steps().collect();

        for &id in &commands {
            if let Some(command) = self.node(id).command() {
                for url in command.output_urls() {
                    if url.is_content() {
                        producers.entry(url).or_insert(id);
                    }
                }
            }
        }

        let mut unresolved = Vec::new();
        for &id in &commands {
            let inputs = match self.node(id).command() {
                Some(command) => command.input_dependencies(),
                None => continue,
            };
            for url in inputs.into_iter().filter(ObjectUrl::is_content) {
                match producers.get(&url) {
                    Some(&producer) if producer != id => {
                        self.nodes[producer.0].successors.insert(id);
                        self.nodes[id.0].prerequisites.insert(producer);
                    }
                    Some(_) => {}
                    None => unresolved.push((id, url)),
                }
            }
        }

        unresolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandError, CommandOutcome};
    use crate::context::ExecuteContext;
    use kiln_utils::{HashError, ParameterWriter};

    struct Convert {
        input: &'static str,
        output: &'static str,
    }

    impl Command for Convert {
        fn type_name(&self) -> &str {
            "Convert"
        }

        fn title(&self) -> String {
            format!("Convert {}", self.output)
        }

        fn hash_parameters(&self, writer: &mut ParameterWriter) -> Result<(), HashError> {
            writer.write(self.input)?;
            writer.write(self.output)
        }

        fn input_dependencies(&self) -> Vec<ObjectUrl> {
            vec![ObjectUrl::content(self.input)]
        }

        fn output_urls(&self) -> Vec<ObjectUrl> {
            vec![ObjectUrl::content(self.output)]
        }

        fn execute(&self, _ctx: &mut ExecuteContext<'_>) -> Result<CommandOutcome, CommandError> {
            Ok(CommandOutcome::Succeeded)
        }
    }

    #[test]
    fn test_link_sets_both_directions() {
        let mut graph = BuildGraph::new();
        let root = graph.root();
        let a = graph.add_command(root, Convert { input: "x", output: "a" }).unwrap();
        let b = graph.add_command(root, Convert { input: "y", output: "b" }).unwrap();

        graph.link(a, b).unwrap();

        assert_eq!(graph.successors(a).collect::<Vec<_>>(), vec![b]);
        assert_eq!(graph.prerequisites(b).collect::<Vec<_>>(), vec![a]);
        assert_eq!(graph.children(root), &[a, b]);
        assert_eq!(graph.title(b), "Convert b");
        assert_eq!(graph.status(a), ResultStatus::NotProcessed);
    }

    #[test]
    fn test_invalid_links_and_parents() {
        let mut graph = BuildGraph::new();
        let root = graph.root();
        let a = graph.add_command(root, Convert { input: "x", output: "a" }).unwrap();

        assert!(matches!(graph.link(a, a), Err(ExecError::SelfDependency(_))));
        assert!(matches!(
            graph.link(a, StepId(42)),
            Err(ExecError::StepNotFound(_))
        ));
        assert!(matches!(
            graph.add_command(a, Convert { input: "x", output: "b" }),
            Err(ExecError::NotAList(_))
        ));
    }

    #[test]
    fn test_nested_lists() {
        let mut graph = BuildGraph::new();
        let root = graph.root();
        let textures = graph.add_list(root, "textures").unwrap();
        let grass = graph
            .add_command(textures, Convert { input: "src/grass", output: "grass" })
            .unwrap();

        assert_eq!(graph.parent(grass), Some(textures));
        assert_eq!(graph.kind(textures), StepKind::List);
        assert_eq!(graph.command_steps().collect::<Vec<_>>(), vec![grass]);
        assert_eq!(graph.len(), 2);
        assert!(!graph.is_empty());
    }

    #[test]
    fn test_content_references_are_linked() {
        let mut graph = BuildGraph::new();
        let root = graph.root();
        let material = graph
            .add_command(root, Convert { input: "textures/grass", output: "materials/grass" })
            .unwrap();
        let texture = graph
            .add_command(root, Convert { input: "sources/grass", output: "textures/grass" })
            .unwrap();

        let unresolved = graph.link_content_references();

        assert_eq!(graph.prerequisites(material).collect::<Vec<_>>(), vec![texture]);
        assert_eq!(unresolved, vec![(texture, ObjectUrl::content("sources/grass"))]);
    }

    #[test]
    fn test_reset_retires_spawned_steps() {
        let mut graph = BuildGraph::new();
        let root = graph.root();
        let importer = graph.add_command(root, Convert { input: "x", output: "a" }).unwrap();
        let spawned = graph.push_command(importer, Arc::new(Convert { input: "a", output: "b" }), true);
        graph.node_mut(importer).status = ResultStatus::Successful;

        graph.reset_for_run();

        assert!(!graph.contains(spawned));
        assert!(graph.children(importer).is_empty());
        assert_eq!(graph.status(importer), ResultStatus::NotProcessed);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_empty_graph_has_no_steps() {
        let graph = BuildGraph::new();
        assert_eq!(graph.len(), 0);
        assert!(graph.is_empty());
        assert_eq!(graph.step_ids().collect::<Vec<_>>(), vec![graph.root()]);
    }

    #[test]
    fn test_reruns_do_not_grow_the_arena() {
        let mut graph = BuildGraph::new();
        let root = graph.root();
        let importer = graph.add_command(root, Convert { input: "x", output: "a" }).unwrap();
        let later = graph.add_command(root, Convert { input: "y", output: "c" }).unwrap();

        for _ in 0..3 {
            graph.reset_for_run();
            let spawned = graph.push_command(importer, Arc::new(Convert { input: "a", output: "b" }), true);
            graph.link(spawned, later).unwrap();
        }
        assert_eq!(graph.capacity_len(), 4);

        graph.reset_for_run();
        assert_eq!(graph.capacity_len(), 3);
        assert_eq!(graph.prerequisites(later).count(), 0);
        assert!(graph.successors(importer).next().is_none());
    }
}
