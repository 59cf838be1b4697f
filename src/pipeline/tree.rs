//! Arena of stages.
//!
//! Stages are stored in a flat `Vec<Stage>` with [`StageId`] as the array
//! index. The root is always `StageId::ROOT`; children keep their attach order,
//! which is also the order their parent's pipe delivers to them.

use crate::error::{Result, TransitError};
use crate::events::Endpoints;
use crate::pipe::Pipe;
use crate::pipeline::id::StageId;
use crate::pipeline::stage::{Stage, StageSpec};
use std::collections::{BTreeSet, VecDeque};
use std::ops::Index;

/// The stage tree of one pipeline.
#[derive(Debug)]
pub struct StageTree {
    stages: Vec<Stage>,
}

impl StageTree {
    /// Create a tree holding only the source stage.
    pub fn new(root: StageSpec) -> Self {
        let path = root.name.clone();
        let pipe = Pipe::new_root(path.clone());
        Self {
            stages: vec![Stage::new(root, StageId::ROOT, StageId::INVALID, path, pipe)],
        }
    }

    /// Attach a new stage below `parent`.
    pub fn add_child(&mut self, parent: StageId, spec: StageSpec) -> Result<StageId> {
        let id = StageId(self.stages.len() as u32);
        let parent_stage = self
            .stages
            .get_mut(parent.index())
            .ok_or_else(|| TransitError::Config(format!("unknown parent stage {}", parent)))?;
        let path = format!("{}/{}", parent_stage.path(), spec.name);
        let pipe = Pipe::new_child(&mut parent_stage.pipe, path.clone());
        parent_stage.children.push(id);
        self.stages.push(Stage::new(spec, id, parent, path, pipe));
        Ok(id)
    }

    pub fn root(&self) -> &Stage {
        &self.stages[StageId::ROOT.index()]
    }

    pub fn get(&self, id: StageId) -> Option<&Stage> {
        self.stages.get(id.index())
    }

    /// Number of stages, the root included.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in insertion order.
    pub fn stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter()
    }

    /// Stages level by level from the root, children in attach order.
    pub fn breadth_first(&self) -> Vec<&Stage> {
        let mut order = Vec::with_capacity(self.stages.len());
        let mut queue = VecDeque::from([StageId::ROOT]);
        while let Some(id) = queue.pop_front() {
            let stage = &self[id];
            queue.extend(stage.children().iter().copied());
            order.push(stage);
        }
        order
    }

    /// Stage name → adaptor type.
    pub fn endpoints(&self) -> Endpoints {
        self.stages
            .iter()
            .map(|s| (s.name().to_string(), s.kind().to_string()))
            .collect()
    }

    /// The source needs at least one child and stage names must be unique.
    pub fn validate(&self) -> Result<()> {
        let root = self.root();
        if root.children().is_empty() {
            return Err(TransitError::Config(format!(
                "source '{}' has no children",
                root.name()
            )));
        }
        let mut names = BTreeSet::new();
        for stage in &self.stages {
            if !names.insert(stage.name()) {
                return Err(TransitError::Config(format!(
                    "duplicate stage name '{}'",
                    stage.name()
                )));
            }
        }
        Ok(())
    }

    /// Stop every stage, parents before children, so that each child drains
    /// what its parent already handed over.
    pub fn stop(&self) {
        for stage in self.breadth_first() {
            stage.stop();
        }
    }
}

impl Index<StageId> for StageTree {
    type Output = Stage;

    fn index(&self, id: StageId) -> &Stage {
        &self.stages[id.index()]
    }
}
