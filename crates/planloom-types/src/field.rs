//! Field-level patches, mutation plans, and node commands.
//!
//! Every mutation in the outline is expressed as a [`MutationPlan`]: a list of
//! [`FieldPatch`]es, each carrying the new value *and* the value it replaces.
//! Plans are data: computing one never touches shared state, so a plan can be
//! inspected (dry run) before it is applied, and the `previous` values are
//! enough to undo it.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use thiserror::Error;

use crate::ids::NodeId;
use crate::node::{ContentBlock, Node, TaskFacet};

/// Patchable node fields.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeField {
    ParentId,
    Position,
    Level,
    Title,
    Content,
    Tags,
    Task,
    Metadata,
    UpdatedAt,
}

impl NodeField {
    /// Fields that describe a node's place in the tree.
    ///
    /// These only change through tree operations, never through a free-form
    /// field update.
    pub fn is_structural(&self) -> bool {
        matches!(self, Self::ParentId | Self::Position | Self::Level)
    }
}

/// A tagged value for one [`NodeField`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    ParentId(Option<NodeId>),
    Position(f64),
    Level(u32),
    Title(String),
    Content(Vec<ContentBlock>),
    Tags(Option<Vec<String>>),
    Task(Option<TaskFacet>),
    Metadata(BTreeMap<String, serde_json::Value>),
    UpdatedAt(u64),
}

impl FieldValue {
    /// Which field this value belongs to.
    pub fn field(&self) -> NodeField {
        match self {
            Self::ParentId(_) => NodeField::ParentId,
            Self::Position(_) => NodeField::Position,
            Self::Level(_) => NodeField::Level,
            Self::Title(_) => NodeField::Title,
            Self::Content(_) => NodeField::Content,
            Self::Tags(_) => NodeField::Tags,
            Self::Task(_) => NodeField::Task,
            Self::Metadata(_) => NodeField::Metadata,
            Self::UpdatedAt(_) => NodeField::UpdatedAt,
        }
    }

    /// Check if this value is "nothing" (absent, empty string, empty list or map).
    pub fn is_blank(&self) -> bool {
        match self {
            Self::ParentId(p) => p.is_none(),
            Self::Title(t) => t.is_empty(),
            Self::Content(c) => c.is_empty(),
            Self::Tags(t) => t.as_ref().is_none_or(|t| t.is_empty()),
            Self::Task(t) => t.is_none(),
            Self::Metadata(m) => m.is_empty(),
            Self::Position(_) | Self::Level(_) | Self::UpdatedAt(_) => false,
        }
    }

    /// Equality where all blank values are equal to each other.
    ///
    /// `Tags(None)` and `Tags(Some(vec![]))` are the same value here.
    pub fn same_as(&self, other: &FieldValue) -> bool {
        if self.field() != other.field() {
            return false;
        }
        (self.is_blank() && other.is_blank()) || self == other
    }
}

/// A partial node image: only the fields a caller cares about.
pub type PartialNode = BTreeMap<NodeField, FieldValue>;

impl Node {
    /// Read one field as a tagged value.
    pub fn get(&self, field: NodeField) -> FieldValue {
        match field {
            NodeField::ParentId => FieldValue::ParentId(self.parent_id),
            NodeField::Position => FieldValue::Position(self.position),
            NodeField::Level => FieldValue::Level(self.level),
            NodeField::Title => FieldValue::Title(self.title.clone()),
            NodeField::Content => FieldValue::Content(self.content.clone()),
            NodeField::Tags => FieldValue::Tags(self.tags.clone()),
            NodeField::Task => FieldValue::Task(self.task),
            NodeField::Metadata => FieldValue::Metadata(self.metadata.clone()),
            NodeField::UpdatedAt => FieldValue::UpdatedAt(self.updated_at),
        }
    }

    /// Write one field from a tagged value.
    pub fn set(&mut self, value: FieldValue) {
        match value {
            FieldValue::ParentId(v) => self.parent_id = v,
            FieldValue::Position(v) => self.position = v,
            FieldValue::Level(v) => self.level = v,
            FieldValue::Title(v) => self.title = v,
            FieldValue::Content(v) => self.content = v,
            FieldValue::Tags(v) => self.tags = v,
            FieldValue::Task(v) => self.task = v,
            FieldValue::Metadata(v) => self.metadata = v,
            FieldValue::UpdatedAt(v) => self.updated_at = v,
        }
    }

    /// Partial image of the given fields.
    pub fn partial(&self, fields: impl IntoIterator<Item = NodeField>) -> PartialNode {
        fields.into_iter().map(|f| (f, self.get(f))).collect()
    }

    /// Partial image of every field.
    pub fn full_partial(&self) -> PartialNode {
        self.partial(ALL_FIELDS)
    }
}

/// Every patchable field, in declaration order.
pub const ALL_FIELDS: [NodeField; 9] = [
    NodeField::ParentId,
    NodeField::Position,
    NodeField::Level,
    NodeField::Title,
    NodeField::Content,
    NodeField::Tags,
    NodeField::Task,
    NodeField::Metadata,
    NodeField::UpdatedAt,
];

/// Errors from boundary validation of patches and commands.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("patch for {node_id:?} mixes fields: new is {new}, previous is {previous}")]
    FieldMismatch {
        node_id: NodeId,
        new: NodeField,
        previous: NodeField,
    },

    #[error("update for {0:?} carries no fields")]
    Empty(NodeId),

    #[error("update for {node_id:?} sets {field} more than once")]
    DuplicateField { node_id: NodeId, field: NodeField },

    #[error("field {field} of {node_id:?} can only change through a tree operation")]
    StructuralField { node_id: NodeId, field: NodeField },

    #[error("position {0} is not a finite number")]
    NonFinitePosition(f64),
}

/// One field change on one node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldPatch {
    pub node_id: NodeId,
    pub new: FieldValue,
    pub previous: FieldValue,
}

impl FieldPatch {
    pub fn new(node_id: NodeId, new: FieldValue, previous: FieldValue) -> Self {
        Self {
            node_id,
            new,
            previous,
        }
    }

    /// Build a patch whose `previous` is read from `node`.
    pub fn against(node: &Node, new: FieldValue) -> Self {
        let previous = node.get(new.field());
        Self::new(node.id, new, previous)
    }

    pub fn field(&self) -> NodeField {
        self.new.field()
    }

    /// Check the patch is internally consistent.
    pub fn validate(&self) -> Result<(), CommandError> {
        if self.new.field() != self.previous.field() {
            return Err(CommandError::FieldMismatch {
                node_id: self.node_id,
                new: self.new.field(),
                previous: self.previous.field(),
            });
        }
        if let FieldValue::Position(p) = self.new
            && !p.is_finite()
        {
            return Err(CommandError::NonFinitePosition(p));
        }
        Ok(())
    }
}

/// The full set of field changes for one logical mutation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MutationPlan {
    patches: Vec<FieldPatch>,
}

impl MutationPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// A plan with nothing to do.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_patches(patches: Vec<FieldPatch>) -> Self {
        Self { patches }
    }

    pub fn push(&mut self, patch: FieldPatch) {
        self.patches.push(patch);
    }

    pub fn extend(&mut self, other: MutationPlan) {
        self.patches.extend(other.patches);
    }

    pub fn patches(&self) -> &[FieldPatch] {
        &self.patches
    }

    pub fn into_patches(self) -> Vec<FieldPatch> {
        self.patches
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Node ids touched by this plan, in first-appearance order.
    pub fn touched_nodes(&self) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        self.patches
            .iter()
            .filter(|p| seen.insert(p.node_id))
            .map(|p| p.node_id)
            .collect()
    }

    /// Patches for one node.
    pub fn patches_for(&self, node_id: NodeId) -> impl Iterator<Item = &FieldPatch> {
        self.patches.iter().filter(move |p| p.node_id == node_id)
    }

    /// The new value this plan assigns to `field` of `node_id`, if any.
    ///
    /// When a field is patched twice the last patch wins.
    pub fn new_value(&self, node_id: NodeId, field: NodeField) -> Option<&FieldValue> {
        self.patches_for(node_id)
            .filter(|p| p.field() == field)
            .last()
            .map(|p| &p.new)
    }

    /// Validate every patch.
    pub fn validate(&self) -> Result<(), CommandError> {
        self.patches.iter().try_for_each(FieldPatch::validate)
    }
}

/// Create a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateNodeCommand {
    pub node: Node,
}

impl CreateNodeCommand {
    pub fn validate(&self) -> Result<(), CommandError> {
        if !self.node.position.is_finite() {
            return Err(CommandError::NonFinitePosition(self.node.position));
        }
        Ok(())
    }
}

/// Update non-structural fields of a node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateNodeCommand {
    pub node_id: NodeId,
    pub fields: Vec<FieldValue>,
}

impl UpdateNodeCommand {
    pub fn new(node_id: NodeId, fields: Vec<FieldValue>) -> Self {
        Self { node_id, fields }
    }

    /// Reject empty updates, repeated fields, and structural fields.
    pub fn validate(&self) -> Result<(), CommandError> {
        if self.fields.is_empty() {
            return Err(CommandError::Empty(self.node_id));
        }
        let mut seen = HashSet::new();
        for value in &self.fields {
            let field = value.field();
            if field.is_structural() {
                return Err(CommandError::StructuralField {
                    node_id: self.node_id,
                    field,
                });
            }
            if !seen.insert(field) {
                return Err(CommandError::DuplicateField {
                    node_id: self.node_id,
                    field,
                });
            }
        }
        Ok(())
    }

    /// Turn the update into a plan against the node's current state.
    pub fn into_plan(self, current: &Node) -> MutationPlan {
        MutationPlan::from_patches(
            self.fields
                .into_iter()
                .map(|v| FieldPatch::against(current, v))
                .collect(),
        )
    }
}

/// Delete a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteNodeCommand {
    pub node_id: NodeId,
}

/// Any command accepted at the outline boundary.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum NodeCommand {
    Create(CreateNodeCommand),
    Update(UpdateNodeCommand),
    Delete(DeleteNodeCommand),
}
