//! Object manager.
//!
//! Owns the scene graph as an id-keyed arena behind one coarse lock. Parent
//! and child links are ids only. The graph is changed exclusively by OBJECT
//! events through [`ObjectManager::apply`]; every successful change refreshes
//! the world matrices.
//!
//! Two id policies exist. The authority always assigns a fresh id on CREATE.
//! A replica keeps the `id` field a CREATE carries (the authority's id), so
//! later UPDATE and relation events from the authority resolve to the same
//! node.

use std::{collections::BTreeMap, fmt};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    event::{Event, EventListener, ObjectEvent},
    fields::FieldError,
    math::Mat4,
    render::RenderItem,
    scene::{NodeId, ObjectType, SceneObject, ROOT_PARENT},
};

/// Fields sent by periodic replication.
pub const TRANSFORM_FIELDS: [&str; 3] = ["position", "rotation", "scale"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRole {
    /// Assigns ids.
    Authority,
    /// Mirrors ids chosen by the authority.
    Replica,
}

/// What an applied event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectChange {
    Created { id: NodeId, object_type: ObjectType },
    Updated { id: NodeId, fields: usize },
    Destroyed { id: NodeId, orphans: Vec<NodeId> },
    Linked { parent: NodeId, child: NodeId },
    Unlinked { parent: NodeId, child: NodeId },
    /// Valid event with nothing to do (relation already in the requested
    /// state).
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObjectError {
    NotAnObjectEvent,
    UnknownObjectType(u8),
    UnknownObject(NodeId),
    DuplicateId(NodeId),
    /// Every id from 1 to `NodeId::MAX` is taken.
    IdsExhausted,
    SelfRelation(NodeId),
    WouldCycle { parent: NodeId, child: NodeId },
    Field { id: Option<NodeId>, source: FieldError },
}

impl fmt::Display for ObjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectError::NotAnObjectEvent => write!(f, "event carries no object payload"),
            ObjectError::UnknownObjectType(t) => write!(f, "unknown object type {t}"),
            ObjectError::UnknownObject(id) => write!(f, "no object with id {id}"),
            ObjectError::DuplicateId(id) => write!(f, "object id {id} already exists"),
            ObjectError::IdsExhausted => write!(f, "no free object ids"),
            ObjectError::SelfRelation(id) => write!(f, "object {id} cannot be its own parent"),
            ObjectError::WouldCycle { parent, child } => {
                write!(f, "linking {child} under {parent} would create a cycle")
            }
            ObjectError::Field { id: Some(id), source } => write!(f, "object {id}: {source}"),
            ObjectError::Field { id: None, source } => write!(f, "new object: {source}"),
        }
    }
}

impl std::error::Error for ObjectError {}

#[derive(Debug, Default)]
struct SceneGraph {
    nodes: BTreeMap<NodeId, SceneObject>,
    next_id: NodeId,
}

impl SceneGraph {
    /// Next unused id at or after `next_id`, wrapping once past `NodeId::MAX`.
    fn fresh_id(&mut self) -> Result<NodeId, ObjectError> {
        // Ids start at 1; 0 is the root marker.
        let start = self.next_id.max(1);
        let id = (start..=NodeId::MAX)
            .chain(1..start)
            .find(|id| !self.nodes.contains_key(id))
            .ok_or(ObjectError::IdsExhausted)?;
        self.next_id = id.saturating_add(1);
        Ok(id)
    }

    fn node(&self, id: NodeId) -> Result<&SceneObject, ObjectError> {
        self.nodes.get(&id).ok_or(ObjectError::UnknownObject(id))
    }

    fn node_mut(&mut self, id: NodeId) -> Result<&mut SceneObject, ObjectError> {
        self.nodes.get_mut(&id).ok_or(ObjectError::UnknownObject(id))
    }

    fn create(
        &mut self,
        role: ObjectRole,
        type_byte: u8,
        fields: &[u8],
    ) -> Result<ObjectChange, ObjectError> {
        let object_type = ObjectType::from_u8(type_byte)
            .filter(|t| *t != ObjectType::Undef)
            .ok_or(ObjectError::UnknownObjectType(type_byte))?;
        let mut obj =
            SceneObject::new(object_type).ok_or(ObjectError::UnknownObjectType(type_byte))?;
        if !fields.is_empty() {
            obj.unserialize(fields)
                .map_err(|source| ObjectError::Field { id: None, source })?;
        }

        let carried = obj.node().id;
        let id = match role {
            ObjectRole::Replica if carried != 0 => {
                if self.nodes.contains_key(&carried) {
                    return Err(ObjectError::DuplicateId(carried));
                }
                self.next_id = self.next_id.max(carried.saturating_add(1));
                carried
            }
            _ => self.fresh_id()?,
        };

        let node = obj.node_mut();
        node.id = id;
        node.parent = ROOT_PARENT;
        node.children.clear();
        self.nodes.insert(id, obj);
        Ok(ObjectChange::Created { id, object_type })
    }

    /// Applies the blob to a copy and swaps it in, so a failing field leaves
    /// the node untouched.
    fn update(&mut self, id: NodeId, fields: &[u8]) -> Result<ObjectChange, ObjectError> {
        let current = self.node(id)?;
        let mut next = current.clone();
        let applied = next
            .unserialize(fields)
            .map_err(|source| ObjectError::Field { id: Some(id), source })?;

        // Identity and links are not field-controlled.
        let node = next.node_mut();
        node.id = id;
        node.parent = current.node().parent;
        node.children = current.node().children.clone();

        self.nodes.insert(id, next);
        Ok(ObjectChange::Updated {
            id,
            fields: applied,
        })
    }

    fn link(&mut self, parent: NodeId, child: NodeId) -> Result<ObjectChange, ObjectError> {
        if parent == child {
            return Err(ObjectError::SelfRelation(child));
        }
        self.node(parent)?;
        let old_parent = self.node(child)?.node().parent;
        if old_parent == parent {
            return Ok(ObjectChange::Unchanged);
        }

        // Walk up from the new parent; meeting the child means a cycle.
        let mut cursor = parent;
        while cursor != ROOT_PARENT {
            if cursor == child {
                return Err(ObjectError::WouldCycle { parent, child });
            }
            cursor = self.node(cursor)?.node().parent;
        }

        if old_parent != ROOT_PARENT {
            if let Some(old) = self.nodes.get_mut(&old_parent) {
                old.node_mut().children.retain(|c| *c != child);
            }
        }
        self.node_mut(child)?.node_mut().parent = parent;
        let children = &mut self.node_mut(parent)?.node_mut().children;
        if !children.contains(&child) {
            children.push(child);
        }
        Ok(ObjectChange::Linked { parent, child })
    }

    fn unlink(&mut self, parent: NodeId, child: NodeId) -> Result<ObjectChange, ObjectError> {
        self.node(parent)?;
        if self.node(child)?.node().parent != parent {
            return Ok(ObjectChange::Unchanged);
        }
        self.node_mut(parent)?
            .node_mut()
            .children
            .retain(|c| *c != child);
        self.node_mut(child)?.node_mut().parent = ROOT_PARENT;
        Ok(ObjectChange::Unlinked { parent, child })
    }

    /// Removes the node; its children become roots.
    fn destroy(&mut self, id: NodeId) -> Result<ObjectChange, ObjectError> {
        let removed = self.nodes.remove(&id).ok_or(ObjectError::UnknownObject(id))?;
        let node = removed.node();

        if node.parent != ROOT_PARENT {
            if let Some(parent) = self.nodes.get_mut(&node.parent) {
                parent.node_mut().children.retain(|c| *c != id);
            }
        }
        for child in &node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.node_mut().parent = ROOT_PARENT;
            }
        }
        Ok(ObjectChange::Destroyed {
            id,
            orphans: node.children.clone(),
        })
    }

    /// Depth-first from every root: `world = parent_world * local`.
    fn update_model_matrices(&mut self) {
        let mut stack: Vec<(NodeId, Mat4)> = self
            .nodes
            .values()
            .filter(|o| o.node().is_root())
            .map(|o| (o.node().id, Mat4::IDENTITY))
            .collect();

        while let Some((id, parent_world)) = stack.pop() {
            let Some(obj) = self.nodes.get_mut(&id) else {
                continue;
            };
            let node = obj.node_mut();
            let world = parent_world * node.local_matrix();
            node.model_matrix = world;
            stack.extend(node.children.iter().map(|c| (*c, world)));
        }
    }
}

pub struct ObjectManager {
    role: ObjectRole,
    graph: Mutex<SceneGraph>,
}

impl fmt::Debug for ObjectManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectManager")
            .field("role", &self.role)
            .field("objects", &self.len())
            .finish()
    }
}

impl ObjectManager {
    pub fn new(role: ObjectRole) -> Self {
        Self {
            role,
            graph: Mutex::new(SceneGraph::default()),
        }
    }

    pub fn role(&self) -> ObjectRole {
        self.role
    }

    /// Applies one OBJECT event.
    pub fn apply(&self, event: &Event) -> Result<ObjectChange, ObjectError> {
        let obj = event.object_event().ok_or(ObjectError::NotAnObjectEvent)?;
        self.apply_object(obj)
    }

    pub fn apply_object(&self, event: &ObjectEvent) -> Result<ObjectChange, ObjectError> {
        let mut graph = self.graph.lock();
        let change = match event {
            ObjectEvent::Create {
                object_type,
                fields,
            } => graph.create(self.role, *object_type, fields)?,
            ObjectEvent::Update { object_id, fields } => graph.update(*object_id, fields)?,
            ObjectEvent::Destroy { object_id } => graph.destroy(*object_id)?,
            ObjectEvent::ParentAdd { child, parent } | ObjectEvent::ChildAdd { parent, child } => {
                graph.link(*parent, *child)?
            }
            ObjectEvent::ParentRemove { child, parent }
            | ObjectEvent::ChildRemove { parent, child } => graph.unlink(*parent, *child)?,
        };
        if change != ObjectChange::Unchanged {
            graph.update_model_matrices();
        }
        Ok(change)
    }

    pub fn update_model_matrices(&self) {
        self.graph.lock().update_model_matrices();
    }

    pub fn len(&self) -> usize {
        self.graph.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.graph.lock().nodes.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.graph.lock().nodes.keys().copied().collect()
    }

    /// Copy of one object.
    pub fn get(&self, id: NodeId) -> Option<SceneObject> {
        self.graph.lock().nodes.get(&id).cloned()
    }

    /// Runs `f` against one object under the lock. `f` must not call back
    /// into the manager.
    pub fn with_object<R>(&self, id: NodeId, f: impl FnOnce(&SceneObject) -> R) -> Option<R> {
        self.graph.lock().nodes.get(&id).map(f)
    }

    /// CREATE for every node (all default fields) followed by PARENT_ADD for
    /// every linked node; replaying them on an empty replica reproduces the
    /// graph.
    pub fn snapshot_events(&self) -> Vec<ObjectEvent> {
        let graph = self.graph.lock();
        let creates = graph.nodes.values().map(|obj| ObjectEvent::Create {
            object_type: obj.object_type().as_u8(),
            fields: obj.serialize(&[]),
        });
        let links = graph
            .nodes
            .values()
            .filter(|obj| !obj.node().is_root())
            .map(|obj| ObjectEvent::ParentAdd {
                child: obj.node().id,
                parent: obj.node().parent,
            });
        creates.chain(links).collect()
    }

    /// One UPDATE per node carrying `names`.
    pub fn update_events(&self, names: &[&str]) -> Vec<ObjectEvent> {
        self.graph
            .lock()
            .nodes
            .values()
            .map(|obj| ObjectEvent::Update {
                object_id: obj.node().id,
                fields: obj.serialize(names),
            })
            .collect()
    }

    /// CREATE carrying every default field of an existing node.
    pub fn create_event(&self, id: NodeId) -> Option<ObjectEvent> {
        self.with_object(id, |obj| ObjectEvent::Create {
            object_type: obj.object_type().as_u8(),
            fields: obj.serialize(&[]),
        })
    }

    /// Draw list for every node that has render state.
    pub fn render_items(&self) -> Vec<RenderItem> {
        self.graph
            .lock()
            .nodes
            .values()
            .filter_map(|obj| {
                let entity = obj.entity()?;
                Some(RenderItem {
                    id: entity.node.id,
                    model_matrix: entity.node.model_matrix,
                    mesh: entity.mesh.clone(),
                    texture: entity.texture.clone(),
                    color: entity.material,
                })
            })
            .collect()
    }
}

impl EventListener for ObjectManager {
    fn handle_event(&self, event: &Event) -> anyhow::Result<()> {
        match self.apply(event) {
            Ok(change) => {
                debug!(event = %event.sub_type(), ?change, "Applied object event");
                Ok(())
            }
            Err(e) => {
                warn!(event = %event.sub_type(), error = %e, "Dropped object event");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::{
        math::{Quat, Vec3},
        scene::{Entity, WorldNode},
    };

    const EPS: f32 = 1e-5;

    fn create(
        mgr: &ObjectManager,
        object_type: ObjectType,
        obj: &SceneObject,
        names: &[&str],
    ) -> NodeId {
        let change = mgr
            .apply_object(&ObjectEvent::Create {
                object_type: object_type.as_u8(),
                fields: obj.serialize(names),
            })
            .unwrap();
        match change {
            ObjectChange::Created { id, .. } => id,
            other => panic!("unexpected {other:?}"),
        }
    }

    fn node_at(position: Vec3) -> SceneObject {
        SceneObject::Node(WorldNode {
            position,
            ..WorldNode::default()
        })
    }

    #[test]
    fn create_entity_sets_position_and_matrix() {
        let mgr = ObjectManager::new(ObjectRole::Authority);
        let proto = SceneObject::Entity(Entity {
            node: WorldNode {
                position: Vec3::new(1.0, 0.0, 0.0),
                ..WorldNode::default()
            },
            ..Entity::default()
        });
        let id = create(&mgr, ObjectType::Entity, &proto, &["position"]);

        assert_ne!(id, 0);
        assert_eq!(mgr.len(), 1);
        let obj = mgr.get(id).unwrap();
        assert_eq!(obj.object_type(), ObjectType::Entity);
        assert_eq!(obj.node().position, Vec3::new(1.0, 0.0, 0.0));
        assert!(obj
            .node()
            .model_matrix
            .approx_eq(&Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0)), EPS));
    }

    #[test]
    fn update_of_unknown_id_changes_nothing() {
        let mgr = ObjectManager::new(ObjectRole::Authority);
        let id = create(&mgr, ObjectType::WorldNode, &node_at(Vec3::ONE), &[]);
        let before = mgr.get(id);

        let err = mgr
            .apply_object(&ObjectEvent::Update {
                object_id: id + 100,
                fields: node_at(Vec3::ZERO).serialize(&["position"]),
            })
            .unwrap_err();
        assert_eq!(err, ObjectError::UnknownObject(id + 100));
        assert_eq!(mgr.get(id), before);
        assert_eq!(mgr.len(), 1);
    }

    #[test]
    fn update_applies_only_present_fields_atomically() {
        let mgr = ObjectManager::new(ObjectRole::Authority);
        let id = create(&mgr, ObjectType::WorldNode, &node_at(Vec3::new(3.0, 0.0, 0.0)), &[]);

        let rotated = SceneObject::Node(WorldNode {
            rotation: Quat::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), 1.0),
            ..WorldNode::default()
        });
        mgr.apply_object(&ObjectEvent::Update {
            object_id: id,
            fields: rotated.serialize(&["rotation"]),
        })
        .unwrap();
        let obj = mgr.get(id).unwrap();
        assert_eq!(obj.node().position, Vec3::new(3.0, 0.0, 0.0));
        assert!(obj.node().rotation.approx_eq(rotated.node().rotation, EPS));

        // Good position followed by a truncated scale: nothing is applied.
        let mut blob = node_at(Vec3::ZERO).serialize(&["position", "scale"]).to_vec();
        blob.pop();
        assert!(mgr
            .apply_object(&ObjectEvent::Update {
                object_id: id,
                fields: Bytes::from(blob),
            })
            .is_err());
        assert_eq!(mgr.get(id).unwrap().node().position, Vec3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn parent_add_then_child_add_does_not_duplicate() {
        let mgr = ObjectManager::new(ObjectRole::Replica);
        for id in 1..=5 {
            let mut proto = node_at(Vec3::ZERO);
            proto.node_mut().id = id;
            create(&mgr, ObjectType::WorldNode, &proto, &["id"]);
        }

        assert_eq!(
            mgr.apply_object(&ObjectEvent::ParentAdd { child: 5, parent: 3 })
                .unwrap(),
            ObjectChange::Linked { parent: 3, child: 5 }
        );
        assert_eq!(
            mgr.apply_object(&ObjectEvent::ChildAdd { parent: 3, child: 5 })
                .unwrap(),
            ObjectChange::Unchanged
        );
        assert_eq!(mgr.get(3).unwrap().node().children, vec![5]);
        assert_eq!(mgr.get(5).unwrap().node().parent, 3);
    }

    #[test]
    fn relink_moves_child_and_rejects_cycles() {
        let mgr = ObjectManager::new(ObjectRole::Authority);
        let a = create(&mgr, ObjectType::WorldNode, &node_at(Vec3::ZERO), &[]);
        let b = create(&mgr, ObjectType::WorldNode, &node_at(Vec3::ZERO), &[]);
        let c = create(&mgr, ObjectType::WorldNode, &node_at(Vec3::ZERO), &[]);

        mgr.apply_object(&ObjectEvent::ChildAdd { parent: a, child: c }).unwrap();
        mgr.apply_object(&ObjectEvent::ChildAdd { parent: b, child: c }).unwrap();
        assert!(mgr.get(a).unwrap().node().children.is_empty());
        assert_eq!(mgr.get(b).unwrap().node().children, vec![c]);

        assert_eq!(
            mgr.apply_object(&ObjectEvent::ChildAdd { parent: c, child: b }),
            Err(ObjectError::WouldCycle { parent: c, child: b })
        );
        assert_eq!(
            mgr.apply_object(&ObjectEvent::ParentAdd { child: a, parent: a }),
            Err(ObjectError::SelfRelation(a))
        );
    }

    #[test]
    fn unlink_is_symmetric() {
        let mgr = ObjectManager::new(ObjectRole::Authority);
        let p = create(&mgr, ObjectType::WorldNode, &node_at(Vec3::ZERO), &[]);
        let c = create(&mgr, ObjectType::WorldNode, &node_at(Vec3::ZERO), &[]);
        mgr.apply_object(&ObjectEvent::ParentAdd { child: c, parent: p }).unwrap();

        assert_eq!(
            mgr.apply_object(&ObjectEvent::ChildRemove { parent: p, child: c })
                .unwrap(),
            ObjectChange::Unlinked { parent: p, child: c }
        );
        assert!(mgr.get(p).unwrap().node().children.is_empty());
        assert!(mgr.get(c).unwrap().node().is_root());
        assert_eq!(
            mgr.apply_object(&ObjectEvent::ParentRemove { child: c, parent: p })
                .unwrap(),
            ObjectChange::Unchanged
        );
    }

    #[test]
    fn world_matrix_composes_down_the_chain() {
        let mgr = ObjectManager::new(ObjectRole::Authority);
        let root_local = WorldNode {
            position: Vec3::new(10.0, 0.0, 0.0),
            scale: Vec3::new(2.0, 2.0, 2.0),
            ..WorldNode::default()
        };
        let a_local = WorldNode {
            position: Vec3::new(0.0, 1.0, 0.0),
            rotation: Quat::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), 0.5),
            ..WorldNode::default()
        };
        let b_local = WorldNode {
            position: Vec3::new(0.0, 0.0, 3.0),
            scale: Vec3::new(0.5, 1.0, 1.0),
            ..WorldNode::default()
        };

        let names = ["position", "rotation", "scale"];
        let node = |local: &WorldNode| SceneObject::Node(local.clone());
        let root = create(&mgr, ObjectType::WorldNode, &node(&root_local), &names);
        let a = create(&mgr, ObjectType::WorldNode, &node(&a_local), &names);
        let b = create(&mgr, ObjectType::WorldNode, &node(&b_local), &names);
        mgr.apply_object(&ObjectEvent::ChildAdd { parent: a, child: b }).unwrap();
        mgr.apply_object(&ObjectEvent::ChildAdd { parent: root, child: a }).unwrap();

        let expected = root_local.local_matrix() * a_local.local_matrix() * b_local.local_matrix();
        assert!(mgr.get(b).unwrap().node().model_matrix.approx_eq(&expected, EPS));
    }

    #[test]
    fn destroy_promotes_children_to_roots() {
        let mgr = ObjectManager::new(ObjectRole::Authority);
        let top = create(&mgr, ObjectType::WorldNode, &node_at(Vec3::ZERO), &[]);
        let mid = create(&mgr, ObjectType::WorldNode, &node_at(Vec3::new(1.0, 0.0, 0.0)), &[]);
        let leaf = create(&mgr, ObjectType::WorldNode, &node_at(Vec3::new(0.0, 2.0, 0.0)), &[]);
        mgr.apply_object(&ObjectEvent::ChildAdd { parent: top, child: mid }).unwrap();
        mgr.apply_object(&ObjectEvent::ChildAdd { parent: mid, child: leaf }).unwrap();

        assert_eq!(
            mgr.apply_object(&ObjectEvent::Destroy { object_id: mid }).unwrap(),
            ObjectChange::Destroyed { id: mid, orphans: vec![leaf] }
        );
        assert!(!mgr.contains(mid));
        assert!(mgr.get(top).unwrap().node().children.is_empty());
        let leaf_node = mgr.get(leaf).unwrap();
        assert!(leaf_node.node().is_root());
        assert!(leaf_node
            .node()
            .model_matrix
            .approx_eq(&Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)), EPS));
    }

    #[test]
    fn authority_ignores_carried_id_replica_keeps_it() {
        let mut proto = node_at(Vec3::ZERO);
        proto.node_mut().id = 40;

        let authority = ObjectManager::new(ObjectRole::Authority);
        assert_eq!(create(&authority, ObjectType::WorldNode, &proto, &[]), 1);

        let replica = ObjectManager::new(ObjectRole::Replica);
        assert_eq!(create(&replica, ObjectType::WorldNode, &proto, &[]), 40);
        assert_eq!(
            replica.apply_object(&ObjectEvent::Create {
                object_type: ObjectType::WorldNode.as_u8(),
                fields: proto.serialize(&[]),
            }),
            Err(ObjectError::DuplicateId(40))
        );
        // No id carried: fresh ids continue past the highest seen.
        assert_eq!(create(&replica, ObjectType::WorldNode, &proto, &["position"]), 41);
    }

    #[test]
    fn replica_fresh_id_after_max_id_wraps_to_a_free_id() {
        let replica = ObjectManager::new(ObjectRole::Replica);
        let mut top = node_at(Vec3::new(5.0, 0.0, 0.0));
        top.node_mut().id = NodeId::MAX;
        let id = create(&replica, ObjectType::WorldNode, &top, &["id", "position"]);
        assert_eq!(id, NodeId::MAX);

        let mut taken = node_at(Vec3::ZERO);
        taken.node_mut().id = 1;
        create(&replica, ObjectType::WorldNode, &taken, &["id"]);

        // No id carried; MAX and 1 are in use.
        let fresh = create(&replica, ObjectType::WorldNode, &node_at(Vec3::ONE), &["position"]);
        assert_eq!(fresh, 2);
        assert_eq!(replica.len(), 3);
        let top = replica.get(NodeId::MAX).unwrap();
        assert_eq!(top.node().position, Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(replica.get(fresh).unwrap().node().position, Vec3::ONE);
    }

    #[test]
    fn snapshot_replays_into_identical_replica() {
        let authority = ObjectManager::new(ObjectRole::Authority);
        let root = create(&authority, ObjectType::WorldNode, &node_at(Vec3::ZERO), &[]);
        let cube = SceneObject::Entity(Entity {
            mesh: "cube".into(),
            ..Entity::default()
        });
        let a = create(&authority, ObjectType::Entity, &cube, &["mesh"]);
        let b = create(&authority, ObjectType::Entity, &cube, &["mesh"]);
        authority.apply_object(&ObjectEvent::ChildAdd { parent: root, child: a }).unwrap();
        authority.apply_object(&ObjectEvent::ChildAdd { parent: a, child: b }).unwrap();

        let replica = ObjectManager::new(ObjectRole::Replica);
        for event in authority.snapshot_events() {
            replica.apply_object(&event).unwrap();
        }

        assert_eq!(replica.ids(), authority.ids());
        for id in authority.ids() {
            assert_eq!(replica.get(id), authority.get(id));
        }
        assert_eq!(replica.render_items().len(), 2);
    }

    #[test]
    fn unknown_object_type_is_rejected() {
        let mgr = ObjectManager::new(ObjectRole::Authority);
        assert_eq!(
            mgr.apply_object(&ObjectEvent::Create {
                object_type: 0,
                fields: Bytes::new(),
            }),
            Err(ObjectError::UnknownObjectType(0))
        );
        assert_eq!(
            mgr.apply_object(&ObjectEvent::Create {
                object_type: 9,
                fields: Bytes::new(),
            }),
            Err(ObjectError::UnknownObjectType(9))
        );
        assert!(mgr.is_empty());
    }
}
