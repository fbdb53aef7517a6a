//! Scene node types.
//!
//! `WorldNode` carries the transform hierarchy; `Entity` adds what a renderer
//! needs; `PhysicsObject` adds simulation state. Each type's field registry is
//! the base registry lifted through the embedding plus its own entries, so
//! the default field set reads base-first:
//!
//! | type | fields |
//! |------|--------|
//! | WorldNode | id, position, rotation, scale |
//! | Entity | + material, texture, mesh |
//! | PhysicsObject | + velocity, angVelocity, mass, collisionShape |

use std::{fmt, sync::OnceLock};

use bytes::{Bytes, BytesMut};

use crate::{
    codec,
    fields::{expect_len, FieldError, FieldRegistry},
    math::{Color, Mat4, Quat, Vec3},
};

pub type NodeId = u32;

/// Parent id of a root node.
pub const ROOT_PARENT: NodeId = 0;

/// Mesh/texture name used when none is set.
pub const DEFAULT_ASSET: &str = "default";

/// Object type byte carried by OBJECT_CREATE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    Undef = 0,
    WorldNode = 1,
    Entity = 2,
    PhysicsObject = 3,
}

impl ObjectType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ObjectType::Undef),
            1 => Some(ObjectType::WorldNode),
            2 => Some(ObjectType::Entity),
            3 => Some(ObjectType::PhysicsObject),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectType::Undef => "Undef",
            ObjectType::WorldNode => "WorldNode",
            ObjectType::Entity => "Entity",
            ObjectType::PhysicsObject => "PhysicsObject",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorldNode {
    pub id: NodeId,
    pub parent: NodeId,
    pub children: Vec<NodeId>,
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
    /// World transform, refreshed by the object manager.
    pub model_matrix: Mat4,
}

impl Default for WorldNode {
    fn default() -> Self {
        Self {
            id: 0,
            parent: ROOT_PARENT,
            children: Vec::new(),
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
            model_matrix: Mat4::IDENTITY,
        }
    }
}

impl WorldNode {
    pub fn is_root(&self) -> bool {
        self.parent == ROOT_PARENT
    }

    /// `T(position) * R(rotation) * S(scale)`.
    pub fn local_matrix(&self) -> Mat4 {
        Mat4::from_trs(self.position, self.rotation, self.scale)
    }

    pub fn fields() -> &'static FieldRegistry<WorldNode> {
        static REGISTRY: OnceLock<FieldRegistry<WorldNode>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            FieldRegistry::<WorldNode>::new()
                .field(
                    "id",
                    |n, buf| {
                        codec::put_u32(buf, n.id);
                        Ok(())
                    },
                    |n, data| {
                        n.id = read_u32("id", data)?;
                        Ok(())
                    },
                )
                .field(
                    "position",
                    |n, buf| {
                        put_vec3(buf, n.position);
                        Ok(())
                    },
                    |n, data| {
                        n.position = read_vec3("position", data)?;
                        Ok(())
                    },
                )
                .field(
                    "rotation",
                    |n, buf| {
                        put_quat(buf, n.rotation);
                        Ok(())
                    },
                    |n, data| {
                        n.rotation = read_quat("rotation", data)?;
                        Ok(())
                    },
                )
                .field(
                    "scale",
                    |n, buf| {
                        put_vec3(buf, n.scale);
                        Ok(())
                    },
                    |n, data| {
                        n.scale = read_vec3("scale", data)?;
                        Ok(())
                    },
                )
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub node: WorldNode,
    pub mesh: String,
    pub texture: String,
    pub material: Color,
}

impl Default for Entity {
    fn default() -> Self {
        Self {
            node: WorldNode::default(),
            mesh: DEFAULT_ASSET.to_string(),
            texture: DEFAULT_ASSET.to_string(),
            material: Color::WHITE,
        }
    }
}

impl Entity {
    pub fn fields() -> &'static FieldRegistry<Entity> {
        static REGISTRY: OnceLock<FieldRegistry<Entity>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            WorldNode::fields()
                .lift(|e: &Entity| &e.node, |e: &mut Entity| &mut e.node)
                .field(
                    "material",
                    |e, buf| {
                        let c = e.material;
                        for v in [c.r, c.g, c.b, c.a] {
                            codec::put_f32(buf, v);
                        }
                        Ok(())
                    },
                    |e, data| {
                        let [r, g, b, a] = read_f32s::<4>("material", data)?;
                        e.material = Color::new(r, g, b, a);
                        Ok(())
                    },
                )
                .field(
                    "texture",
                    |e, buf| codec::put_string(buf, &e.texture),
                    |e, data| {
                        e.texture = read_asset("texture", data)?;
                        Ok(())
                    },
                )
                .field(
                    "mesh",
                    |e, buf| codec::put_string(buf, &e.mesh),
                    |e, data| {
                        e.mesh = read_asset("mesh", data)?;
                        Ok(())
                    },
                )
        })
    }
}

/// Collision primitive kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ShapeKind {
    #[default]
    None = 0,
    Sphere = 1,
    Box = 2,
    Capsule = 3,
}

impl ShapeKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ShapeKind::None),
            1 => Some(ShapeKind::Sphere),
            2 => Some(ShapeKind::Box),
            3 => Some(ShapeKind::Capsule),
            _ => None,
        }
    }
}

/// Shape kind plus four kind-specific parameters (radius, half extents, ...).
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CollisionShape {
    pub kind: ShapeKind,
    pub params: [f32; 4],
}

impl CollisionShape {
    pub const ENCODED_LEN: usize = 1 + 4 * 4;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicsObject {
    pub entity: Entity,
    pub velocity: Vec3,
    pub angular_velocity: Quat,
    pub mass: f32,
    pub collision_shape: CollisionShape,
}

impl Default for PhysicsObject {
    fn default() -> Self {
        Self {
            entity: Entity::default(),
            velocity: Vec3::ZERO,
            angular_velocity: Quat::IDENTITY,
            mass: 1.0,
            collision_shape: CollisionShape::default(),
        }
    }
}

impl PhysicsObject {
    pub fn fields() -> &'static FieldRegistry<PhysicsObject> {
        static REGISTRY: OnceLock<FieldRegistry<PhysicsObject>> = OnceLock::new();
        REGISTRY.get_or_init(|| {
            Entity::fields()
                .lift(
                    |p: &PhysicsObject| &p.entity,
                    |p: &mut PhysicsObject| &mut p.entity,
                )
                .field(
                    "velocity",
                    |p, buf| {
                        put_vec3(buf, p.velocity);
                        Ok(())
                    },
                    |p, data| {
                        p.velocity = read_vec3("velocity", data)?;
                        Ok(())
                    },
                )
                .field(
                    "angVelocity",
                    |p, buf| {
                        put_quat(buf, p.angular_velocity);
                        Ok(())
                    },
                    |p, data| {
                        p.angular_velocity = read_quat("angVelocity", data)?;
                        Ok(())
                    },
                )
                .field(
                    "mass",
                    |p, buf| {
                        codec::put_f32(buf, p.mass);
                        Ok(())
                    },
                    |p, data| {
                        let [mass] = read_f32s::<1>("mass", data)?;
                        p.mass = mass;
                        Ok(())
                    },
                )
                .field(
                    "collisionShape",
                    |p, buf| {
                        let shape = p.collision_shape;
                        codec::put_u8(buf, shape.kind as u8);
                        for v in shape.params {
                            codec::put_f32(buf, v);
                        }
                        Ok(())
                    },
                    |p, data| {
                        expect_len("collisionShape", data, CollisionShape::ENCODED_LEN)?;
                        let mut src = data;
                        let kind = ShapeKind::from_u8(codec::get_u8(&mut src)?)
                            .ok_or_else(|| FieldError::InvalidValue("collisionShape".into()))?;
                        let mut params = [0.0; 4];
                        for v in &mut params {
                            *v = codec::get_f32(&mut src)?;
                        }
                        p.collision_shape = CollisionShape { kind, params };
                        Ok(())
                    },
                )
        })
    }
}

fn put_vec3(buf: &mut BytesMut, v: Vec3) {
    for c in [v.x, v.y, v.z] {
        codec::put_f32(buf, c);
    }
}

fn put_quat(buf: &mut BytesMut, q: Quat) {
    for c in [q.x, q.y, q.z, q.w] {
        codec::put_f32(buf, c);
    }
}

fn read_u32(field: &str, data: &[u8]) -> Result<u32, FieldError> {
    expect_len(field, data, 4)?;
    Ok(codec::get_u32(&mut &data[..])?)
}

fn read_f32s<const N: usize>(field: &str, data: &[u8]) -> Result<[f32; N], FieldError> {
    expect_len(field, data, N * 4)?;
    let mut src = data;
    let mut out = [0.0; N];
    for v in &mut out {
        *v = codec::get_f32(&mut src)?;
    }
    Ok(out)
}

fn read_vec3(field: &str, data: &[u8]) -> Result<Vec3, FieldError> {
    let [x, y, z] = read_f32s::<3>(field, data)?;
    Ok(Vec3::new(x, y, z))
}

fn read_quat(field: &str, data: &[u8]) -> Result<Quat, FieldError> {
    let [x, y, z, w] = read_f32s::<4>(field, data)?;
    Ok(Quat::new(x, y, z, w))
}

/// Length-prefixed asset name; empty means [`DEFAULT_ASSET`].
fn read_asset(field: &str, data: &[u8]) -> Result<String, FieldError> {
    let declared = match data {
        [lo, hi, ..] => u16::from_le_bytes([*lo, *hi]) as usize,
        _ => 0,
    };
    expect_len(field, data, codec::string_len("") + declared)?;
    let name = codec::get_string(&mut &data[..])?;
    if name.is_empty() {
        return Ok(DEFAULT_ASSET.to_string());
    }
    Ok(name)
}

/// Any node the object manager can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneObject {
    Node(WorldNode),
    Entity(Entity),
    Physics(PhysicsObject),
}

impl SceneObject {
    /// Default-initialized object of `object_type`; `None` for `Undef`.
    pub fn new(object_type: ObjectType) -> Option<Self> {
        match object_type {
            ObjectType::Undef => None,
            ObjectType::WorldNode => Some(SceneObject::Node(WorldNode::default())),
            ObjectType::Entity => Some(SceneObject::Entity(Entity::default())),
            ObjectType::PhysicsObject => Some(SceneObject::Physics(PhysicsObject::default())),
        }
    }

    pub fn object_type(&self) -> ObjectType {
        match self {
            SceneObject::Node(_) => ObjectType::WorldNode,
            SceneObject::Entity(_) => ObjectType::Entity,
            SceneObject::Physics(_) => ObjectType::PhysicsObject,
        }
    }

    pub fn node(&self) -> &WorldNode {
        match self {
            SceneObject::Node(n) => n,
            SceneObject::Entity(e) => &e.node,
            SceneObject::Physics(p) => &p.entity.node,
        }
    }

    pub fn node_mut(&mut self) -> &mut WorldNode {
        match self {
            SceneObject::Node(n) => n,
            SceneObject::Entity(e) => &mut e.node,
            SceneObject::Physics(p) => &mut p.entity.node,
        }
    }

    pub fn entity(&self) -> Option<&Entity> {
        match self {
            SceneObject::Node(_) => None,
            SceneObject::Entity(e) => Some(e),
            SceneObject::Physics(p) => Some(&p.entity),
        }
    }

    /// Serializes `names`, or every default field when empty.
    pub fn serialize(&self, names: &[&str]) -> Bytes {
        match self {
            SceneObject::Node(n) => WorldNode::fields().serialize(n, names),
            SceneObject::Entity(e) => Entity::fields().serialize(e, names),
            SceneObject::Physics(p) => PhysicsObject::fields().serialize(p, names),
        }
    }

    pub fn unserialize(&mut self, data: &[u8]) -> Result<usize, FieldError> {
        match self {
            SceneObject::Node(n) => WorldNode::fields().unserialize(n, data),
            SceneObject::Entity(e) => Entity::fields().unserialize(e, data),
            SceneObject::Physics(p) => PhysicsObject::fields().unserialize(p, data),
        }
    }

    pub fn default_field_names(&self) -> Vec<&'static str> {
        match self {
            SceneObject::Node(_) => WorldNode::fields().default_names(),
            SceneObject::Entity(_) => Entity::fields().default_names(),
            SceneObject::Physics(_) => PhysicsObject::fields().default_names(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f32 = 1e-6;

    #[test]
    fn transform_fields_round_trip() {
        let mut src = SceneObject::new(ObjectType::WorldNode).unwrap();
        {
            let n = src.node_mut();
            n.position = Vec3::new(1.5, -2.0, 0.25);
            n.rotation = Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), 0.8);
            n.scale = Vec3::new(2.0, 2.0, 0.5);
        }
        let blob = src.serialize(&["position", "rotation", "scale"]);

        let mut dst = SceneObject::new(ObjectType::WorldNode).unwrap();
        assert_eq!(dst.unserialize(&blob).unwrap(), 3);
        assert!(dst.node().position.approx_eq(src.node().position, EPS));
        assert!(dst.node().rotation.approx_eq(src.node().rotation, EPS));
        assert!(dst.node().scale.approx_eq(src.node().scale, EPS));
        assert_eq!(dst.node().id, 0, "id was not in the field list");
    }

    #[test]
    fn default_sets_compose_base_first() {
        let node = SceneObject::new(ObjectType::WorldNode).unwrap();
        assert_eq!(
            node.default_field_names(),
            vec!["id", "position", "rotation", "scale"]
        );
        let phys = SceneObject::new(ObjectType::PhysicsObject).unwrap();
        assert_eq!(
            phys.default_field_names(),
            vec![
                "id",
                "position",
                "rotation",
                "scale",
                "material",
                "texture",
                "mesh",
                "velocity",
                "angVelocity",
                "mass",
                "collisionShape"
            ]
        );
    }

    #[test]
    fn entity_defaults_round_trip() {
        let mut src = Entity {
            mesh: "cube".into(),
            texture: "crate".into(),
            material: Color::new(0.2, 0.4, 0.6, 1.0),
            ..Entity::default()
        };
        src.node.id = 42;
        let blob = Entity::fields().serialize(&src, &[]);

        let mut dst = Entity::default();
        assert_eq!(Entity::fields().unserialize(&mut dst, &blob).unwrap(), 7);
        assert_eq!(dst, src);
    }

    #[test]
    fn empty_asset_name_means_default() {
        let mut e = Entity {
            mesh: "cube".into(),
            ..Entity::default()
        };
        // count=1, len=7, "mesh:", u16 0
        let blob = [1u8, 7, b'm', b'e', b's', b'h', b':', 0, 0];
        Entity::fields().unserialize(&mut e, &blob).unwrap();
        assert_eq!(e.mesh, DEFAULT_ASSET);
    }

    #[test]
    fn wrong_value_size_is_rejected() {
        let mut n = WorldNode::default();
        // "scale:" with 8 bytes instead of 12
        let mut blob = vec![1u8, 14];
        blob.extend_from_slice(b"scale:");
        blob.extend_from_slice(&[0; 8]);
        assert!(matches!(
            WorldNode::fields().unserialize(&mut n, &blob),
            Err(FieldError::LengthMismatch { expected: 12, actual: 8, .. })
        ));
    }

    #[test]
    fn collision_shape_is_seventeen_bytes() {
        let mut p = PhysicsObject::default();
        p.collision_shape = CollisionShape {
            kind: ShapeKind::Box,
            params: [1.0, 2.0, 3.0, 0.0],
        };
        p.mass = 12.5;
        let blob = PhysicsObject::fields().serialize(&p, &["collisionShape", "mass"]);
        // count, then len byte = "collisionShape:".len() + 17
        assert_eq!(blob[1] as usize, 15 + CollisionShape::ENCODED_LEN);

        let mut back = PhysicsObject::default();
        PhysicsObject::fields().unserialize(&mut back, &blob).unwrap();
        assert_eq!(back.collision_shape, p.collision_shape);
        assert_eq!(back.mass, 12.5);
    }

    #[test]
    fn undef_type_has_no_object() {
        assert!(SceneObject::new(ObjectType::Undef).is_none());
        assert_eq!(ObjectType::from_u8(2), Some(ObjectType::Entity));
        assert!(ObjectType::from_u8(4).is_none());
    }
}
