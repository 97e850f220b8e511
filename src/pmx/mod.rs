//! In-memory PMX model assembled by the conversion pipeline.
//!
//! Indices between entities (vertex → bone, vertex → material, morph →
//! material, bone → bone) are plain `usize` positions into the owning
//! collection. Any stage that reorders a collection rewrites every such
//! back-reference before it returns.

mod bones;
pub mod writer;

use std::{collections::HashMap, ops::Range, path::PathBuf};

use bitflags::bitflags;
use nalgebra::{Vector2, Vector3, Vector4};

use crate::error::{ConvertError, ConvertResult};

pub use bones::{Bone, BoneFlags, BoneTail, Bones, Effect, Ik, IkLink, LocalAxes, Placement};

/// Allowed distance of a four-bone weight sum from 1, summed in `f64`.
const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

// ─── Vertex ───────────────────────────────────────────────────────────────────

/// Discriminant of a [`Deform`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeformKind {
    Single,
    Double,
    Quad,
}

/// Per-vertex skinning descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum Deform {
    Single { bone: usize },
    Double { bones: [usize; 2], weight0: f32 },
    Quad { bones: [usize; 4], weights: [f32; 4] },
}

impl Deform {
    pub fn kind(&self) -> DeformKind {
        match self {
            Deform::Single { .. } => DeformKind::Single,
            Deform::Double { .. } => DeformKind::Double,
            Deform::Quad { .. } => DeformKind::Quad,
        }
    }

    pub fn indices(&self) -> &[usize] {
        match self {
            Deform::Single { bone } => std::slice::from_ref(bone),
            Deform::Double { bones, .. } => bones,
            Deform::Quad { bones, .. } => bones,
        }
    }

    pub fn weights(&self) -> Vec<f32> {
        match self {
            Deform::Single { .. } => vec![1.0],
            Deform::Double { weight0, .. } => vec![*weight0, 1.0 - *weight0],
            Deform::Quad { weights, .. } => weights.to_vec(),
        }
    }

    /// `(bone, weight)` pairs with non-zero weight.
    pub fn bone_weights(&self) -> Vec<(usize, f32)> {
        self.indices()
            .iter()
            .copied()
            .zip(self.weights())
            .filter(|(_, weight)| *weight > 0.0)
            .collect()
    }

    pub fn remap_bones(&mut self, mut map: impl FnMut(usize) -> usize) {
        match self {
            Deform::Single { bone } => *bone = map(*bone),
            Deform::Double { bones, .. } => bones.iter_mut().for_each(|bone| *bone = map(*bone)),
            Deform::Quad { bones, .. } => bones.iter_mut().for_each(|bone| *bone = map(*bone)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Vertex {
    pub position: Vector3<f32>,
    pub normal: Vector3<f32>,
    pub uv: Vector2<f32>,
    pub extended_uvs: Vec<Vector4<f32>>,
    pub deform: Deform,
    pub edge_factor: f32,
    /// Materials whose faces reference this vertex, each listed once.
    pub material_indices: Vec<usize>,
}

impl Vertex {
    pub fn new(position: Vector3<f32>, normal: Vector3<f32>, uv: Vector2<f32>, deform: Deform) -> Self {
        Self {
            position,
            normal,
            uv,
            extended_uvs: Vec::new(),
            deform,
            edge_factor: 1.0,
            material_indices: Vec::new(),
        }
    }

    pub fn add_material(&mut self, material: usize) {
        if !self.material_indices.contains(&material) {
            self.material_indices.push(material);
        }
    }
}

// ─── Texture / material ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    Color,
    Sphere,
    Toon,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Texture {
    /// Relative path-like name, e.g. `tex/body.png`.
    pub name: String,
    pub valid: bool,
    pub kind: TextureKind,
}

bitflags! {
    /// PMX material draw flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DrawFlags: u8 {
        const DOUBLE_SIDED = 0x01;
        const GROUND_SHADOW = 0x02;
        const SELF_SHADOW_MAP_DRAW = 0x04;
        const SELF_SHADOW_DRAW = 0x08;
        const EDGE = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SphereMode {
    None,
    Multiply,
    Add,
    SubTexture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toon {
    Texture(Option<usize>),
    /// Shared toon `toon01.bmp` .. `toon10.bmp`, stored zero-based.
    Shared(u8),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub english_name: String,
    pub diffuse: Vector4<f32>,
    pub specular: Vector3<f32>,
    pub specular_power: f32,
    pub ambient: Vector3<f32>,
    pub edge_color: Vector4<f32>,
    pub edge_size: f32,
    pub texture_factor: Vector4<f32>,
    pub sphere_factor: Vector4<f32>,
    pub toon_factor: Vector4<f32>,
    pub draw_flags: DrawFlags,
    /// Always `3 * owned face count`.
    pub vertices_count: usize,
    pub texture_index: Option<usize>,
    pub sphere_texture_index: Option<usize>,
    pub sphere_mode: SphereMode,
    pub toon: Toon,
    pub memo: String,
}

impl Material {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            english_name: String::new(),
            diffuse: Vector4::new(1.0, 1.0, 1.0, 1.0),
            specular: Vector3::zeros(),
            specular_power: 1.0,
            ambient: Vector3::new(0.5, 0.5, 0.5),
            edge_color: Vector4::new(0.0, 0.0, 0.0, 1.0),
            edge_size: 1.0,
            texture_factor: Vector4::new(1.0, 1.0, 1.0, 1.0),
            sphere_factor: Vector4::new(1.0, 1.0, 1.0, 1.0),
            toon_factor: Vector4::new(1.0, 1.0, 1.0, 1.0),
            draw_flags: DrawFlags::GROUND_SHADOW
                | DrawFlags::SELF_SHADOW_MAP_DRAW
                | DrawFlags::SELF_SHADOW_DRAW,
            vertices_count: 0,
            texture_index: None,
            sphere_texture_index: None,
            sphere_mode: SphereMode::None,
            toon: Toon::Texture(None),
            memo: String::new(),
        }
    }
}

// ─── Morph ────────────────────────────────────────────────────────────────────

/// MMD UI category of a morph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphPanel {
    System = 0,
    EyebrowLowerLeft = 1,
    EyeUpperLeft = 2,
    LipUpperRight = 3,
    OtherLowerRight = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphKind {
    Group,
    Vertex,
    Bone,
    Material,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexOffset {
    pub vertex: usize,
    pub offset: Vector3<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupOffset {
    pub morph: usize,
    pub factor: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoneOffset {
    pub bone: usize,
    pub translation: Vector3<f32>,
    pub rotation: Vector4<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialOp {
    Multiply,
    Add,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MaterialOffset {
    /// `None` targets every material.
    pub material: Option<usize>,
    pub op: MaterialOp,
    pub diffuse: Vector4<f32>,
    pub specular: Vector3<f32>,
    pub specular_power: f32,
    pub ambient: Vector3<f32>,
    pub edge_color: Vector4<f32>,
    pub edge_size: f32,
    pub texture_factor: Vector4<f32>,
    pub sphere_factor: Vector4<f32>,
    pub toon_factor: Vector4<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MorphOffsets {
    Group(Vec<GroupOffset>),
    Vertex(Vec<VertexOffset>),
    Bone(Vec<BoneOffset>),
    Material(Vec<MaterialOffset>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Morph {
    pub name: String,
    pub english_name: String,
    pub panel: MorphPanel,
    pub offsets: MorphOffsets,
}

impl Morph {
    pub fn kind(&self) -> MorphKind {
        match self.offsets {
            MorphOffsets::Group(_) => MorphKind::Group,
            MorphOffsets::Vertex(_) => MorphKind::Vertex,
            MorphOffsets::Bone(_) => MorphKind::Bone,
            MorphOffsets::Material(_) => MorphKind::Material,
        }
    }

    pub fn offset_count(&self) -> usize {
        match &self.offsets {
            MorphOffsets::Group(offsets) => offsets.len(),
            MorphOffsets::Vertex(offsets) => offsets.len(),
            MorphOffsets::Bone(offsets) => offsets.len(),
            MorphOffsets::Material(offsets) => offsets.len(),
        }
    }
}

// ─── Display slot ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayRef {
    Bone(usize),
    Morph(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplaySlot {
    pub name: String,
    pub english_name: String,
    pub special: bool,
    pub references: Vec<DisplayRef>,
}

// ─── Model ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PmxModel {
    pub name: String,
    pub english_name: String,
    pub comment: String,
    pub english_comment: String,
    /// Output PMX path; texture names are relative to its directory.
    pub path: Option<PathBuf>,
    pub vertices: Vec<Vertex>,
    pub faces: Vec<[usize; 3]>,
    pub textures: Vec<Texture>,
    pub materials: Vec<Material>,
    pub bones: Bones,
    pub morphs: Vec<Morph>,
    pub display_slots: Vec<DisplaySlot>,
}

impl PmxModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Register a texture by relative name, reusing an existing entry.
    pub fn insert_texture(&mut self, name: &str, kind: TextureKind) -> usize {
        if let Some(index) = self.textures.iter().position(|texture| texture.name == name) {
            return index;
        }
        self.textures.push(Texture {
            name: name.to_string(),
            valid: true,
            kind,
        });
        self.textures.len() - 1
    }

    /// Face index range owned by each material, following `vertices_count`.
    pub fn face_ranges(&self) -> Vec<Range<usize>> {
        let mut start = 0usize;
        self.materials
            .iter()
            .map(|material| {
                let end = start + material.vertices_count / 3;
                let range = start..end;
                start = end;
                range
            })
            .collect()
    }

    pub fn morph_index(&self, name: &str) -> Option<usize> {
        self.morphs.iter().position(|morph| morph.name == name)
    }

    /// Apply a bone permutation (`order[new] = old`) to the bone collection
    /// and every bone reference held outside it.
    pub fn renumber_bones(&mut self, order: &[usize]) -> ConvertResult<()> {
        let old_to_new = self.bones.reorder(order)?;
        let remap = |bone: usize| old_to_new.get(bone).copied().unwrap_or(bone);

        for vertex in &mut self.vertices {
            vertex.deform.remap_bones(remap);
        }
        for morph in &mut self.morphs {
            if let MorphOffsets::Bone(offsets) = &mut morph.offsets {
                for offset in offsets {
                    offset.bone = remap(offset.bone);
                }
            }
        }
        for slot in &mut self.display_slots {
            for reference in &mut slot.references {
                if let DisplayRef::Bone(bone) = reference {
                    *bone = remap(*bone);
                }
            }
        }
        Ok(())
    }

    /// Apply a material permutation (`order[new] = old`), moving each
    /// material's face range along with it and rewriting vertex and
    /// material-morph references.
    pub fn renumber_materials(&mut self, order: &[usize]) -> ConvertResult<()> {
        let len = self.materials.len();
        let mut old_to_new = vec![usize::MAX; len];
        if order.len() != len {
            return Err(ConvertError::invalid(format!(
                "material order has {} entries for {} materials",
                order.len(),
                len
            )));
        }
        for (new_index, &old_index) in order.iter().enumerate() {
            if old_index >= len || old_to_new[old_index] != usize::MAX {
                return Err(ConvertError::invalid("material order is not a permutation"));
            }
            old_to_new[old_index] = new_index;
        }

        let ranges = self.face_ranges();
        let mut faces = Vec::with_capacity(self.faces.len());
        for &old_index in order {
            faces.extend_from_slice(&self.faces[ranges[old_index].clone()]);
        }
        self.faces = faces;
        self.materials = order.iter().map(|&old| self.materials[old].clone()).collect();

        for vertex in &mut self.vertices {
            for material in &mut vertex.material_indices {
                *material = old_to_new.get(*material).copied().unwrap_or(*material);
            }
            vertex.material_indices.sort_unstable();
        }
        for morph in &mut self.morphs {
            if let MorphOffsets::Material(offsets) = &mut morph.offsets {
                for offset in offsets {
                    if let Some(material) = &mut offset.material {
                        *material = old_to_new.get(*material).copied().unwrap_or(*material);
                    }
                }
            }
        }
        Ok(())
    }

    /// Check the structural invariants a writer relies on.
    pub fn validate(&self) -> ConvertResult<()> {
        let face_vertex_total: usize = self.materials.iter().map(|m| m.vertices_count).sum();
        if face_vertex_total != self.faces.len() * 3 {
            return Err(ConvertError::invalid(format!(
                "material vertex counts sum to {} but there are {} faces",
                face_vertex_total,
                self.faces.len()
            )));
        }
        if let Some(material) = self.materials.iter().find(|m| m.vertices_count % 3 != 0) {
            return Err(ConvertError::invalid(format!(
                "material '{}' vertex count {} is not a multiple of 3",
                material.name, material.vertices_count
            )));
        }

        let vertex_count = self.vertices.len();
        for (face_index, face) in self.faces.iter().enumerate() {
            if face.iter().any(|&v| v >= vertex_count) {
                return Err(ConvertError::invalid(format!(
                    "face {face_index} references a vertex out of range"
                )));
            }
            if face[0] == face[1] || face[1] == face[2] || face[0] == face[2] {
                return Err(ConvertError::invalid(format!(
                    "face {face_index} repeats a vertex"
                )));
            }
        }

        self.bones.validate()?;

        let bone_count = self.bones.len();
        let material_count = self.materials.len();
        for (vertex_index, vertex) in self.vertices.iter().enumerate() {
            if vertex.deform.indices().iter().any(|&bone| bone >= bone_count) {
                return Err(ConvertError::invalid(format!(
                    "vertex {vertex_index} deform references a missing bone"
                )));
            }
            let weights = vertex.deform.weights();
            if weights.iter().any(|w| *w < 0.0) {
                return Err(ConvertError::invalid(format!(
                    "vertex {vertex_index} has a negative deform weight"
                )));
            }
            if vertex.deform.kind() == DeformKind::Quad {
                let sum: f64 = weights.iter().map(|w| f64::from(*w)).sum();
                if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
                    return Err(ConvertError::invalid(format!(
                        "vertex {vertex_index} deform weights sum to {sum}"
                    )));
                }
            }
            if vertex.material_indices.iter().any(|&m| m >= material_count) {
                return Err(ConvertError::invalid(format!(
                    "vertex {vertex_index} references a missing material"
                )));
            }
        }

        for morph in &self.morphs {
            if let MorphOffsets::Material(offsets) = &morph.offsets
                && offsets
                    .iter()
                    .any(|offset| offset.material.is_some_and(|m| m >= material_count))
            {
                return Err(ConvertError::invalid(format!(
                    "material morph '{}' references a missing material",
                    morph.name
                )));
            }
        }

        let mut seen = HashMap::<&str, usize>::new();
        for (index, morph) in self.morphs.iter().enumerate() {
            if let Some(previous) = seen.insert(morph.name.as_str(), index) {
                log::warn!(
                    "duplicate morph name '{}' at {} and {}",
                    morph.name,
                    previous,
                    index
                );
            }
        }

        Ok(())
    }
}
