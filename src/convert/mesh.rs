use std::{
    collections::{BTreeMap, HashMap, HashSet},
    rc::Rc,
};

use nalgebra::{Matrix3, Matrix4, Point3, Vector2, Vector3};

use super::{
    document::{
        Document, MODE_POINTS, MODE_TRIANGLE_FAN, MODE_TRIANGLE_STRIP, MODE_TRIANGLES, Primitive,
    },
    gltf_utils::{AccessorData, AccessorReader},
    material::material_from_source,
    scene::{Conversion, SceneGraph},
};
use crate::{
    error::{ConvertError, ConvertResult},
    pmx::{Deform, Morph, MorphOffsets, MorphPanel, PmxModel, Vertex, VertexOffset},
};

/// Morph offsets shorter than this are dropped.
const MIN_MORPH_OFFSET: f32 = 1e-6;

/// Result of the mesh stage consumed by later stages.
#[derive(Debug, Clone, Default)]
pub(crate) struct MeshBuild {
    /// glTF material index behind each PMX material.
    pub(crate) material_sources: Vec<Option<usize>>,
    pub(crate) skipped_primitives: usize,
}

/// Identity of a primitive used to skip duplicated morph-target primitives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PrimitiveKey {
    attributes: BTreeMap<String, usize>,
    indices: Option<usize>,
    material: Option<usize>,
    mode: u32,
}

impl PrimitiveKey {
    fn of(primitive: &Primitive) -> Self {
        Self {
            attributes: primitive.attributes.clone(),
            indices: primitive.indices,
            material: primitive.material,
            mode: primitive.mode,
        }
    }
}

// ─── Triangulation ────────────────────────────────────────────────────────────

/// Split an index stream into triangles. Points and lines yield nothing.
pub(super) fn triangulate(mode: u32, indices: &[u32]) -> Vec<[u32; 3]> {
    match mode {
        MODE_TRIANGLES => indices
            .chunks_exact(3)
            .map(|tri| [tri[0], tri[1], tri[2]])
            .collect(),
        MODE_TRIANGLE_STRIP => indices
            .windows(3)
            .enumerate()
            .map(|(i, w)| {
                if i % 2 == 0 {
                    [w[0], w[1], w[2]]
                } else {
                    [w[1], w[0], w[2]]
                }
            })
            .collect(),
        MODE_TRIANGLE_FAN => match indices.split_first() {
            Some((&first, rest)) => rest
                .windows(2)
                .map(|pair| [first, pair[0], pair[1]])
                .collect(),
            None => Vec::new(),
        },
        _ => Vec::new(),
    }
}

// ─── Skinning ─────────────────────────────────────────────────────────────────

/// Pick the PMX deform variant for accumulated `(bone, weight)` pairs.
pub(super) fn derive_deform(mut entries: Vec<(usize, f32)>, default_bone: usize) -> Deform {
    entries.retain(|(_, weight)| *weight > 0.0);
    entries.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

    match entries.as_slice() {
        [] => Deform::Single { bone: default_bone },
        [(bone, _)] => Deform::Single { bone: *bone },
        [(b0, w0), (b1, w1)] => Deform::Double {
            bones: [*b0, *b1],
            weight0: w0 / (w0 + w1),
        },
        _ => {
            entries.truncate(4);
            let total: f64 = entries.iter().map(|(_, weight)| f64::from(*weight)).sum();
            let mut bones = [default_bone; 4];
            let mut weights = [0.0f32; 4];
            for (slot, (bone, weight)) in entries.iter().enumerate() {
                bones[slot] = *bone;
                weights[slot] = (f64::from(*weight) / total) as f32;
            }
            Deform::Quad { bones, weights }
        }
    }
}

/// Sum the weights of one vertex per bone. Joint values index the skin's
/// joint list when a skin is bound, else they are node indices.
fn accumulate_weights(
    joints: &[f64],
    weights: &[f64],
    skin_joints: Option<&[usize]>,
    bone_count: usize,
) -> Vec<(usize, f32)> {
    let mut entries: Vec<(usize, f32)> = Vec::with_capacity(4);
    for (joint, weight) in joints.iter().zip(weights) {
        let joint = *joint as usize;
        let node = match skin_joints {
            Some(skin_joints) => match skin_joints.get(joint) {
                Some(node) => *node,
                None => continue,
            },
            None => joint,
        };
        if node >= bone_count {
            continue;
        }
        match entries.iter_mut().find(|(bone, _)| *bone == node) {
            Some(entry) => entry.1 += *weight as f32,
            None => entries.push((node, *weight as f32)),
        }
    }
    entries
}

// ─── Mesh build ───────────────────────────────────────────────────────────────

struct MeshBuilder<'a, 'r> {
    document: &'a Document,
    reader: &'r mut AccessorReader<'a>,
    scene: &'r SceneGraph,
    conversion: &'r Conversion,
    image_textures: &'r [Option<usize>],
    seen_morph_primitives: HashSet<PrimitiveKey>,
    vertex_ranges: HashMap<(usize, BTreeMap<String, usize>), (usize, usize)>,
    build: MeshBuild,
}

/// Linear part of a node transform for positions and for normals.
struct NodeTransform {
    matrix: Matrix4<f32>,
    normal: Matrix3<f32>,
}

impl NodeTransform {
    fn identity() -> Self {
        Self {
            matrix: Matrix4::identity(),
            normal: Matrix3::identity(),
        }
    }

    fn from_world(world: Matrix4<f32>) -> Self {
        let linear = world.fixed_view::<3, 3>(0, 0).into_owned();
        let normal = linear
            .try_inverse()
            .map(|inverse| inverse.transpose())
            .unwrap_or(linear);
        Self {
            matrix: world,
            normal,
        }
    }

    fn point(&self, value: &Vector3<f32>) -> Vector3<f32> {
        self.matrix.transform_point(&Point3::from(*value)).coords
    }

    fn vector(&self, value: &Vector3<f32>) -> Vector3<f32> {
        self.matrix.transform_vector(value)
    }
}

impl<'a, 'r> MeshBuilder<'a, 'r> {
    fn optional(&mut self, primitive: &Primitive, attribute: &str) -> ConvertResult<Option<Rc<AccessorData>>> {
        primitive
            .attributes
            .get(attribute)
            .map(|index| self.reader.read(*index))
            .transpose()
    }

    fn normals(&mut self, primitive: &Primitive, count: usize, mesh_name: &str) -> Vec<Vector3<f32>> {
        let Some(&index) = primitive.attributes.get("NORMAL") else {
            return vec![Vector3::y(); count];
        };
        match self.reader.read(index) {
            Ok(data) if data.len() >= count => data.vec3(),
            Ok(data) => {
                log::warn!(
                    "mesh '{mesh_name}': NORMAL has {} rows for {count} vertices; using +Y",
                    data.len()
                );
                vec![Vector3::y(); count]
            }
            Err(err) => {
                log::warn!("mesh '{mesh_name}': NORMAL unreadable ({err}); using +Y");
                vec![Vector3::y(); count]
            }
        }
    }

    /// Append (or reuse) the vertices of one primitive. Returns the first
    /// vertex index.
    fn vertices(
        &mut self,
        model: &mut PmxModel,
        node_index: usize,
        primitive: &Primitive,
        positions: &[Vector3<f32>],
        transform: &NodeTransform,
        mesh_name: &str,
    ) -> ConvertResult<usize> {
        let reuse_key = (node_index, primitive.attributes.clone());
        if let Some(&(start, len)) = self.vertex_ranges.get(&reuse_key)
            && len == positions.len()
        {
            return Ok(start);
        }

        let count = positions.len();
        let normals = self.normals(primitive, count, mesh_name);
        let uvs = self
            .optional(primitive, "TEXCOORD_0")?
            .map(|data| data.vec2())
            .unwrap_or_default();
        let joints = self.optional(primitive, "JOINTS_0")?;
        let weights = self.optional(primitive, "WEIGHTS_0")?;

        let node = &self.document.nodes[node_index];
        let skin_joints = node
            .skin
            .and_then(|skin| self.document.skins.get(skin))
            .map(|skin| skin.joints.as_slice());
        let bone_count = model.bones.len();
        let default_bone = if node_index < bone_count { node_index } else { 0 };

        let start = model.vertices.len();
        for (i, position) in positions.iter().enumerate() {
            let position = self.conversion.position(&transform.point(position));
            let normal = self
                .conversion
                .direction(&(transform.normal * normals[i]))
                .unwrap_or_else(Vector3::y);
            let uv = uvs.get(i).copied().unwrap_or_else(Vector2::zeros);

            let entries = match (&joints, &weights) {
                (Some(joints), Some(weights)) if i < joints.len() && i < weights.len() => {
                    accumulate_weights(joints.row(i), weights.row(i), skin_joints, bone_count)
                }
                _ => Vec::new(),
            };
            let deform = derive_deform(entries, default_bone);
            model.vertices.push(Vertex::new(position, normal, uv, deform));
        }

        self.vertex_ranges.insert(reuse_key, (start, count));
        Ok(start)
    }

    #[allow(clippy::too_many_arguments)]
    fn morph_targets(
        &mut self,
        model: &mut PmxModel,
        primitive: &Primitive,
        mesh_target_names: &[String],
        mesh_name: &str,
        vertex_start: usize,
        count: usize,
        transform: &NodeTransform,
    ) -> ConvertResult<()> {
        let primitive_names = primitive.target_names();
        for (k, target) in primitive.targets.iter().enumerate() {
            let Some(&accessor) = target.get("POSITION") else {
                continue;
            };
            let deltas = self.reader.read(accessor)?.vec3();
            let name = mesh_target_names
                .get(k)
                .or_else(|| primitive_names.get(k))
                .map(|name| name.trim())
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("{mesh_name}_morph_{k:03}"));

            let offsets: Vec<VertexOffset> = deltas
                .iter()
                .take(count)
                .enumerate()
                .filter_map(|(i, delta)| {
                    let offset = self.conversion.position(&transform.vector(delta));
                    (offset.norm() > MIN_MORPH_OFFSET).then_some(VertexOffset {
                        vertex: vertex_start + i,
                        offset,
                    })
                })
                .collect();
            merge_vertex_morph(model, &name, offsets);
        }
        Ok(())
    }

    fn primitive(
        &mut self,
        model: &mut PmxModel,
        node_index: usize,
        mesh_index: usize,
        primitive_index: usize,
        transform: &NodeTransform,
    ) -> ConvertResult<()> {
        let document = self.document;
        let mesh = &document.meshes[mesh_index];
        let primitive = &mesh.primitives[primitive_index];
        let mesh_name = mesh
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("mesh_{mesh_index:03}"));

        if primitive.mode < MODE_TRIANGLES || primitive.mode > MODE_TRIANGLE_FAN {
            let topology = if primitive.mode == MODE_POINTS { "points" } else { "lines" };
            log::warn!(
                "mesh '{mesh_name}' primitive {primitive_index}: {topology} (mode {}) skipped",
                primitive.mode
            );
            self.build.skipped_primitives += 1;
            return Ok(());
        }

        if !primitive.targets.is_empty()
            && !self.seen_morph_primitives.insert(PrimitiveKey::of(primitive))
        {
            log::debug!("mesh '{mesh_name}' primitive {primitive_index}: duplicate skipped");
            self.build.skipped_primitives += 1;
            return Ok(());
        }

        let Some(&position_accessor) = primitive.attributes.get("POSITION") else {
            return Err(ConvertError::parse(format!(
                "mesh '{mesh_name}' primitive {primitive_index} has no POSITION"
            )));
        };
        let positions = self.reader.read(position_accessor)?.vec3();
        let count = positions.len();

        let indices = match primitive.indices {
            Some(accessor) => self.reader.read(accessor)?.indices(),
            None => (0..count as u32).collect(),
        };
        if let Some(bad) = indices.iter().find(|index| **index as usize >= count) {
            return Err(ConvertError::parse(format!(
                "mesh '{mesh_name}' primitive {primitive_index} index {bad} exceeds {count} vertices"
            )));
        }

        let triangles: Vec<[u32; 3]> = triangulate(primitive.mode, &indices)
            .into_iter()
            .filter(|[a, b, c]| a != b && b != c && a != c)
            .collect();
        if triangles.is_empty() {
            log::warn!("mesh '{mesh_name}' primitive {primitive_index} has no triangles");
            self.build.skipped_primitives += 1;
            return Ok(());
        }

        let vertex_start =
            self.vertices(model, node_index, primitive, &positions, transform, &mesh_name)?;
        self.morph_targets(
            model,
            primitive,
            &mesh.target_names(),
            &mesh_name,
            vertex_start,
            count,
            transform,
        )?;

        let fallback_name = format!("{mesh_name}_{primitive_index:03}");
        let mut material = material_from_source(
            document,
            primitive.material,
            &fallback_name,
            self.image_textures,
        );
        let material_index = model.materials.len();
        for [a, b, c] in triangles.iter().copied() {
            let face = [
                vertex_start + a as usize,
                vertex_start + b as usize,
                vertex_start + c as usize,
            ];
            let face = if self.conversion.reverse_winding {
                [face[2], face[1], face[0]]
            } else {
                face
            };
            for vertex in face {
                model.vertices[vertex].add_material(material_index);
            }
            model.faces.push(face);
        }
        material.vertices_count = triangles.len() * 3;
        model.materials.push(material);
        self.build.material_sources.push(primitive.material);
        Ok(())
    }
}

/// Merge vertex offsets into the morph called `name`, creating it on first use.
/// A vertex already present in the morph keeps its first offset.
fn merge_vertex_morph(model: &mut PmxModel, name: &str, offsets: Vec<VertexOffset>) {
    match model.morph_index(name).map(|index| &mut model.morphs[index].offsets) {
        Some(MorphOffsets::Vertex(existing)) => {
            let present: HashSet<usize> = existing.iter().map(|offset| offset.vertex).collect();
            existing.extend(offsets.into_iter().filter(|offset| !present.contains(&offset.vertex)));
        }
        Some(_) => log::warn!("morph '{name}' already exists with another kind; targets dropped"),
        None => model.morphs.push(Morph {
            name: name.to_string(),
            english_name: name.to_string(),
            panel: MorphPanel::OtherLowerRight,
            offsets: MorphOffsets::Vertex(offsets),
        }),
    }
}

/// Convert every mesh-bearing node's primitives into vertices, faces,
/// materials and vertex morphs. Nodes are visited in index order.
pub(crate) fn build_meshes<'a>(
    document: &'a Document,
    reader: &mut AccessorReader<'a>,
    scene: &SceneGraph,
    conversion: &Conversion,
    image_textures: &[Option<usize>],
    model: &mut PmxModel,
) -> ConvertResult<MeshBuild> {
    let mut builder = MeshBuilder {
        document,
        reader,
        scene,
        conversion,
        image_textures,
        seen_morph_primitives: HashSet::new(),
        vertex_ranges: HashMap::new(),
        build: MeshBuild::default(),
    };

    for (node_index, node) in document.nodes.iter().enumerate() {
        let Some(mesh_index) = node.mesh else {
            continue;
        };
        let Some(mesh) = document.meshes.get(mesh_index) else {
            log::warn!("node {node_index} references missing mesh {mesh_index}");
            continue;
        };
        // Skinned vertices are already in model space; others follow their node.
        let transform = if node.skin.is_some() {
            NodeTransform::identity()
        } else {
            NodeTransform::from_world(builder.scene.world[node_index])
        };
        for primitive_index in 0..mesh.primitives.len() {
            builder.primitive(model, node_index, mesh_index, primitive_index, &transform)?;
        }
    }

    log::info!(
        "mesh build: {} vertices, {} faces, {} materials, {} morphs",
        model.vertices.len(),
        model.faces.len(),
        model.materials.len(),
        model.morphs.len()
    );
    Ok(builder.build)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::convert::{
        glb::parse_glb,
        scene::{build_scene_graph, detect_vrm},
        skeleton::build_skeleton,
        test_support::{GltfFixture, triangle_fixture, vrm1_json},
    };

    fn convert(fixture: &GltfFixture) -> (PmxModel, MeshBuild) {
        let bytes = fixture.build();
        let glb = parse_glb(&bytes).unwrap();
        let document = Document::from_slice(&glb.json).unwrap();
        let meta = detect_vrm(&document).unwrap();
        let scene = build_scene_graph(&document).unwrap();
        let conversion = Conversion::for_model(meta.version, meta.profile);
        let mut model = PmxModel::new("m");
        build_skeleton(&document, &scene, &conversion, &mut model).unwrap();
        let mut reader = AccessorReader::new(&document, glb.bin());
        let build = build_meshes(&document, &mut reader, &scene, &conversion, &[], &mut model).unwrap();
        (model, build)
    }

    #[test]
    fn given_strip_and_fan_when_triangulating_then_winding_alternates_and_fans_share_origin() {
        assert_eq!(triangulate(MODE_TRIANGLE_STRIP, &[0, 1, 2, 3]), vec![[0, 1, 2], [2, 1, 3]]);
        assert_eq!(triangulate(MODE_TRIANGLE_FAN, &[0, 1, 2, 3]), vec![[0, 1, 2], [0, 2, 3]]);
        assert!(triangulate(1, &[0, 1, 2, 3]).is_empty());
    }

    #[test]
    fn given_weight_sets_when_deriving_deform_then_variant_follows_entry_count() {
        assert_eq!(derive_deform(vec![(2, 0.0)], 7), Deform::Single { bone: 7 });
        assert_eq!(derive_deform(vec![(3, 1.0)], 7), Deform::Single { bone: 3 });
        assert_eq!(
            derive_deform(vec![(1, 0.25), (4, 0.75)], 0),
            Deform::Double { bones: [4, 1], weight0: 0.75 }
        );
        let Deform::Quad { bones, weights } =
            derive_deform(vec![(5, 0.2), (3, 0.2), (9, 0.4)], 0)
        else {
            panic!("expected a four-bone deform");
        };
        assert_eq!(bones, [9, 3, 5, 0]);
        assert!((weights.iter().map(|w| f64::from(*w)).sum::<f64>() - 1.0).abs() < 1e-6);
        let Deform::Quad { weights, .. } =
            derive_deform(vec![(1, 0.1), (2, 0.3), (3, 0.7), (4, 0.9), (5, 0.05)], 0)
        else {
            panic!("expected a four-bone deform");
        };
        assert!((weights.iter().map(|w| f64::from(*w)).sum::<f64>() - 1.0).abs() < 1e-6);
        assert_eq!(weights[3], 0.0);
    }

    #[test]
    fn given_triangle_primitive_when_building_then_one_face_one_material_three_vertices() {
        let (model, build) = convert(&triangle_fixture());

        assert_eq!(model.vertices.len(), 3);
        assert_eq!(model.faces, vec![[2, 1, 0]]);
        assert_eq!(model.materials.len(), 1);
        assert_eq!(model.materials[0].name, "Skin");
        assert_eq!(model.materials[0].vertices_count, 3);
        assert_eq!(build.material_sources, vec![Some(0)]);
        assert!(model.vertices.iter().all(|v| v.material_indices == vec![0]));
        assert_eq!(model.vertices[0].deform, Deform::Single { bone: 0 });
        assert!(model.validate().is_ok());
    }

    #[test]
    fn given_points_and_lines_when_building_then_no_faces_or_materials_are_made() {
        let mut fixture = triangle_fixture();
        fixture.json["meshes"][0]["primitives"][0]["mode"] = json!(0);
        let mut lines = fixture.json["meshes"][0]["primitives"][0].clone();
        lines["mode"] = json!(1);
        fixture.json["meshes"][0]["primitives"]
            .as_array_mut()
            .unwrap()
            .push(lines);

        let (model, build) = convert(&fixture);

        assert!(model.faces.is_empty());
        assert!(model.materials.is_empty());
        assert_eq!(build.skipped_primitives, 2);
    }

    #[test]
    fn given_no_normal_attribute_when_building_then_normals_point_up() {
        let mut fixture = triangle_fixture();
        fixture.json["meshes"][0]["primitives"][0]["attributes"]
            .as_object_mut()
            .unwrap()
            .remove("NORMAL");

        let (model, _) = convert(&fixture);

        assert!(model.vertices.iter().all(|v| v.normal == Vector3::y()));
    }

    #[test]
    fn given_duplicated_morph_primitive_when_building_then_it_is_counted_once() {
        let mut fixture = triangle_fixture();
        let delta = fixture.push_f32("VEC3", &[0.0, 0.0, 0.0, 0.0, 0.1, 0.0, 0.0, 0.0, 0.0]);
        let primitive = &mut fixture.json["meshes"][0]["primitives"][0];
        primitive["targets"] = json!([{ "POSITION": delta }]);
        let duplicate = primitive.clone();
        fixture.json["meshes"][0]["primitives"]
            .as_array_mut()
            .unwrap()
            .push(duplicate);
        fixture.json["meshes"][0]["extras"] = json!({ "targetNames": ["Fcl_MTH_A"] });

        let (model, build) = convert(&fixture);

        assert_eq!(model.materials.len(), 1);
        assert_eq!(build.skipped_primitives, 1);
        assert_eq!(model.morphs.len(), 1);
        assert_eq!(model.morphs[0].name, "Fcl_MTH_A");
        let MorphOffsets::Vertex(offsets) = &model.morphs[0].offsets else {
            panic!("expected a vertex morph");
        };
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets[0].vertex, 1);
        assert!((offsets[0].offset.y - 1.25).abs() < 1e-5);
    }

    #[test]
    fn given_skinned_primitive_when_building_then_joints_resolve_through_skin() {
        let mut fixture = GltfFixture::new(vrm1_json(
            json!([
                { "name": "root", "children": [1, 2] },
                { "name": "a", "translation": [0.0, 1.0, 0.0] },
                { "name": "body", "mesh": 0, "skin": 0 }
            ]),
            json!({ "hips": { "node": 0 } }),
        ));
        let position = fixture.push_f32("VEC3", &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
        let joints = fixture.push_u8("VEC4", &[0, 1, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
        let weights = fixture.push_f32(
            "VEC4",
            &[0.5, 0.5, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
        );
        fixture.json["skins"] = json!([{ "joints": [0, 1] }]);
        fixture.json["meshes"] = json!([{ "primitives": [{
            "attributes": { "POSITION": position, "JOINTS_0": joints, "WEIGHTS_0": weights }
        }] }]);

        let (model, _) = convert(&fixture);

        assert_eq!(
            model.vertices[0].deform,
            Deform::Double { bones: [0, 1], weight0: 0.5 }
        );
        assert_eq!(model.vertices[1].deform, Deform::Single { bone: 1 });
        // No weights: falls back to the mesh node's bone.
        assert_eq!(model.vertices[2].deform, Deform::Single { bone: 2 });
        assert_eq!(model.materials[0].name, "mesh_000_000");
    }

    #[test]
    fn given_two_primitives_sharing_attributes_when_building_then_vertices_are_reused() {
        let mut fixture = triangle_fixture();
        let second = fixture.json["meshes"][0]["primitives"][0].clone();
        fixture.json["meshes"][0]["primitives"]
            .as_array_mut()
            .unwrap()
            .push(second);

        let (model, _) = convert(&fixture);

        assert_eq!(model.vertices.len(), 3);
        assert_eq!(model.faces.len(), 2);
        assert_eq!(model.materials.len(), 2);
        assert_eq!(model.vertices[0].material_indices, vec![0, 1]);
    }
}
