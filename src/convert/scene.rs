use std::collections::BTreeMap;

use nalgebra::{Matrix4, Vector3};
use serde_json::Value;

use super::{
    document::Document,
    gltf_utils::node_to_local_matrix,
    types::{Profile, VrmVersion},
};
use crate::error::{ConvertError, ConvertResult};

/// Meters to MMD units.
pub(crate) const MMD_SCALE: f32 = 12.5;

// ─── Node hierarchy ───────────────────────────────────────────────────────────

/// Parent links and world transforms for every node.
#[derive(Debug, Clone)]
pub(crate) struct SceneGraph {
    pub(crate) parents: Vec<Option<usize>>,
    pub(crate) world: Vec<Matrix4<f32>>,
}

impl SceneGraph {
    pub(crate) fn len(&self) -> usize {
        self.parents.len()
    }

    pub(crate) fn world_position(&self, node: usize) -> Vector3<f32> {
        let matrix = &self.world[node];
        Vector3::new(matrix[(0, 3)], matrix[(1, 3)], matrix[(2, 3)])
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Visit {
    White,
    Gray,
    Black,
}

/// Walk every node's children depth-first, rejecting back-edges.
fn check_acyclic(document: &Document) -> ConvertResult<()> {
    let count = document.nodes.len();
    let mut state = vec![Visit::White; count];

    for start in 0..count {
        if state[start] != Visit::White {
            continue;
        }
        state[start] = Visit::Gray;
        let mut stack = vec![(start, 0usize)];

        while let Some((node, next)) = stack.last_mut() {
            let children = &document.nodes[*node].children;
            if *next >= children.len() {
                state[*node] = Visit::Black;
                stack.pop();
                continue;
            }
            let child = children[*next];
            *next += 1;
            if child >= count {
                return Err(ConvertError::parse(format!(
                    "node {} references missing child {child}",
                    *node
                )));
            }
            match state[child] {
                Visit::Gray => {
                    return Err(ConvertError::parse(format!(
                        "node hierarchy has a cycle through node {child}"
                    )));
                }
                Visit::White => {
                    state[child] = Visit::Gray;
                    stack.push((child, 0));
                }
                Visit::Black => {}
            }
        }
    }
    Ok(())
}

/// Collect child→parent links. A node listed by several parents keeps the first.
fn collect_parents(document: &Document) -> Vec<Option<usize>> {
    let mut parents = vec![None; document.nodes.len()];
    for (parent_index, node) in document.nodes.iter().enumerate() {
        for &child in &node.children {
            match parents.get(child).copied() {
                Some(None) => parents[child] = Some(parent_index),
                Some(Some(existing)) => log::warn!(
                    "node {child} is a child of both {existing} and {parent_index}; keeping {existing}"
                ),
                None => {}
            }
        }
    }
    parents
}

fn resolve_world_matrix(
    index: usize,
    locals: &[Matrix4<f32>],
    parents: &[Option<usize>],
    worlds: &mut [Option<Matrix4<f32>>],
) -> Matrix4<f32> {
    if let Some(world) = worlds[index] {
        return world;
    }
    let world = match parents[index] {
        Some(parent) => resolve_world_matrix(parent, locals, parents, worlds) * locals[index],
        None => locals[index],
    };
    worlds[index] = Some(world);
    world
}

/// Compute parent links and world matrices for every node.
pub(crate) fn build_scene_graph(document: &Document) -> ConvertResult<SceneGraph> {
    check_acyclic(document)?;
    let parents = collect_parents(document);
    let locals: Vec<Matrix4<f32>> = document.nodes.iter().map(node_to_local_matrix).collect();

    let mut worlds = vec![None; locals.len()];
    let world = (0..locals.len())
        .map(|index| resolve_world_matrix(index, &locals, &parents, &mut worlds))
        .collect();

    Ok(SceneGraph { parents, world })
}

// ─── VRM metadata ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct VrmMeta {
    pub(crate) version: VrmVersion,
    pub(crate) profile: Profile,
    pub(crate) generator: Option<String>,
    pub(crate) exporter_version: Option<String>,
    pub(crate) title: Option<String>,
    pub(crate) author: Option<String>,
    /// Humanoid bone name → node index.
    pub(crate) humanoid: BTreeMap<String, usize>,
    pub(crate) has_expressions: bool,
    /// Raw `VRM` / `VRMC_*` extension blobs, by key.
    pub(crate) extensions: BTreeMap<String, Value>,
}

impl VrmMeta {
    pub(crate) fn humanoid_node(&self, bone: &str) -> Option<usize> {
        self.humanoid.get(bone).copied()
    }
}

fn humanoid_v1(extensions: &serde_json::Map<String, Value>) -> BTreeMap<String, usize> {
    extensions
        .get("VRMC_vrm")
        .and_then(|vrm| vrm.pointer("/humanoid/humanBones"))
        .and_then(Value::as_object)
        .map(|bones| {
            bones
                .iter()
                .filter_map(|(name, value)| {
                    let node = value.get("node").and_then(Value::as_u64)? as usize;
                    Some((name.clone(), node))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn humanoid_v0(extensions: &serde_json::Map<String, Value>) -> BTreeMap<String, usize> {
    let mut mapping = BTreeMap::new();
    let Some(bones) = extensions
        .get("VRM")
        .and_then(|vrm| vrm.pointer("/humanoid/humanBones"))
        .and_then(Value::as_array)
    else {
        return mapping;
    };
    for value in bones {
        let bone = value.get("bone").and_then(Value::as_str);
        let node = value.get("node").and_then(Value::as_i64);
        if let (Some(bone), Some(node)) = (bone, node)
            && node >= 0
        {
            mapping.entry(bone.to_string()).or_insert(node as usize);
        }
    }
    mapping
}

fn non_empty(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(items)) => !items.is_empty(),
        _ => false,
    }
}

fn meta_string(extensions: &serde_json::Map<String, Value>, pointer: &str) -> Option<String> {
    let (key, rest) = pointer.trim_start_matches('/').split_once('/')?;
    extensions
        .get(key)?
        .pointer(&format!("/{rest}"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

/// Detect VRM version and profile and extract the humanoid map.
pub(crate) fn detect_vrm(document: &Document) -> ConvertResult<VrmMeta> {
    let has_v1 = document.declares_extension("VRMC_vrm");
    let has_v0 = document.declares_extension("VRM");
    let version = if has_v1 {
        VrmVersion::V1
    } else if has_v0 {
        VrmVersion::V0
    } else {
        return Err(ConvertError::unsupported(
            "no VRM or VRMC_vrm extension declared",
        ));
    };

    let extensions = &document.extensions;
    let generator = document.asset.generator.clone();
    let exporter_version = meta_string(extensions, "/VRM/exporterVersion");

    let is_vroid = [generator.as_deref(), exporter_version.as_deref()]
        .into_iter()
        .flatten()
        .any(|value| value.to_lowercase().contains("vroid"));
    let profile = if is_vroid {
        Profile::VRoid
    } else {
        Profile::Standard
    };

    let (preferred, fallback) = match version {
        VrmVersion::V1 => (humanoid_v1(extensions), humanoid_v0(extensions)),
        VrmVersion::V0 => (humanoid_v0(extensions), humanoid_v1(extensions)),
    };
    let mut humanoid = if preferred.is_empty() {
        fallback
    } else {
        preferred
    };
    humanoid.retain(|bone, node| {
        let valid = *node < document.nodes.len();
        if !valid {
            log::warn!("humanoid bone '{bone}' points to missing node {node}; ignored");
        }
        valid
    });

    let title = meta_string(extensions, "/VRMC_vrm/meta/name")
        .or_else(|| meta_string(extensions, "/VRM/meta/title"));
    let author = meta_string(extensions, "/VRMC_vrm/meta/authors/0")
        .or_else(|| meta_string(extensions, "/VRM/meta/author"));

    let has_expressions = extensions.get("VRMC_vrm").is_some_and(|vrm| {
        non_empty(vrm.pointer("/expressions/preset")) || non_empty(vrm.pointer("/expressions/custom"))
    }) || extensions
        .get("VRM")
        .is_some_and(|vrm| non_empty(vrm.pointer("/blendShapeMaster/blendShapeGroups")));

    let kept = extensions
        .iter()
        .filter(|(key, _)| key.as_str() == "VRM" || key.starts_with("VRMC_"))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    Ok(VrmMeta {
        version,
        profile,
        generator,
        exporter_version,
        title,
        author,
        humanoid,
        has_expressions,
        extensions: kept,
    })
}

// ─── Coordinate conversion ────────────────────────────────────────────────────

/// glTF (right-handed, Y-up, meters) → MMD coordinate conversion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Conversion {
    pub(crate) scale: f32,
    pub(crate) axis: Vector3<f32>,
    pub(crate) reverse_winding: bool,
}

impl Conversion {
    pub(crate) fn for_model(version: VrmVersion, profile: Profile) -> Self {
        let axis = if profile == Profile::VRoid && version == VrmVersion::V1 {
            Vector3::new(1.0, 1.0, -1.0)
        } else {
            Vector3::new(-1.0, 1.0, 1.0)
        };
        Self {
            scale: MMD_SCALE,
            axis,
            reverse_winding: axis.x * axis.y * axis.z < 0.0,
        }
    }

    pub(crate) fn position(&self, value: &Vector3<f32>) -> Vector3<f32> {
        value.component_mul(&self.axis) * self.scale
    }

    /// Axis-flipped unit direction; `None` when the input is degenerate.
    pub(crate) fn direction(&self, value: &Vector3<f32>) -> Option<Vector3<f32>> {
        let flipped = value.component_mul(&self.axis);
        let length = flipped.norm();
        (length > 1e-8).then(|| flipped / length)
    }
}
