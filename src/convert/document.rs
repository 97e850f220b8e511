//! Tolerant glTF 2.0 document model.
//!
//! Unknown keys are ignored and absent keys fall back to empty collections or
//! zero, so partially-filled exporter output still decodes. Extension blobs are
//! kept as raw JSON.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Map, Value};

/// glTF primitive topology. Absent `mode` means triangles.
pub(crate) const MODE_POINTS: u32 = 0;
pub(crate) const MODE_TRIANGLES: u32 = 4;
pub(crate) const MODE_TRIANGLE_STRIP: u32 = 5;
pub(crate) const MODE_TRIANGLE_FAN: u32 = 6;

fn default_mode() -> u32 {
    MODE_TRIANGLES
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Document {
    pub asset: Asset,
    pub extensions_used: Vec<String>,
    pub extensions: Map<String, Value>,
    pub scene: Option<usize>,
    pub scenes: Vec<Scene>,
    pub nodes: Vec<Node>,
    pub meshes: Vec<Mesh>,
    pub accessors: Vec<Accessor>,
    pub buffer_views: Vec<BufferView>,
    pub buffers: Vec<Buffer>,
    pub materials: Vec<Material>,
    pub textures: Vec<Texture>,
    pub images: Vec<Image>,
    pub skins: Vec<Skin>,
}

impl Document {
    pub fn from_slice(json: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(json)
    }

    /// True when `name` is listed in `extensionsUsed` or present in `extensions`.
    pub fn declares_extension(&self, name: &str) -> bool {
        self.extensions_used.iter().any(|used| used == name) || self.extensions.contains_key(name)
    }

    /// Image index behind a texture index, when both exist.
    pub fn texture_image(&self, texture_index: usize) -> Option<usize> {
        self.textures
            .get(texture_index)?
            .source
            .filter(|image| *image < self.images.len())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Asset {
    pub generator: Option<String>,
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Scene {
    pub name: Option<String>,
    pub nodes: Vec<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Node {
    pub name: Option<String>,
    pub mesh: Option<usize>,
    pub skin: Option<usize>,
    pub children: Vec<usize>,
    pub matrix: Vec<f32>,
    pub translation: Vec<f32>,
    pub rotation: Vec<f32>,
    pub scale: Vec<f32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Mesh {
    pub name: Option<String>,
    pub primitives: Vec<Primitive>,
    pub extras: Value,
}

impl Mesh {
    /// Morph target names exported by most tools as `extras.targetNames`.
    pub fn target_names(&self) -> Vec<String> {
        target_names(&self.extras)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Primitive {
    pub attributes: BTreeMap<String, usize>,
    pub indices: Option<usize>,
    pub material: Option<usize>,
    #[serde(default = "default_mode")]
    pub mode: u32,
    pub targets: Vec<BTreeMap<String, usize>>,
    pub extras: Value,
}

impl Default for Primitive {
    fn default() -> Self {
        Self {
            attributes: BTreeMap::new(),
            indices: None,
            material: None,
            mode: MODE_TRIANGLES,
            targets: Vec::new(),
            extras: Value::Null,
        }
    }
}

impl Primitive {
    pub fn target_names(&self) -> Vec<String> {
        target_names(&self.extras)
    }
}

fn target_names(extras: &Value) -> Vec<String> {
    extras
        .get("targetNames")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .map(|name| name.as_str().unwrap_or_default().to_string())
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Accessor {
    pub buffer_view: Option<usize>,
    pub byte_offset: i64,
    pub component_type: u32,
    pub normalized: bool,
    pub count: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub sparse: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BufferView {
    pub buffer: i64,
    pub byte_offset: i64,
    pub byte_length: i64,
    pub byte_stride: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Buffer {
    pub byte_length: i64,
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Material {
    pub name: Option<String>,
    pub pbr_metallic_roughness: Option<PbrMetallicRoughness>,
    pub double_sided: bool,
    pub alpha_mode: Option<String>,
    pub alpha_cutoff: Option<f32>,
    pub extensions: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PbrMetallicRoughness {
    pub base_color_factor: Vec<f32>,
    pub base_color_texture: Option<TextureRef>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TextureRef {
    pub index: usize,
    pub tex_coord: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Texture {
    pub source: Option<usize>,
    pub sampler: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Image {
    pub name: Option<String>,
    pub uri: Option<String>,
    pub mime_type: Option<String>,
    pub buffer_view: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Skin {
    pub joints: Vec<usize>,
    pub skeleton: Option<usize>,
    pub inverse_bind_matrices: Option<usize>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn given_sparse_json_when_decoding_then_missing_keys_use_defaults() {
        let json = json!({
            "asset": { "version": "2.0" },
            "nodes": [{ "name": "hips", "unknownKey": 1 }],
            "meshes": [{ "primitives": [{ "attributes": { "POSITION": 0 } }] }],
            "accessors": [{ "count": 3, "type": "VEC3", "componentType": 5126 }]
        });

        let document: Document = serde_json::from_value(json).unwrap();

        assert_eq!(document.nodes[0].name.as_deref(), Some("hips"));
        assert!(document.nodes[0].children.is_empty());
        assert_eq!(document.meshes[0].primitives[0].mode, MODE_TRIANGLES);
        assert_eq!(document.accessors[0].byte_offset, 0);
        assert!(document.accessors[0].buffer_view.is_none());
        assert!(document.materials.is_empty());
    }

    #[test]
    fn given_target_names_in_extras_when_reading_then_names_are_returned() {
        let mesh: Mesh = serde_json::from_value(json!({
            "name": "Face",
            "primitives": [],
            "extras": { "targetNames": ["Fcl_MTH_A", "Fcl_EYE_Close"] }
        }))
        .unwrap();

        assert_eq!(mesh.target_names(), vec!["Fcl_MTH_A", "Fcl_EYE_Close"]);
    }

    #[test]
    fn given_extension_only_in_used_list_when_checking_then_it_is_declared() {
        let document: Document =
            serde_json::from_value(json!({ "extensionsUsed": ["VRMC_vrm"] })).unwrap();

        assert!(document.declares_extension("VRMC_vrm"));
        assert!(!document.declares_extension("VRM"));
    }
}
