//! GLB fixtures assembled in memory from `serde_json::json!` documents.

use std::path::{Path, PathBuf};

use serde_json::{Value, json};

use super::glb::{CHUNK_TYPE_BIN, CHUNK_TYPE_JSON, GLB_HEADER_SIZE, GLB_MAGIC, GLB_VERSION};

fn padded(bytes: &[u8], pad: u8) -> Vec<u8> {
    let mut out = bytes.to_vec();
    while out.len() % 4 != 0 {
        out.push(pad);
    }
    out
}

/// Assemble a GLB container from a JSON chunk and an optional BIN chunk.
pub(crate) fn glb_bytes(json: &[u8], bin: Option<&[u8]>) -> Vec<u8> {
    let json = padded(json, b' ');
    let bin = bin.map(|bin| padded(bin, 0));
    let total = GLB_HEADER_SIZE
        + 8
        + json.len()
        + bin.as_ref().map(|bin| 8 + bin.len()).unwrap_or(0);

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&CHUNK_TYPE_JSON.to_le_bytes());
    out.extend_from_slice(&json);
    if let Some(bin) = bin {
        out.extend_from_slice(&(bin.len() as u32).to_le_bytes());
        out.extend_from_slice(&CHUNK_TYPE_BIN.to_le_bytes());
        out.extend_from_slice(&bin);
    }
    out
}

/// Incrementally builds a glTF document plus its BIN buffer.
pub(crate) struct GltfFixture {
    pub(crate) json: Value,
    bin: Vec<u8>,
}

impl GltfFixture {
    pub(crate) fn new(json: Value) -> Self {
        Self {
            json,
            bin: Vec::new(),
        }
    }

    fn push_view(&mut self, bytes: &[u8], component_type: u32, kind: &str, count: usize) -> usize {
        while self.bin.len() % 4 != 0 {
            self.bin.push(0);
        }
        let offset = self.bin.len();
        self.bin.extend_from_slice(bytes);

        let views = array_entry(&mut self.json, "bufferViews");
        views.push(json!({ "buffer": 0, "byteOffset": offset, "byteLength": bytes.len() }));
        let view_index = views.len() - 1;

        let accessors = array_entry(&mut self.json, "accessors");
        accessors.push(json!({
            "bufferView": view_index,
            "componentType": component_type,
            "count": count,
            "type": kind,
        }));
        accessors.len() - 1
    }

    /// Append float data and return the accessor index.
    pub(crate) fn push_f32(&mut self, kind: &str, values: &[f32]) -> usize {
        let width = components(kind);
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.push_view(&bytes, 5126, kind, values.len() / width)
    }

    pub(crate) fn push_u16(&mut self, kind: &str, values: &[u16]) -> usize {
        let width = components(kind);
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.push_view(&bytes, 5123, kind, values.len() / width)
    }

    pub(crate) fn push_u8(&mut self, kind: &str, values: &[u8]) -> usize {
        let width = components(kind);
        self.push_view(values, 5121, kind, values.len() / width)
    }

    /// Append raw bytes as a bufferView (for embedded images).
    pub(crate) fn push_blob(&mut self, bytes: &[u8]) -> usize {
        while self.bin.len() % 4 != 0 {
            self.bin.push(0);
        }
        let offset = self.bin.len();
        self.bin.extend_from_slice(bytes);
        let views = array_entry(&mut self.json, "bufferViews");
        views.push(json!({ "buffer": 0, "byteOffset": offset, "byteLength": bytes.len() }));
        views.len() - 1
    }

    pub(crate) fn build(&self) -> Vec<u8> {
        let json = serde_json::to_vec(&self.json).unwrap_or_default();
        if self.bin.is_empty() {
            glb_bytes(&json, None)
        } else {
            glb_bytes(&json, Some(&self.bin))
        }
    }

    /// Write the fixture as `{dir}/{file_name}` and return the path.
    pub(crate) fn write(&self, dir: &Path, file_name: &str) -> PathBuf {
        let path = dir.join(file_name);
        std::fs::write(&path, self.build()).unwrap();
        path
    }
}

fn components(kind: &str) -> usize {
    match kind {
        "VEC2" => 2,
        "VEC3" => 3,
        "VEC4" => 4,
        _ => 1,
    }
}

fn array_entry<'a>(json: &'a mut Value, key: &str) -> &'a mut Vec<Value> {
    if !json.get(key).is_some_and(Value::is_array) {
        json[key] = json!([]);
    }
    match json.get_mut(key) {
        Some(Value::Array(values)) => values,
        _ => unreachable!("array entry was just inserted"),
    }
}

/// A VRM 1.0 document with the given nodes and humanoid bones.
pub(crate) fn vrm1_json(nodes: Value, human_bones: Value) -> Value {
    json!({
        "asset": { "version": "2.0", "generator": "fixture" },
        "extensionsUsed": ["VRMC_vrm"],
        "extensions": {
            "VRMC_vrm": {
                "specVersion": "1.0",
                "meta": { "name": "fixture" },
                "humanoid": { "humanBones": human_bones }
            }
        },
        "scene": 0,
        "scenes": [{ "nodes": [0] }],
        "nodes": nodes
    })
}

/// Triangle-mesh fixture: one node carrying one triangle primitive.
pub(crate) fn triangle_fixture() -> GltfFixture {
    let mut fixture = GltfFixture::new(vrm1_json(
        json!([{ "name": "hips", "translation": [0.0, 0.8, 0.0], "mesh": 0 }]),
        json!({ "hips": { "node": 0 } }),
    ));
    let position = fixture.push_f32("VEC3", &[0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0]);
    let normal = fixture.push_f32("VEC3", &[0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0]);
    let uv = fixture.push_f32("VEC2", &[0.0, 0.0, 0.0, 1.0, 1.0, 0.0]);
    let indices = fixture.push_u16("SCALAR", &[0, 1, 2]);
    fixture.json["meshes"] = json!([{
        "name": "Body",
        "primitives": [{
            "attributes": { "POSITION": position, "NORMAL": normal, "TEXCOORD_0": uv },
            "indices": indices,
            "material": 0,
            "mode": 4
        }]
    }]);
    fixture.json["materials"] = json!([{
        "name": "Skin",
        "pbrMetallicRoughness": { "baseColorFactor": [1.0, 1.0, 1.0, 1.0] }
    }]);
    fixture
}
