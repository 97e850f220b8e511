use nalgebra::{Vector3, Vector4};
use serde_json::Value;

use super::{document::Document, scene::VrmMeta};
use crate::pmx::{DrawFlags, Material, PmxModel, Toon};

/// Build the PMX material for one primitive.
///
/// `image_textures` maps a glTF image index to the model texture index
/// registered by the output layout.
pub(super) fn material_from_source(
    document: &Document,
    source: Option<usize>,
    fallback_name: &str,
    image_textures: &[Option<usize>],
) -> Material {
    let gltf_material = source.and_then(|index| document.materials.get(index));
    let name = gltf_material
        .and_then(|material| material.name.as_deref())
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .unwrap_or(fallback_name);

    let mut material = Material::new(name);
    material.english_name = name.to_string();
    let Some(gltf_material) = gltf_material else {
        return material;
    };

    if let Some(pbr) = &gltf_material.pbr_metallic_roughness {
        if let [r, g, b, a] = pbr.base_color_factor.as_slice() {
            material.diffuse = Vector4::new(*r, *g, *b, *a);
        }
        material.texture_index = pbr
            .base_color_texture
            .as_ref()
            .and_then(|texture| document.texture_image(texture.index))
            .and_then(|image| image_textures.get(image).copied().flatten());
    }
    if gltf_material.double_sided {
        material.draw_flags.insert(DrawFlags::DOUBLE_SIDED);
    }
    if gltf_material.alpha_mode.as_deref() == Some("MASK") {
        material.diffuse.w = 1.0;
    }
    material
}

// ─── VRoid preparation ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct Outline {
    width: f32,
    color: Vector3<f32>,
}

fn color3(value: Option<&Value>) -> Option<Vector3<f32>> {
    let items = value?.as_array()?;
    let channel = |index: usize| items.get(index).and_then(Value::as_f64).map(|v| v as f32);
    Some(Vector3::new(channel(0)?, channel(1)?, channel(2)?))
}

/// VRM 0.x keeps MToon parameters in `VRM.materialProperties`, aligned with
/// the glTF material list, or matched by name when misaligned.
fn outline_v0(meta: &VrmMeta, document: &Document, source: usize) -> Option<Outline> {
    let properties = meta.extensions.get("VRM")?.get("materialProperties")?.as_array()?;
    let source_name = document.materials.get(source)?.name.as_deref();
    let entry = properties
        .get(source)
        .filter(|entry| {
            source_name.is_none() || entry.get("name").and_then(Value::as_str) == source_name
        })
        .or_else(|| {
            properties
                .iter()
                .find(|entry| entry.get("name").and_then(Value::as_str) == source_name)
        })?;

    let width = entry.pointer("/floatProperties/_OutlineWidth")?.as_f64()? as f32;
    let color = color3(entry.pointer("/vectorProperties/_OutlineColor")).unwrap_or_else(Vector3::zeros);
    Some(Outline { width, color })
}

fn outline_v1(document: &Document, source: usize) -> Option<Outline> {
    let mtoon = document
        .materials
        .get(source)?
        .extensions
        .get("VRMC_materials_mtoon")?;
    let width = mtoon.get("outlineWidthFactor")?.as_f64()? as f32;
    let color = color3(mtoon.get("outlineColorFactor")).unwrap_or_else(Vector3::zeros);
    Some(Outline { width, color })
}

/// Carry MToon outlines over to PMX edges. Returns the number of materials
/// that received an edge.
pub(crate) fn prepare_vroid_materials(
    model: &mut PmxModel,
    material_sources: &[Option<usize>],
    document: &Document,
    meta: &VrmMeta,
) -> usize {
    let mut edged = 0;
    for (material, source) in model.materials.iter_mut().zip(material_sources) {
        let Some(source) = *source else {
            continue;
        };
        let outline = outline_v1(document, source).or_else(|| outline_v0(meta, document, source));
        let Some(outline) = outline.filter(|outline| outline.width.abs() > f32::EPSILON) else {
            continue;
        };
        material.draw_flags.insert(DrawFlags::EDGE);
        material.edge_color = Vector4::new(outline.color.x, outline.color.y, outline.color.z, 1.0);
        material.toon = Toon::Shared(0);
        edged += 1;
    }
    log::debug!("{edged} VRoid materials carry an outline edge");
    edged
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::convert::types::{Profile, VrmVersion};

    fn document(json: Value) -> Document {
        serde_json::from_value(json).unwrap()
    }

    fn meta(extensions: BTreeMap<String, Value>) -> VrmMeta {
        VrmMeta {
            version: VrmVersion::V0,
            profile: Profile::VRoid,
            generator: None,
            exporter_version: None,
            title: None,
            author: None,
            humanoid: BTreeMap::new(),
            has_expressions: false,
            extensions,
        }
    }

    #[test]
    fn given_textured_material_when_building_then_texture_follows_image_map() {
        let doc = document(json!({
            "materials": [{
                "name": " Hair ",
                "doubleSided": true,
                "alphaMode": "MASK",
                "pbrMetallicRoughness": {
                    "baseColorFactor": [0.5, 0.4, 0.3, 0.2],
                    "baseColorTexture": { "index": 0 }
                }
            }],
            "textures": [{ "source": 1 }],
            "images": [{}, {}]
        }));

        let material = material_from_source(&doc, Some(0), "unused", &[Some(4), Some(7)]);

        assert_eq!(material.name, "Hair");
        assert_eq!(material.texture_index, Some(7));
        assert_eq!(material.diffuse, Vector4::new(0.5, 0.4, 0.3, 1.0));
        assert!(material.draw_flags.contains(DrawFlags::DOUBLE_SIDED));
        assert!(material.draw_flags.contains(DrawFlags::SELF_SHADOW_DRAW));
    }

    #[test]
    fn given_missing_source_when_building_then_fallback_name_and_defaults_apply() {
        let material = material_from_source(&Document::default(), None, "Body_001", &[]);

        assert_eq!(material.name, "Body_001");
        assert_eq!(material.diffuse, Vector4::new(1.0, 1.0, 1.0, 1.0));
        assert_eq!(material.texture_index, None);
    }

    #[test]
    fn given_vrm0_outline_when_preparing_then_edge_and_shared_toon_are_set() {
        let doc = document(json!({ "materials": [{ "name": "Face" }, { "name": "Cloth" }] }));
        let mut extensions = BTreeMap::new();
        extensions.insert(
            "VRM".to_string(),
            json!({ "materialProperties": [
                { "name": "Face", "floatProperties": { "_OutlineWidth": 0.0 } },
                {
                    "name": "Cloth",
                    "floatProperties": { "_OutlineWidth": 0.2 },
                    "vectorProperties": { "_OutlineColor": [0.1, 0.2, 0.3, 1.0] }
                }
            ]}),
        );
        let mut model = PmxModel::new("m");
        model.materials = vec![Material::new("Face"), Material::new("Cloth")];

        let edged = prepare_vroid_materials(&mut model, &[Some(0), Some(1)], &doc, &meta(extensions));

        assert_eq!(edged, 1);
        assert!(!model.materials[0].draw_flags.contains(DrawFlags::EDGE));
        let cloth = &model.materials[1];
        assert!(cloth.draw_flags.contains(DrawFlags::EDGE));
        assert!((cloth.edge_color - Vector4::new(0.1, 0.2, 0.3, 1.0)).norm() < 1e-6);
        assert_eq!(cloth.toon, Toon::Shared(0));
    }

    #[test]
    fn given_vrm1_mtoon_extension_when_preparing_then_outline_factor_is_used() {
        let doc = document(json!({ "materials": [{
            "name": "Cloth",
            "extensions": { "VRMC_materials_mtoon": {
                "outlineWidthFactor": 0.01,
                "outlineColorFactor": [1.0, 0.0, 0.0]
            } }
        }] }));
        let mut model = PmxModel::new("m");
        model.materials = vec![Material::new("Cloth")];

        prepare_vroid_materials(&mut model, &[Some(0)], &doc, &meta(BTreeMap::new()));

        assert_eq!(model.materials[0].edge_color, Vector4::new(1.0, 0.0, 0.0, 1.0));
    }
}
