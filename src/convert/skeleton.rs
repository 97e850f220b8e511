use nalgebra::Vector3;

use super::{
    document::Document,
    scene::{Conversion, SceneGraph},
};
use crate::{
    error::{ConvertError, ConvertResult},
    pmx::{Bone, BoneFlags, PmxModel},
};

const FALLBACK_TAIL: Vector3<f32> = Vector3::new(0.0, 0.1, 0.0);

fn node_bone_name(name: Option<&str>, index: usize) -> String {
    match name.map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => format!("node_{index:03}"),
    }
}

/// Create one bone per glTF node (bone index = node index), then wire parents,
/// tails and layers.
pub(crate) fn build_skeleton(
    document: &Document,
    scene: &SceneGraph,
    conversion: &Conversion,
    model: &mut PmxModel,
) -> ConvertResult<()> {
    if !model.bones.is_empty() {
        return Err(ConvertError::invalid(
            "skeleton must be built before any other bone is added",
        ));
    }

    for (index, node) in document.nodes.iter().enumerate() {
        let name = node_bone_name(node.name.as_deref(), index);
        let mut bone = Bone::new(name.clone(), conversion.position(&scene.world_position(index)));
        bone.english_name = name;
        let pushed = model.bones.push_unique(bone);
        debug_assert_eq!(pushed, index);
    }

    for (index, node) in document.nodes.iter().enumerate() {
        let parent = scene.parents[index];
        let parent_position = parent
            .and_then(|parent| model.bones.get(parent))
            .map(|bone| bone.position);
        let first_child = node
            .children
            .iter()
            .copied()
            .find(|child| *child < model.bones.len());

        let Some(bone) = model.bones.get_mut(index) else {
            continue;
        };
        bone.parent = parent;
        if parent.is_none() {
            bone.flags.insert(BoneFlags::TRANSLATE);
        }

        match first_child {
            Some(child) => bone.set_tail_bone(Some(child)),
            None => {
                let offset = parent_position
                    .map(|parent_position| (bone.position - parent_position) * 0.5)
                    .filter(|offset| offset.norm() > 1e-8);
                match offset {
                    Some(offset) => bone.set_tail_offset(offset),
                    None => {
                        if parent_position.is_some() {
                            log::warn!(
                                "bone '{}' sits on its parent; using a default tail",
                                bone.name
                            );
                        }
                        bone.set_tail_offset(FALLBACK_TAIL);
                    }
                }
            }
        }
    }

    model.bones.recompute_layers();
    log::debug!("skeleton built with {} bones", model.bones.len());
    Ok(())
}
