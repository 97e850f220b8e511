use nalgebra::{Matrix3, Matrix4, Translation3, Vector3};

use crate::{
    correction::{Influence, JointAxis, chain_step, joint_rotation, local_axes, posed_origin, reproject_vertex},
    error::ConvertResult,
    pmx::{BoneTail, PmxModel},
};

const UPPER: &str = "上半身";

/// Joint rotations that turn a T-stance into an A-stance.
const JOINTS: [(&str, JointAxis, f32); 6] = [
    ("左腕", JointAxis::Z, -35.0),
    ("右腕", JointAxis::Z, 35.0),
    ("左親指０", JointAxis::Y, -8.0),
    ("左親指１", JointAxis::Y, -24.0),
    ("右親指０", JointAxis::Y, 8.0),
    ("右親指１", JointAxis::Y, 24.0),
];

const NAMED_TARGETS: [&str; 2] = ["頭", "首"];
const SIDE_TARGETS: [&str; 7] = ["腕捩1", "腕捩2", "腕捩3", "手捩1", "手捩2", "手捩3", "手首先"];

fn side_base(name: &str) -> &str {
    name.strip_prefix('左')
        .or_else(|| name.strip_prefix('右'))
        .unwrap_or(name)
}

fn children(model: &PmxModel) -> Vec<Vec<usize>> {
    let mut children = vec![Vec::new(); model.bones.len()];
    for (index, bone) in model.bones.iter().enumerate() {
        if let Some(parent) = bone.parent.filter(|parent| *parent < children.len()) {
            children[parent].push(index);
        }
    }
    children
}

/// Bones from `start` down to `end`, or `None` when `end` is not below `start`.
fn chain_from(model: &PmxModel, start: usize, end: usize) -> Option<Vec<usize>> {
    let mut chain = vec![end];
    let mut current = end;
    while current != start {
        current = model.bones.get(current)?.parent?;
        if chain.len() > model.bones.len() {
            return None;
        }
        chain.push(current);
    }
    chain.reverse();
    Some(chain)
}

fn targets(model: &PmxModel, children: &[Vec<usize>]) -> Vec<usize> {
    let mut targets: Vec<usize> = NAMED_TARGETS
        .iter()
        .filter_map(|name| model.bones.index_of(name))
        .collect();
    for side in ['左', '右'] {
        targets.extend(
            SIDE_TARGETS
                .iter()
                .filter_map(|base| model.bones.index_of(&format!("{side}{base}"))),
        );
    }
    for (index, bone) in model.bones.iter().enumerate() {
        let finger_tip = bone.name.contains('指') && children[index].is_empty();
        if finger_tip || bone.name.contains("装飾_") {
            targets.push(index);
        }
    }
    // Remaining leaves keep everything hanging off the arms attached.
    targets.extend((0..model.bones.len()).filter(|index| children[*index].is_empty()));
    targets
}

/// Rotate the arms and thumbs of a T-stance model into an A-stance, then
/// reproject every vertex through the moved bones. Returns the number of
/// bones whose pose was recomputed.
pub(crate) fn apply_a_stance(model: &mut PmxModel) -> ConvertResult<usize> {
    let Some(upper) = model.bones.index_of(UPPER) else {
        log::warn!("A-stance skipped: no '{UPPER}' bone");
        return Ok(0);
    };
    let origins: Vec<Vector3<f32>> = model.bones.iter().map(|bone| bone.position).collect();
    let mut matrices: Vec<Matrix4<f32>> = origins
        .iter()
        .map(|origin| Translation3::from(*origin).to_homogeneous())
        .collect();
    let joints: Vec<Option<Matrix4<f32>>> = model
        .bones
        .iter()
        .map(|bone| {
            JOINTS
                .iter()
                .find(|(name, _, _)| *name == bone.name)
                .map(|(_, axis, degrees)| joint_rotation(*axis, *degrees))
        })
        .collect();

    let children = children(model);
    let mut posed = vec![false; model.bones.len()];
    posed[upper] = true;
    for target in targets(model, &children) {
        let Some(chain) = chain_from(model, upper, target) else {
            continue;
        };
        let mut current = matrices[upper];
        for pair in chain.windows(2) {
            let (parent, child) = (pair[0], pair[1]);
            if posed[child] {
                current = matrices[child];
                continue;
            }
            current = chain_step(&current, origins[child] - origins[parent], joints[child].as_ref());
            matrices[child] = current;
            posed[child] = true;
        }
    }

    let mut moved = 0;
    for (index, matrix) in matrices.iter().enumerate() {
        if !posed[index] || index == upper {
            continue;
        }
        let Some(bone) = model.bones.get_mut(index) else {
            continue;
        };
        bone.position = posed_origin(matrix);
        if let BoneTail::Offset(offset) = bone.tail {
            let rotation: Matrix3<f32> = matrix.fixed_view::<3, 3>(0, 0).into_owned();
            bone.tail = BoneTail::Offset(rotation * offset);
        }
        moved += 1;
    }

    rebuild_axes(model, &children);

    for vertex in &mut model.vertices {
        let weights = vertex.deform.bone_weights();
        if !weights.iter().any(|(bone, _)| posed.get(*bone).copied().unwrap_or(false)) {
            continue;
        }
        let influences: Vec<Influence<'_>> = weights
            .iter()
            .filter(|(bone, _)| *bone < matrices.len())
            .map(|(bone, weight)| Influence {
                matrix: &matrices[*bone],
                origin: origins[*bone],
                weight: *weight,
            })
            .collect();
        let (position, normal) = reproject_vertex(&influences, vertex.position, vertex.normal);
        vertex.position = position;
        vertex.normal = normal;
    }

    log::info!("A-stance moved {moved} bones");
    Ok(moved)
}

fn is_arm_family(base: &str) -> bool {
    matches!(base, "肩" | "腕" | "ひじ" | "手首") || base.contains('指')
}

/// Local X towards the child bone for arms and fingers, and the twist axis
/// for twist bones. Degenerate directions keep the previous axes.
fn rebuild_axes(model: &mut PmxModel, children: &[Vec<usize>]) {
    let positions: Vec<Vector3<f32>> = model.bones.iter().map(|bone| bone.position).collect();
    let position_of = |name: String| model.bones.index_of(&name).map(|index| positions[index]);

    let mut updates = Vec::new();
    for (index, bone) in model.bones.iter().enumerate() {
        let prefix = &bone.name[..bone.name.len() - side_base(&bone.name).len()];
        let base = side_base(&bone.name);
        let twist_span = if base.starts_with("腕捩") {
            Some((format!("{prefix}腕"), format!("{prefix}ひじ")))
        } else if base.starts_with("手捩") {
            Some((format!("{prefix}ひじ"), format!("{prefix}手首")))
        } else {
            None
        };

        let direction = match twist_span {
            Some((from, to)) => match (position_of(from), position_of(to)) {
                (Some(from), Some(to)) => Some(to - from),
                _ => None,
            },
            None if is_arm_family(base) => {
                let child = bone
                    .tail_bone()
                    .or_else(|| children[index].first().copied())
                    .filter(|child| *child < positions.len());
                match (child, bone.parent) {
                    (Some(child), _) => Some(positions[child] - positions[index]),
                    (None, Some(parent)) if parent < positions.len() => {
                        Some(positions[index] - positions[parent])
                    }
                    _ => None,
                }
            }
            None => None,
        };
        if let Some((x, z)) = direction.and_then(local_axes) {
            updates.push((index, x, z, bone.fixed_axis.is_some()));
        }
    }

    for (index, x, z, fixed) in updates {
        if let Some(bone) = model.bones.get_mut(index) {
            bone.set_local_axes(x, z);
            if fixed {
                bone.set_fixed_axis(x);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector2;

    use super::*;
    use crate::pmx::{Bone, Deform, Vertex};

    fn arm_model() -> PmxModel {
        let mut model = PmxModel::new("m");
        let bones = [
            ("上半身", None, [0.0, 10.0, 0.0]),
            ("左肩", Some(0), [0.5, 15.0, 0.0]),
            ("左腕", Some(1), [1.5, 15.0, 0.0]),
            ("左ひじ", Some(2), [4.5, 15.0, 0.0]),
            ("首", Some(0), [0.0, 16.0, 0.0]),
            ("左足", None, [1.0, 9.0, 0.0]),
        ];
        for (name, parent, [x, y, z]) in bones {
            model
                .bones
                .push(Bone::new(name, Vector3::new(x, y, z)).with_parent(parent))
                .unwrap();
        }
        model
    }

    fn vertex(position: Vector3<f32>, deform: Deform) -> Vertex {
        Vertex::new(position, Vector3::y(), Vector2::zeros(), deform)
    }

    fn approx(a: Vector3<f32>, b: Vector3<f32>) -> bool {
        (a - b).norm() < 1e-4
    }

    #[test]
    fn given_t_stance_arm_when_applying_then_elbow_swings_down_35_degrees() {
        let mut model = arm_model();
        model.vertices.push(vertex(Vector3::new(4.5, 15.0, 0.0), Deform::Single { bone: 3 }));

        apply_a_stance(&mut model).unwrap();

        let angle = 35f32.to_radians();
        let elbow = Vector3::new(1.5 + 3.0 * angle.cos(), 15.0 - 3.0 * angle.sin(), 0.0);
        assert!(approx(model.bones.get(3).unwrap().position, elbow));
        assert!(approx(model.bones.get(2).unwrap().position, Vector3::new(1.5, 15.0, 0.0)));
        assert!(approx(model.vertices[0].position, elbow));
        let normal = model.vertices[0].normal;
        assert!(approx(normal, Vector3::new(angle.sin(), angle.cos(), 0.0)));
    }

    #[test]
    fn given_bones_outside_upper_body_when_applying_then_they_stay_put() {
        let mut model = arm_model();
        model.vertices.push(vertex(Vector3::new(1.0, 5.0, 0.0), Deform::Single { bone: 5 }));

        apply_a_stance(&mut model).unwrap();

        assert_eq!(model.bones.get(4).unwrap().position, Vector3::new(0.0, 16.0, 0.0));
        assert_eq!(model.bones.get(5).unwrap().position, Vector3::new(1.0, 9.0, 0.0));
        assert_eq!(model.vertices[0].position, Vector3::new(1.0, 5.0, 0.0));
    }

    #[test]
    fn given_blended_vertex_when_applying_then_position_mixes_both_bones() {
        let mut model = arm_model();
        model.vertices.push(vertex(
            Vector3::new(2.5, 15.0, 0.0),
            Deform::Double { bones: [2, 0], weight0: 0.5 },
        ));

        apply_a_stance(&mut model).unwrap();

        let angle = 35f32.to_radians();
        let rotated = Vector3::new(1.5 + angle.cos(), 15.0 - angle.sin(), 0.0);
        let expected = (rotated + Vector3::new(2.5, 15.0, 0.0)) * 0.5;
        assert!(approx(model.vertices[0].position, expected));
    }

    #[test]
    fn given_posed_arm_when_rebuilding_axes_then_x_points_at_child() {
        let mut model = arm_model();

        apply_a_stance(&mut model).unwrap();

        let axes = model.bones.get(2).unwrap().local_axes.as_ref().unwrap();
        let angle = 35f32.to_radians();
        assert!(approx(axes.x, Vector3::new(angle.cos(), -angle.sin(), 0.0)));
        assert!(axes.x.dot(&axes.z).abs() < 1e-5);
    }

    #[test]
    fn given_no_upper_body_when_applying_then_nothing_moves() {
        let mut model = PmxModel::new("m");
        model.bones.push(Bone::new("root", Vector3::zeros())).unwrap();

        assert_eq!(apply_a_stance(&mut model).unwrap(), 0);
    }
}
