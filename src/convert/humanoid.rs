use std::collections::{HashMap, HashSet};
use std::f32::consts::PI;

use nalgebra::Vector3;

use super::{scene::VrmMeta, types::canonical_bone_name};
use crate::{
    correction::local_axes,
    error::ConvertResult,
    pmx::{Bone, BoneFlags, DisplayRef, DisplaySlot, Ik, IkLink, Placement, PmxModel},
};

const TWIST_RATIOS: [f32; 3] = [0.25, 0.5, 0.75];
const HEEL_RATIO: f32 = 0.35;
const LEG_IK_LOOPS: u32 = 40;
const LEG_IK_UNIT: f32 = 2.0;
const TOE_IK_LOOPS: u32 = 3;
const TOE_IK_UNIT: f32 = 4.0;
const KNEE_MAX_BEND: f32 = -0.5;

const ROOT: &str = "全ての親";
const CENTER: &str = "センター";
const GROOVE: &str = "グルーブ";
const TRUNK_ROOT: &str = "体幹中心";
const LEG_CENTER: &str = "足中心";
const NECK_ROOT: &str = "首根元";
const WAIST: &str = "腰";
const EYES: &str = "両目";
const LOWER: &str = "下半身";
const UPPER: &str = "上半身";
const UPPER2: &str = "上半身2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Left,
    Right,
}

impl Side {
    const BOTH: [Side; 2] = [Side::Left, Side::Right];

    fn prefix(self) -> &'static str {
        match self {
            Side::Left => "左",
            Side::Right => "右",
        }
    }

    fn name(self, base: &str) -> String {
        format!("{}{base}", self.prefix())
    }

    fn waist_cancel(self) -> String {
        format!("腰キャンセル{}", self.prefix())
    }
}

/// What the mapper changed on one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct HumanoidOutcome {
    /// `(source name, canonical name)` in plan order.
    pub(crate) renamed: Vec<(String, String)>,
    pub(crate) inserted: usize,
}

/// Rename humanoid bones to their MMD names, add the supplementary MMD
/// skeleton (root, center, twist, D-chain, IK), build display frames and
/// apply the final bone order.
pub(crate) fn map_humanoid(model: &mut PmxModel, meta: &VrmMeta) -> ConvertResult<HumanoidOutcome> {
    let plan = resolve_plan(model, meta);
    let renamed = rename_bones(model, &plan)?;

    let mut supplement = Supplement {
        model: &mut *model,
        inserted: 0,
    };
    supplement.trunk()?;
    for side in Side::BOTH {
        supplement.arm(side)?;
        supplement.leg(side)?;
    }
    supplement.normalize_roots();
    let inserted = supplement.inserted;

    transfer_leg_weights(model);
    let order = model.bones.planned_order();
    model.renumber_bones(&order)?;
    model.bones.recompute_layers();
    build_display_slots(model);

    log::info!(
        "humanoid mapping renamed {} bones and inserted {inserted}",
        renamed.len()
    );
    Ok(HumanoidOutcome { renamed, inserted })
}

// ─── Rename ───────────────────────────────────────────────────────────────────

/// `(bone index, canonical name)` for every humanoid slot that still needs
/// a rename. A slot whose canonical name is already taken is left alone.
fn resolve_plan(model: &PmxModel, meta: &VrmMeta) -> Vec<(usize, &'static str)> {
    let mut plan = Vec::new();
    for (humanoid, &node) in &meta.humanoid {
        let Some(canonical) = canonical_bone_name(meta.version, humanoid) else {
            log::debug!("humanoid bone '{humanoid}' has no MMD counterpart");
            continue;
        };
        if model.bones.contains(canonical) {
            continue;
        }
        let source = if node < model.bones.len() {
            Some(node)
        } else {
            model.bones.index_of(humanoid)
        };
        match source {
            Some(source) => plan.push((source, canonical)),
            None => log::warn!("humanoid bone '{humanoid}' points at missing node {node}"),
        }
    }
    plan
}

fn temporary_name(model: &PmxModel, counter: &mut usize) -> String {
    loop {
        let candidate = format!("__tmp_{:03}", *counter);
        *counter += 1;
        if !model.bones.contains(&candidate) {
            return candidate;
        }
    }
}

fn rename_bones(
    model: &mut PmxModel,
    plan: &[(usize, &'static str)],
) -> ConvertResult<Vec<(String, String)>> {
    let sources: HashSet<usize> = plan.iter().map(|(source, _)| *source).collect();
    let mut seen_sources = HashSet::new();
    let mut seen_targets = HashSet::new();
    let mut accepted = Vec::new();
    for &(source, target) in plan {
        if !seen_sources.insert(source) || !seen_targets.insert(target) {
            log::warn!("bone {source} is claimed twice for '{target}', keeping the first claim");
            continue;
        }
        if let Some(holder) = model.bones.index_of(target)
            && !sources.contains(&holder)
        {
            log::warn!("bone name '{target}' is taken by bone {holder}, rename skipped");
            continue;
        }
        accepted.push((source, target));
    }

    let mut counter = 0;
    let mut originals = Vec::with_capacity(accepted.len());
    for &(source, _) in &accepted {
        let original = model
            .bones
            .get(source)
            .map(|bone| bone.name.clone())
            .unwrap_or_default();
        let temporary = temporary_name(model, &mut counter);
        model.bones.rename(source, &temporary)?;
        originals.push(original);
    }

    let mut renamed = Vec::new();
    for (&(source, target), original) in accepted.iter().zip(originals) {
        match model.bones.rename(source, target) {
            Ok(()) => {
                if let Some(bone) = model.bones.get_mut(source) {
                    bone.english_name = original.clone();
                }
                renamed.push((original, target.to_string()));
            }
            Err(err) => {
                log::warn!("rename '{original}' -> '{target}' skipped: {err}");
                let restored = model.bones.unique_name(&original);
                model.bones.rename(source, &restored)?;
            }
        }
    }
    Ok(renamed)
}

// ─── Supplementary bones ──────────────────────────────────────────────────────

fn midpoint(a: Vector3<f32>, b: Vector3<f32>) -> Vector3<f32> {
    (a + b) * 0.5
}

fn on_floor(mut position: Vector3<f32>) -> Vector3<f32> {
    position.y = 0.0;
    position
}

struct Supplement<'m> {
    model: &'m mut PmxModel,
    inserted: usize,
}

impl Supplement<'_> {
    fn index(&self, name: &str) -> Option<usize> {
        self.model.bones.index_of(name)
    }

    fn position(&self, name: &str) -> Option<Vector3<f32>> {
        self.model.bones.by_name(name).map(|bone| bone.position)
    }

    fn first(&self, names: &[&str]) -> Option<usize> {
        names.iter().find_map(|name| self.index(name))
    }

    fn skipped(&self, bone: &str, anchor: &str) {
        log::warn!("supplementary bone '{bone}' skipped: no '{anchor}' bone");
    }

    /// Add `bone` unless its name exists; returns the bone index either way.
    fn add(&mut self, bone: Bone, placement: Option<Placement>) -> ConvertResult<usize> {
        if let Some(existing) = self.index(&bone.name) {
            return Ok(existing);
        }
        let index = match placement {
            Some(Placement::Before(anchor)) => self.model.bones.insert_before(anchor, bone)?,
            Some(Placement::After(anchor)) => self.model.bones.insert_after(anchor, bone)?,
            None => self.model.bones.push(bone)?,
        };
        self.inserted += 1;
        Ok(index)
    }

    fn reparent(&mut self, child: Option<usize>, parent: Option<usize>) {
        if let (Some(child), Some(parent)) = (child, parent)
            && child != parent
            && let Some(bone) = self.model.bones.get_mut(child)
        {
            bone.parent = Some(parent);
        }
    }

    fn set_effect(&mut self, bone: usize, source: Option<usize>, factor: f32) {
        if let (Some(source), Some(bone)) = (source, self.model.bones.get_mut(bone)) {
            bone.set_effect(source, factor);
        }
    }

    fn trunk(&mut self) -> ConvertResult<()> {
        let lower = self.index(LOWER);
        let first = (!self.model.bones.is_empty()).then_some(Placement::Before(0));
        let root = self.add(
            Bone::new(ROOT, Vector3::zeros()).with_flags(BoneFlags::TRANSLATE),
            first,
        )?;

        let Some(lower_position) = self.position(LOWER) else {
            self.skipped(CENTER, LOWER);
            return Ok(());
        };
        let center = self.add(
            Bone::new(CENTER, Vector3::new(0.0, lower_position.y * 0.5, 0.0))
                .with_parent(Some(root))
                .with_flags(BoneFlags::TRANSLATE),
            Some(Placement::After(root)),
        )?;
        let groove = self.add(
            Bone::new(GROOVE, Vector3::new(0.0, lower_position.y * 0.7, 0.0))
                .with_parent(Some(center))
                .with_flags(BoneFlags::TRANSLATE),
            Some(Placement::After(center)),
        )?;

        let trunk_root = match self.position(UPPER) {
            Some(upper_position) => Some(self.add(
                Bone::new(TRUNK_ROOT, midpoint(upper_position, lower_position))
                    .with_parent(Some(center))
                    .hidden()
                    .system(),
                Some(Placement::After(groove)),
            )?),
            None => {
                self.skipped(TRUNK_ROOT, UPPER);
                None
            }
        };

        match (self.position(&Side::Left.name("足")), self.position(&Side::Right.name("足"))) {
            (Some(left), Some(right)) => {
                self.add(
                    Bone::new(LEG_CENTER, midpoint(left, right))
                        .with_parent(lower)
                        .hidden()
                        .system(),
                    lower.map(Placement::After),
                )?;
            }
            _ => self.skipped(LEG_CENTER, "足"),
        }

        let neck_root = match (
            self.position(&Side::Left.name("腕")),
            self.position(&Side::Right.name("腕")),
        ) {
            (Some(left), Some(right)) => {
                let parent = self.first(&[UPPER2, UPPER]);
                let placement = self
                    .index("首")
                    .map(Placement::Before)
                    .or(parent.map(Placement::After));
                Some(self.add(
                    Bone::new(NECK_ROOT, midpoint(left, right)).with_parent(parent),
                    placement,
                )?)
            }
            _ => {
                self.skipped(NECK_ROOT, "腕");
                None
            }
        };

        if let Some(upper_position) = self.position(UPPER) {
            let parent = trunk_root.or(Some(groove));
            let waist = self.add(
                Bone::new(WAIST, midpoint(upper_position, lower_position)).with_parent(parent),
                Some(Placement::After(trunk_root.unwrap_or(groove))),
            )?;
            self.reparent(lower, Some(waist));
            let upper = self.index(UPPER);
            self.reparent(upper, Some(waist));
        } else {
            self.skipped(WAIST, UPPER);
        }

        let neck = self.index("首");
        self.reparent(neck, neck_root);

        match (self.index(&Side::Left.name("目")), self.index(&Side::Right.name("目"))) {
            (Some(left), Some(right)) => {
                let position = midpoint(
                    self.model.bones.get(left).map(|b| b.position).unwrap_or_default(),
                    self.model.bones.get(right).map(|b| b.position).unwrap_or_default(),
                );
                let parent = neck_root.or_else(|| self.first(&[UPPER2, UPPER]));
                let placement = self.index("頭").map(Placement::After);
                let eyes = self.add(Bone::new(EYES, position).with_parent(parent), placement)?;
                self.set_effect(left, Some(eyes), 1.0);
                self.set_effect(right, Some(eyes), 1.0);
            }
            _ => self.skipped(EYES, "目"),
        }
        Ok(())
    }

    fn arm(&mut self, side: Side) -> ConvertResult<()> {
        let shoulder_name = side.name("肩");
        let arm_name = side.name("腕");
        let elbow_name = side.name("ひじ");
        let wrist_name = side.name("手首");
        let shoulder = self.index(&shoulder_name);
        let arm = self.index(&arm_name);

        if let Some(shoulder) = shoulder {
            let position = self.position(&shoulder_name).unwrap_or_default();
            let parent = self.first(&[NECK_ROOT, UPPER2, UPPER]);
            let shoulder_p = self.add(
                Bone::new(side.name("肩P"), position).with_parent(parent),
                Some(Placement::Before(shoulder)),
            )?;
            self.reparent(Some(shoulder), Some(shoulder_p));

            if let Some(arm) = arm {
                let position = self.position(&arm_name).unwrap_or_default();
                let shoulder_c = self.add(
                    Bone::new(side.name("肩C"), position)
                        .with_parent(Some(shoulder))
                        .hidden(),
                    Some(Placement::Before(arm)),
                )?;
                self.set_effect(shoulder_c, Some(shoulder_p), -1.0);
                self.reparent(Some(arm), Some(shoulder_c));
            }
        } else {
            self.skipped(&side.name("肩P"), &shoulder_name);
        }

        self.twist_family(side, &arm_name, &elbow_name, "腕捩")?;
        self.twist_family(side, &elbow_name, &wrist_name, "手捩")?;

        let Some(wrist) = self.index(&wrist_name) else {
            self.skipped(&side.name("手首先"), &wrist_name);
            return Ok(());
        };
        let finger_roots: Vec<Vector3<f32>> = ["人指１", "中指１", "薬指１", "小指１"]
            .iter()
            .filter_map(|finger| self.position(&side.name(finger)))
            .collect();
        let wrist_position = self.position(&wrist_name).unwrap_or_default();
        let tip = if finger_roots.is_empty() {
            let elbow_position = self.position(&elbow_name).unwrap_or(wrist_position);
            wrist_position + (wrist_position - elbow_position) * 0.5
        } else {
            finger_roots.iter().sum::<Vector3<f32>>() / finger_roots.len() as f32
        };
        self.add(
            Bone::new(side.name("手首先"), tip)
                .with_parent(Some(wrist))
                .hidden(),
            Some(Placement::After(wrist)),
        )?;
        Ok(())
    }

    /// Twist bone between `from` and `to`, three fractional followers, and
    /// `to` reparented under the twist bone.
    fn twist_family(&mut self, side: Side, from: &str, to: &str, twist: &str) -> ConvertResult<()> {
        let twist_name = side.name(twist);
        let (Some(start), Some(end)) = (self.index(from), self.index(to)) else {
            self.skipped(&twist_name, to);
            return Ok(());
        };
        let start_position = self.position(from).unwrap_or_default();
        let end_position = self.position(to).unwrap_or_default();
        let span = end_position - start_position;

        let mut bone = Bone::new(twist_name.clone(), midpoint(start_position, end_position))
            .with_parent(Some(start));
        if let Some((x, z)) = local_axes(span) {
            bone.set_fixed_axis(x);
            bone.set_local_axes(x, z);
        }
        let twist_bone = self.add(bone, Some(Placement::After(start)))?;

        for (step, ratio) in TWIST_RATIOS.iter().enumerate() {
            let follower = self.add(
                Bone::new(format!("{twist_name}{}", step + 1), start_position + span * *ratio)
                    .with_parent(Some(start))
                    .hidden(),
                Some(Placement::After(start)),
            )?;
            self.set_effect(follower, Some(twist_bone), *ratio);
        }
        self.reparent(Some(end), Some(twist_bone));
        Ok(())
    }

    fn leg(&mut self, side: Side) -> ConvertResult<()> {
        let leg_name = side.name("足");
        let knee_name = side.name("ひざ");
        let ankle_name = side.name("足首");
        let toe_name = side.name("つま先");
        let (Some(leg), Some(knee), Some(ankle)) = (
            self.index(&leg_name),
            self.index(&knee_name),
            self.index(&ankle_name),
        ) else {
            self.skipped(&side.name("足ＩＫ"), &ankle_name);
            return Ok(());
        };
        let toe = self.index(&toe_name);
        let ankle_position = self.position(&ankle_name).unwrap_or_default();

        let waist = self.index(WAIST);
        let lower = self.index(LOWER);
        if waist.is_some() {
            let cancel = self.add(
                Bone::new(side.waist_cancel(), self.position(&leg_name).unwrap_or_default())
                    .with_parent(lower)
                    .hidden(),
                Some(Placement::Before(leg)),
            )?;
            self.set_effect(cancel, waist, -1.0);
            self.reparent(Some(leg), Some(cancel));
        } else {
            self.skipped(&side.waist_cancel(), WAIST);
        }

        let toe_tail = match toe {
            Some(toe) => {
                let position = on_floor(self.position(&toe_name).unwrap_or_default());
                let tail = self.add(
                    Bone::new(side.name("つま先先"), position)
                        .with_parent(Some(toe))
                        .hidden(),
                    Some(Placement::After(toe)),
                )?;
                let heel = on_floor(ankle_position + (ankle_position - position) * HEEL_RATIO);
                self.add(
                    Bone::new(side.name("かかと"), heel)
                        .with_parent(Some(ankle))
                        .hidden(),
                    Some(Placement::After(ankle)),
                )?;
                Some((tail, position))
            }
            None => {
                self.skipped(&side.name("つま先先"), &toe_name);
                None
            }
        };

        // D-chain follows the primary chain through external rotation.
        let leg_parent = self.model.bones.get(leg).and_then(|bone| bone.parent);
        let mut parent = leg_parent;
        for (source, name) in [
            (Some(leg), side.name("足D")),
            (Some(knee), side.name("ひざD")),
            (Some(ankle), side.name("足首D")),
            (toe, side.name("足先EX")),
        ] {
            let Some(source) = source else {
                continue;
            };
            let position = self.model.bones.get(source).map(|bone| bone.position).unwrap_or_default();
            let follower = self.add(Bone::new(name, position).with_parent(parent), None)?;
            self.set_effect(follower, Some(source), 1.0);
            parent = Some(follower);
        }

        let root = self.index(ROOT);
        let ik_parent = self.add(
            Bone::new(side.name("足IK親"), on_floor(ankle_position))
                .with_parent(root)
                .with_flags(BoneFlags::TRANSLATE),
            None,
        )?;
        let mut leg_ik = Bone::new(side.name("足ＩＫ"), ankle_position)
            .with_parent(Some(ik_parent))
            .with_flags(BoneFlags::TRANSLATE);
        leg_ik.set_tail_offset(Vector3::new(0.0, 0.0, 1.0));
        leg_ik.set_ik(Ik {
            target: ankle,
            loop_count: LEG_IK_LOOPS,
            unit_angle: LEG_IK_UNIT,
            links: vec![
                IkLink {
                    bone: knee,
                    angle_limit: Some((
                        Vector3::new(-PI, 0.0, 0.0),
                        Vector3::new(KNEE_MAX_BEND.to_radians(), 0.0, 0.0),
                    )),
                },
                IkLink { bone: leg, angle_limit: None },
            ],
        });
        let leg_ik = self.add(leg_ik, None)?;

        if let Some((toe_tail, position)) = toe_tail {
            let mut toe_ik = Bone::new(side.name("つま先ＩＫ"), position)
                .with_parent(Some(leg_ik))
                .with_flags(BoneFlags::TRANSLATE);
            toe_ik.set_tail_offset(Vector3::new(0.0, -1.0, 0.0));
            toe_ik.set_ik(Ik {
                target: toe_tail,
                loop_count: TOE_IK_LOOPS,
                unit_angle: TOE_IK_UNIT,
                links: vec![IkLink { bone: ankle, angle_limit: None }],
            });
            self.add(toe_ik, None)?;
        }
        Ok(())
    }

    /// Hang every remaining top-level bone under the root.
    fn normalize_roots(&mut self) {
        let Some(root) = self.index(ROOT) else {
            return;
        };
        let center = self.index(CENTER);
        let groove = self.index(GROOVE);
        self.reparent(center, Some(root));
        self.reparent(groove, center);

        let orphans: Vec<usize> = self
            .model
            .bones
            .iter()
            .enumerate()
            .filter(|(index, bone)| *index != root && bone.parent.is_none())
            .map(|(index, _)| index)
            .collect();
        for orphan in orphans {
            self.reparent(Some(orphan), Some(root));
        }
    }
}

// ─── Weights ──────────────────────────────────────────────────────────────────

fn transfer_leg_weights(model: &mut PmxModel) {
    let mut moves = HashMap::new();
    for side in Side::BOTH {
        for (source, target) in [("足", "足D"), ("ひざ", "ひざD"), ("足首", "足首D"), ("つま先", "足先EX")] {
            if let (Some(source), Some(target)) = (
                model.bones.index_of(&side.name(source)),
                model.bones.index_of(&side.name(target)),
            ) {
                moves.insert(source, target);
            }
        }
    }
    if moves.is_empty() {
        return;
    }
    for vertex in &mut model.vertices {
        vertex
            .deform
            .remap_bones(|bone| moves.get(&bone).copied().unwrap_or(bone));
    }
}

// ─── Display frames ───────────────────────────────────────────────────────────

const FRAMES: [(&str, &str); 7] = [
    ("センター", "Center"),
    ("体(上)", "Upper"),
    ("体(下)", "Lower"),
    ("腕", "Arm"),
    ("指", "Finger"),
    ("足", "Leg"),
    ("その他", "Other"),
];

fn frame_of(name: &str) -> usize {
    let base = name
        .strip_prefix('左')
        .or_else(|| name.strip_prefix('右'))
        .unwrap_or(name);
    match base {
        CENTER | GROOVE => 0,
        UPPER | UPPER2 | "上半身3" | NECK_ROOT | "首" | "頭" | EYES | "目" => 1,
        WAIST | LOWER => 2,
        _ if base.contains('指') => 4,
        _ if ["肩", "腕", "ひじ", "手"].iter().any(|part| base.starts_with(part)) => 3,
        _ if ["足", "ひざ", "つま先"].iter().any(|part| base.starts_with(part)) => 5,
        _ => 6,
    }
}

fn build_display_slots(model: &mut PmxModel) {
    let root = model.bones.index_of(ROOT);
    let mut frames = vec![Vec::new(); FRAMES.len()];
    for (index, bone) in model.bones.iter().enumerate() {
        if Some(index) == root || bone.is_system || !bone.flags.contains(BoneFlags::VISIBLE) {
            continue;
        }
        frames[frame_of(&bone.name)].push(index);
    }

    let mut slots = vec![
        DisplaySlot {
            name: "Root".to_string(),
            english_name: "Root".to_string(),
            special: true,
            references: root.map(DisplayRef::Bone).into_iter().collect(),
        },
        DisplaySlot {
            name: "表情".to_string(),
            english_name: "Exp".to_string(),
            special: true,
            references: (0..model.morphs.len()).map(DisplayRef::Morph).collect(),
        },
    ];
    let mut assignments = Vec::new();
    if let Some(root) = root {
        assignments.push((root, 0));
    }
    for ((name, english_name), bones) in FRAMES.iter().zip(frames) {
        if bones.is_empty() {
            continue;
        }
        let slot = slots.len();
        assignments.extend(bones.iter().map(|bone| (*bone, slot)));
        slots.push(DisplaySlot {
            name: name.to_string(),
            english_name: english_name.to_string(),
            special: false,
            references: bones.into_iter().map(DisplayRef::Bone).collect(),
        });
    }

    for (bone, slot) in assignments {
        if let Some(bone) = model.bones.get_mut(bone) {
            bone.display_slot = Some(slot);
        }
    }
    model.display_slots = slots;
}
