use std::collections::{BTreeSet, HashMap};

use bitflags::bitflags;
use nalgebra::Vector3;

use crate::error::{ConvertError, ConvertResult};

bitflags! {
    /// Bone capability flags. Serialized to the PMX bit layout by the writer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BoneFlags: u16 {
        const TAIL_IS_BONE = 0x0001;
        const ROTATE = 0x0002;
        const TRANSLATE = 0x0004;
        const VISIBLE = 0x0008;
        const MANIPULATE = 0x0010;
        const IK = 0x0020;
        const EXTERNAL_ROTATION = 0x0100;
        const FIXED_AXIS = 0x0400;
        const LOCAL_AXIS = 0x0800;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BoneTail {
    Bone(Option<usize>),
    Offset(Vector3<f32>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalAxes {
    pub x: Vector3<f32>,
    pub z: Vector3<f32>,
}

/// External-rotation link ("付与"): the bone receives `factor` of the
/// effect parent's rotation.
#[derive(Debug, Clone, PartialEq)]
pub struct Effect {
    pub parent: usize,
    pub factor: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IkLink {
    pub bone: usize,
    /// `(min, max)` Euler limits in radians.
    pub angle_limit: Option<(Vector3<f32>, Vector3<f32>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Ik {
    pub target: usize,
    pub loop_count: u32,
    /// Per-iteration rotation limit in radians.
    pub unit_angle: f32,
    pub links: Vec<IkLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bone {
    pub name: String,
    pub english_name: String,
    pub position: Vector3<f32>,
    pub parent: Option<usize>,
    pub tail: BoneTail,
    pub flags: BoneFlags,
    pub fixed_axis: Option<Vector3<f32>>,
    pub local_axes: Option<LocalAxes>,
    pub effect: Option<Effect>,
    pub ik: Option<Ik>,
    pub display_slot: Option<usize>,
    pub layer: i32,
    pub is_system: bool,
}

impl Bone {
    pub fn new(name: impl Into<String>, position: Vector3<f32>) -> Self {
        Self {
            name: name.into(),
            english_name: String::new(),
            position,
            parent: None,
            tail: BoneTail::Offset(Vector3::zeros()),
            flags: BoneFlags::ROTATE | BoneFlags::VISIBLE | BoneFlags::MANIPULATE,
            fixed_axis: None,
            local_axes: None,
            effect: None,
            ik: None,
            display_slot: None,
            layer: 0,
            is_system: false,
        }
    }

    pub fn with_parent(mut self, parent: Option<usize>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_flags(mut self, flags: BoneFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn system(mut self) -> Self {
        self.is_system = true;
        self
    }

    /// Not shown in the bone list and not directly manipulable.
    pub fn hidden(mut self) -> Self {
        self.flags.remove(BoneFlags::VISIBLE | BoneFlags::MANIPULATE);
        self
    }

    pub fn set_tail_bone(&mut self, bone: Option<usize>) {
        self.tail = BoneTail::Bone(bone);
        self.flags.insert(BoneFlags::TAIL_IS_BONE);
    }

    pub fn set_tail_offset(&mut self, offset: Vector3<f32>) {
        self.tail = BoneTail::Offset(offset);
        self.flags.remove(BoneFlags::TAIL_IS_BONE);
    }

    pub fn set_fixed_axis(&mut self, axis: Vector3<f32>) {
        self.fixed_axis = Some(axis);
        self.flags.insert(BoneFlags::FIXED_AXIS);
    }

    pub fn set_local_axes(&mut self, x: Vector3<f32>, z: Vector3<f32>) {
        self.local_axes = Some(LocalAxes { x, z });
        self.flags.insert(BoneFlags::LOCAL_AXIS);
    }

    pub fn set_effect(&mut self, parent: usize, factor: f32) {
        self.effect = Some(Effect { parent, factor });
        self.flags.insert(BoneFlags::EXTERNAL_ROTATION);
    }

    pub fn set_ik(&mut self, ik: Ik) {
        self.ik = Some(ik);
        self.flags.insert(BoneFlags::IK);
    }

    pub fn tail_bone(&self) -> Option<usize> {
        match self.tail {
            BoneTail::Bone(bone) => bone,
            BoneTail::Offset(_) => None,
        }
    }

    fn remap(&mut self, map: &[usize]) {
        let remap = |index: usize| map.get(index).copied().unwrap_or(index);
        self.parent = self.parent.map(remap);
        if let BoneTail::Bone(Some(tail)) = &mut self.tail {
            *tail = remap(*tail);
        }
        if let Some(effect) = &mut self.effect {
            effect.parent = remap(effect.parent);
        }
        if let Some(ik) = &mut self.ik {
            ik.target = remap(ik.target);
            for link in &mut ik.links {
                link.bone = remap(link.bone);
            }
        }
    }
}

/// Where a bone should land when the collection is renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Before(usize),
    After(usize),
}

/// Ordered, name-unique bone collection.
///
/// Bones are only ever appended while the pipeline runs, so indices handed
/// out stay valid. Appends may carry a [`Placement`] hint; [`Bones::planned_order`]
/// turns the hints into the export order, which the model applies once.
#[derive(Debug, Clone, Default)]
pub struct Bones {
    items: Vec<Bone>,
    by_name: HashMap<String, usize>,
    placements: Vec<(usize, Placement)>,
}

impl Bones {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Bone> {
        self.items.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Bone> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut Bone> {
        self.items.get_mut(index)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn by_name(&self, name: &str) -> Option<&Bone> {
        self.index_of(name).and_then(|index| self.items.get(index))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Append a bone. Fails when the name is already taken.
    pub fn push(&mut self, bone: Bone) -> ConvertResult<usize> {
        if self.by_name.contains_key(&bone.name) {
            return Err(ConvertError::invalid(format!(
                "bone name '{}' already exists",
                bone.name
            )));
        }
        let index = self.items.len();
        self.by_name.insert(bone.name.clone(), index);
        self.items.push(bone);
        Ok(index)
    }

    /// Append a bone, suffixing `_{n}` to its name until it is unique.
    pub fn push_unique(&mut self, mut bone: Bone) -> usize {
        bone.name = self.unique_name(&bone.name);
        let index = self.items.len();
        self.by_name.insert(bone.name.clone(), index);
        self.items.push(bone);
        index
    }

    /// Append a bone that should be exported right before `anchor`.
    pub fn insert_before(&mut self, anchor: usize, bone: Bone) -> ConvertResult<usize> {
        let index = self.push(bone)?;
        self.placements.push((index, Placement::Before(anchor)));
        Ok(index)
    }

    /// Append a bone that should be exported right after `anchor` (after any
    /// bone previously placed after the same anchor).
    pub fn insert_after(&mut self, anchor: usize, bone: Bone) -> ConvertResult<usize> {
        let index = self.push(bone)?;
        self.placements.push((index, Placement::After(anchor)));
        Ok(index)
    }

    pub fn unique_name(&self, base: &str) -> String {
        if !self.by_name.contains_key(base) {
            return base.to_string();
        }
        (1..)
            .map(|n| format!("{base}_{n}"))
            .find(|candidate| !self.by_name.contains_key(candidate))
            .unwrap_or_else(|| base.to_string())
    }

    pub fn rename(&mut self, index: usize, new_name: &str) -> ConvertResult<()> {
        let Some(bone) = self.items.get_mut(index) else {
            return Err(ConvertError::invalid(format!(
                "bone index {index} out of range"
            )));
        };
        if bone.name == new_name {
            return Ok(());
        }
        if self.by_name.contains_key(new_name) {
            return Err(ConvertError::invalid(format!(
                "bone name '{new_name}' already exists"
            )));
        }
        self.by_name.remove(&bone.name);
        bone.name = new_name.to_string();
        self.by_name.insert(new_name.to_string(), index);
        Ok(())
    }

    /// Export order (`order[new] = old`) honouring placement hints, repaired so
    /// that every parent precedes its children.
    pub fn planned_order(&self) -> Vec<usize> {
        let placed: BTreeSet<usize> = self.placements.iter().map(|(index, _)| *index).collect();
        let mut order: Vec<usize> = (0..self.items.len())
            .filter(|index| !placed.contains(index))
            .collect();
        let mut last_after = HashMap::<usize, usize>::new();

        for (index, placement) in &self.placements {
            let position = match placement {
                Placement::Before(anchor) => order.iter().position(|i| i == anchor),
                Placement::After(anchor) => {
                    let after = last_after.get(anchor).copied().unwrap_or(*anchor);
                    order.iter().position(|i| *i == after).map(|p| p + 1)
                }
            };
            match position {
                Some(position) => order.insert(position, *index),
                None => order.push(*index),
            }
            if let Placement::After(anchor) = placement {
                last_after.insert(*anchor, *index);
            }
        }

        self.parents_first(&order)
    }

    /// Stable topological repair: emit bones in `preferred` order, deferring a
    /// bone until its parent has been emitted. Cycles fall back to preferred
    /// order for the remaining bones.
    fn parents_first(&self, preferred: &[usize]) -> Vec<usize> {
        let rank: HashMap<usize, usize> = preferred
            .iter()
            .enumerate()
            .map(|(rank, index)| (*index, rank))
            .collect();
        let mut children = vec![Vec::<usize>::new(); self.items.len()];
        let mut ready = BTreeSet::<(usize, usize)>::new();
        for &index in preferred {
            match self.items[index].parent.filter(|p| *p < self.items.len() && *p != index) {
                Some(parent) => children[parent].push(index),
                None => {
                    ready.insert((rank[&index], index));
                }
            }
        }

        let mut emitted = vec![false; self.items.len()];
        let mut order = Vec::with_capacity(self.items.len());
        loop {
            while let Some((_, index)) = ready.pop_first() {
                if emitted[index] {
                    continue;
                }
                emitted[index] = true;
                order.push(index);
                for &child in &children[index] {
                    ready.insert((rank[&child], child));
                }
            }
            let Some(&stuck) = preferred.iter().find(|index| !emitted[**index]) else {
                break;
            };
            ready.insert((rank[&stuck], stuck));
        }
        order
    }

    /// Apply a permutation (`order[new] = old`). Returns the old→new map.
    pub(crate) fn reorder(&mut self, order: &[usize]) -> ConvertResult<Vec<usize>> {
        let len = self.items.len();
        let mut old_to_new = vec![usize::MAX; len];
        if order.len() != len {
            return Err(ConvertError::invalid(format!(
                "bone order has {} entries for {} bones",
                order.len(),
                len
            )));
        }
        for (new_index, &old_index) in order.iter().enumerate() {
            if old_index >= len || old_to_new[old_index] != usize::MAX {
                return Err(ConvertError::invalid(
                    "bone order is not a permutation".to_string(),
                ));
            }
            old_to_new[old_index] = new_index;
        }

        let mut previous: Vec<Option<Bone>> = std::mem::take(&mut self.items)
            .into_iter()
            .map(Some)
            .collect();
        self.items = order
            .iter()
            .filter_map(|old_index| previous[*old_index].take())
            .collect();
        for bone in &mut self.items {
            bone.remap(&old_to_new);
        }
        self.by_name = self
            .items
            .iter()
            .enumerate()
            .map(|(index, bone)| (bone.name.clone(), index))
            .collect();
        self.placements.clear();
        Ok(old_to_new)
    }

    /// Recompute layers: parent layer + 1, or effect parent layer + 1 when an
    /// external-rotation link exists. Capped at the bone count.
    pub fn recompute_layers(&mut self) {
        let len = self.items.len();
        let mut layers: Vec<Option<i32>> = vec![None; len];
        for index in 0..len {
            Self::resolve_layer(&self.items, index, &mut layers, 0);
        }
        for (bone, layer) in self.items.iter_mut().zip(layers) {
            bone.layer = layer.unwrap_or(0);
        }
    }

    fn resolve_layer(items: &[Bone], index: usize, layers: &mut [Option<i32>], depth: usize) -> i32 {
        if let Some(layer) = layers[index] {
            return layer;
        }
        let cap = items.len() as i32;
        if depth >= items.len() {
            return cap;
        }
        let bone = &items[index];
        let base = bone
            .effect
            .as_ref()
            .map(|effect| effect.parent)
            .or(bone.parent)
            .filter(|source| *source < items.len() && *source != index);
        let layer = match base {
            Some(source) => (Self::resolve_layer(items, source, layers, depth + 1) + 1).min(cap),
            None => 0,
        };
        layers[index] = Some(layer);
        layer
    }

    pub(crate) fn validate(&self) -> ConvertResult<()> {
        let len = self.items.len();
        for (index, bone) in self.items.iter().enumerate() {
            if let Some(parent) = bone.parent
                && (parent >= len || parent == index)
            {
                return Err(ConvertError::invalid(format!(
                    "bone '{}' has invalid parent {}",
                    bone.name, parent
                )));
            }
            if bone.tail_bone().is_some_and(|tail| tail >= len) {
                return Err(ConvertError::invalid(format!(
                    "bone '{}' tail is out of range",
                    bone.name
                )));
            }
            if bone.effect.as_ref().is_some_and(|effect| effect.parent >= len) {
                return Err(ConvertError::invalid(format!(
                    "bone '{}' effect parent is out of range",
                    bone.name
                )));
            }
            if let Some(ik) = &bone.ik
                && (ik.target >= len || ik.links.iter().any(|link| link.bone >= len))
            {
                return Err(ConvertError::invalid(format!(
                    "bone '{}' IK references a missing bone",
                    bone.name
                )));
            }
        }
        if self.by_name.len() != len {
            return Err(ConvertError::invalid("bone names are not unique".to_string()));
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Bones {
    type Item = &'a Bone;
    type IntoIter = std::slice::Iter<'a, Bone>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bone(name: &str, parent: Option<usize>) -> Bone {
        Bone::new(name, Vector3::zeros()).with_parent(parent)
    }

    #[test]
    fn given_duplicate_name_when_pushing_then_model_invalid_is_returned() {
        let mut bones = Bones::default();
        bones.push(bone("a", None)).unwrap();

        assert!(matches!(
            bones.push(bone("a", None)),
            Err(ConvertError::ModelInvalid(_))
        ));
        assert_eq!(bones.push_unique(bone("a", None)), 1);
        assert_eq!(bones.get(1).unwrap().name, "a_1");
    }

    #[test]
    fn given_rename_to_taken_name_when_renaming_then_error_and_index_unchanged() {
        let mut bones = Bones::default();
        bones.push(bone("a", None)).unwrap();
        bones.push(bone("b", Some(0))).unwrap();

        assert!(bones.rename(1, "a").is_err());
        bones.rename(1, "c").unwrap();
        assert_eq!(bones.index_of("c"), Some(1));
        assert_eq!(bones.index_of("b"), None);
    }

    #[test]
    fn given_placements_when_planning_order_then_bones_land_next_to_anchors() {
        let mut bones = Bones::default();
        let hips = bones.push(bone("hips", None)).unwrap();
        let spine = bones.push(bone("spine", Some(hips))).unwrap();
        let root = bones.insert_before(hips, bone("root", None)).unwrap();
        let center = bones.insert_before(hips, bone("center", Some(root))).unwrap();
        bones.get_mut(hips).unwrap().parent = Some(center);
        let first = bones.insert_after(spine, bone("x1", Some(spine))).unwrap();
        let second = bones.insert_after(spine, bone("x2", Some(spine))).unwrap();

        assert_eq!(
            bones.planned_order(),
            vec![root, center, hips, spine, first, second]
        );
    }

    #[test]
    fn given_child_before_parent_when_planning_order_then_parent_is_moved_first() {
        let mut bones = Bones::default();
        bones.push(bone("child", Some(1))).unwrap();
        bones.push(bone("parent", None)).unwrap();

        assert_eq!(bones.planned_order(), vec![1, 0]);
    }

    #[test]
    fn given_permutation_when_reordering_then_links_are_remapped() {
        let mut bones = Bones::default();
        bones.push(bone("child", Some(1))).unwrap();
        bones.push(bone("parent", None)).unwrap();
        bones.get_mut(0).unwrap().set_effect(1, 0.5);

        let old_to_new = bones.reorder(&[1, 0]).unwrap();

        assert_eq!(old_to_new, vec![1, 0]);
        assert_eq!(bones.get(1).unwrap().parent, Some(0));
        assert_eq!(bones.get(1).unwrap().effect.as_ref().unwrap().parent, 0);
        assert_eq!(bones.index_of("child"), Some(1));
        assert!(bones.validate().is_ok());
    }

    #[test]
    fn given_effect_link_when_recomputing_layers_then_effect_parent_wins() {
        let mut bones = Bones::default();
        bones.push(bone("root", None)).unwrap();
        bones.push(bone("leg", Some(0))).unwrap();
        bones.push(bone("knee", Some(1))).unwrap();
        let mut leg_d = bone("legD", Some(0));
        leg_d.set_effect(2, 1.0);
        bones.push(leg_d).unwrap();

        bones.recompute_layers();

        let layers: Vec<i32> = bones.iter().map(|b| b.layer).collect();
        assert_eq!(layers, vec![0, 1, 2, 3]);
    }
}
