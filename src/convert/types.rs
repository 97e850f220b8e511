use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::pmx::writer::TextEncoding;

// ─── Source model classification ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VrmVersion {
    V0,
    V1,
}

impl fmt::Display for VrmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VrmVersion::V0 => f.write_str("0.x"),
            VrmVersion::V1 => f.write_str("1.0"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Profile {
    VRoid,
    Standard,
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Profile::VRoid => f.write_str("VRoid"),
            Profile::Standard => f.write_str("standard"),
        }
    }
}

// ─── Options / report ─────────────────────────────────────────────────────────

/// Conversion options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertOptions {
    /// Output PMX path. Defaults to `{input_dir}/{stem}_{timestamp}/{stem}.pmx`.
    pub output_path: Option<PathBuf>,
    pub text_encoding: TextEncoding,
    pub reorder_materials: bool,
    /// Only takes effect for VRoid models.
    pub apply_a_stance: bool,
    pub rename_morphs: bool,
    /// Write the raw `.gltf`/`.bin` pair under `glTF/`.
    pub export_gltf: bool,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            output_path: None,
            text_encoding: TextEncoding::Utf16Le,
            reorder_materials: true,
            apply_a_stance: true,
            rename_morphs: true,
            export_gltf: true,
        }
    }
}

/// Summary of one conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub model_name: String,
    pub vrm_version: VrmVersion,
    pub profile: Profile,
    pub bone_count: usize,
    pub vertex_count: usize,
    pub face_count: usize,
    pub material_count: usize,
    pub morph_count: usize,
    pub texture_count: usize,
    /// `(source name, canonical name)` for every renamed humanoid bone.
    pub renamed_bones: Vec<(String, String)>,
    pub inserted_bones: usize,
    pub renamed_morphs: usize,
    pub materials_reordered: bool,
    pub a_stance_applied: bool,
    pub output_path: PathBuf,
    pub written: bool,
}

// ─── Bone name constants ──────────────────────────────────────────────────────

/// VRM humanoid bone → canonical MMD bone name, shared by both VRM versions.
pub(super) const HUMANOID_BONE_MAP: [(&str, &str); 48] = [
    ("hips", "下半身"),
    ("spine", "上半身"),
    ("chest", "上半身2"),
    ("upperChest", "上半身3"),
    ("neck", "首"),
    ("head", "頭"),
    ("leftEye", "左目"),
    ("rightEye", "右目"),
    ("leftShoulder", "左肩"),
    ("leftUpperArm", "左腕"),
    ("leftLowerArm", "左ひじ"),
    ("leftHand", "左手首"),
    ("rightShoulder", "右肩"),
    ("rightUpperArm", "右腕"),
    ("rightLowerArm", "右ひじ"),
    ("rightHand", "右手首"),
    ("leftUpperLeg", "左足"),
    ("leftLowerLeg", "左ひざ"),
    ("leftFoot", "左足首"),
    ("leftToes", "左つま先"),
    ("rightUpperLeg", "右足"),
    ("rightLowerLeg", "右ひざ"),
    ("rightFoot", "右足首"),
    ("rightToes", "右つま先"),
    ("leftIndexProximal", "左人指１"),
    ("leftIndexIntermediate", "左人指２"),
    ("leftIndexDistal", "左人指３"),
    ("leftMiddleProximal", "左中指１"),
    ("leftMiddleIntermediate", "左中指２"),
    ("leftMiddleDistal", "左中指３"),
    ("leftRingProximal", "左薬指１"),
    ("leftRingIntermediate", "左薬指２"),
    ("leftRingDistal", "左薬指３"),
    ("leftLittleProximal", "左小指１"),
    ("leftLittleIntermediate", "左小指２"),
    ("leftLittleDistal", "左小指３"),
    ("rightIndexProximal", "右人指１"),
    ("rightIndexIntermediate", "右人指２"),
    ("rightIndexDistal", "右人指３"),
    ("rightMiddleProximal", "右中指１"),
    ("rightMiddleIntermediate", "右中指２"),
    ("rightMiddleDistal", "右中指３"),
    ("rightRingProximal", "右薬指１"),
    ("rightRingIntermediate", "右薬指２"),
    ("rightRingDistal", "右薬指３"),
    ("rightLittleProximal", "右小指１"),
    ("rightLittleIntermediate", "右小指２"),
    ("rightLittleDistal", "右小指３"),
];

/// VRM 1.0 thumb chain (metacarpal/proximal/distal).
pub(super) const THUMB_MAP_V1: [(&str, &str); 6] = [
    ("leftThumbMetacarpal", "左親指０"),
    ("leftThumbProximal", "左親指１"),
    ("leftThumbDistal", "左親指２"),
    ("rightThumbMetacarpal", "右親指０"),
    ("rightThumbProximal", "右親指１"),
    ("rightThumbDistal", "右親指２"),
];

/// VRM 0.x thumb chain (proximal/intermediate/distal).
pub(super) const THUMB_MAP_V0: [(&str, &str); 6] = [
    ("leftThumbProximal", "左親指０"),
    ("leftThumbIntermediate", "左親指１"),
    ("leftThumbDistal", "左親指２"),
    ("rightThumbProximal", "右親指０"),
    ("rightThumbIntermediate", "右親指１"),
    ("rightThumbDistal", "右親指２"),
];

/// Canonical MMD name for a VRM humanoid bone name.
pub(super) fn canonical_bone_name(version: VrmVersion, humanoid: &str) -> Option<&'static str> {
    let thumbs: &[(&str, &str)] = match version {
        VrmVersion::V0 => &THUMB_MAP_V0,
        VrmVersion::V1 => &THUMB_MAP_V1,
    };
    thumbs
        .iter()
        .chain(HUMANOID_BONE_MAP.iter())
        .find(|(source, _)| *source == humanoid)
        .map(|(_, canonical)| *canonical)
}

/// Humanoid slots whose vertices count as "body" for material reorder.
pub(crate) const BODY_HUMANOID_BONES: [&str; 5] = ["hips", "spine", "chest", "upperChest", "neck"];
