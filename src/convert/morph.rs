use std::collections::{HashMap, HashSet};

use crate::{
    error::ConvertResult,
    pmx::{MorphPanel, PmxModel},
    progress::{ProgressEvent, ProgressReporter},
};

const PROGRESS_CHUNK: usize = 25;

const BROW: MorphPanel = MorphPanel::EyebrowLowerLeft;
const EYE: MorphPanel = MorphPanel::EyeUpperLeft;
const LIP: MorphPanel = MorphPanel::LipUpperRight;
const OTHER: MorphPanel = MorphPanel::OtherLowerRight;

/// Source morph name → (MMD morph name, panel). Covers the VRoid `Fcl_*`
/// blend shapes, VRM 0.x preset names and the ARKit face set.
const MORPH_DICTIONARY: &[(&str, &str, MorphPanel)] = &[
    // VRoid whole-face
    ("Fcl_ALL_Angry", "怒", OTHER),
    ("Fcl_ALL_Fun", "楽", OTHER),
    ("Fcl_ALL_Joy", "喜", OTHER),
    ("Fcl_ALL_Sorrow", "哀", OTHER),
    ("Fcl_ALL_Surprised", "驚", OTHER),
    // VRoid brows
    ("Fcl_BRW_Angry", "怒り", BROW),
    ("Fcl_BRW_Fun", "上", BROW),
    ("Fcl_BRW_Joy", "にこり", BROW),
    ("Fcl_BRW_Sorrow", "困る", BROW),
    ("Fcl_BRW_Surprised", "驚き眉", BROW),
    // VRoid eyes
    ("Fcl_EYE_Angry", "ｷﾘｯ", EYE),
    ("Fcl_EYE_Close", "まばたき", EYE),
    ("Fcl_EYE_Close_L", "ウィンク２", EYE),
    ("Fcl_EYE_Close_R", "ｳｨﾝｸ２右", EYE),
    ("Fcl_EYE_Fun", "笑い目", EYE),
    ("Fcl_EYE_Joy", "笑い", EYE),
    ("Fcl_EYE_Joy_L", "ウィンク", EYE),
    ("Fcl_EYE_Joy_R", "ウィンク右", EYE),
    ("Fcl_EYE_Sorrow", "悲しい目", EYE),
    ("Fcl_EYE_Surprised", "びっくり", EYE),
    ("Fcl_EYE_Spread", "見開き", EYE),
    ("Fcl_EYE_Iris_Hide", "瞳小", EYE),
    ("Fcl_EYE_Highlight_Hide", "ハイライト消し", EYE),
    // VRoid mouth
    ("Fcl_MTH_A", "あ", LIP),
    ("Fcl_MTH_I", "い", LIP),
    ("Fcl_MTH_U", "う", LIP),
    ("Fcl_MTH_E", "え", LIP),
    ("Fcl_MTH_O", "お", LIP),
    ("Fcl_MTH_Close", "ん", LIP),
    ("Fcl_MTH_Up", "口角上げ", LIP),
    ("Fcl_MTH_Down", "口角下げ", LIP),
    ("Fcl_MTH_Angry", "∧", LIP),
    ("Fcl_MTH_Fun", "ワ", LIP),
    ("Fcl_MTH_Joy", "にやり", LIP),
    ("Fcl_MTH_Sorrow", "▲", LIP),
    ("Fcl_MTH_Surprised", "□", LIP),
    ("Fcl_HA_Fung1", "八重歯", OTHER),
    // VRM 0.x presets
    ("A", "あ", LIP),
    ("I", "い", LIP),
    ("U", "う", LIP),
    ("E", "え", LIP),
    ("O", "お", LIP),
    ("Blink", "まばたき", EYE),
    ("Blink_L", "ウィンク２", EYE),
    ("Blink_R", "ｳｨﾝｸ２右", EYE),
    ("Joy", "喜", OTHER),
    ("Angry", "怒", OTHER),
    ("Sorrow", "哀", OTHER),
    ("Fun", "楽", OTHER),
    // ARKit
    ("eyeBlinkLeft", "まばたき左", EYE),
    ("eyeBlinkRight", "まばたき右", EYE),
    ("eyeWideLeft", "見開き左", EYE),
    ("eyeWideRight", "見開き右", EYE),
    ("eyeSquintLeft", "細目左", EYE),
    ("eyeSquintRight", "細目右", EYE),
    ("browInnerUp", "眉頭上", BROW),
    ("browDownLeft", "眉下左", BROW),
    ("browDownRight", "眉下右", BROW),
    ("browOuterUpLeft", "眉尻上左", BROW),
    ("browOuterUpRight", "眉尻上右", BROW),
    ("jawOpen", "あ２", LIP),
    ("jawForward", "顎前", LIP),
    ("jawLeft", "顎左", LIP),
    ("jawRight", "顎右", LIP),
    ("mouthClose", "ん２", LIP),
    ("mouthFunnel", "お２", LIP),
    ("mouthPucker", "う２", LIP),
    ("mouthLeft", "口左", LIP),
    ("mouthRight", "口右", LIP),
    ("mouthSmileLeft", "口角上げ左", LIP),
    ("mouthSmileRight", "口角上げ右", LIP),
    ("mouthFrownLeft", "口角下げ左", LIP),
    ("mouthFrownRight", "口角下げ右", LIP),
    ("mouthRollUpper", "上唇巻き", LIP),
    ("mouthRollLower", "下唇巻き", LIP),
    ("cheekPuff", "ぷくー", OTHER),
    ("tongueOut", "べー", LIP),
];

struct RenamePlan {
    entries: Vec<(usize, &'static str, MorphPanel)>,
}

fn plan_renames(model: &PmxModel) -> RenamePlan {
    let dictionary: HashMap<&str, (&'static str, MorphPanel)> = MORPH_DICTIONARY
        .iter()
        .map(|(source, canonical, panel)| (*source, (*canonical, *panel)))
        .collect();

    let candidates: Vec<(usize, &'static str, MorphPanel)> = model
        .morphs
        .iter()
        .enumerate()
        .filter_map(|(index, morph)| {
            let (canonical, panel) = dictionary.get(morph.name.as_str())?;
            (morph.name != *canonical).then_some((index, *canonical, *panel))
        })
        .collect();

    let mut claims = HashMap::<&str, usize>::new();
    for (_, canonical, _) in &candidates {
        *claims.entry(*canonical).or_default() += 1;
    }
    let sources: HashSet<usize> = candidates.iter().map(|(index, _, _)| *index).collect();
    let held: HashMap<&str, usize> = model
        .morphs
        .iter()
        .enumerate()
        .map(|(index, morph)| (morph.name.as_str(), index))
        .collect();

    let entries = candidates
        .into_iter()
        .filter(|(index, canonical, _)| {
            if claims[canonical] > 1 {
                log::warn!("morph {index} -> '{canonical}' skipped: several morphs map to it");
                return false;
            }
            if let Some(holder) = held.get(canonical)
                && !sources.contains(holder)
            {
                log::warn!("morph {index} -> '{canonical}' skipped: name is taken by morph {holder}");
                return false;
            }
            true
        })
        .collect();
    RenamePlan { entries }
}

/// Rename known expression morphs to their MMD names and sort them into
/// the MMD panels. Returns the number of renamed morphs.
pub(crate) fn rename_morphs(
    model: &mut PmxModel,
    reporter: &mut dyn ProgressReporter,
) -> ConvertResult<usize> {
    let plan = plan_renames(model);
    let total = model.morphs.len();
    reporter.report(ProgressEvent::MorphRenamePlanned {
        targets: total,
        mappings: MORPH_DICTIONARY.len(),
        planned: plan.entries.len(),
    });

    let mut counter = 0usize;
    for (index, _, _) in &plan.entries {
        let temporary = loop {
            let candidate = format!("__tmp_{counter:03}");
            counter += 1;
            if model.morph_index(&candidate).is_none() {
                break candidate;
            }
        };
        model.morphs[*index].name = temporary;
    }

    let targets: HashMap<usize, (&'static str, MorphPanel)> = plan
        .entries
        .iter()
        .map(|(index, canonical, panel)| (*index, (*canonical, *panel)))
        .collect();
    let mut renamed = 0;
    for index in 0..total {
        if let Some((canonical, panel)) = targets.get(&index) {
            let morph = &mut model.morphs[index];
            morph.name = canonical.to_string();
            morph.english_name = canonical.to_string();
            morph.panel = *panel;
            renamed += 1;
        }
        let processed = index + 1;
        if processed % PROGRESS_CHUNK == 0 || processed == total {
            reporter.report(ProgressEvent::MorphRenameProcessed { processed, total });
        }
    }

    reporter.report(ProgressEvent::MorphRenameCompleted);
    log::info!("renamed {renamed} of {total} morphs");
    Ok(renamed)
}
