use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use crate::{
    convert::{
        BODY_HUMANOID_BONES, ConversionReport, ConvertOptions, Profile, default_output_path,
        document::Document,
        glb::{Glb, parse_glb},
        gltf_utils::AccessorReader,
        humanoid::map_humanoid,
        layout::{OutputLayout, file_stem, prepare_output},
        material::prepare_vroid_materials,
        mesh::build_meshes,
        morph::rename_morphs,
        reorder::reorder_materials,
        scene::{Conversion, SceneGraph, VrmMeta, build_scene_graph, detect_vrm},
        skeleton::build_skeleton,
        stance::apply_a_stance,
    },
    error::{ConvertError, PipelineError, Stage, StageExt},
    pmx::{
        PmxModel,
        writer::{WriteOptions, write_pmx},
    },
    progress::{ProgressEvent, ProgressReporter},
    texture::TextureAlphaCache,
};

/// A decoded VRM ready for conversion.
#[derive(Debug)]
pub struct LoadedModel {
    input: PathBuf,
    output: PathBuf,
    glb: Glb,
    document: Document,
    scene: SceneGraph,
    meta: VrmMeta,
    options: ConvertOptions,
}

impl LoadedModel {
    pub fn input_path(&self) -> &Path {
        &self.input
    }

    pub fn output_path(&self) -> &Path {
        &self.output
    }
}

/// A converted PMX model held in memory, not yet written.
#[derive(Debug)]
pub struct PreparedModel {
    model: PmxModel,
    report: ConversionReport,
    options: ConvertOptions,
}

impl PreparedModel {
    pub fn model(&self) -> &PmxModel {
        &self.model
    }

    pub fn report(&self) -> &ConversionReport {
        &self.report
    }
}

fn has_vrm_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("vrm"))
}

fn validate_input(input: &Path) -> Result<(), ConvertError> {
    if !has_vrm_extension(input) {
        return Err(ConvertError::ExtInvalid {
            path: input.to_path_buf(),
        });
    }
    if !input.is_file() {
        return Err(ConvertError::FileNotFound {
            path: input.to_path_buf(),
        });
    }
    Ok(())
}

/// Validate the input, resolve the output path and decode the VRM.
///
/// # Arguments
///
/// * `input` - Source `.vrm` path.
/// * `options` - Conversion options; `output_path` is resolved here.
/// * `reporter` - Progress sink.
///
/// # Errors
///
/// `ExtInvalid`/`FileNotFound` at the input stage, `ParseFailed` or
/// `FormatUnsupported` while decoding the GLB and the VRM extension.
pub fn load_model(
    input: &Path,
    options: &ConvertOptions,
    reporter: &mut dyn ProgressReporter,
) -> Result<LoadedModel, PipelineError> {
    validate_input(input).at(Stage::Input)?;
    reporter.report(ProgressEvent::InputValidated);

    let output = options
        .output_path
        .clone()
        .unwrap_or_else(|| default_output_path(input));
    log::debug!("output path: {}", output.display());
    reporter.report(ProgressEvent::OutputPathResolved);

    let bytes = fs::read(input)
        .map_err(|err| ConvertError::io(input, err))
        .at(Stage::Decode)?;
    let glb = parse_glb(&bytes).at(Stage::Decode)?;
    let document = Document::from_slice(&glb.json)
        .map_err(|err| ConvertError::parse(format!("glTF JSON: {err}")))
        .at(Stage::Decode)?;
    let scene = build_scene_graph(&document).at(Stage::Scene)?;
    let meta = detect_vrm(&document).at(Stage::Scene)?;
    log::info!(
        "loaded {} (VRM {}, {} profile, {} nodes)",
        input.display(),
        meta.version,
        meta.profile,
        document.nodes.len()
    );
    reporter.report(ProgressEvent::ModelValidated);

    Ok(LoadedModel {
        input: input.to_path_buf(),
        output,
        glb,
        document,
        scene,
        meta,
        options: options.clone(),
    })
}

fn new_model(loaded: &LoadedModel) -> PmxModel {
    let stem = file_stem(&loaded.input);
    let mut model = PmxModel::new(loaded.meta.title.clone().unwrap_or_else(|| stem.clone()));
    model.english_name = stem;
    let mut comment = format!("VRM {} ({})", loaded.meta.version, loaded.meta.profile);
    if let Some(author) = &loaded.meta.author {
        comment.push_str(&format!("\nauthor: {author}"));
    }
    if let Some(generator) = &loaded.meta.generator {
        comment.push_str(&format!("\ngenerator: {generator}"));
    }
    model.english_comment = comment.clone();
    model.comment = comment;
    model
}

/// Run every conversion stage and return the in-memory PMX model.
///
/// Stage order: skeleton, output layout, mesh, material reorder, humanoid
/// mapping, stance transfer, morph rename. The output directory and its
/// `tex/`/`glTF/` content are written here; the PMX itself is written by
/// [`save_model`].
///
/// # Errors
///
/// The first stage failure, labelled with its stage.
pub fn prepare_model(
    loaded: LoadedModel,
    reporter: &mut dyn ProgressReporter,
) -> Result<PreparedModel, PipelineError> {
    let meta = &loaded.meta;
    let options = &loaded.options;
    let conversion = Conversion::for_model(meta.version, meta.profile);
    let mut model = new_model(&loaded);

    build_skeleton(&loaded.document, &loaded.scene, &conversion, &mut model).at(Stage::Skeleton)?;

    let layout = OutputLayout::for_output(&loaded.output);
    let image_textures = prepare_output(
        &layout,
        &loaded.glb,
        &loaded.document,
        &loaded.input,
        options.export_gltf,
        &mut model,
    )
    .at(Stage::Layout)?;
    reporter.report(ProgressEvent::LayoutPrepared);
    model.path = Some(loaded.output.clone());
    reporter.report(ProgressEvent::ModelPathApplied);

    let mut reader = AccessorReader::new(&loaded.document, loaded.glb.bin());
    let meshes = build_meshes(
        &loaded.document,
        &mut reader,
        &loaded.scene,
        &conversion,
        &image_textures,
        &mut model,
    )
    .at(Stage::Mesh)?;
    if meshes.skipped_primitives > 0 {
        log::warn!("{} primitives were skipped", meshes.skipped_primitives);
    }

    if meta.profile == Profile::VRoid {
        prepare_vroid_materials(&mut model, &meshes.material_sources, &loaded.document, meta);
    }
    reporter.report(ProgressEvent::VroidMaterialPrepared);

    let materials_reordered = if options.reorder_materials {
        let mut alpha = TextureAlphaCache::new();
        for (index, texture) in model.textures.iter().enumerate() {
            alpha.insert_source(index, layout.root.join(&texture.name));
        }
        let body_bones: HashSet<usize> = BODY_HUMANOID_BONES
            .iter()
            .filter_map(|bone| meta.humanoid_node(bone))
            .collect();
        reorder_materials(&mut model, &body_bones, &mut alpha).at(Stage::MaterialReorder)?
    } else {
        false
    };
    reporter.report(ProgressEvent::ReorderCompleted);

    let humanoid = map_humanoid(&mut model, meta).at(Stage::HumanoidMap)?;
    reporter.report(ProgressEvent::BoneMappingCompleted);

    let a_stance_applied = meta.profile == Profile::VRoid && options.apply_a_stance;
    if a_stance_applied {
        apply_a_stance(&mut model).at(Stage::StanceTransfer)?;
    }
    reporter.report(ProgressEvent::AStanceCompleted);

    let renamed_morphs = if options.rename_morphs {
        if meta.has_expressions {
            log::debug!("source declares expressions; renaming morphs anyway");
        }
        rename_morphs(&mut model, reporter).at(Stage::MorphRename)?
    } else {
        reporter.report(ProgressEvent::MorphRenameCompleted);
        0
    };

    let report = ConversionReport {
        model_name: model.name.clone(),
        vrm_version: meta.version,
        profile: meta.profile,
        bone_count: model.bones.len(),
        vertex_count: model.vertices.len(),
        face_count: model.faces.len(),
        material_count: model.materials.len(),
        morph_count: model.morphs.len(),
        texture_count: model.textures.len(),
        renamed_bones: humanoid.renamed,
        inserted_bones: humanoid.inserted,
        renamed_morphs,
        materials_reordered,
        a_stance_applied,
        output_path: loaded.output.clone(),
        written: false,
    };
    Ok(PreparedModel {
        model,
        report,
        options: loaded.options,
    })
}

/// Write the prepared model to its output path.
///
/// # Returns
///
/// The conversion report with `written` set.
pub fn save_model(prepared: PreparedModel) -> Result<ConversionReport, PipelineError> {
    let PreparedModel {
        model,
        mut report,
        options,
    } = prepared;
    let write_options = WriteOptions {
        encoding: options.text_encoding,
    };
    write_pmx(&report.output_path, &model, write_options).at(Stage::Save)?;
    report.written = true;
    Ok(report)
}

/// Convert one VRM file to PMX: load, prepare and save.
pub fn convert_vrm_to_pmx(
    input: &Path,
    options: &ConvertOptions,
    reporter: &mut dyn ProgressReporter,
) -> Result<ConversionReport, PipelineError> {
    let loaded = load_model(input, options, reporter)?;
    let prepared = prepare_model(loaded, reporter)?;
    save_model(prepared)
}

#[cfg(test)]
mod tests {
    use nalgebra::Vector3;
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        convert::{
            VrmVersion,
            test_support::{GltfFixture, triangle_fixture, vrm1_json},
        },
        progress::NoopReporter,
    };

    fn options_for(dir: &TempDir) -> ConvertOptions {
        ConvertOptions {
            output_path: Some(dir.path().join("out").join("model.pmx")),
            ..ConvertOptions::default()
        }
    }

    fn prepare(fixture: &GltfFixture, dir: &TempDir) -> PreparedModel {
        let input = fixture.write(dir.path(), "model.vrm");
        let loaded = load_model(&input, &options_for(dir), &mut NoopReporter).unwrap();
        prepare_model(loaded, &mut NoopReporter).unwrap()
    }

    fn approx(a: Vector3<f32>, b: Vector3<f32>) -> bool {
        (a - b).norm() < 1e-4
    }

    fn extra_node_json(
        asset: serde_json::Value,
        extensions_used: serde_json::Value,
        extensions: serde_json::Value,
    ) -> serde_json::Value {
        json!({
            "asset": asset,
            "extensionsUsed": extensions_used,
            "extensions": extensions,
            "nodes": [
                { "name": "hips", "translation": [0.0, 0.8, 0.0] },
                { "name": "extra", "translation": [0.1, 0.3, 0.2] }
            ]
        })
    }

    fn vrm0_extension(exporter: &str) -> serde_json::Value {
        json!({
            "exporterVersion": exporter,
            "humanoid": { "humanBones": [{ "bone": "hips", "node": 0 }] }
        })
    }

    #[test]
    fn given_minimal_vrm1_when_converting_then_pmx_and_layout_are_written() {
        let dir = TempDir::new().unwrap();
        let fixture = GltfFixture::new(vrm1_json(
            json!([{ "name": "hips", "translation": [0.0, 0.8, 0.0] }]),
            json!({ "hips": { "node": 0 } }),
        ));
        let input = fixture.write(dir.path(), "model.vrm");

        let report = convert_vrm_to_pmx(&input, &options_for(&dir), &mut NoopReporter).unwrap();

        assert!(report.written);
        assert_eq!(report.vrm_version, VrmVersion::V1);
        assert_eq!(report.profile, Profile::Standard);
        assert_eq!(report.renamed_bones, vec![("hips".to_string(), "下半身".to_string())]);
        let out = dir.path().join("out");
        assert!(out.join("model.pmx").is_file());
        assert!(out.join("glTF").join("model.gltf").is_file());
        assert!(!out.join("glTF").join("model.bin").exists());
        assert!(out.join("tex").join("eye_star.png").is_file());
    }

    #[test]
    fn given_minimal_vrm1_when_preparing_then_lower_body_and_trunk_bones_exist() {
        let dir = TempDir::new().unwrap();
        let fixture = GltfFixture::new(vrm1_json(
            json!([{ "name": "hips", "translation": [0.0, 0.8, 0.0] }]),
            json!({ "hips": { "node": 0 } }),
        ));

        let prepared = prepare(&fixture, &dir);

        let bones = &prepared.model().bones;
        let lower = bones.by_name("下半身").unwrap();
        assert!(approx(lower.position, Vector3::new(0.0, 10.0, 0.0)));
        assert_eq!(bones.by_name("センター").unwrap().position, Vector3::new(0.0, 5.0, 0.0));
        assert_eq!(bones.index_of("全ての親"), Some(0));
        assert!(!bones.contains("腰"));
        assert_eq!(prepared.report().inserted_bones, 3);
    }

    #[test]
    fn given_vroid_vrm0_when_preparing_then_x_is_negated() {
        let dir = TempDir::new().unwrap();
        let fixture = GltfFixture::new(extra_node_json(
            json!({ "version": "2.0", "generator": "VRoid Studio v0.14.0" }),
            json!(["VRM"]),
            json!({ "VRM": vrm0_extension("") }),
        ));

        let prepared = prepare(&fixture, &dir);

        assert_eq!(prepared.report().profile, Profile::VRoid);
        let extra = prepared.model().bones.by_name("extra").unwrap();
        assert!(approx(extra.position, Vector3::new(-1.25, 3.75, 2.5)));
    }

    #[test]
    fn given_vroid_vrm1_when_preparing_then_z_is_negated() {
        let dir = TempDir::new().unwrap();
        let fixture = GltfFixture::new(extra_node_json(
            json!({ "version": "2.0" }),
            json!(["VRM", "VRMC_vrm"]),
            json!({
                "VRM": vrm0_extension("VRoid Studio-1.0"),
                "VRMC_vrm": { "humanoid": { "humanBones": { "hips": { "node": 0 } } } }
            }),
        ));

        let prepared = prepare(&fixture, &dir);

        assert_eq!(prepared.report().vrm_version, VrmVersion::V1);
        let extra = prepared.model().bones.by_name("extra").unwrap();
        assert!(approx(extra.position, Vector3::new(1.25, 3.75, -2.5)));
    }

    #[test]
    fn given_univrm_vrm0_when_preparing_then_standard_axis_is_used() {
        let dir = TempDir::new().unwrap();
        let fixture = GltfFixture::new(extra_node_json(
            json!({ "version": "2.0", "generator": "UniGLTF-1.28" }),
            json!(["VRM"]),
            json!({ "VRM": vrm0_extension("UniVRM-0.51.0") }),
        ));

        let prepared = prepare(&fixture, &dir);

        assert_eq!(prepared.report().profile, Profile::Standard);
        assert!(!prepared.report().a_stance_applied);
        let extra = prepared.model().bones.by_name("extra").unwrap();
        assert!(approx(extra.position, Vector3::new(-1.25, 3.75, 2.5)));
    }

    #[test]
    fn given_triangle_mesh_when_preparing_then_one_face_and_material_are_built() {
        let dir = TempDir::new().unwrap();

        let prepared = prepare(&triangle_fixture(), &dir);

        let model = prepared.model();
        assert_eq!(model.vertices.len(), 3);
        assert_eq!(model.faces.len(), 1);
        assert_eq!(model.materials.len(), 1);
        assert_eq!(model.materials[0].name, "Skin");
        assert!(model.validate().is_ok());
        assert!(dir.path().join("out").join("glTF").join("model.bin").is_file());
    }

    #[test]
    fn given_wrong_extension_when_loading_then_ext_invalid_at_input() {
        let dir = TempDir::new().unwrap();
        let input = triangle_fixture().write(dir.path(), "model.glb");

        let error = load_model(&input, &options_for(&dir), &mut NoopReporter).unwrap_err();

        assert_eq!(error.stage, Stage::Input);
        assert!(matches!(error.kind(), ConvertError::ExtInvalid { .. }));
    }

    #[test]
    fn given_missing_file_when_loading_then_file_not_found() {
        let dir = TempDir::new().unwrap();

        let error = load_model(&dir.path().join("absent.VRM"), &options_for(&dir), &mut NoopReporter)
            .unwrap_err();

        assert!(matches!(error.kind(), ConvertError::FileNotFound { .. }));
    }

    #[test]
    fn given_plain_gltf_when_loading_then_format_unsupported_at_scene() {
        let dir = TempDir::new().unwrap();
        let fixture = GltfFixture::new(json!({ "asset": { "version": "2.0" }, "nodes": [{}] }));
        let input = fixture.write(dir.path(), "plain.vrm");

        let error = load_model(&input, &options_for(&dir), &mut NoopReporter).unwrap_err();

        assert_eq!(error.stage, Stage::Scene);
        assert!(matches!(error.kind(), ConvertError::FormatUnsupported(_)));
    }

    #[test]
    fn given_conversion_when_reporting_then_events_follow_stage_order() {
        let dir = TempDir::new().unwrap();
        let input = triangle_fixture().write(dir.path(), "model.vrm");
        let mut events = Vec::new();

        convert_vrm_to_pmx(&input, &options_for(&dir), &mut |event: ProgressEvent| {
            events.push(event)
        })
        .unwrap();

        let names: Vec<String> = events
            .iter()
            .map(|event| format!("{event:?}"))
            .map(|debug| debug.split([' ', '{']).next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            names,
            [
                "InputValidated",
                "OutputPathResolved",
                "ModelValidated",
                "LayoutPrepared",
                "ModelPathApplied",
                "VroidMaterialPrepared",
                "ReorderCompleted",
                "BoneMappingCompleted",
                "AStanceCompleted",
                "MorphRenamePlanned",
                "MorphRenameCompleted",
            ]
        );
    }
}
