//! Output directory layout: `{model}.pmx` next to `glTF/` and `tex/`.

use std::{
    collections::HashSet,
    fs::{self, DirBuilder},
    path::{Path, PathBuf},
};

use base64::{Engine, prelude::BASE64_STANDARD};

use super::{document::Document, eye_textures::write_eye_textures, glb::Glb};
use crate::{
    error::{ConvertError, ConvertResult},
    pmx::{PmxModel, TextureKind},
    texture::sniff_image_extension,
};

pub(crate) const TEX_DIR: &str = "tex";
pub(crate) const GLTF_DIR: &str = "glTF";

/// `{input_dir}/{stem}_{yyyymmddhhmmss}/{stem}.pmx`.
pub fn default_output_path(input: &Path) -> PathBuf {
    let stem = file_stem(input);
    let timestamp = jiff::Zoned::now().strftime("%Y%m%d%H%M%S").to_string();
    let parent = input.parent().unwrap_or_else(|| Path::new(""));
    parent
        .join(format!("{stem}_{timestamp}"))
        .join(format!("{stem}.pmx"))
}

pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.is_empty())
        .unwrap_or_else(|| "model".to_string())
}

/// Resolved output directories for one model.
#[derive(Debug, Clone)]
pub(crate) struct OutputLayout {
    pub(crate) root: PathBuf,
    pub(crate) tex_dir: PathBuf,
    pub(crate) gltf_dir: PathBuf,
    pub(crate) stem: String,
}

fn create_dir(path: &Path) -> ConvertResult<()> {
    let mut builder = DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(path).map_err(|err| ConvertError::io(path, err))
}

impl OutputLayout {
    pub(crate) fn for_output(output_pmx: &Path) -> Self {
        let root = output_pmx
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            tex_dir: root.join(TEX_DIR),
            gltf_dir: root.join(GLTF_DIR),
            stem: file_stem(output_pmx),
            root,
        }
    }

    /// Create the PMX, `tex/` and `glTF/` directories. Idempotent.
    pub(crate) fn create(&self) -> ConvertResult<()> {
        if !self.root.as_os_str().is_empty() {
            create_dir(&self.root)?;
        }
        create_dir(&self.tex_dir)?;
        create_dir(&self.gltf_dir)
    }

    /// Write the raw JSON chunk as `{stem}.gltf` and the BIN chunk, when
    /// present, as `{stem}.bin`.
    pub(crate) fn export_gltf(&self, glb: &Glb) -> ConvertResult<()> {
        let json_path = self.gltf_dir.join(format!("{}.gltf", self.stem));
        fs::write(&json_path, &glb.json).map_err(|err| ConvertError::io(&json_path, err))?;
        if let Some(bin) = &glb.bin {
            let bin_path = self.gltf_dir.join(format!("{}.bin", self.stem));
            fs::write(&bin_path, bin).map_err(|err| ConvertError::io(&bin_path, err))?;
        }
        Ok(())
    }
}

// ─── Image extraction ─────────────────────────────────────────────────────────

/// Replace characters that are invalid in file names and trim spaces/dots.
pub(crate) fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if matches!(c, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*') || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    replaced.trim_matches(|c| c == ' ' || c == '.').to_string()
}

fn extension_from_mime(mime: &str) -> Option<&'static str> {
    match mime.trim().to_ascii_lowercase().as_str() {
        "image/png" => Some("png"),
        "image/jpeg" | "image/jpg" => Some("jpg"),
        "image/webp" => Some("webp"),
        "image/bmp" => Some("bmp"),
        "image/gif" => Some("gif"),
        _ => None,
    }
}

fn extension_from_uri(uri: &str) -> Option<&'static str> {
    let extension = Path::new(uri).extension()?.to_str()?.to_ascii_lowercase();
    match extension.as_str() {
        "png" => Some("png"),
        "jpg" | "jpeg" => Some("jpg"),
        "webp" => Some("webp"),
        "bmp" => Some("bmp"),
        "gif" => Some("gif"),
        _ => None,
    }
}

/// Decoded `data:` URI: `(mime, bytes)`.
fn decode_data_uri(uri: &str) -> Option<(Option<String>, Vec<u8>)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header
        .split(';')
        .next()
        .filter(|mime| !mime.is_empty())
        .map(str::to_string);
    let bytes = if header.ends_with(";base64") {
        BASE64_STANDARD.decode(payload.trim()).ok()?
    } else {
        payload.as_bytes().to_vec()
    };
    Some((mime, bytes))
}

fn buffer_view_bytes<'b>(document: &Document, bin: &'b [u8], view: usize) -> Option<&'b [u8]> {
    let view = document.buffer_views.get(view)?;
    if view.buffer != 0 || view.byte_offset < 0 || view.byte_length < 0 {
        return None;
    }
    let start = view.byte_offset as usize;
    let end = start.checked_add(view.byte_length as usize)?;
    bin.get(start..end)
}

struct ImageSource {
    bytes: Vec<u8>,
    mime: Option<String>,
    uri_extension: Option<&'static str>,
    uri_stem: Option<String>,
}

fn image_source(
    document: &Document,
    bin: &[u8],
    source_dir: &Path,
    index: usize,
) -> Option<ImageSource> {
    let image = &document.images[index];
    let mime = image.mime_type.clone();

    if let Some(uri) = image.uri.as_deref() {
        if uri.starts_with("data:") {
            let Some((data_mime, bytes)) = decode_data_uri(uri) else {
                log::warn!("image {index}: malformed data URI; skipped");
                return None;
            };
            return Some(ImageSource {
                bytes,
                mime: mime.or(data_mime),
                uri_extension: None,
                uri_stem: None,
            });
        }
        let path = source_dir.join(uri);
        return match fs::read(&path) {
            Ok(bytes) => Some(ImageSource {
                bytes,
                mime,
                uri_extension: extension_from_uri(uri),
                uri_stem: Path::new(uri)
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned()),
            }),
            Err(err) => {
                log::warn!("image {index}: cannot read {} ({err}); skipped", path.display());
                None
            }
        };
    }

    let Some(view) = image.buffer_view else {
        log::warn!("image {index} has neither uri nor bufferView; skipped");
        return None;
    };
    match buffer_view_bytes(document, bin, view) {
        Some(bytes) => Some(ImageSource {
            bytes: bytes.to_vec(),
            mime,
            uri_extension: None,
            uri_stem: None,
        }),
        None => {
            log::warn!("image {index}: bufferView {view} is out of range; skipped");
            None
        }
    }
}

/// Hands out file names unique within one directory (case-insensitive).
#[derive(Debug, Default)]
struct NameAllocator {
    used: HashSet<String>,
}

impl NameAllocator {
    fn allocate(&mut self, stem: &str, extension: &str) -> String {
        let mut candidate = format!("{stem}.{extension}");
        let mut n = 1;
        while !self.used.insert(candidate.to_lowercase()) {
            candidate = format!("{stem}_{n}.{extension}");
            n += 1;
        }
        candidate
    }
}

fn strip_extension<'n>(name: &'n str, extension: &str) -> &'n str {
    let suffix_len = extension.len() + 1;
    if name.len() > suffix_len
        && name.is_char_boundary(name.len() - suffix_len)
        && name[name.len() - suffix_len..].eq_ignore_ascii_case(&format!(".{extension}"))
    {
        &name[..name.len() - suffix_len]
    } else {
        name
    }
}

/// Extract every glTF image into `tex/`. Returns the written file name per
/// image index (`None` for images that could not be read).
pub(crate) fn extract_images(
    document: &Document,
    bin: &[u8],
    source_dir: &Path,
    layout: &OutputLayout,
) -> ConvertResult<Vec<Option<String>>> {
    let mut names = NameAllocator::default();
    let mut files = Vec::with_capacity(document.images.len());

    for index in 0..document.images.len() {
        let Some(source) = image_source(document, bin, source_dir, index) else {
            files.push(None);
            continue;
        };
        let extension = source
            .mime
            .as_deref()
            .and_then(extension_from_mime)
            .or(source.uri_extension)
            .or_else(|| sniff_image_extension(&source.bytes))
            .unwrap_or("bin");

        let raw_name = document.images[index]
            .name
            .clone()
            .or(source.uri_stem)
            .unwrap_or_default();
        let stem = sanitize_file_name(strip_extension(&raw_name, extension));
        let stem = if stem.is_empty() {
            format!("image_{index:03}")
        } else {
            stem
        };
        let file_name = names.allocate(&stem, extension);

        let path = layout.tex_dir.join(&file_name);
        fs::write(&path, &source.bytes).map_err(|err| ConvertError::io(&path, err))?;
        files.push(Some(file_name));
    }
    Ok(files)
}

/// Relative texture name as stored in the PMX: `tex/{file}` with the host
/// path separator.
pub(crate) fn texture_name(file_name: &str) -> String {
    Path::new(TEX_DIR).join(file_name).to_string_lossy().into_owned()
}

/// Register extracted images and the special-eye textures in the model.
/// Returns the model texture index per glTF image index.
pub(crate) fn register_textures(
    model: &mut PmxModel,
    image_files: &[Option<String>],
    eye_files: &[&str],
) -> Vec<Option<usize>> {
    let image_textures = image_files
        .iter()
        .map(|file| {
            file.as_deref()
                .map(|file| model.insert_texture(&texture_name(file), TextureKind::Color))
        })
        .collect();
    for file in eye_files {
        model.insert_texture(&texture_name(file), TextureKind::Color);
    }
    image_textures
}

/// Run the whole layout stage: directories, glTF export, images and
/// special-eye textures. Returns the image→texture index map.
pub(crate) fn prepare_output(
    layout: &OutputLayout,
    glb: &Glb,
    document: &Document,
    input: &Path,
    export_gltf: bool,
    model: &mut PmxModel,
) -> ConvertResult<Vec<Option<usize>>> {
    layout.create()?;
    if export_gltf {
        layout.export_gltf(glb)?;
    }
    let source_dir = input.parent().unwrap_or_else(|| Path::new(""));
    let image_files = extract_images(document, glb.bin(), source_dir, layout)?;
    let eye_files = write_eye_textures(&layout.tex_dir)?;
    let image_textures = register_textures(model, &image_files, &eye_files);
    log::info!(
        "output layout ready at {} ({} textures)",
        layout.root.display(),
        model.textures.len()
    );
    Ok(image_textures)
}
