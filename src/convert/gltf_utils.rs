use std::{collections::HashMap, rc::Rc};

use byteorder::{ByteOrder, LittleEndian};
use nalgebra::{Matrix4, Quaternion, Translation3, UnitQuaternion, Vector2, Vector3, Vector4};

use super::document::{Accessor, Document, Node};
use crate::error::{ConvertError, ConvertResult};

// ─── Accessor metadata ────────────────────────────────────────────────────────

const COMPONENT_BYTE: u32 = 5120;
const COMPONENT_UNSIGNED_BYTE: u32 = 5121;
const COMPONENT_SHORT: u32 = 5122;
const COMPONENT_UNSIGNED_SHORT: u32 = 5123;
const COMPONENT_UNSIGNED_INT: u32 = 5125;
const COMPONENT_FLOAT: u32 = 5126;

fn component_size(component_type: u32) -> Option<usize> {
    match component_type {
        COMPONENT_BYTE | COMPONENT_UNSIGNED_BYTE => Some(1),
        COMPONENT_SHORT | COMPONENT_UNSIGNED_SHORT => Some(2),
        COMPONENT_UNSIGNED_INT | COMPONENT_FLOAT => Some(4),
        _ => None,
    }
}

fn component_count(kind: &str) -> Option<usize> {
    match kind {
        "SCALAR" => Some(1),
        "VEC2" => Some(2),
        "VEC3" => Some(3),
        "VEC4" | "MAT2" => Some(4),
        "MAT3" => Some(9),
        "MAT4" => Some(16),
        _ => None,
    }
}

/// Validated byte layout of one accessor inside the BIN chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct AccessorMeta {
    pub(super) base_offset: usize,
    pub(super) stride: usize,
    pub(super) count: usize,
    pub(super) components: usize,
    pub(super) component_type: u32,
    pub(super) normalized: bool,
}

pub(super) fn accessor_meta(
    document: &Document,
    bin_length: usize,
    accessor_index: usize,
) -> ConvertResult<AccessorMeta> {
    let accessor: &Accessor = document.accessors.get(accessor_index).ok_or_else(|| {
        ConvertError::parse(format!(
            "accessor {accessor_index} out of range ({} accessors)",
            document.accessors.len()
        ))
    })?;

    if accessor.sparse.is_some() {
        return Err(ConvertError::unsupported(format!(
            "accessor {accessor_index} is sparse"
        )));
    }
    let view_index = accessor.buffer_view.ok_or_else(|| {
        ConvertError::unsupported(format!("accessor {accessor_index} has no bufferView"))
    })?;

    let components = component_count(&accessor.kind).ok_or_else(|| {
        ConvertError::unsupported(format!(
            "accessor {accessor_index} has unknown type '{}'",
            accessor.kind
        ))
    })?;
    let size = component_size(accessor.component_type).ok_or_else(|| {
        ConvertError::unsupported(format!(
            "accessor {accessor_index} has unknown component type {}",
            accessor.component_type
        ))
    })?;

    let view = document.buffer_views.get(view_index).ok_or_else(|| {
        ConvertError::parse(format!(
            "accessor {accessor_index} references missing bufferView {view_index}"
        ))
    })?;
    if view.buffer != 0 {
        return Err(ConvertError::unsupported(format!(
            "bufferView {view_index} addresses buffer {} (only the embedded BIN is supported)",
            view.buffer
        )));
    }
    if view.byte_offset < 0 || view.byte_length < 0 || accessor.byte_offset < 0 {
        return Err(ConvertError::parse(format!(
            "bufferView {view_index} or accessor {accessor_index} has a negative offset/length"
        )));
    }

    let view_start = view.byte_offset as usize;
    let view_end = view_start
        .checked_add(view.byte_length as usize)
        .ok_or_else(|| ConvertError::parse(format!("bufferView {view_index} range overflows")))?;
    if view_end > bin_length {
        return Err(ConvertError::parse(format!(
            "bufferView {view_index} ends at {view_end} beyond BIN length {bin_length}"
        )));
    }

    let element_size = components * size;
    let stride = match view.byte_stride.unwrap_or(0) {
        0 => element_size,
        declared if declared < 0 || (declared as usize) < element_size => {
            return Err(ConvertError::parse(format!(
                "bufferView {view_index} stride {declared} is smaller than element size {element_size}"
            )));
        }
        declared => declared as usize,
    };

    let overflow = || ConvertError::parse(format!("accessor {accessor_index} range overflows"));
    let base_offset = view_start
        .checked_add(accessor.byte_offset as usize)
        .ok_or_else(overflow)?;
    accessor.count.checked_mul(components).ok_or_else(overflow)?;
    if accessor.count > 0 {
        let last_end = (accessor.count - 1)
            .checked_mul(stride)
            .and_then(|span| span.checked_add(base_offset))
            .and_then(|start| start.checked_add(element_size))
            .ok_or_else(overflow)?;
        if last_end > view_end {
            return Err(ConvertError::parse(format!(
                "accessor {accessor_index} reads up to {last_end} beyond bufferView end {view_end}"
            )));
        }
    }

    Ok(AccessorMeta {
        base_offset,
        stride,
        count: accessor.count,
        components,
        component_type: accessor.component_type,
        normalized: accessor.normalized,
    })
}

// ─── Accessor I/O ─────────────────────────────────────────────────────────────

/// Decoded accessor values: `count` rows of `components` values each.
///
/// Values are widened to `f64` so every integer component type stays exact.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct AccessorData {
    pub(crate) components: usize,
    values: Vec<f64>,
}

impl AccessorData {
    pub(crate) fn len(&self) -> usize {
        if self.components == 0 {
            0
        } else {
            self.values.len() / self.components
        }
    }

    pub(crate) fn row(&self, index: usize) -> &[f64] {
        &self.values[index * self.components..(index + 1) * self.components]
    }

    pub(crate) fn rows(&self) -> impl Iterator<Item = &[f64]> + '_ {
        self.values.chunks_exact(self.components.max(1))
    }

    fn lane(row: &[f64], lane: usize) -> f32 {
        row.get(lane).copied().unwrap_or(0.0) as f32
    }

    pub(crate) fn vec2(&self) -> Vec<Vector2<f32>> {
        self.rows()
            .map(|row| Vector2::new(Self::lane(row, 0), Self::lane(row, 1)))
            .collect()
    }

    pub(crate) fn vec3(&self) -> Vec<Vector3<f32>> {
        self.rows()
            .map(|row| Vector3::new(Self::lane(row, 0), Self::lane(row, 1), Self::lane(row, 2)))
            .collect()
    }

    pub(crate) fn vec4(&self) -> Vec<Vector4<f32>> {
        self.rows()
            .map(|row| {
                Vector4::new(
                    Self::lane(row, 0),
                    Self::lane(row, 1),
                    Self::lane(row, 2),
                    Self::lane(row, 3),
                )
            })
            .collect()
    }

    /// First component of every row as an index.
    pub(crate) fn indices(&self) -> Vec<u32> {
        self.rows()
            .map(|row| row.first().copied().unwrap_or(0.0).max(0.0) as u32)
            .collect()
    }
}

fn read_component(bin: &[u8], offset: usize, component_type: u32, normalized: bool) -> f64 {
    match component_type {
        COMPONENT_BYTE => {
            let value = bin[offset] as i8 as f64;
            if normalized { (value / 127.0).max(-1.0) } else { value }
        }
        COMPONENT_UNSIGNED_BYTE => {
            let value = bin[offset] as f64;
            if normalized { value / 255.0 } else { value }
        }
        COMPONENT_SHORT => {
            let value = LittleEndian::read_i16(&bin[offset..offset + 2]) as f64;
            if normalized { (value / 32767.0).max(-1.0) } else { value }
        }
        COMPONENT_UNSIGNED_SHORT => {
            let value = LittleEndian::read_u16(&bin[offset..offset + 2]) as f64;
            if normalized { value / 65535.0 } else { value }
        }
        COMPONENT_UNSIGNED_INT => {
            let value = LittleEndian::read_u32(&bin[offset..offset + 4]) as f64;
            if normalized { value / 4_294_967_295.0 } else { value }
        }
        _ => LittleEndian::read_f32(&bin[offset..offset + 4]) as f64,
    }
}

pub(super) fn read_accessor(bin: &[u8], meta: &AccessorMeta) -> AccessorData {
    let size = component_size(meta.component_type).unwrap_or(4);
    let mut values = Vec::with_capacity(meta.count * meta.components);
    for element in 0..meta.count {
        let element_offset = meta.base_offset + element * meta.stride;
        for lane in 0..meta.components {
            values.push(read_component(
                bin,
                element_offset + lane * size,
                meta.component_type,
                meta.normalized,
            ));
        }
    }
    AccessorData {
        components: meta.components,
        values,
    }
}

/// Accessor reader bound to one document and BIN chunk, caching decoded
/// accessors by index for the lifetime of one conversion.
pub(crate) struct AccessorReader<'a> {
    document: &'a Document,
    bin: &'a [u8],
    cache: HashMap<usize, Rc<AccessorData>>,
}

impl<'a> AccessorReader<'a> {
    pub(crate) fn new(document: &'a Document, bin: &'a [u8]) -> Self {
        Self {
            document,
            bin,
            cache: HashMap::new(),
        }
    }

    pub(crate) fn read(&mut self, accessor_index: usize) -> ConvertResult<Rc<AccessorData>> {
        if let Some(data) = self.cache.get(&accessor_index) {
            return Ok(Rc::clone(data));
        }
        let meta = accessor_meta(self.document, self.bin.len(), accessor_index)?;
        let data = Rc::new(read_accessor(self.bin, &meta));
        self.cache.insert(accessor_index, Rc::clone(&data));
        Ok(data)
    }

    #[cfg(test)]
    pub(crate) fn cached(&self) -> usize {
        self.cache.len()
    }
}

// ─── Node transforms ──────────────────────────────────────────────────────────

/// Build the local transform matrix of a glTF node (`matrix`, else `T·R·S`).
pub(super) fn node_to_local_matrix(node: &Node) -> Matrix4<f32> {
    if node.matrix.len() == 16 {
        return Matrix4::from_row_slice(&node.matrix).transpose();
    }

    let translation = match node.translation.as_slice() {
        [x, y, z] => Vector3::new(*x, *y, *z),
        _ => Vector3::zeros(),
    };

    let rotation = match node.rotation.as_slice() {
        [x, y, z, w] => UnitQuaternion::from_quaternion(Quaternion::new(*w, *x, *y, *z)),
        _ => UnitQuaternion::identity(),
    };

    let scale = match node.scale.as_slice() {
        [x, y, z] => Vector3::new(*x, *y, *z),
        _ => Vector3::new(1.0, 1.0, 1.0),
    };

    let translation_matrix = Translation3::from(translation).to_homogeneous();
    let rotation_matrix = rotation.to_homogeneous();
    let scale_matrix = Matrix4::new_nonuniform_scaling(&scale);
    translation_matrix * rotation_matrix * scale_matrix
}
