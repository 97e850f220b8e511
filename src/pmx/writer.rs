//! PMX 2.0 binary writer.

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use byteorder::{LittleEndian, WriteBytesExt};
use nalgebra::{Vector3, Vector4};
use serde::{Deserialize, Serialize};

use super::{
    BoneFlags, BoneTail, Deform, DisplayRef, MaterialOp, MorphOffsets, PmxModel, SphereMode, Toon,
};
use crate::error::{ConvertError, ConvertResult};

const PMX_MAGIC: &[u8; 4] = b"PMX ";
const PMX_VERSION: f32 = 2.0;

/// Text encoding stored in the PMX header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TextEncoding {
    #[default]
    Utf16Le,
    Utf8,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WriteOptions {
    pub encoding: TextEncoding,
}

/// Byte widths of each index class, chosen from element counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexSizes {
    vertex: u8,
    texture: u8,
    material: u8,
    bone: u8,
    morph: u8,
    rigid_body: u8,
}

impl IndexSizes {
    fn for_model(model: &PmxModel) -> Self {
        Self {
            vertex: vertex_index_size(model.vertices.len()),
            texture: signed_index_size(model.textures.len()),
            material: signed_index_size(model.materials.len()),
            bone: signed_index_size(model.bones.len()),
            morph: signed_index_size(model.morphs.len()),
            rigid_body: 1,
        }
    }
}

fn vertex_index_size(count: usize) -> u8 {
    if count <= u8::MAX as usize {
        1
    } else if count <= u16::MAX as usize {
        2
    } else {
        4
    }
}

fn signed_index_size(count: usize) -> u8 {
    if count <= i8::MAX as usize {
        1
    } else if count <= i16::MAX as usize {
        2
    } else {
        4
    }
}

/// Write `model` to `path` as PMX 2.0.
pub fn write_pmx(path: &Path, model: &PmxModel, options: WriteOptions) -> ConvertResult<()> {
    model.validate()?;

    let file = File::create(path).map_err(|err| ConvertError::io(path, err))?;
    let mut out = BufWriter::new(file);
    write_pmx_to(&mut out, model, options).map_err(|err| ConvertError::io(path, err))?;
    out.flush().map_err(|err| ConvertError::io(path, err))?;

    log::info!(
        "PMX written: {} (vertices: {}, faces: {}, materials: {}, bones: {}, morphs: {})",
        path.display(),
        model.vertices.len(),
        model.faces.len(),
        model.materials.len(),
        model.bones.len(),
        model.morphs.len()
    );
    Ok(())
}

/// Serialize `model` into any writer. Does not validate.
pub fn write_pmx_to<W: Write>(
    w: &mut W,
    model: &PmxModel,
    options: WriteOptions,
) -> std::io::Result<()> {
    let sizes = IndexSizes::for_model(model);
    let mut pmx = PmxWriter {
        w,
        encoding: options.encoding,
        sizes,
    };
    pmx.header()?;
    pmx.text(&model.name)?;
    pmx.text(&model.english_name)?;
    pmx.text(&model.comment)?;
    pmx.text(&model.english_comment)?;
    pmx.vertices(model)?;
    pmx.faces(model)?;
    pmx.textures(model)?;
    pmx.materials(model)?;
    pmx.bones(model)?;
    pmx.morphs(model)?;
    pmx.display_slots(model)?;
    // Rigid bodies and joints.
    pmx.w.write_i32::<LittleEndian>(0)?;
    pmx.w.write_i32::<LittleEndian>(0)?;
    Ok(())
}

struct PmxWriter<'a, W: Write> {
    w: &'a mut W,
    encoding: TextEncoding,
    sizes: IndexSizes,
}

impl<W: Write> PmxWriter<'_, W> {
    fn header(&mut self) -> std::io::Result<()> {
        self.w.write_all(PMX_MAGIC)?;
        self.w.write_f32::<LittleEndian>(PMX_VERSION)?;
        self.w.write_u8(8)?;
        self.w.write_u8(match self.encoding {
            TextEncoding::Utf16Le => 0,
            TextEncoding::Utf8 => 1,
        })?;
        // No additional UVs.
        self.w.write_u8(0)?;
        self.w.write_u8(self.sizes.vertex)?;
        self.w.write_u8(self.sizes.texture)?;
        self.w.write_u8(self.sizes.material)?;
        self.w.write_u8(self.sizes.bone)?;
        self.w.write_u8(self.sizes.morph)?;
        self.w.write_u8(self.sizes.rigid_body)?;
        Ok(())
    }

    fn text(&mut self, text: &str) -> std::io::Result<()> {
        match self.encoding {
            TextEncoding::Utf16Le => {
                let units: Vec<u16> = text.encode_utf16().collect();
                self.w.write_i32::<LittleEndian>((units.len() * 2) as i32)?;
                for unit in units {
                    self.w.write_u16::<LittleEndian>(unit)?;
                }
            }
            TextEncoding::Utf8 => {
                self.w.write_i32::<LittleEndian>(text.len() as i32)?;
                self.w.write_all(text.as_bytes())?;
            }
        }
        Ok(())
    }

    fn vec3(&mut self, v: &Vector3<f32>) -> std::io::Result<()> {
        for value in v.iter() {
            self.w.write_f32::<LittleEndian>(*value)?;
        }
        Ok(())
    }

    fn vec4(&mut self, v: &Vector4<f32>) -> std::io::Result<()> {
        for value in v.iter() {
            self.w.write_f32::<LittleEndian>(*value)?;
        }
        Ok(())
    }

    fn signed_index(&mut self, size: u8, index: Option<usize>) -> std::io::Result<()> {
        let value = index.map(|i| i as i64).unwrap_or(-1);
        match size {
            1 => self.w.write_i8(value as i8),
            2 => self.w.write_i16::<LittleEndian>(value as i16),
            _ => self.w.write_i32::<LittleEndian>(value as i32),
        }
    }

    fn vertex_index(&mut self, index: usize) -> std::io::Result<()> {
        match self.sizes.vertex {
            1 => self.w.write_u8(index as u8),
            2 => self.w.write_u16::<LittleEndian>(index as u16),
            _ => self.w.write_i32::<LittleEndian>(index as i32),
        }
    }

    fn bone_index(&mut self, index: Option<usize>) -> std::io::Result<()> {
        self.signed_index(self.sizes.bone, index)
    }

    fn vertices(&mut self, model: &PmxModel) -> std::io::Result<()> {
        self.w.write_i32::<LittleEndian>(model.vertices.len() as i32)?;
        for vertex in &model.vertices {
            self.vec3(&vertex.position)?;
            self.vec3(&vertex.normal)?;
            self.w.write_f32::<LittleEndian>(vertex.uv.x)?;
            self.w.write_f32::<LittleEndian>(vertex.uv.y)?;
            match &vertex.deform {
                Deform::Single { bone } => {
                    self.w.write_u8(0)?;
                    self.bone_index(Some(*bone))?;
                }
                Deform::Double { bones, weight0 } => {
                    self.w.write_u8(1)?;
                    self.bone_index(Some(bones[0]))?;
                    self.bone_index(Some(bones[1]))?;
                    self.w.write_f32::<LittleEndian>(*weight0)?;
                }
                Deform::Quad { bones, weights } => {
                    self.w.write_u8(2)?;
                    for bone in bones {
                        self.bone_index(Some(*bone))?;
                    }
                    for weight in weights {
                        self.w.write_f32::<LittleEndian>(*weight)?;
                    }
                }
            }
            self.w.write_f32::<LittleEndian>(vertex.edge_factor)?;
        }
        Ok(())
    }

    fn faces(&mut self, model: &PmxModel) -> std::io::Result<()> {
        self.w.write_i32::<LittleEndian>((model.faces.len() * 3) as i32)?;
        for face in &model.faces {
            for index in face {
                self.vertex_index(*index)?;
            }
        }
        Ok(())
    }

    fn textures(&mut self, model: &PmxModel) -> std::io::Result<()> {
        self.w.write_i32::<LittleEndian>(model.textures.len() as i32)?;
        for texture in &model.textures {
            self.text(&texture.name)?;
        }
        Ok(())
    }

    fn materials(&mut self, model: &PmxModel) -> std::io::Result<()> {
        self.w.write_i32::<LittleEndian>(model.materials.len() as i32)?;
        for material in &model.materials {
            self.text(&material.name)?;
            self.text(&material.english_name)?;
            self.vec4(&material.diffuse)?;
            self.vec3(&material.specular)?;
            self.w.write_f32::<LittleEndian>(material.specular_power)?;
            self.vec3(&material.ambient)?;
            self.w.write_u8(material.draw_flags.bits())?;
            self.vec4(&material.edge_color)?;
            self.w.write_f32::<LittleEndian>(material.edge_size)?;
            self.signed_index(self.sizes.texture, material.texture_index)?;
            self.signed_index(self.sizes.texture, material.sphere_texture_index)?;
            self.w.write_u8(match material.sphere_mode {
                SphereMode::None => 0,
                SphereMode::Multiply => 1,
                SphereMode::Add => 2,
                SphereMode::SubTexture => 3,
            })?;
            match material.toon {
                Toon::Texture(index) => {
                    self.w.write_u8(0)?;
                    self.signed_index(self.sizes.texture, index)?;
                }
                Toon::Shared(index) => {
                    self.w.write_u8(1)?;
                    self.w.write_u8(index)?;
                }
            }
            self.text(&material.memo)?;
            self.w.write_i32::<LittleEndian>(material.vertices_count as i32)?;
        }
        Ok(())
    }

    fn bones(&mut self, model: &PmxModel) -> std::io::Result<()> {
        self.w.write_i32::<LittleEndian>(model.bones.len() as i32)?;
        for bone in &model.bones {
            self.text(&bone.name)?;
            self.text(&bone.english_name)?;
            self.vec3(&bone.position)?;
            self.bone_index(bone.parent)?;
            self.w.write_i32::<LittleEndian>(bone.layer)?;

            let mut flags = bone.flags;
            flags.set(BoneFlags::TAIL_IS_BONE, matches!(bone.tail, BoneTail::Bone(_)));
            flags.set(BoneFlags::EXTERNAL_ROTATION, bone.effect.is_some());
            flags.set(BoneFlags::FIXED_AXIS, bone.fixed_axis.is_some());
            flags.set(BoneFlags::LOCAL_AXIS, bone.local_axes.is_some());
            flags.set(BoneFlags::IK, bone.ik.is_some());
            self.w.write_u16::<LittleEndian>(flags.bits())?;

            match &bone.tail {
                BoneTail::Bone(tail) => self.bone_index(*tail)?,
                BoneTail::Offset(offset) => self.vec3(offset)?,
            }
            if let Some(effect) = &bone.effect {
                self.bone_index(Some(effect.parent))?;
                self.w.write_f32::<LittleEndian>(effect.factor)?;
            }
            if let Some(axis) = &bone.fixed_axis {
                self.vec3(axis)?;
            }
            if let Some(axes) = &bone.local_axes {
                self.vec3(&axes.x)?;
                self.vec3(&axes.z)?;
            }
            if let Some(ik) = &bone.ik {
                self.bone_index(Some(ik.target))?;
                self.w.write_i32::<LittleEndian>(ik.loop_count as i32)?;
                self.w.write_f32::<LittleEndian>(ik.unit_angle)?;
                self.w.write_i32::<LittleEndian>(ik.links.len() as i32)?;
                for link in &ik.links {
                    self.bone_index(Some(link.bone))?;
                    match &link.angle_limit {
                        Some((min, max)) => {
                            self.w.write_u8(1)?;
                            self.vec3(min)?;
                            self.vec3(max)?;
                        }
                        None => self.w.write_u8(0)?,
                    }
                }
            }
        }
        Ok(())
    }

    fn morphs(&mut self, model: &PmxModel) -> std::io::Result<()> {
        self.w.write_i32::<LittleEndian>(model.morphs.len() as i32)?;
        for morph in &model.morphs {
            self.text(&morph.name)?;
            self.text(&morph.english_name)?;
            self.w.write_u8(morph.panel as u8)?;
            match &morph.offsets {
                MorphOffsets::Group(offsets) => {
                    self.w.write_u8(0)?;
                    self.w.write_i32::<LittleEndian>(offsets.len() as i32)?;
                    for offset in offsets {
                        self.signed_index(self.sizes.morph, Some(offset.morph))?;
                        self.w.write_f32::<LittleEndian>(offset.factor)?;
                    }
                }
                MorphOffsets::Vertex(offsets) => {
                    self.w.write_u8(1)?;
                    self.w.write_i32::<LittleEndian>(offsets.len() as i32)?;
                    for offset in offsets {
                        self.vertex_index(offset.vertex)?;
                        self.vec3(&offset.offset)?;
                    }
                }
                MorphOffsets::Bone(offsets) => {
                    self.w.write_u8(2)?;
                    self.w.write_i32::<LittleEndian>(offsets.len() as i32)?;
                    for offset in offsets {
                        self.bone_index(Some(offset.bone))?;
                        self.vec3(&offset.translation)?;
                        self.vec4(&offset.rotation)?;
                    }
                }
                MorphOffsets::Material(offsets) => {
                    self.w.write_u8(8)?;
                    self.w.write_i32::<LittleEndian>(offsets.len() as i32)?;
                    for offset in offsets {
                        self.signed_index(self.sizes.material, offset.material)?;
                        self.w.write_u8(match offset.op {
                            MaterialOp::Multiply => 0,
                            MaterialOp::Add => 1,
                        })?;
                        self.vec4(&offset.diffuse)?;
                        self.vec3(&offset.specular)?;
                        self.w.write_f32::<LittleEndian>(offset.specular_power)?;
                        self.vec3(&offset.ambient)?;
                        self.vec4(&offset.edge_color)?;
                        self.w.write_f32::<LittleEndian>(offset.edge_size)?;
                        self.vec4(&offset.texture_factor)?;
                        self.vec4(&offset.sphere_factor)?;
                        self.vec4(&offset.toon_factor)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn display_slots(&mut self, model: &PmxModel) -> std::io::Result<()> {
        self.w.write_i32::<LittleEndian>(model.display_slots.len() as i32)?;
        for slot in &model.display_slots {
            self.text(&slot.name)?;
            self.text(&slot.english_name)?;
            self.w.write_u8(u8::from(slot.special))?;
            self.w.write_i32::<LittleEndian>(slot.references.len() as i32)?;
            for reference in &slot.references {
                match reference {
                    DisplayRef::Bone(bone) => {
                        self.w.write_u8(0)?;
                        self.bone_index(Some(*bone))?;
                    }
                    DisplayRef::Morph(morph) => {
                        self.w.write_u8(1)?;
                        self.signed_index(self.sizes.morph, Some(*morph))?;
                    }
                }
            }
        }
        Ok(())
    }
}
