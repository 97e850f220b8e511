//! VRM → PMX conversion stages.
//!
//! Each submodule owns one pipeline stage; `crate::pipeline` runs them in
//! order over a single [`crate::pmx::PmxModel`].

pub(crate) mod document;
pub(crate) mod eye_textures;
pub(crate) mod glb;
pub(crate) mod gltf_utils;
pub(crate) mod humanoid;
pub(crate) mod layout;
pub(crate) mod material;
pub(crate) mod mesh;
pub(crate) mod morph;
pub(crate) mod reorder;
pub(crate) mod scene;
pub(crate) mod skeleton;
pub(crate) mod stance;
mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export public types for callers of this module.
pub use layout::default_output_path;
pub use types::{ConversionReport, ConvertOptions, Profile, VrmVersion};

pub(crate) use types::BODY_HUMANOID_BONES;
