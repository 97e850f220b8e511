//! GLB (binary glTF) container reader.
//!
//! - 12-byte file header (magic, version 2, total length)
//! - sequential chunks of `(length, type, payload)`
//! - exactly one JSON chunk; the first BIN chunk wins

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::{ConvertError, ConvertResult};

pub(crate) const GLB_MAGIC: u32 = 0x46546C67; // "glTF"
pub(crate) const GLB_VERSION: u32 = 2;
pub(crate) const GLB_HEADER_SIZE: usize = 12;
pub(crate) const CHUNK_HEADER_SIZE: usize = 8;
pub(crate) const CHUNK_TYPE_JSON: u32 = 0x4E4F534A;
pub(crate) const CHUNK_TYPE_BIN: u32 = 0x004E4942;

/// Raw chunk payloads of a GLB container.
#[derive(Debug, Clone)]
pub struct Glb {
    pub json: Vec<u8>,
    pub bin: Option<Vec<u8>>,
}

impl Glb {
    pub fn bin(&self) -> &[u8] {
        self.bin.as_deref().unwrap_or_default()
    }
}

fn truncated(what: &str) -> ConvertError {
    ConvertError::parse(format!("GLB {what} is truncated"))
}

/// Split a GLB byte stream into its JSON and BIN chunks.
pub fn parse_glb(bytes: &[u8]) -> ConvertResult<Glb> {
    if bytes.len() < GLB_HEADER_SIZE {
        return Err(truncated("header"));
    }

    let mut header = Cursor::new(&bytes[..GLB_HEADER_SIZE]);
    let magic = header.read_u32::<LittleEndian>().map_err(|_| truncated("header"))?;
    let version = header.read_u32::<LittleEndian>().map_err(|_| truncated("header"))?;
    let total_length =
        header.read_u32::<LittleEndian>().map_err(|_| truncated("header"))? as usize;

    if magic != GLB_MAGIC {
        return Err(ConvertError::parse(format!(
            "not a GLB container (magic 0x{magic:08X})"
        )));
    }
    if version != GLB_VERSION {
        return Err(ConvertError::unsupported(format!(
            "GLB version {version} (expected {GLB_VERSION})"
        )));
    }
    if total_length > bytes.len() {
        return Err(ConvertError::parse(format!(
            "GLB declares {total_length} bytes but only {} are present",
            bytes.len()
        )));
    }

    let mut json = None::<Vec<u8>>;
    let mut bin = None::<Vec<u8>>;
    let mut offset = GLB_HEADER_SIZE;

    while offset + CHUNK_HEADER_SIZE <= total_length {
        let mut chunk_header = Cursor::new(&bytes[offset..offset + CHUNK_HEADER_SIZE]);
        let length = chunk_header
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated("chunk header"))? as usize;
        let chunk_type = chunk_header
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated("chunk header"))?;

        let start = offset + CHUNK_HEADER_SIZE;
        let end = start
            .checked_add(length)
            .filter(|end| *end <= total_length)
            .ok_or_else(|| {
                ConvertError::parse(format!(
                    "GLB chunk at offset {offset} ({length} bytes) exceeds the container"
                ))
            })?;
        let payload = &bytes[start..end];

        match chunk_type {
            CHUNK_TYPE_JSON => {
                if json.is_some() {
                    return Err(ConvertError::parse("GLB contains more than one JSON chunk"));
                }
                json = Some(payload.to_vec());
            }
            CHUNK_TYPE_BIN => {
                if bin.is_none() {
                    bin = Some(payload.to_vec());
                } else {
                    log::debug!("ignoring extra GLB BIN chunk at offset {offset}");
                }
            }
            other => log::debug!("skipping unknown GLB chunk type 0x{other:08X}"),
        }

        offset = end;
    }

    let json = json.ok_or_else(|| ConvertError::parse("GLB has no JSON chunk"))?;
    Ok(Glb { json, bin })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::test_support::glb_bytes;

    #[test]
    fn given_json_and_bin_when_parsing_then_both_chunks_are_returned() {
        let bytes = glb_bytes(br#"{"asset":{"version":"2.0"}}"#, Some(&[1, 2, 3, 4]));

        let glb = parse_glb(&bytes).unwrap();

        assert!(glb.json.starts_with(b"{\"asset\""));
        assert_eq!(glb.bin(), &[1, 2, 3, 4]);
    }

    #[test]
    fn given_no_bin_chunk_when_parsing_then_bin_is_absent() {
        let bytes = glb_bytes(b"{}", None);

        let glb = parse_glb(&bytes).unwrap();

        assert!(glb.bin.is_none());
        assert!(glb.bin().is_empty());
    }

    #[test]
    fn given_bad_magic_when_parsing_then_parse_failed() {
        let mut bytes = glb_bytes(b"{}", None);
        bytes[0] = b'x';

        assert!(matches!(parse_glb(&bytes), Err(ConvertError::ParseFailed(_))));
    }

    #[test]
    fn given_version_one_when_parsing_then_format_unsupported() {
        let mut bytes = glb_bytes(b"{}", None);
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());

        assert!(matches!(
            parse_glb(&bytes),
            Err(ConvertError::FormatUnsupported(_))
        ));
    }

    #[test]
    fn given_declared_length_beyond_data_when_parsing_then_parse_failed() {
        let mut bytes = glb_bytes(b"{}", None);
        let declared = (bytes.len() as u32 + 16).to_le_bytes();
        bytes[8..12].copy_from_slice(&declared);

        assert!(matches!(parse_glb(&bytes), Err(ConvertError::ParseFailed(_))));
    }

    #[test]
    fn given_chunk_overrunning_container_when_parsing_then_parse_failed() {
        let mut bytes = glb_bytes(b"{}", None);
        bytes[12..16].copy_from_slice(&1000u32.to_le_bytes());

        assert!(matches!(parse_glb(&bytes), Err(ConvertError::ParseFailed(_))));
    }

    #[test]
    fn given_only_bin_chunk_when_parsing_then_missing_json_is_reported() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&GLB_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&GLB_VERSION.to_le_bytes());
        bytes.extend_from_slice(&24u32.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&CHUNK_TYPE_BIN.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0, 0]);

        let err = parse_glb(&bytes).unwrap_err();
        assert!(err.to_string().contains("no JSON chunk"));
    }

    #[test]
    fn given_two_bin_chunks_when_parsing_then_first_wins() {
        let mut bytes = glb_bytes(b"{}", Some(&[9, 9, 9, 9]));
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&CHUNK_TYPE_BIN.to_le_bytes());
        bytes.extend_from_slice(&[7, 7, 7, 7]);
        let total = (bytes.len() as u32).to_le_bytes();
        bytes[8..12].copy_from_slice(&total);

        let glb = parse_glb(&bytes).unwrap();

        assert_eq!(glb.bin(), &[9, 9, 9, 9]);
    }
}
