//! Safetensors file format reader and writer.
//!
//! Layout:
//! ```text
//! [8 bytes: header_size (u64 LE)]
//! [header_size bytes: JSON header]
//! [remaining bytes: tensor data]
//! ```
//! The JSON header maps tensor names to `{dtype, shape, data_offsets}` and may
//! carry a flat string map under `__metadata__`. Only `F32` tensors are
//! decoded; that is all the byte-level backend needs.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WeightError};
use crate::weights::mmap::MappedFile;

const METADATA_KEY: &str = "__metadata__";

/// Metadata for a single tensor in a safetensors file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorInfo {
    /// Data type string (e.g., "F32", "F16").
    pub dtype: String,

    /// Tensor shape.
    pub shape: Vec<usize>,

    /// Byte offset range `[start, end)` within the data section.
    pub data_offsets: [usize; 2],
}

impl TensorInfo {
    /// Total byte size of the tensor data.
    pub fn byte_size(&self) -> usize {
        self.data_offsets[1].saturating_sub(self.data_offsets[0])
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }
}

/// Parsed safetensors file header.
#[derive(Debug)]
pub struct SafetensorsHeader {
    /// Map from tensor name to metadata.
    pub tensors: HashMap<String, TensorInfo>,

    /// Free-form metadata (model name, format version).
    pub metadata: HashMap<String, String>,

    /// Byte offset where the data section begins (after header).
    pub data_offset: usize,
}

/// Parse a safetensors header from raw file bytes.
pub fn parse_header(bytes: &[u8]) -> Result<SafetensorsHeader> {
    if bytes.len() < 8 {
        return Err(WeightError::Format(
            "file too small for safetensors header".into(),
        ));
    }

    let header_size = (&bytes[..8]).read_u64::<LittleEndian>()? as usize;

    let header_end = 8usize
        .checked_add(header_size)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| {
            WeightError::Format(format!(
                "header size {header_size} exceeds file size {}",
                bytes.len()
            ))
        })?;

    let header_str = std::str::from_utf8(&bytes[8..header_end])
        .map_err(|e| WeightError::Format(format!("invalid UTF-8 in header: {e}")))?;

    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(header_str)?;

    let mut tensors = HashMap::new();
    let mut metadata = HashMap::new();

    for (key, value) in raw {
        if key == METADATA_KEY {
            if let Some(obj) = value.as_object() {
                for (mk, mv) in obj {
                    if let Some(s) = mv.as_str() {
                        metadata.insert(mk.clone(), s.to_string());
                    }
                }
            }
        } else {
            let info: TensorInfo = serde_json::from_value(value).map_err(|e| {
                WeightError::Format(format!("failed to parse tensor '{key}': {e}"))
            })?;
            if info.data_offsets[0] > info.data_offsets[1] {
                return Err(WeightError::Format(format!(
                    "tensor '{key}' has inverted data offsets"
                )));
            }
            tensors.insert(key, info);
        }
    }

    Ok(SafetensorsHeader {
        tensors,
        metadata,
        data_offset: header_end,
    })
}

/// A loaded safetensors file with parsed header and memory-mapped data.
pub struct SafetensorsFile {
    pub header: SafetensorsHeader,
    mapped: MappedFile,
}

impl SafetensorsFile {
    /// Open and parse a safetensors file.
    pub fn open(path: &Path) -> Result<Self> {
        let mapped = MappedFile::open(path)?;
        let header = parse_header(mapped.as_bytes())?;
        Ok(SafetensorsFile { header, mapped })
    }

    fn info(&self, name: &str) -> Result<&TensorInfo> {
        self.header
            .tensors
            .get(name)
            .ok_or_else(|| WeightError::MissingTensor(name.to_string()))
    }

    /// Get the raw bytes for a named tensor.
    pub fn tensor_data(&self, name: &str) -> Result<&[u8]> {
        let info = self.info(name)?;
        let start = self.header.data_offset + info.data_offsets[0];
        self.mapped.slice(start, info.byte_size())
    }

    /// Decode a named `F32` tensor, checking its shape.
    pub fn tensor_f32(&self, name: &str, expected_shape: &[usize]) -> Result<Vec<f32>> {
        let info = self.info(name)?;
        if info.dtype != "F32" {
            return Err(WeightError::Dtype {
                name: name.to_string(),
                dtype: info.dtype.clone(),
            });
        }
        if info.shape != expected_shape {
            return Err(WeightError::Shape {
                name: name.to_string(),
                expected: expected_shape.to_vec(),
                got: info.shape.clone(),
            });
        }
        if info.byte_size() != info.element_count() * 4 {
            return Err(WeightError::Format(format!(
                "tensor '{name}' spans {} bytes for {} f32 elements",
                info.byte_size(),
                info.element_count()
            )));
        }

        let bytes = self.tensor_data(name)?;
        let mut out = vec![0.0f32; info.element_count()];
        LittleEndian::read_f32_into(bytes, &mut out);
        Ok(out)
    }

    /// Shape of a named tensor.
    pub fn shape(&self, name: &str) -> Result<&[usize]> {
        Ok(&self.info(name)?.shape)
    }

    pub fn has_tensor(&self, name: &str) -> bool {
        self.header.tensors.contains_key(name)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.header.metadata.get(key).map(String::as_str)
    }
}

/// A named `F32` tensor to be written.
pub struct F32Tensor<'a> {
    pub name: &'a str,
    pub shape: Vec<usize>,
    pub data: &'a [f32],
}

/// Write `F32` tensors and string metadata as a safetensors file.
pub fn write_f32(path: &Path, tensors: &[F32Tensor<'_>], metadata: &[(&str, &str)]) -> Result<()> {
    let mut header = BTreeMap::new();
    let mut offset = 0usize;
    for t in tensors {
        if t.shape.iter().product::<usize>() != t.data.len() {
            return Err(WeightError::Shape {
                name: t.name.to_string(),
                expected: t.shape.clone(),
                got: vec![t.data.len()],
            });
        }
        let size = t.data.len() * 4;
        let info = TensorInfo {
            dtype: "F32".to_string(),
            shape: t.shape.clone(),
            data_offsets: [offset, offset + size],
        };
        header.insert(t.name.to_string(), serde_json::to_value(info)?);
        offset += size;
    }
    if !metadata.is_empty() {
        let meta: BTreeMap<&str, &str> = metadata.iter().copied().collect();
        header.insert(METADATA_KEY.to_string(), serde_json::to_value(meta)?);
    }

    let mut header_bytes = serde_json::to_vec(&header)?;
    // Data section starts 8-byte aligned
    while header_bytes.len() % 8 != 0 {
        header_bytes.push(b' ');
    }

    let mut out = BufWriter::new(File::create(path)?);
    out.write_u64::<LittleEndian>(header_bytes.len() as u64)?;
    out.write_all(&header_bytes)?;
    for t in tensors {
        for &v in t.data {
            out.write_f32::<LittleEndian>(v)?;
        }
    }
    out.flush()?;
    Ok(())
}
