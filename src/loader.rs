//! Model file loading and dispatch
//!
//! A model file is, in order: the 4-byte magic `ggml`, an i32 model type, an
//! i32 version, the family config record, the tokenizer blob, and the tensor
//! blob. [`ModelLoader`] memory-maps the file, validates the header, and
//! remembers the three section offsets so any section can be revisited:
//! [`reload_model`] rebuilds a model under a new `max_length` without
//! re-reading the tokenizer.
//!
//! Dispatch is a static registry table keyed by model type; see
//! [`crate::models`].

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use half::f16;
use memmap2::Mmap;

use crate::config::BaseConfig;
use crate::engine::{CausalTransformer, Model};
use crate::error::{CharlarError, Result};
use crate::models;
use crate::tokenizer::{Tokenizer, VocabTokenizer};

/// Magic bytes every model file starts with
pub const MODEL_MAGIC: &[u8; 4] = b"ggml";

/// Tensor payload dtype tags
const DTYPE_F32: i32 = 0;
const DTYPE_F16: i32 = 1;

/// A loaded model file: tokenizer plus the model driving it
pub struct LoadResult {
    /// Shared, immutable tokenizer
    pub tokenizer: Arc<dyn Tokenizer>,
    /// The model behind the uniform caller-facing interface
    pub model: Box<dyn Model>,
}

impl std::fmt::Debug for LoadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadResult").finish_non_exhaustive()
    }
}

/// Load a model file and construct its family
///
/// `max_length` optionally lowers the model's context limit; it can never
/// raise it beyond the file value.
///
/// # Errors
///
/// Bad magic, unknown model type, version mismatch, and any parse failure in
/// the config/tokenizer/tensor sections. No partial model is ever returned.
///
/// # Example
///
/// ```rust,ignore
/// let result = charlar::load("model.bin", None)?;
/// let ids = vec![result.tokenizer.bos_token_id()];
/// ```
pub fn load<P: AsRef<Path>>(path: P, max_length: Option<usize>) -> Result<LoadResult> {
    let mut loader = ModelLoader::from_path(path.as_ref())?;
    let entry = models::find_entry(loader.model_type)?;
    if loader.version != entry.supported_version {
        return Err(CharlarError::UnsupportedVersion {
            model: entry.model_type.name().to_string(),
            expected: entry.supported_version,
            actual: loader.version,
        });
    }
    (entry.build)(&mut loader, max_length)
}

/// Rebuild the model from an already-parsed loader, reusing its tokenizer
///
/// Seeks back to the remembered offsets, so the config and tensors are
/// re-read but the tokenizer section is skipped entirely.
///
/// # Errors
///
/// Same failure surface as [`load`], minus the tokenizer section.
pub fn reload_model(
    loader: &mut ModelLoader,
    tokenizer: Arc<dyn Tokenizer>,
    max_length: Option<usize>,
) -> Result<Box<dyn Model>> {
    let entry = models::find_entry(loader.model_type)?;
    if loader.version != entry.supported_version {
        return Err(CharlarError::UnsupportedVersion {
            model: entry.model_type.name().to_string(),
            expected: entry.supported_version,
            actual: loader.version,
        });
    }
    (entry.rebuild)(loader, tokenizer, max_length)
}

/// Cursor over a memory-mapped model file
///
/// Tracks the three section offsets (`offset_config`, `offset_tokenizer`,
/// `offset_tensors`); a zero offset means "not reached yet", since the
/// header is twelve bytes and zero is never a valid section start.
#[derive(Debug)]
pub struct ModelLoader {
    mmap: Mmap,
    pos: usize,
    /// Raw model type tag from the header
    pub model_type: i32,
    /// File version from the header
    pub version: i32,
    /// Start of the config record
    pub offset_config: usize,
    /// Start of the tokenizer blob
    pub offset_tokenizer: usize,
    /// Start of the tensor blob
    pub offset_tensors: usize,
}

impl ModelLoader {
    /// Map the file and validate its header
    ///
    /// # Errors
    ///
    /// I/O failures, a short file, or bad magic.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| CharlarError::Io {
            message: format!("failed to open {}: {e}", path.display()),
        })?;
        // SAFETY: the mapping is only read, never written, and the file is
        // not expected to change underneath a loaded model.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| CharlarError::Io {
                message: format!("failed to mmap {}: {e}", path.display()),
            })?
        };

        let mut loader = Self {
            mmap,
            pos: 0,
            model_type: 0,
            version: 0,
            offset_config: 0,
            offset_tokenizer: 0,
            offset_tensors: 0,
        };

        let magic = loader.read_bytes(4)?;
        if magic != MODEL_MAGIC {
            let mut found = [0u8; 4];
            found.copy_from_slice(magic);
            return Err(CharlarError::BadMagic { found });
        }
        loader.model_type = loader.read_i32()?;
        loader.version = loader.read_i32()?;
        Ok(loader)
    }

    /// Current cursor position
    #[must_use]
    pub fn tell(&self) -> usize {
        self.pos
    }

    /// Move the cursor to an absolute offset
    pub fn seek(&mut self, pos: usize) {
        self.pos = pos;
    }

    /// Bytes from the cursor to the end of the file
    #[must_use]
    pub fn remaining(&self) -> &[u8] {
        &self.mmap[self.pos.min(self.mmap.len())..]
    }

    /// Read and advance past `n` bytes
    ///
    /// # Errors
    ///
    /// [`CharlarError::Malformed`] when the file ends early.
    pub fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| CharlarError::Malformed {
            reason: "offset overflow".to_string(),
        })?;
        if end > self.mmap.len() {
            return Err(CharlarError::Malformed {
                reason: format!(
                    "unexpected end of file: need {n} bytes at offset {}, file is {}",
                    self.pos,
                    self.mmap.len()
                ),
            });
        }
        let bytes = &self.mmap[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Read a little-endian i32
    ///
    /// # Errors
    ///
    /// See [`ModelLoader::read_bytes`].
    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(
            self.read_bytes(4)?.try_into().expect("4-byte slice"),
        ))
    }

    /// Read a little-endian u32
    ///
    /// # Errors
    ///
    /// See [`ModelLoader::read_bytes`].
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(
            self.read_bytes(4)?.try_into().expect("4-byte slice"),
        ))
    }

    /// Read a little-endian i64
    ///
    /// # Errors
    ///
    /// See [`ModelLoader::read_bytes`].
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(
            self.read_bytes(8)?.try_into().expect("8-byte slice"),
        ))
    }

    /// Read one named tensor record into f32
    ///
    /// The record is `u32 name length + name, i32 ndim, ndim × i64 dims,
    /// i32 dtype, payload`. Records are read strictly in the order the
    /// transformer enumerates them; any name or shape disagreement is fatal.
    ///
    /// # Errors
    ///
    /// [`CharlarError::TensorMismatch`] on a name disagreement,
    /// [`CharlarError::TensorShapeMismatch`] on a shape disagreement,
    /// [`CharlarError::Malformed`] on truncation or an unknown dtype.
    pub fn read_tensor(&mut self, expected_name: &str, expected_shape: &[usize]) -> Result<Vec<f32>> {
        let name_len = self.read_u32()? as usize;
        let name_bytes = self.read_bytes(name_len)?.to_vec();
        let actual = String::from_utf8(name_bytes).map_err(|e| CharlarError::Malformed {
            reason: format!("tensor name is not UTF-8: {e}"),
        })?;
        if actual != expected_name {
            return Err(CharlarError::TensorMismatch {
                expected: expected_name.to_string(),
                actual,
            });
        }

        let ndim = self.read_i32()?;
        if !(0..=4).contains(&ndim) {
            return Err(CharlarError::Malformed {
                reason: format!("tensor '{actual}': implausible ndim {ndim}"),
            });
        }
        let mut shape = Vec::with_capacity(ndim as usize);
        for _ in 0..ndim {
            shape.push(self.read_i64()? as usize);
        }
        let elements: usize = shape.iter().product();
        let expected_elements: usize = expected_shape.iter().product();
        if elements != expected_elements {
            return Err(CharlarError::TensorShapeMismatch {
                name: actual,
                elements: expected_elements,
                shape,
            });
        }

        let dtype = self.read_i32()?;
        match dtype {
            DTYPE_F32 => {
                let payload = self.read_bytes(elements * 4)?;
                Ok(payload
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes(c.try_into().expect("4-byte chunk")))
                    .collect())
            },
            DTYPE_F16 => {
                let payload = self.read_bytes(elements * 2)?;
                Ok(payload
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes(c.try_into().expect("2-byte chunk")).to_f32())
                    .collect())
            },
            other => Err(CharlarError::Malformed {
                reason: format!("tensor '{actual}': unknown dtype {other}"),
            }),
        }
    }
}

/// Read the family config, recording/reusing `offset_config`
///
/// # Errors
///
/// Propagates config parse failures.
pub fn load_config(loader: &mut ModelLoader, max_length: Option<usize>) -> Result<BaseConfig> {
    if loader.offset_config == 0 {
        loader.offset_config = loader.tell();
    } else {
        loader.seek(loader.offset_config);
    }
    let config = BaseConfig::read(loader, max_length)?;
    loader.offset_tokenizer = loader.tell();
    Ok(config)
}

/// Read the tokenizer blob, consuming exactly its framed size
///
/// # Errors
///
/// Propagates tokenizer parse failures.
pub fn load_tokenizer(loader: &mut ModelLoader, config: &BaseConfig) -> Result<Arc<VocabTokenizer>> {
    loader.seek(loader.offset_tokenizer);
    let (tokenizer, consumed) = VocabTokenizer::load(loader.remaining(), config)?;
    loader.seek(loader.offset_tokenizer + consumed);
    loader.offset_tensors = loader.tell();
    Ok(Arc::new(tokenizer))
}

/// Populate a transformer's tensors from the tensor blob
///
/// # Errors
///
/// Propagates tensor read failures.
pub fn load_transformer<T: CausalTransformer>(
    loader: &mut ModelLoader,
    transformer: &mut T,
) -> Result<()> {
    loader.seek(loader.offset_tensors);
    transformer.load(loader)
}
