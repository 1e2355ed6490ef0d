//! Precompiled module loading.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that only ever loads ahead-of-time artifacts. Raw WebAssembly is rejected:
//! it has to go through [`WasmEngine::precompile`](crate::WasmEngine::precompile)
//! at build time first, so nothing is compiled on the device.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{debug, error, instrument};
use wasmtime::{Engine, ExternType, Module};

use dsp_runtime_common::RuntimeError;

/// Magic number of a raw WebAssembly binary.
const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Precompiled artifacts are ELF images.
const ARTIFACT_MAGIC: &[u8; 4] = b"\x7fELF";

/// A loaded, precompiled WebAssembly module.
///
/// The underlying Wasmtime module is immutable machine code plus metadata;
/// cloning is cheap.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,

    /// Hash of the artifact bytes.
    content_hash: String,
}

impl CompiledModule {
    /// Load a precompiled module image.
    ///
    /// # Arguments
    ///
    /// * `engine` - The Wasmtime engine (must match the precompilation settings)
    /// * `bytes` - The artifact produced by `WasmEngine::precompile`
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ModuleLoad`] if the image is not a compatible
    /// artifact. The diagnostic carries the first four bytes of the image.
    #[allow(unsafe_code)]
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_precompiled(engine: &Engine, bytes: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        Self::validate_artifact_header(bytes).inspect_err(|e| {
            error!(header = %header_hex(bytes), error = %e, "Rejected module image");
        })?;

        // SAFETY: `deserialize` checks the artifact's engine and version
        // fingerprint; the bytes are the output of `precompile_module`.
        let module = unsafe { Module::deserialize(engine, bytes) }.map_err(|e| {
            error!(header = %header_hex(bytes), "Precompiled module rejected by runtime");
            RuntimeError::module_load(format!(
                "Failed to load precompiled module (header {}): {e}",
                header_hex(bytes)
            ))
        })?;

        let content_hash = compute_hash(bytes);

        debug!(
            content_hash = %content_hash,
            duration_us = start.elapsed().as_micros(),
            "Precompiled module loaded"
        );

        Ok(Self {
            inner: module,
            content_hash,
        })
    }

    /// Validate the artifact header before handing it to the runtime.
    fn validate_artifact_header(bytes: &[u8]) -> Result<(), RuntimeError> {
        if bytes.len() < 16 {
            return Err(RuntimeError::module_load(format!(
                "Invalid module image: {} bytes is too small",
                bytes.len()
            )));
        }

        if &bytes[0..4] == WASM_MAGIC {
            return Err(RuntimeError::module_load(
                "Module image is raw WebAssembly; precompile it with `dsp-runtime compile`",
            ));
        }

        if &bytes[0..4] != ARTIFACT_MAGIC {
            return Err(RuntimeError::module_load(format!(
                "Invalid module image: bad magic number {}",
                header_hex(bytes)
            )));
        }

        Ok(())
    }

    /// Names of the exported functions.
    pub fn exports(&self) -> Vec<String> {
        self.inner
            .exports()
            .filter(|export| matches!(export.ty(), ExternType::Func(_)))
            .map(|export| export.name().to_string())
            .collect()
    }

    /// Get the content hash of the artifact.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get the inner Wasmtime module.
    pub fn inner(&self) -> &Module {
        &self.inner
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// The first four bytes of an image, hex-encoded.
fn header_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::alloc::{AlignedAllocator, RegionAllocator};
    use crate::WasmEngine;
    use dsp_runtime_common::EngineConfig;

    const MINIMAL_WASM: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, // magic: \0asm
        0x01, 0x00, 0x00, 0x00, // version: 1
    ];

    fn engine() -> WasmEngine {
        let region = Arc::new(RegionAllocator::new(4 * 1024 * 1024));
        WasmEngine::new(&EngineConfig::default(), Arc::new(AlignedAllocator::new(region))).unwrap()
    }

    #[test]
    fn test_header_too_small() {
        let err = CompiledModule::validate_artifact_header(&[0x7f, 0x45]).unwrap_err();
        assert!(err.to_string().contains("too small"));
    }

    #[test]
    fn test_header_raw_wasm_rejected() {
        let mut bytes = MINIMAL_WASM.to_vec();
        bytes.resize(32, 0);
        let err = CompiledModule::validate_artifact_header(&bytes).unwrap_err();
        assert!(err.to_string().contains("precompile"));
    }

    #[test]
    fn test_header_bad_magic_reports_bytes() {
        let bytes = [0xde, 0xad, 0xbe, 0xef].repeat(8);
        let err = CompiledModule::validate_artifact_header(&bytes).unwrap_err();
        assert!(err.to_string().contains("de ad be ef"));
    }

    #[test]
    fn test_header_hex() {
        assert_eq!(header_hex(b"\x7fELF\x02"), "7f 45 4c 46");
        assert_eq!(header_hex(&[1]), "01");
        assert_eq!(header_hex(&[]), "");
    }

    #[test]
    fn test_compute_hash() {
        let hash1 = compute_hash(b"hello");
        let hash2 = compute_hash(b"hello");
        let hash3 = compute_hash(b"world");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        assert_eq!(hash1.len(), 16);
    }

    #[test]
    fn test_load_precompiled() {
        let engine = engine();
        let artifact = engine
            .precompile(br#"(module (func (export "process") (param f32) (result f32) local.get 0))"#)
            .unwrap();

        let module = CompiledModule::from_precompiled(engine.inner(), &artifact).unwrap();
        assert_eq!(module.exports(), vec!["process".to_string()]);
        assert!(!module.content_hash().is_empty());
    }

    #[test]
    fn test_load_rejects_raw_wasm() {
        let engine = engine();
        let err = CompiledModule::from_precompiled(engine.inner(), MINIMAL_WASM).unwrap_err();
        assert!(matches!(err, RuntimeError::ModuleLoad { .. }));
    }

    #[test]
    fn test_load_rejects_truncated_artifact() {
        let engine = engine();
        let artifact = engine.precompile(b"(module)").unwrap();
        let truncated = &artifact[..artifact.len() / 2];

        let err = CompiledModule::from_precompiled(engine.inner(), truncated).unwrap_err();
        assert!(err.to_string().contains("7f 45 4c 46"));
    }

    #[test]
    fn test_module_debug() {
        let engine = engine();
        let artifact = engine.precompile(b"(module)").unwrap();
        let module = CompiledModule::from_precompiled(engine.inner(), &artifact).unwrap();

        let debug_str = format!("{module:?}");
        assert!(debug_str.contains("CompiledModule"));
        assert!(debug_str.contains("content_hash"));
    }
}
