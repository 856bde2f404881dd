//! WGSL composition and compiled shader-module caching.

use log::{debug, info};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use thiserror::Error;
use wgpu::{ShaderModuleDescriptor, ShaderSource};

/// Error types for shader loading operations.
#[derive(Debug, Error)]
pub enum ShaderError {
    #[error("shader '{name}' failed to compile: {message}")]
    CompilationFailed { name: String, message: String },

    #[error("shader '{name}' not found in library")]
    NotLoaded { name: String },
}

/// Concatenate WGSL fragments (shared helpers first) into one module source.
pub fn compose_wgsl(parts: &[&str]) -> String {
    let mut out = String::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for part in parts {
        out.push_str(part);
        if !part.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

/// Compiled shader modules keyed by label.
///
/// Pipelines that share a label share the module; the source hash is kept so
/// a changed source under the same label recompiles.
pub struct ShaderLibrary {
    modules: FxHashMap<String, (u64, Arc<wgpu::ShaderModule>)>,
}

fn source_hash(source: &str) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut h = rustc_hash::FxHasher::default();
    source.hash(&mut h);
    h.finish()
}

impl ShaderLibrary {
    pub fn new() -> Self {
        Self {
            modules: FxHashMap::default(),
        }
    }

    /// Compile `source` under `name`, or return the cached module.
    ///
    /// Compilation messages of error severity become
    /// [`ShaderError::CompilationFailed`].
    pub fn load_from_source(
        &mut self,
        device: &wgpu::Device,
        name: &str,
        source: &str,
    ) -> Result<Arc<wgpu::ShaderModule>, ShaderError> {
        let hash = source_hash(source);
        if let Some((cached, module)) = self.modules.get(name)
            && *cached == hash
        {
            return Ok(module.clone());
        }

        debug!("Compiling shader '{}'", name);
        let module = device.create_shader_module(ShaderModuleDescriptor {
            label: Some(name),
            source: ShaderSource::Wgsl(source.into()),
        });

        let compilation = pollster::block_on(module.get_compilation_info());
        let errors: Vec<String> = compilation
            .messages
            .iter()
            .filter(|m| matches!(m.message_type, wgpu::CompilationMessageType::Error))
            .map(|m| m.message.clone())
            .collect();
        if !errors.is_empty() {
            return Err(ShaderError::CompilationFailed {
                name: name.to_string(),
                message: errors.join("; "),
            });
        }

        let module = Arc::new(module);
        if self
            .modules
            .insert(name.to_string(), (hash, module.clone()))
            .is_some()
        {
            info!("Replaced shader '{}'", name);
        } else {
            info!("Loaded shader '{}'", name);
        }
        Ok(module)
    }

    /// Get a previously compiled shader by name.
    pub fn get(&self, name: &str) -> Result<Arc<wgpu::ShaderModule>, ShaderError> {
        self.modules
            .get(name)
            .map(|(_, m)| m.clone())
            .ok_or_else(|| ShaderError::NotLoaded {
                name: name.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl Default for ShaderLibrary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::create_test_device_queue;

    const VALID_SHADER: &str = r#"
        @vertex
        fn vs_main(@builtin(vertex_index) idx: u32) -> @builtin(position) vec4<f32> {
            return vec4<f32>(0.0, 0.0, 0.0, 1.0);
        }

        @fragment
        fn fs_main() -> @location(0) vec4<f32> {
            return vec4<f32>(1.0, 0.0, 0.0, 1.0);
        }
    "#;

    /// Fragments are joined with newlines in order.
    #[test]
    fn test_compose_wgsl_joins_parts() {
        let src = compose_wgsl(&["const A: f32 = 1.0;", "const B: f32 = A;\n"]);
        assert_eq!(src, "const A: f32 = 1.0;\nconst B: f32 = A;\n");
    }

    /// Loading the same source twice reuses the module.
    #[test]
    fn test_cache_returns_same_module_for_same_source() {
        let Some((device, _queue)) = create_test_device_queue() else {
            return;
        };
        let mut library = ShaderLibrary::new();
        let a = library.load_from_source(&device, "tri", VALID_SHADER).unwrap();
        let b = library.load_from_source(&device, "tri", VALID_SHADER).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(library.len(), 1);
    }

    /// Unknown names report `NotLoaded`.
    #[test]
    fn test_get_nonexistent_shader() {
        let library = ShaderLibrary::new();
        assert!(matches!(
            library.get("missing"),
            Err(ShaderError::NotLoaded { .. })
        ));
        assert!(library.is_empty());
    }
}
