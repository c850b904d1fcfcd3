//! Metal library loading, pipeline-state caching, and kernel dispatch

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::Arc;

use metal::{
    ComputePipelineState, Device as MtlDevice, FunctionConstantValues, Library as MtlLibrary,
    MTLDataType, MTLSize,
};
use parking_lot::Mutex;
use tracing::debug;

use crate::attribute::{Attribute, AttributeKind};
use crate::backend::{downcast_image, FunctionImpl, LibraryImpl};
use crate::device::Stream;
use crate::error::{Error, Result};
use crate::function::{Function, Library};
use crate::launch::LaunchArgs;

use super::{buffer_of, stream_of, MetalImage};

/// Cache key: function name plus the serialised specialisation tuple
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    name: String,
    spec: Vec<u8>,
}

/// Serialise specialisation attributes into a stable cache key
fn spec_key(args: &[Attribute]) -> Vec<u8> {
    let mut key = Vec::with_capacity(args.len() * 24);
    for attr in args {
        key.push(attr.kind() as u8);
        key.push(attr.count() as u8);
        match attr.kind() {
            AttributeKind::Float => {
                for v in attr.f32_array() {
                    key.extend_from_slice(&v.to_ne_bytes());
                }
            }
            AttributeKind::Int => {
                for v in attr.i32_array() {
                    key.extend_from_slice(&v.to_ne_bytes());
                }
            }
            AttributeKind::Bool => {
                key.extend(attr.bool_array().iter().map(|&b| u8::from(b)));
            }
            _ => {}
        }
    }
    key
}

/// A compiled Metal library plus its pipeline-state cache
pub struct MetalLibrary {
    device: MtlDevice,
    library: MtlLibrary,
    pipelines: Mutex<HashMap<PipelineKey, ComputePipelineState>>,
}

unsafe impl Send for MetalLibrary {}
unsafe impl Sync for MetalLibrary {}

impl MetalLibrary {
    pub(super) fn from_source(device: &MtlDevice, text: &str, _options: &str) -> Result<Library> {
        let library = device
            .new_library_with_source(text, &metal::CompileOptions::new())
            .map_err(Error::build)?;
        debug!("compiled Metal library from source");
        Ok(Library::from_impl(Arc::new(Self {
            device: device.clone(),
            library,
            pipelines: Mutex::new(HashMap::new()),
        })))
    }

    pub(super) fn from_archive(device: &MtlDevice, data: &[u8]) -> Result<Library> {
        let library = device
            .new_library_with_data(data)
            .map_err(|e| Error::native("Metal", 0, e))?;
        Ok(Library::from_impl(Arc::new(Self {
            device: device.clone(),
            library,
            pipelines: Mutex::new(HashMap::new()),
        })))
    }

    /// Pipeline state for (name, specialisation), compiled at most once
    fn pipeline(&self, name: &str, spec: &[Attribute]) -> Result<ComputePipelineState> {
        let key = PipelineKey {
            name: name.to_owned(),
            spec: spec_key(spec),
        };
        let mut pipelines = self.pipelines.lock();
        if let Some(state) = pipelines.get(&key) {
            return Ok(state.clone());
        }

        let constants = if spec.is_empty() {
            None
        } else {
            Some(constant_values(spec)?)
        };
        let function = self
            .library
            .get_function(name, constants)
            .map_err(|e| Error::native("Metal", 0, e))?;
        let state = self
            .device
            .new_compute_pipeline_state_with_function(&function)
            .map_err(|e| Error::native("Metal", 0, e))?;
        pipelines.insert(key, state.clone());
        Ok(state)
    }
}

/// Route specialisation attributes into a function-constant table, indexed
/// by position
fn constant_values(spec: &[Attribute]) -> Result<FunctionConstantValues> {
    let values = FunctionConstantValues::new();
    for (index, attr) in spec.iter().enumerate() {
        match attr.kind() {
            AttributeKind::Float => values.set_constant_value_at_index(
                attr.f32_array().as_ptr() as *const c_void,
                MTLDataType::Float,
                index as u64,
            ),
            AttributeKind::Int => values.set_constant_value_at_index(
                attr.i32_array().as_ptr() as *const c_void,
                MTLDataType::Int,
                index as u64,
            ),
            AttributeKind::Bool => {
                let value = attr.as_bool();
                values.set_constant_value_at_index(
                    &value as *const bool as *const c_void,
                    MTLDataType::Bool,
                    index as u64,
                )
            }
            _ => return Err(Error::unsupported("non-scalar function constants")),
        }
    }
    Ok(values)
}

impl LibraryImpl for MetalLibrary {
    fn lookup_function(self: Arc<Self>, name: &str) -> Result<Function> {
        let pipeline = self.pipeline(name, &[])?;
        Ok(Function::from_impl(Arc::new(MetalFunction { pipeline })))
    }

    fn specialize_function(self: Arc<Self>, name: &str, args: &[Attribute]) -> Result<Function> {
        let pipeline = self.pipeline(name, args)?;
        Ok(Function::from_impl(Arc::new(MetalFunction { pipeline })))
    }
}

/// One compute pipeline state, ready to encode
pub struct MetalFunction {
    pipeline: ComputePipelineState,
}

unsafe impl Send for MetalFunction {}
unsafe impl Sync for MetalFunction {}

impl FunctionImpl for MetalFunction {
    fn execute(&self, stream: &Stream, launch: &LaunchArgs, args: &[Attribute]) -> Result<()> {
        let stream = stream_of(stream)?;
        let command = stream.queue.new_command_buffer();
        let encoder = command.new_compute_command_encoder();
        encoder.set_compute_pipeline_state(&self.pipeline);

        // scalars and buffers share the buffer-argument table; textures and
        // threadgroup memory have their own index spaces
        let mut buffer_index: u64 = 0;
        let mut texture_index: u64 = 0;
        let mut threadgroup_index: u64 = 0;
        for attr in args {
            match attr.kind() {
                AttributeKind::Float => {
                    encoder.set_bytes(
                        buffer_index,
                        (std::mem::size_of::<f32>() * attr.count().max(1)) as u64,
                        attr.f32_array().as_ptr() as *const c_void,
                    );
                    buffer_index += 1;
                }
                AttributeKind::Int => {
                    encoder.set_bytes(
                        buffer_index,
                        (std::mem::size_of::<i32>() * attr.count().max(1)) as u64,
                        attr.i32_array().as_ptr() as *const c_void,
                    );
                    buffer_index += 1;
                }
                AttributeKind::Bool => {
                    let bytes: [u8; 4] = attr.bool_array().map(u8::from);
                    encoder.set_bytes(
                        buffer_index,
                        attr.count().max(1) as u64,
                        bytes.as_ptr() as *const c_void,
                    );
                    buffer_index += 1;
                }
                AttributeKind::Buffer => {
                    let buffer = attr.as_buffer().expect("buffer attribute");
                    encoder.set_buffer(buffer_index, Some(buffer_of(buffer)?), 0);
                    buffer_index += 1;
                }
                AttributeKind::Image => {
                    let image = attr.as_image().expect("image attribute");
                    let image = downcast_image::<MetalImage>(image)?;
                    encoder.set_texture(texture_index, Some(&image.texture));
                    texture_index += 1;
                }
                AttributeKind::LocalMem => {
                    encoder.set_threadgroup_memory_length(
                        threadgroup_index,
                        u64::from(attr.local_mem_bytes()),
                    );
                    threadgroup_index += 1;
                }
                AttributeKind::String | AttributeKind::Unknown => {}
            }
        }

        let dims = launch.dims().max(1) as usize;
        let mut groups = [1u64; 3];
        for (i, group) in groups.iter_mut().enumerate().take(dims) {
            *group = launch.count_dim(i) as u64;
        }
        let local = launch.local_size();
        encoder.dispatch_thread_groups(
            MTLSize {
                width: groups[0],
                height: groups[1],
                depth: groups[2],
            },
            MTLSize {
                width: u64::from(local[0]),
                height: u64::from(local[1]),
                depth: u64::from(local[2]),
            },
        );
        encoder.end_encoding();
        command.commit();
        Ok(())
    }
}
