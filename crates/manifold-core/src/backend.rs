//! Abstract contract between the public facade and the backends
//!
//! Each backend implements these object-safe traits; the facade types in
//! [`crate::device`] and [`crate::function`] hold them behind `Arc` and
//! forward. A method whose native runtime cannot provide the operation
//! reports [`Error::Unsupported`] rather than silently degrading.
//!
//! The `as_any` hooks let a backend recover its own concrete stream/buffer
//! types from facade values at enqueue time; handing a stream from one
//! backend to another backend's operation is reported as unsupported.

use std::any::Any;
use std::ffi::c_void;
use std::path::Path;
use std::sync::Arc;

use crate::attribute::Attribute;
use crate::cache::BinaryCache;
use crate::device::{Buffer, HostMemory, Image, MappedBuffer, Stream};
use crate::error::{Error, Result};
use crate::function::{Function, Library};
use crate::image::{Access, ImageDescription};
use crate::launch::LaunchArgs;

/// Device property selectors for [`DeviceImpl::get_attribute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceAttributeId {
    /// Backend name ("CPU", "CUDA", "Metal", "OpenCL")
    Implementation,
    Name,
    Vendor,
    DriverVersion,
    /// Sub-units stamping the cache fingerprint: multiprocessors on
    /// CUDA-class devices, context device count on OpenCL-class, 1 on CPU
    SubUnitCount,
    ProcessorCount,
    UnifiedMemory,
    TotalMemory,
    LocalMemory,
    MaxThreadsPerGroup,
    MaxWorkSize,
    MaxRegisters,
    MaxImageSize1D,
    MaxImageSize2D,
    MaxImageSize3D,
    ImageAlignment,
    SupportsMappedBuffer,
    SupportsProgramConstants,
    SubgroupWidth,
    SupportsSubgroup,
    SupportsSubgroupShuffle,
    SupportsImageIntFiltering,
    SupportsImageFloatFiltering,
}

/// Function property selectors for [`FunctionImpl::get_attribute`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionAttributeId {
    LocalMemory,
    MaxLocalMemory,
    ThreadWidth,
    MaxThreads,
    RequiredWorkSize,
}

/// Externally created native objects a device may adopt instead of creating
/// its own. Any subset may be null; each backend interprets the pointers as
/// its own native types.
#[derive(Debug, Clone, Copy)]
pub struct SharedContext {
    pub context: *mut c_void,
    pub queue: *mut c_void,
    pub device: *mut c_void,
    pub platform: *mut c_void,
}

impl Default for SharedContext {
    fn default() -> Self {
        Self {
            context: std::ptr::null_mut(),
            queue: std::ptr::null_mut(),
            device: std::ptr::null_mut(),
            platform: std::ptr::null_mut(),
        }
    }
}

/// Backend stream: an ordered queue of device work
pub trait StreamImpl: Send + Sync {
    /// Block until everything enqueued so far has completed
    fn sync(&self) -> Result<()>;

    fn as_any(&self) -> &dyn Any;
}

/// Backend buffer: linear device-visible memory
pub trait BufferImpl: Send + Sync {
    fn copy_from_buffer(&self, stream: &Stream, src: &Buffer, bytes: usize) -> Result<()>;

    /// Enqueue a host-to-device copy of `src`
    fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<()>;

    /// Enqueue a device-to-host copy into `dst`
    fn copy_to_host(&self, stream: &Stream, dst: &mut [u8]) -> Result<()>;

    /// Map the buffer into host address space (mapped buffers only)
    fn map(&self, _stream: &Stream, _access: Access, _sync: bool) -> Result<*mut u8> {
        Err(Error::unsupported("mapped buffers"))
    }

    fn unmap(&self, _stream: &Stream) -> Result<()> {
        Err(Error::unsupported("mapped buffers"))
    }

    fn as_any(&self) -> &dyn Any;
}

/// Backend image: 1-D/2-D/3-D formatted memory
pub trait ImageImpl: Send + Sync {
    fn copy_from_image(&self, stream: &Stream, src: &Image) -> Result<()>;
    fn copy_from_buffer(&self, stream: &Stream, src: &Buffer, descr: &ImageDescription)
        -> Result<()>;
    fn copy_from_host(&self, stream: &Stream, src: &[u8], descr: &ImageDescription) -> Result<()>;
    fn copy_to_buffer(&self, stream: &Stream, dst: &Buffer, descr: &ImageDescription)
        -> Result<()>;
    fn copy_to_host(&self, stream: &Stream, dst: &mut [u8], descr: &ImageDescription)
        -> Result<()>;

    fn description(&self) -> &ImageDescription;

    fn as_any(&self) -> &dyn Any;
}

/// Backend function: one launchable kernel entry point
pub trait FunctionImpl: Send + Sync {
    /// Translate `args` to native kernel parameters and enqueue the launch
    fn execute(&self, stream: &Stream, launch: &LaunchArgs, args: &[Attribute]) -> Result<()>;

    fn get_attribute(&self, _what: FunctionAttributeId) -> Result<Attribute> {
        Ok(Attribute::unknown())
    }
}

/// Backend library: a loaded module of kernel entry points
pub trait LibraryImpl: Send + Sync {
    fn lookup_function(self: Arc<Self>, name: &str) -> Result<Function>;

    /// Compile-time specialisation over a function-constant table
    fn specialize_function(self: Arc<Self>, _name: &str, _args: &[Attribute]) -> Result<Function> {
        Err(Error::unsupported("function specialisation"))
    }
}

/// Backend device: the root object of one runtime
pub trait DeviceImpl: Send + Sync {
    fn load_library_from_text(&self, text: &str, options: &str) -> Result<Library>;

    fn load_library_from_data(&self, data: &[u8], options: &str) -> Result<Library>;

    /// Load a library from a file. The default reads the file and defers to
    /// the binary path; the CPU backend overrides this with a native
    /// shared-library load.
    fn load_library_from_file(&self, path: &Path) -> Result<Library> {
        let data = std::fs::read(path)?;
        self.load_library_from_data(&data, "")
    }

    /// Expose this device's native handles for interop with the embedder
    fn share_context(&self) -> SharedContext;

    fn create_stream(&self) -> Result<Stream>;

    /// Advisory memory-pool sizing; backends store the value
    fn memory_pool_size(&self) -> usize;
    fn set_memory_pool_size(&self, bytes: usize);

    /// Plain host allocation, zero-initialised
    fn allocate_host_memory(&self, bytes: usize) -> HostMemory {
        HostMemory::new(bytes)
    }

    fn allocate_buffer(&self, bytes: usize, access: Access) -> Result<Buffer>;

    fn allocate_mapped_buffer(&self, bytes: usize, access: Access) -> Result<MappedBuffer>;

    fn allocate_image(&self, descr: &ImageDescription) -> Result<Image>;

    /// A new image view aliasing `buffer`'s storage
    fn shared_image_from_buffer(&self, descr: &ImageDescription, buffer: &Buffer)
        -> Result<Image>;

    /// A new image view aliasing `image`'s storage
    fn shared_image_from_image(&self, descr: &ImageDescription, image: &Image) -> Result<Image>;

    /// Query a device property; unknown selectors yield an invalid attribute
    fn get_attribute(&self, what: DeviceAttributeId) -> Attribute;

    /// The binary cache this device consults when compiling
    fn binary_cache(&self) -> Arc<BinaryCache>;

    fn as_any(&self) -> &dyn Any;
}

/// Recover a backend's concrete stream type from a facade stream
pub(crate) fn downcast_stream<'a, T: 'static>(stream: &'a Stream) -> Result<&'a T> {
    stream
        .imp()
        .as_any()
        .downcast_ref::<T>()
        .ok_or(Error::Unsupported("stream belongs to a different backend"))
}

/// Recover a backend's concrete buffer type from a facade buffer
pub(crate) fn downcast_buffer<'a, T: 'static>(buffer: &'a Buffer) -> Result<&'a T> {
    buffer
        .imp()
        .as_any()
        .downcast_ref::<T>()
        .ok_or(Error::Unsupported("buffer belongs to a different backend"))
}

/// Recover a backend's concrete image type from a facade image
pub(crate) fn downcast_image<'a, T: 'static>(image: &'a Image) -> Result<&'a T> {
    image
        .imp()
        .as_any()
        .downcast_ref::<T>()
        .ok_or(Error::Unsupported("image belongs to a different backend"))
}
