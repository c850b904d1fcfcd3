//! Public device surface
//!
//! `Device`, `Stream`, `Buffer`, `MappedBuffer`, `Image`, and `HostMemory`
//! are thin shared-reference wrappers over a backend implementation. Cloning
//! any of them shares the underlying native object; the last clone to drop
//! runs the backend's release. User code written against these types works
//! unchanged on every backend.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::attribute::Attribute;
use crate::backend::{BufferImpl, DeviceAttributeId, DeviceImpl, ImageImpl, SharedContext, StreamImpl};
use crate::cache::BinaryCache;
use crate::error::Result;
use crate::function::Library;
use crate::image::{Access, ImageDescription};

/// An ordered queue of device work
#[derive(Clone)]
pub struct Stream {
    imp: Arc<dyn StreamImpl>,
}

impl Stream {
    pub(crate) fn from_impl(imp: Arc<dyn StreamImpl>) -> Self {
        Self { imp }
    }

    pub(crate) fn imp(&self) -> &Arc<dyn StreamImpl> {
        &self.imp
    }

    /// Block until everything enqueued on this stream has completed
    pub fn sync(&self) -> Result<()> {
        self.imp.sync()
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream").finish_non_exhaustive()
    }
}

/// Linear device-visible memory
#[derive(Clone)]
pub struct Buffer {
    imp: Arc<dyn BufferImpl>,
}

impl Buffer {
    pub(crate) fn from_impl(imp: Arc<dyn BufferImpl>) -> Self {
        Self { imp }
    }

    pub(crate) fn imp(&self) -> &Arc<dyn BufferImpl> {
        &self.imp
    }

    /// Enqueue a device-to-device copy of `bytes` bytes from `src`
    pub fn copy_from(&self, stream: &Stream, src: &Buffer, bytes: usize) -> Result<()> {
        self.imp.copy_from_buffer(stream, src, bytes)
    }

    /// Enqueue a host-to-device upload of `src`
    ///
    /// The copy may still be in flight when this returns; synchronize the
    /// stream before reusing `src` storage for something else.
    pub fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<()> {
        self.imp.copy_from_host(stream, src)
    }

    /// Enqueue a device-to-host download into `dst`
    ///
    /// Synchronize the stream before reading `dst`.
    pub fn copy_to_host(&self, stream: &Stream, dst: &mut [u8]) -> Result<()> {
        self.imp.copy_to_host(stream, dst)
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer").finish_non_exhaustive()
    }
}

/// A buffer whose storage is directly addressable from the host
#[derive(Clone, Debug)]
pub struct MappedBuffer {
    buffer: Buffer,
}

impl MappedBuffer {
    pub(crate) fn from_impl(imp: Arc<dyn BufferImpl>) -> Self {
        Self {
            buffer: Buffer::from_impl(imp),
        }
    }

    /// Obtain the host pointer for the requested access
    ///
    /// With `sync` set, in-flight device work on the buffer is made visible
    /// before the pointer is handed back.
    pub fn map(&self, stream: &Stream, access: Access, sync: bool) -> Result<*mut u8> {
        self.buffer.imp().map(stream, access, sync)
    }

    pub fn unmap(&self, stream: &Stream) -> Result<()> {
        self.buffer.imp().unmap(stream)
    }
}

impl std::ops::Deref for MappedBuffer {
    type Target = Buffer;

    fn deref(&self) -> &Buffer {
        &self.buffer
    }
}

/// 1-D/2-D/3-D formatted memory
#[derive(Clone)]
pub struct Image {
    imp: Arc<dyn ImageImpl>,
}

impl Image {
    pub(crate) fn from_impl(imp: Arc<dyn ImageImpl>) -> Self {
        Self { imp }
    }

    pub(crate) fn imp(&self) -> &Arc<dyn ImageImpl> {
        &self.imp
    }

    /// The descriptor the image was created with
    pub fn description(&self) -> ImageDescription {
        *self.imp.description()
    }

    pub fn copy_from(&self, stream: &Stream, src: &Image) -> Result<()> {
        self.imp.copy_from_image(stream, src)
    }

    pub fn copy_from_buffer(
        &self,
        stream: &Stream,
        src: &Buffer,
        descr: &ImageDescription,
    ) -> Result<()> {
        self.imp.copy_from_buffer(stream, src, descr)
    }

    pub fn copy_from_host(
        &self,
        stream: &Stream,
        src: &[u8],
        descr: &ImageDescription,
    ) -> Result<()> {
        self.imp.copy_from_host(stream, src, descr)
    }

    pub fn copy_to_buffer(
        &self,
        stream: &Stream,
        dst: &Buffer,
        descr: &ImageDescription,
    ) -> Result<()> {
        self.imp.copy_to_buffer(stream, dst, descr)
    }

    pub fn copy_to_host(
        &self,
        stream: &Stream,
        dst: &mut [u8],
        descr: &ImageDescription,
    ) -> Result<()> {
        self.imp.copy_to_host(stream, dst, descr)
    }
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("description", self.imp.description())
            .finish()
    }
}

/// Owned, zero-initialised host allocation
///
/// The CPU backend's buffers are backed by these; user code can also request
/// one through [`Device::allocate_host_memory`] for staging.
pub struct HostMemory {
    ptr: NonNull<u8>,
    len: usize,
}

const HOST_MEMORY_ALIGN: usize = 64;

impl HostMemory {
    pub fn new(bytes: usize) -> Self {
        if bytes == 0 {
            return Self {
                ptr: NonNull::dangling(),
                len: 0,
            };
        }
        let layout = Layout::from_size_align(bytes, HOST_MEMORY_ALIGN).expect("valid layout");
        // SAFETY: layout has non-zero size
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, len: bytes }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for HostMemory {
    fn drop(&mut self) {
        if self.len > 0 {
            let layout = Layout::from_size_align(self.len, HOST_MEMORY_ALIGN).expect("valid layout");
            // SAFETY: allocated with this exact layout in `new`
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

// SAFETY: the allocation is uniquely owned; all access goes through raw
// pointers handed to kernels, whose synchronization is the caller's contract.
unsafe impl Send for HostMemory {}
unsafe impl Sync for HostMemory {}

impl fmt::Debug for HostMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostMemory").field("len", &self.len).finish()
    }
}

/// One compute device of some backend
///
/// Obtained from a backend constructor such as
/// [`crate::backends::CpuDevice::create`]. All allocation and library
/// loading goes through here; kernel work is enqueued on its streams.
#[derive(Clone)]
pub struct Device {
    imp: Arc<dyn DeviceImpl>,
    default_stream: Stream,
}

impl Device {
    pub(crate) fn from_impl(imp: Arc<dyn DeviceImpl>, default_stream: Stream) -> Self {
        Self {
            imp,
            default_stream,
        }
    }

    pub(crate) fn imp(&self) -> &Arc<dyn DeviceImpl> {
        &self.imp
    }

    /// Compile a library from kernel source text
    pub fn load_library_from_text(&self, text: &str, options: &str) -> Result<Library> {
        self.imp.load_library_from_text(text, options)
    }

    /// Load a library from a compiled blob (PTX, fat binary, IL, archive)
    pub fn load_library_from_data(&self, data: &[u8], options: &str) -> Result<Library> {
        self.imp.load_library_from_data(data, options)
    }

    /// Load a library from a file; on the CPU backend this is a native
    /// shared-library load
    pub fn load_library_from_file(&self, path: impl AsRef<Path>) -> Result<Library> {
        self.imp.load_library_from_file(path.as_ref())
    }

    /// Expose native handles for embedding alongside an existing runtime
    pub fn share_context(&self) -> SharedContext {
        self.imp.share_context()
    }

    pub fn create_stream(&self) -> Result<Stream> {
        self.imp.create_stream()
    }

    /// The stream created with the device
    pub fn default_stream(&self) -> Stream {
        self.default_stream.clone()
    }

    /// Advisory memory-pool size previously stored with
    /// [`set_memory_pool_size`](Self::set_memory_pool_size)
    pub fn memory_pool_size(&self) -> usize {
        self.imp.memory_pool_size()
    }

    pub fn set_memory_pool_size(&self, bytes: usize) {
        self.imp.set_memory_pool_size(bytes)
    }

    /// Plain zero-initialised host allocation
    pub fn allocate_host_memory(&self, bytes: usize) -> HostMemory {
        self.imp.allocate_host_memory(bytes)
    }

    pub fn allocate_buffer(&self, bytes: usize, access: Access) -> Result<Buffer> {
        self.imp.allocate_buffer(bytes, access)
    }

    pub fn allocate_mapped_buffer(&self, bytes: usize, access: Access) -> Result<MappedBuffer> {
        self.imp.allocate_mapped_buffer(bytes, access)
    }

    pub fn allocate_image(&self, descr: &ImageDescription) -> Result<Image> {
        self.imp.allocate_image(descr)
    }

    /// An image aliasing `buffer`'s storage under a new descriptor
    pub fn shared_image_from_buffer(
        &self,
        descr: &ImageDescription,
        buffer: &Buffer,
    ) -> Result<Image> {
        self.imp.shared_image_from_buffer(descr, buffer)
    }

    /// An image aliasing `image`'s storage under a new descriptor
    pub fn shared_image_from_image(&self, descr: &ImageDescription, image: &Image) -> Result<Image> {
        self.imp.shared_image_from_image(descr, image)
    }

    /// Query a device property
    pub fn get_attribute(&self, what: DeviceAttributeId) -> Attribute {
        self.imp.get_attribute(what)
    }

    /// The binary cache consulted when this device compiles kernels
    pub fn binary_cache(&self) -> Arc<BinaryCache> {
        self.imp.binary_cache()
    }

    /// Unlink cached binaries older than `days` days
    pub fn purge_binaries(&self, days: u32) {
        self.imp.binary_cache().purge(days);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field(
                "implementation",
                &self.get_attribute(DeviceAttributeId::Implementation).as_str(),
            )
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_memory_zeroed() {
        let mem = HostMemory::new(64);
        assert_eq!(mem.len(), 64);
        let bytes = unsafe { std::slice::from_raw_parts(mem.as_ptr(), mem.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_host_memory_empty() {
        let mem = HostMemory::new(0);
        assert!(mem.is_empty());
    }
}
