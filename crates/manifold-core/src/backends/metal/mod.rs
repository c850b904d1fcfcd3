//! Metal-class backend for Apple GPUs
//!
//! Built on the `metal` crate, whose reference types carry the native
//! retain/release discipline (clone retains). Buffers use shared storage,
//! so host copies touch `contents()` directly; device-to-device transfers
//! and map synchronisation go through blit encoders on the stream's command
//! queue. Functions compile to compute pipeline states, cached per
//! (name, specialisation tuple) in their library.
//!
//! ```text
//! MetalDevice
//! ├── MetalStream        - command queue; sync = empty committed buffer
//! ├── MetalBuffer        - MTLBuffer, shared storage
//! ├── MetalMappedBuffer  - contents() pointer, blit-synced map
//! ├── MetalImage         - 1-D/2-D/3-D MTLTexture (+ buffer-aliased views)
//! └── MetalLibrary       - runtime-compiled source or archive data
//! ```

#[cfg(target_vendor = "apple")]
mod library;

#[cfg(target_vendor = "apple")]
pub use imp::*;

#[cfg(not(target_vendor = "apple"))]
use crate::backend::SharedContext;
#[cfg(not(target_vendor = "apple"))]
use crate::device::Device;
#[cfg(not(target_vendor = "apple"))]
use crate::error::{Error, Result};

#[cfg(target_vendor = "apple")]
mod imp {
    use std::any::Any;
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use metal::foreign_types::{ForeignType, ForeignTypeRef};
    use metal::{
        Buffer as MtlBuffer, CommandQueue, Device as MtlDevice, MTLPixelFormat, MTLRegion,
        MTLResourceOptions, MTLSize, MTLTextureType, Texture, TextureDescriptor,
    };
    use tracing::debug;

    use super::library::MetalLibrary;
    use crate::attribute::Attribute;
    use crate::backend::{
        downcast_image, downcast_stream, BufferImpl, DeviceAttributeId, DeviceImpl, ImageImpl,
        SharedContext, StreamImpl,
    };
    use crate::cache::BinaryCache;
    use crate::device::{Buffer, Device, Image, MappedBuffer, Stream};
    use crate::error::{Error, Result};
    use crate::function::Library;
    use crate::image::{Access, DataType, ImageDescription};

    /// An Apple GPU behind a Metal device and command queue
    pub struct MetalDevice {
        pub(crate) device: MtlDevice,
        default_stream: Arc<MetalStream>,
        pool_size: AtomicUsize,
        cache: Arc<BinaryCache>,
    }

    // SAFETY: Metal devices, queues, buffers and textures are documented
    // thread-safe; encoders are only ever used frame-locally here.
    unsafe impl Send for MetalDevice {}
    unsafe impl Sync for MetalDevice {}

    impl MetalDevice {
        pub fn create() -> Result<Device> {
            Self::create_with_context(&SharedContext::default())
        }

        pub fn create_with_context(share: &SharedContext) -> Result<Device> {
            let device = if share.device.is_null() {
                MtlDevice::system_default()
                    .ok_or(Error::Unsupported("no Metal device on this system"))?
            } else {
                // to_owned retains; the embedder keeps its own reference
                unsafe { metal::DeviceRef::from_ptr(share.device.cast()) }.to_owned()
            };
            let queue: CommandQueue = if share.queue.is_null() {
                device.new_command_queue()
            } else {
                unsafe { metal::CommandQueueRef::from_ptr(share.queue.cast()) }.to_owned()
            };
            debug!(name = %device.name(), "created Metal device");

            let default_stream = Arc::new(MetalStream { queue });
            let imp = Arc::new(MetalDevice {
                device,
                default_stream: Arc::clone(&default_stream),
                pool_size: AtomicUsize::new(0),
                cache: BinaryCache::global(),
            });
            Ok(Device::from_impl(
                imp,
                Stream::from_impl(default_stream as Arc<dyn StreamImpl>),
            ))
        }

        pub fn is_available() -> bool {
            MtlDevice::system_default().is_some()
        }
    }

    fn texture_descriptor(descr: &ImageDescription) -> Result<TextureDescriptor> {
        let format = pixel_format(descr)?;
        let td = TextureDescriptor::new();
        td.set_texture_type(if descr.size.z > 1 {
            MTLTextureType::D3
        } else if descr.size.y > 1 {
            MTLTextureType::D2
        } else {
            MTLTextureType::D1
        });
        td.set_pixel_format(format);
        td.set_width(descr.size.x as u64);
        td.set_height(descr.size.y.max(1) as u64);
        td.set_depth(descr.size.z.max(1) as u64);
        Ok(td)
    }

    fn pixel_format(descr: &ImageDescription) -> Result<MTLPixelFormat> {
        // Metal has no RGB-only formats; unsupported combinations surface
        // instead of silently widening
        let format = match (descr.channels, descr.data_type) {
            (1, DataType::UInt8) => MTLPixelFormat::R8Unorm,
            (1, DataType::Int8) => MTLPixelFormat::R8Snorm,
            (1, DataType::UInt16) => MTLPixelFormat::R16Unorm,
            (1, DataType::Int16) => MTLPixelFormat::R16Snorm,
            (1, DataType::Float16) => MTLPixelFormat::R16Float,
            (1, DataType::Float32) => MTLPixelFormat::R32Float,
            (2, DataType::UInt8) => MTLPixelFormat::RG8Unorm,
            (2, DataType::Float16) => MTLPixelFormat::RG16Float,
            (2, DataType::Float32) => MTLPixelFormat::RG32Float,
            (4, DataType::UInt8) => MTLPixelFormat::RGBA8Unorm,
            (4, DataType::Int8) => MTLPixelFormat::RGBA8Snorm,
            (4, DataType::UInt16) => MTLPixelFormat::RGBA16Unorm,
            (4, DataType::Int16) => MTLPixelFormat::RGBA16Snorm,
            (4, DataType::Float16) => MTLPixelFormat::RGBA16Float,
            (4, DataType::Float32) => MTLPixelFormat::RGBA32Float,
            _ => return Err(Error::unsupported("image format on Metal")),
        };
        Ok(format)
    }

    impl DeviceImpl for MetalDevice {
        fn load_library_from_text(&self, text: &str, options: &str) -> Result<Library> {
            MetalLibrary::from_source(&self.device, text, options)
        }

        fn load_library_from_data(&self, data: &[u8], _options: &str) -> Result<Library> {
            MetalLibrary::from_archive(&self.device, data)
        }

        fn share_context(&self) -> SharedContext {
            SharedContext {
                device: self.device.as_ptr().cast(),
                queue: self.default_stream.queue.as_ptr().cast(),
                ..SharedContext::default()
            }
        }

        fn create_stream(&self) -> Result<Stream> {
            Ok(Stream::from_impl(Arc::new(MetalStream {
                queue: self.device.new_command_queue(),
            })))
        }

        fn memory_pool_size(&self) -> usize {
            self.pool_size.load(Ordering::Relaxed)
        }

        fn set_memory_pool_size(&self, bytes: usize) {
            self.pool_size.store(bytes, Ordering::Relaxed);
        }

        fn allocate_buffer(&self, bytes: usize, _access: Access) -> Result<Buffer> {
            let buffer = self
                .device
                .new_buffer(bytes as u64, MTLResourceOptions::StorageModeShared);
            Ok(Buffer::from_impl(Arc::new(MetalBuffer { buffer })))
        }

        fn allocate_mapped_buffer(&self, bytes: usize, _access: Access) -> Result<MappedBuffer> {
            let buffer = self
                .device
                .new_buffer(bytes as u64, MTLResourceOptions::StorageModeShared);
            Ok(MappedBuffer::from_impl(Arc::new(MetalMappedBuffer {
                base: MetalBuffer { buffer },
            })))
        }

        fn allocate_image(&self, descr: &ImageDescription) -> Result<Image> {
            let td = texture_descriptor(descr)?;
            let texture = self.device.new_texture(&td);
            Ok(Image::from_impl(Arc::new(MetalImage {
                texture,
                descr: *descr,
            })))
        }

        fn shared_image_from_buffer(
            &self,
            descr: &ImageDescription,
            buffer: &Buffer,
        ) -> Result<Image> {
            let src = downcast_buffer_any(buffer)?;
            let td = texture_descriptor(descr)?;
            let texture =
                src.new_texture_with_descriptor(&td, 0, descr.stride.x as u64);
            Ok(Image::from_impl(Arc::new(MetalImage {
                texture,
                descr: *descr,
            })))
        }

        fn shared_image_from_image(&self, descr: &ImageDescription, image: &Image) -> Result<Image> {
            let src = downcast_image::<MetalImage>(image)?;
            let texture = src.texture.new_texture_view(pixel_format(descr)?);
            Ok(Image::from_impl(Arc::new(MetalImage {
                texture,
                descr: *descr,
            })))
        }

        fn get_attribute(&self, what: DeviceAttributeId) -> Attribute {
            match what {
                DeviceAttributeId::Implementation => Attribute::from("Metal"),
                DeviceAttributeId::Name => Attribute::from(self.device.name().to_string()),
                DeviceAttributeId::Vendor => Attribute::from("Apple"),
                DeviceAttributeId::DriverVersion => Attribute::from(""),
                DeviceAttributeId::SubUnitCount => Attribute::from(1i32),
                DeviceAttributeId::UnifiedMemory => {
                    Attribute::from(self.device.has_unified_memory())
                }
                DeviceAttributeId::MaxThreadsPerGroup => {
                    Attribute::from(self.device.max_threads_per_threadgroup().width as i64)
                }
                DeviceAttributeId::SupportsMappedBuffer => Attribute::from(true),
                DeviceAttributeId::SupportsProgramConstants => Attribute::from(true),
                _ => Attribute::unknown(),
            }
        }

        fn binary_cache(&self) -> Arc<BinaryCache> {
            Arc::clone(&self.cache)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// The backing MTLBuffer of a facade buffer, whichever type wraps it
    fn downcast_buffer_any(buffer: &Buffer) -> Result<&MtlBuffer> {
        let any = buffer.imp().as_any();
        if let Some(b) = any.downcast_ref::<MetalBuffer>() {
            return Ok(&b.buffer);
        }
        if let Some(b) = any.downcast_ref::<MetalMappedBuffer>() {
            return Ok(&b.base.buffer);
        }
        Err(Error::Unsupported("buffer belongs to a different backend"))
    }

    pub(crate) fn buffer_of(buffer: &Buffer) -> Result<&MtlBuffer> {
        downcast_buffer_any(buffer)
    }

    /// A command queue; FIFO ordering comes from Metal's in-order queues
    pub struct MetalStream {
        pub(crate) queue: CommandQueue,
    }

    unsafe impl Send for MetalStream {}
    unsafe impl Sync for MetalStream {}

    impl StreamImpl for MetalStream {
        fn sync(&self) -> Result<()> {
            // an empty command buffer committed behind everything else acts
            // as the completion fence
            let fence = self.queue.new_command_buffer();
            fence.commit();
            fence.wait_until_completed();
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub(crate) fn stream_of(stream: &Stream) -> Result<&MetalStream> {
        downcast_stream::<MetalStream>(stream)
    }

    /// A shared-storage MTLBuffer
    pub struct MetalBuffer {
        pub(crate) buffer: MtlBuffer,
    }

    unsafe impl Send for MetalBuffer {}
    unsafe impl Sync for MetalBuffer {}

    impl MetalBuffer {
        fn copy_from_buffer_impl(&self, stream: &Stream, src: &Buffer, bytes: usize) -> Result<()> {
            let stream = stream_of(stream)?;
            let src = buffer_of(src)?;
            let command = stream.queue.new_command_buffer();
            let blit = command.new_blit_command_encoder();
            blit.copy_from_buffer(src, 0, &self.buffer, 0, bytes as u64);
            blit.end_encoding();
            command.commit();
            Ok(())
        }

        fn copy_from_host_impl(&self, src: &[u8]) {
            let bytes = src.len().min(self.buffer.length() as usize);
            // shared storage: contents() is the buffer
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    self.buffer.contents() as *mut u8,
                    bytes,
                )
            };
        }

        fn copy_to_host_impl(&self, dst: &mut [u8]) {
            let bytes = dst.len().min(self.buffer.length() as usize);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.buffer.contents() as *const u8,
                    dst.as_mut_ptr(),
                    bytes,
                )
            };
        }
    }

    impl BufferImpl for MetalBuffer {
        fn copy_from_buffer(&self, stream: &Stream, src: &Buffer, bytes: usize) -> Result<()> {
            self.copy_from_buffer_impl(stream, src, bytes)
        }

        fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<()> {
            stream_of(stream)?;
            self.copy_from_host_impl(src);
            Ok(())
        }

        fn copy_to_host(&self, stream: &Stream, dst: &mut [u8]) -> Result<()> {
            stream_of(stream)?;
            self.copy_to_host_impl(dst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// A buffer whose contents pointer is handed straight to the host
    pub struct MetalMappedBuffer {
        base: MetalBuffer,
    }

    unsafe impl Send for MetalMappedBuffer {}
    unsafe impl Sync for MetalMappedBuffer {}

    impl BufferImpl for MetalMappedBuffer {
        fn copy_from_buffer(&self, stream: &Stream, src: &Buffer, bytes: usize) -> Result<()> {
            self.base.copy_from_buffer_impl(stream, src, bytes)
        }

        fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<()> {
            stream_of(stream)?;
            self.base.copy_from_host_impl(src);
            Ok(())
        }

        fn copy_to_host(&self, stream: &Stream, dst: &mut [u8]) -> Result<()> {
            stream_of(stream)?;
            self.base.copy_to_host_impl(dst);
            Ok(())
        }

        fn map(&self, stream: &Stream, _access: Access, sync: bool) -> Result<*mut u8> {
            if sync {
                // drain outstanding device work before exposing the storage
                stream.sync()?;
            }
            Ok(self.base.buffer.contents() as *mut u8)
        }

        fn unmap(&self, _stream: &Stream) -> Result<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// A texture with image geometry
    pub struct MetalImage {
        pub(crate) texture: Texture,
        descr: ImageDescription,
    }

    unsafe impl Send for MetalImage {}
    unsafe impl Sync for MetalImage {}

    impl MetalImage {
        fn region(descr: &ImageDescription) -> MTLRegion {
            MTLRegion {
                origin: metal::MTLOrigin { x: 0, y: 0, z: 0 },
                size: MTLSize {
                    width: descr.size.x as u64,
                    height: descr.size.y.max(1) as u64,
                    depth: descr.size.z.max(1) as u64,
                },
            }
        }
    }

    impl ImageImpl for MetalImage {
        fn copy_from_image(&self, stream: &Stream, src: &Image) -> Result<()> {
            let stream = stream_of(stream)?;
            let src = downcast_image::<MetalImage>(src)?;
            let command = stream.queue.new_command_buffer();
            let blit = command.new_blit_command_encoder();
            blit.copy_from_texture(
                &src.texture,
                0,
                0,
                metal::MTLOrigin { x: 0, y: 0, z: 0 },
                Self::region(&self.descr).size,
                &self.texture,
                0,
                0,
                metal::MTLOrigin { x: 0, y: 0, z: 0 },
            );
            blit.end_encoding();
            command.commit();
            Ok(())
        }

        fn copy_from_buffer(
            &self,
            stream: &Stream,
            src: &Buffer,
            descr: &ImageDescription,
        ) -> Result<()> {
            let stream = stream_of(stream)?;
            let src = buffer_of(src)?;
            let command = stream.queue.new_command_buffer();
            let blit = command.new_blit_command_encoder();
            blit.copy_from_buffer_to_texture(
                src,
                0,
                descr.stride.x as u64,
                descr.stride.y as u64,
                Self::region(descr).size,
                &self.texture,
                0,
                0,
                metal::MTLOrigin { x: 0, y: 0, z: 0 },
                metal::MTLBlitOption::empty(),
            );
            blit.end_encoding();
            command.commit();
            Ok(())
        }

        fn copy_from_host(
            &self,
            stream: &Stream,
            src: &[u8],
            descr: &ImageDescription,
        ) -> Result<()> {
            stream_of(stream)?;
            self.texture.replace_region(
                Self::region(descr),
                0,
                src.as_ptr() as *const c_void,
                descr.stride.x as u64,
            );
            Ok(())
        }

        fn copy_to_buffer(
            &self,
            stream: &Stream,
            dst: &Buffer,
            descr: &ImageDescription,
        ) -> Result<()> {
            let stream = stream_of(stream)?;
            let dst = buffer_of(dst)?;
            let command = stream.queue.new_command_buffer();
            let blit = command.new_blit_command_encoder();
            blit.copy_from_texture_to_buffer(
                &self.texture,
                0,
                0,
                metal::MTLOrigin { x: 0, y: 0, z: 0 },
                Self::region(descr).size,
                dst,
                0,
                descr.stride.x as u64,
                descr.stride.y as u64,
                metal::MTLBlitOption::empty(),
            );
            blit.end_encoding();
            command.commit();
            Ok(())
        }

        fn copy_to_host(
            &self,
            stream: &Stream,
            dst: &mut [u8],
            descr: &ImageDescription,
        ) -> Result<()> {
            // texture reads require completed device work
            stream.sync()?;
            self.texture.get_bytes(
                dst.as_mut_ptr() as *mut c_void,
                descr.stride.x as u64,
                Self::region(descr),
                0,
            );
            Ok(())
        }

        fn description(&self) -> &ImageDescription {
            &self.descr
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_metal_buffer_round_trip() {
            if !MetalDevice::is_available() {
                return;
            }
            let device = MetalDevice::create().unwrap();
            let stream = device.default_stream();

            let buffer = device.allocate_buffer(16, Access::ReadWrite).unwrap();
            buffer.copy_from_host(&stream, b"0123456789abcdef").unwrap();

            let mut out = [0u8; 16];
            buffer.copy_to_host(&stream, &mut out).unwrap();
            stream.sync().unwrap();
            assert_eq!(&out, b"0123456789abcdef");
        }

        #[test]
        fn test_metal_mapped_buffer() {
            if !MetalDevice::is_available() {
                return;
            }
            let device = MetalDevice::create().unwrap();
            let stream = device.default_stream();
            let mapped = device.allocate_mapped_buffer(64, Access::ReadWrite).unwrap();
            let ptr = mapped.map(&stream, Access::WriteOnly, true).unwrap();
            assert!(!ptr.is_null());
            mapped.unmap(&stream).unwrap();
        }
    }
}

/// Stub for non-Apple targets
#[cfg(not(target_vendor = "apple"))]
pub struct MetalDevice;

#[cfg(not(target_vendor = "apple"))]
impl MetalDevice {
    pub fn create() -> Result<Device> {
        Err(Error::unsupported("Metal backend is only available on Apple platforms"))
    }

    pub fn create_with_context(_share: &SharedContext) -> Result<Device> {
        Err(Error::unsupported("Metal backend is only available on Apple platforms"))
    }

    pub fn is_available() -> bool {
        false
    }
}
