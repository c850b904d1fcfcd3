//! CPU backend
//!
//! The host itself as a compute device: buffers are plain host allocations,
//! a "library" is a dynamically loaded shared object, and kernel launches
//! fan out over a fixed FIFO thread pool sized to the machine's core count.
//!
//! ```text
//! CpuDevice
//! ├── ThreadPool   - cores workers, one mutex + condvar FIFO (per stream)
//! ├── CpuBuffer    - host allocation, memcpy transfers
//! ├── CpuImage     - descriptor only; pixel work belongs to kernels
//! └── CpuLibrary   - libloading shared object, C-ABI entry points
//! ```
//!
//! Source and binary-blob library loads are unsupported here; only native
//! shared libraries. Mapped buffers are unsupported (plain buffers are
//! already host memory).

mod abi;
mod library;
mod pool;

pub use abi::{ArgBlock, CpuKernelFn, HostArg, HostArgKind};

use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::attribute::Attribute;
use crate::backend::{
    downcast_buffer, downcast_image, downcast_stream, BufferImpl, DeviceAttributeId, DeviceImpl,
    ImageImpl, SharedContext, StreamImpl,
};
use crate::cache::BinaryCache;
use crate::device::{Buffer, Device, HostMemory, Image, MappedBuffer, Stream};
use crate::error::{Error, Result};
use crate::function::Library;
use crate::image::{Access, ImageDescription};

use library::CpuLibrary;
use pool::ThreadPool;

/// The host as a compute device
pub struct CpuDevice {
    cores: usize,
    pool_size: AtomicUsize,
    cache: Arc<BinaryCache>,
}

impl CpuDevice {
    /// Create a CPU device sized to the machine's online core count
    pub fn create() -> Result<Device> {
        Self::create_with_context(&SharedContext::default())
    }

    /// Create a CPU device; the shared context carries nothing for the CPU
    /// backend but keeps the constructor shape uniform across backends
    pub fn create_with_context(_share: &SharedContext) -> Result<Device> {
        Self::build(Self::core_count())
    }

    /// Always available
    pub fn is_available() -> bool {
        true
    }

    #[cfg(test)]
    pub(crate) fn create_with_cores(cores: usize) -> Result<Device> {
        Self::build(cores.max(1))
    }

    fn build(cores: usize) -> Result<Device> {
        debug!(cores, "creating CPU device");
        let imp = Arc::new(CpuDevice {
            cores,
            pool_size: AtomicUsize::new(0),
            cache: BinaryCache::global(),
        });
        let default_stream = imp.create_stream()?;
        Ok(Device::from_impl(imp, default_stream))
    }

    fn core_count() -> usize {
        std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1)
    }
}

impl DeviceImpl for CpuDevice {
    fn load_library_from_text(&self, _text: &str, _options: &str) -> Result<Library> {
        Err(Error::unsupported("CPU kernel compilation from source"))
    }

    fn load_library_from_data(&self, _data: &[u8], _options: &str) -> Result<Library> {
        Err(Error::unsupported("CPU kernel load from binary blob"))
    }

    fn load_library_from_file(&self, path: &Path) -> Result<Library> {
        CpuLibrary::load(path, self.cores)
    }

    fn share_context(&self) -> SharedContext {
        SharedContext::default()
    }

    fn create_stream(&self) -> Result<Stream> {
        Ok(Stream::from_impl(Arc::new(CpuStream {
            pool: ThreadPool::new(self.cores),
        })))
    }

    fn memory_pool_size(&self) -> usize {
        self.pool_size.load(Ordering::Relaxed)
    }

    fn set_memory_pool_size(&self, bytes: usize) {
        self.pool_size.store(bytes, Ordering::Relaxed);
    }

    fn allocate_buffer(&self, bytes: usize, _access: Access) -> Result<Buffer> {
        Ok(Buffer::from_impl(Arc::new(CpuBuffer {
            mem: HostMemory::new(bytes),
        })))
    }

    fn allocate_mapped_buffer(&self, _bytes: usize, _access: Access) -> Result<MappedBuffer> {
        Err(Error::unsupported("mapped buffers on the CPU backend"))
    }

    fn allocate_image(&self, descr: &ImageDescription) -> Result<Image> {
        Ok(Image::from_impl(Arc::new(CpuImage { descr: *descr })))
    }

    fn shared_image_from_buffer(
        &self,
        descr: &ImageDescription,
        buffer: &Buffer,
    ) -> Result<Image> {
        downcast_buffer::<CpuBuffer>(buffer)?;
        Ok(Image::from_impl(Arc::new(CpuImage { descr: *descr })))
    }

    fn shared_image_from_image(&self, descr: &ImageDescription, image: &Image) -> Result<Image> {
        downcast_image::<CpuImage>(image)?;
        Ok(Image::from_impl(Arc::new(CpuImage { descr: *descr })))
    }

    fn get_attribute(&self, what: DeviceAttributeId) -> Attribute {
        match what {
            DeviceAttributeId::Implementation => Attribute::from("CPU"),
            DeviceAttributeId::Name => Attribute::from(""),
            DeviceAttributeId::Vendor => Attribute::from(""),
            DeviceAttributeId::DriverVersion => Attribute::from(""),
            DeviceAttributeId::SubUnitCount => Attribute::from(1i32),
            DeviceAttributeId::ProcessorCount => Attribute::from(self.cores as u32),
            DeviceAttributeId::UnifiedMemory => Attribute::from(true),
            DeviceAttributeId::TotalMemory => Attribute::from(0i64),
            DeviceAttributeId::LocalMemory => Attribute::from(0i32),
            DeviceAttributeId::MaxThreadsPerGroup => Attribute::from(1024i32),
            DeviceAttributeId::MaxWorkSize => Attribute::from([1024i32, 1024, 1]),
            DeviceAttributeId::MaxRegisters => Attribute::from(0i32),
            DeviceAttributeId::MaxImageSize1D => Attribute::from(i32::MAX),
            DeviceAttributeId::MaxImageSize2D => Attribute::from([i32::MAX, i32::MAX]),
            DeviceAttributeId::MaxImageSize3D => Attribute::from([i32::MAX, i32::MAX, i32::MAX]),
            DeviceAttributeId::ImageAlignment => Attribute::from(64i32),
            DeviceAttributeId::SupportsMappedBuffer => Attribute::from(false),
            DeviceAttributeId::SupportsProgramConstants => Attribute::from(false),
            DeviceAttributeId::SubgroupWidth => Attribute::from(16i32),
            DeviceAttributeId::SupportsSubgroup => Attribute::from(true),
            DeviceAttributeId::SupportsSubgroupShuffle => Attribute::from(true),
            DeviceAttributeId::SupportsImageIntFiltering => Attribute::from(false),
            DeviceAttributeId::SupportsImageFloatFiltering => Attribute::from(false),
        }
    }

    fn binary_cache(&self) -> Arc<BinaryCache> {
        Arc::clone(&self.cache)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A stream backed by its own worker pool
pub struct CpuStream {
    pub(crate) pool: ThreadPool,
}

impl StreamImpl for CpuStream {
    fn sync(&self) -> Result<()> {
        self.pool.sync();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A buffer backed by a host allocation
pub struct CpuBuffer {
    mem: HostMemory,
}

impl CpuBuffer {
    pub(crate) fn host_ptr(&self) -> *mut u8 {
        self.mem.as_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.mem.len()
    }
}

impl BufferImpl for CpuBuffer {
    fn copy_from_buffer(&self, stream: &Stream, src: &Buffer, bytes: usize) -> Result<()> {
        downcast_stream::<CpuStream>(stream)?;
        let src = downcast_buffer::<CpuBuffer>(src)?;
        let bytes = bytes.min(self.len()).min(src.len());
        // SAFETY: both allocations are owned and at least `bytes` long
        unsafe { std::ptr::copy_nonoverlapping(src.host_ptr(), self.host_ptr(), bytes) };
        Ok(())
    }

    fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<()> {
        downcast_stream::<CpuStream>(stream)?;
        let bytes = src.len().min(self.len());
        // SAFETY: destination is owned and at least `bytes` long
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.host_ptr(), bytes) };
        Ok(())
    }

    fn copy_to_host(&self, stream: &Stream, dst: &mut [u8]) -> Result<()> {
        downcast_stream::<CpuStream>(stream)?;
        let bytes = dst.len().min(self.len());
        // SAFETY: source is owned and at least `bytes` long
        unsafe { std::ptr::copy_nonoverlapping(self.host_ptr(), dst.as_mut_ptr(), bytes) };
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Descriptor-only image
///
/// The CPU backend carries image geometry for kernels that want it but does
/// no pixel manipulation at this layer; copies are deliberate no-ops.
pub struct CpuImage {
    descr: ImageDescription,
}

impl ImageImpl for CpuImage {
    fn copy_from_image(&self, _stream: &Stream, _src: &Image) -> Result<()> {
        Ok(())
    }

    fn copy_from_buffer(
        &self,
        _stream: &Stream,
        _src: &Buffer,
        _descr: &ImageDescription,
    ) -> Result<()> {
        Ok(())
    }

    fn copy_from_host(
        &self,
        _stream: &Stream,
        _src: &[u8],
        _descr: &ImageDescription,
    ) -> Result<()> {
        Ok(())
    }

    fn copy_to_buffer(
        &self,
        _stream: &Stream,
        _dst: &Buffer,
        _descr: &ImageDescription,
    ) -> Result<()> {
        Ok(())
    }

    fn copy_to_host(
        &self,
        _stream: &Stream,
        _dst: &mut [u8],
        _descr: &ImageDescription,
    ) -> Result<()> {
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
    use crate::image::{DataType, PixelOrder, Size3, Stride2};

    #[test]
    fn test_device_reports_cpu_attributes() {
        let device = CpuDevice::create().unwrap();
        assert_eq!(
            device.get_attribute(DeviceAttributeId::Implementation).as_str(),
            "CPU"
        );
        assert_eq!(device.get_attribute(DeviceAttributeId::SubUnitCount).as_i32(), 1);
        assert!(device.get_attribute(DeviceAttributeId::UnifiedMemory).as_bool());
        assert!(!device
            .get_attribute(DeviceAttributeId::SupportsMappedBuffer)
            .as_bool());
        assert!(device.get_attribute(DeviceAttributeId::ProcessorCount).as_u32() >= 1);
    }

    #[test]
    fn test_buffer_copy_round_trip() {
        let device = CpuDevice::create().unwrap();
        let stream = device.default_stream();

        let a = device.allocate_buffer(16, Access::ReadWrite).unwrap();
        let b = device.allocate_buffer(16, Access::ReadWrite).unwrap();

        a.copy_from_host(&stream, b"0123456789abcdef").unwrap();
        b.copy_from(&stream, &a, 16).unwrap();

        let mut out = [0u8; 16];
        b.copy_to_host(&stream, &mut out).unwrap();
        stream.sync().unwrap();
        assert_eq!(&out, b"0123456789abcdef");
    }

    #[test]
    fn test_source_and_blob_loads_unsupported() {
        let device = CpuDevice::create().unwrap();
        assert!(matches!(
            device.load_library_from_text("kernel void k() {}", ""),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            device.load_library_from_data(b"\x7fELF", ""),
            Err(Error::Unsupported(_))
        ));
        assert!(matches!(
            device.allocate_mapped_buffer(64, Access::ReadWrite),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_memory_pool_size_is_stored() {
        let device = CpuDevice::create().unwrap();
        assert_eq!(device.memory_pool_size(), 0);
        device.set_memory_pool_size(1 << 20);
        assert_eq!(device.memory_pool_size(), 1 << 20);
    }

    #[test]
    fn test_images_are_descriptor_only() {
        let device = CpuDevice::create().unwrap();
        let stream = device.default_stream();
        let descr = ImageDescription::new(
            Size3::new(8, 8, 1),
            4,
            PixelOrder::Rgba,
            DataType::UInt8,
            Stride2::new(32, 256),
        );
        let image = device.allocate_image(&descr).unwrap();
        assert_eq!(image.description(), descr);

        // copies are defined no-ops at this layer
        image.copy_from_host(&stream, &[0u8; 256], &descr).unwrap();

        let buffer = device.allocate_buffer(256, Access::ReadWrite).unwrap();
        let view = device.shared_image_from_buffer(&descr, &buffer).unwrap();
        assert_eq!(view.description(), descr);

        let view2 = device.shared_image_from_image(&descr, &image).unwrap();
        assert_eq!(view2.description(), descr);
    }

    #[test]
    fn test_streams_are_independent() {
        let device = CpuDevice::create().unwrap();
        let s1 = device.create_stream().unwrap();
        let s2 = device.create_stream().unwrap();
        s1.sync().unwrap();
        s2.sync().unwrap();
    }
}
