//! CUDA-class backend for NVIDIA GPUs
//!
//! Drives the CUDA driver API directly through `cudarc`'s `sys` bindings:
//! contexts and streams are adopted from a [`SharedContext`] or created
//! fresh, buffers are plain device allocations, images are pitched
//! allocations, libraries go through the driver JIT linker (memoised by the
//! binary cache), and image arguments become per-launch texture objects.
//!
//! ```text
//! CudaDevice
//! ├── CudaStream        - non-blocking CUstream (context-sync fallback)
//! ├── CudaBuffer        - cuMemAlloc device memory
//! ├── CudaMappedBuffer  - cuMemHostAlloc host memory + device alias
//! ├── CudaImage         - cuMemAllocPitch, 2-D/3-D async copies
//! └── CudaLibrary       - JIT link -> module, functions by name
//! ```

#[cfg(feature = "cuda")]
mod library;

#[cfg(feature = "cuda")]
pub use imp::*;

#[cfg(not(feature = "cuda"))]
use crate::backend::SharedContext;
#[cfg(not(feature = "cuda"))]
use crate::device::Device;
#[cfg(not(feature = "cuda"))]
use crate::error::{Error, Result};

#[cfg(feature = "cuda")]
mod imp {
    use super::library::load_module;
    use std::any::Any;
    use std::ffi::{c_void, CStr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use cudarc::driver::sys;
    use tracing::debug;

    use crate::attribute::{Attribute, AttributeKind};
    use crate::backend::{
        downcast_image, downcast_stream, BufferImpl, DeviceAttributeId, DeviceImpl, ImageImpl,
        SharedContext, StreamImpl,
    };
    use crate::cache::{BinaryCache, DeviceFingerprint};
    use crate::device::{Buffer, Device, Image, MappedBuffer, Stream};
    use crate::error::{Error, Result};
    use crate::function::Library;
    use crate::handle::{Handle, HandleTraits};
    use crate::image::{Access, DataType, ImageDescription};

    macro_rules! release_traits {
        ($name:ident, $ty:ty, $null:expr, $release:ident) => {
            pub(crate) struct $name;

            impl HandleTraits<$ty> for $name {
                const NULL: $ty = $null;

                fn release(raw: $ty) {
                    // release is best-effort by contract
                    unsafe {
                        let _ = sys::$release(raw);
                    }
                }
            }
        };
    }

    release_traits!(ContextTraits, sys::CUcontext, std::ptr::null_mut(), cuCtxDestroy_v2);
    release_traits!(StreamTraits, sys::CUstream, std::ptr::null_mut(), cuStreamDestroy_v2);
    release_traits!(ModuleTraits, sys::CUmodule, std::ptr::null_mut(), cuModuleUnload);
    release_traits!(LinkTraits, sys::CUlinkState, std::ptr::null_mut(), cuLinkDestroy);
    release_traits!(DevicePtrTraits, sys::CUdeviceptr, 0, cuMemFree_v2);
    release_traits!(HostAllocTraits, *mut c_void, std::ptr::null_mut(), cuMemFreeHost);
    release_traits!(TexObjectTraits, sys::CUtexObject, 0, cuTexObjectDestroy);

    /// Convert a driver status into our error family
    pub(crate) fn check(code: sys::CUresult) -> Result<()> {
        if code == sys::CUresult::CUDA_SUCCESS {
            return Ok(());
        }
        let mut text: *const std::os::raw::c_char = std::ptr::null();
        unsafe {
            let _ = sys::cuGetErrorString(code, &mut text);
        }
        let message = if text.is_null() {
            "unrecognised CUDA error".to_owned()
        } else {
            unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
        };
        Err(Error::native("CUDA", code as i64, message))
    }

    /// An NVIDIA GPU driven through the CUDA driver API
    pub struct CudaDevice {
        context: Handle<sys::CUcontext, ContextTraits>,
        device: sys::CUdevice,
        compute_capability: (i32, i32),
        default_stream: Arc<CudaStream>,
        pool_size: AtomicUsize,
        cache: Arc<BinaryCache>,
    }

    // SAFETY: CUDA driver handles are usable from any thread once the
    // context exists; this device performs no thread-local state tricks.
    unsafe impl Send for CudaDevice {}
    unsafe impl Sync for CudaDevice {}

    impl CudaDevice {
        /// Create a device on a fresh context for GPU 0
        pub fn create() -> Result<Device> {
            Self::create_with_context(&SharedContext::default())
        }

        /// Create a device, adopting any context/stream the embedder shares
        pub fn create_with_context(share: &SharedContext) -> Result<Device> {
            unsafe { check(sys::cuInit(0))? };

            let mut context: Handle<sys::CUcontext, ContextTraits> = if share.context.is_null() {
                Handle::null()
            } else {
                Handle::borrow_raw(share.context as sys::CUcontext)
            };
            let mut device: sys::CUdevice = 0;
            if context.is_null() {
                unsafe {
                    check(sys::cuDeviceGet(&mut device, 0))?;
                    check(sys::cuCtxCreate_v2(context.out(), 0, device))?;
                }
            } else {
                unsafe { check(sys::cuCtxGetDevice(&mut device))? };
            }

            let queue: Handle<sys::CUstream, StreamTraits> = if share.queue.is_null() {
                let mut q = Handle::null();
                unsafe {
                    check(sys::cuStreamCreate(
                        q.out(),
                        sys::CUstream_flags_enum::CU_STREAM_NON_BLOCKING as u32,
                    ))?
                };
                q
            } else {
                Handle::borrow_raw(share.queue as sys::CUstream)
            };

            let mut major = 0;
            let mut minor = 0;
            unsafe {
                check(sys::cuDeviceGetAttribute(
                    &mut major,
                    sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR,
                    device,
                ))?;
                check(sys::cuDeviceGetAttribute(
                    &mut minor,
                    sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR,
                    device,
                ))?;
            }
            debug!(major, minor, "created CUDA device");

            let default_stream = Arc::new(CudaStream { queue });
            let imp = Arc::new(CudaDevice {
                context,
                device,
                compute_capability: (major, minor),
                default_stream: Arc::clone(&default_stream),
                pool_size: AtomicUsize::new(0),
                cache: BinaryCache::global(),
            });
            Ok(Device::from_impl(
                imp,
                Stream::from_impl(default_stream as Arc<dyn StreamImpl>),
            ))
        }

        /// Whether a CUDA driver and device are reachable
        pub fn is_available() -> bool {
            unsafe { sys::cuInit(0) == sys::CUresult::CUDA_SUCCESS }
        }

        pub fn compute_capability(&self) -> (i32, i32) {
            self.compute_capability
        }

        fn attribute_i32(&self, what: sys::CUdevice_attribute) -> Result<i32> {
            let mut value = 0;
            unsafe { check(sys::cuDeviceGetAttribute(&mut value, what, self.device))? };
            Ok(value)
        }
    }

    impl DeviceImpl for CudaDevice {
        fn load_library_from_text(&self, _text: &str, _options: &str) -> Result<Library> {
            Err(Error::unsupported("CUDA source compilation (load PTX or a fat binary instead)"))
        }

        fn load_library_from_data(&self, data: &[u8], options: &str) -> Result<Library> {
            let fingerprint = DeviceFingerprint::from_device(self);
            load_module(&fingerprint, &self.cache, data, options)
        }

        fn share_context(&self) -> SharedContext {
            SharedContext {
                context: self.context.get() as *mut c_void,
                queue: self.default_stream.queue.get() as *mut c_void,
                ..SharedContext::default()
            }
        }

        fn create_stream(&self) -> Result<Stream> {
            let mut queue: Handle<sys::CUstream, StreamTraits> = Handle::null();
            unsafe {
                check(sys::cuStreamCreate(
                    queue.out(),
                    sys::CUstream_flags_enum::CU_STREAM_NON_BLOCKING as u32,
                ))?
            };
            Ok(Stream::from_impl(Arc::new(CudaStream { queue })))
        }

        fn memory_pool_size(&self) -> usize {
            self.pool_size.load(Ordering::Relaxed)
        }

        fn set_memory_pool_size(&self, bytes: usize) {
            self.pool_size.store(bytes, Ordering::Relaxed);
        }

        fn allocate_buffer(&self, bytes: usize, _access: Access) -> Result<Buffer> {
            let mut mem: Handle<sys::CUdeviceptr, DevicePtrTraits> = Handle::null();
            unsafe { check(sys::cuMemAlloc_v2(mem.out(), bytes))? };
            Ok(Buffer::from_impl(Arc::new(CudaBuffer { mem })))
        }

        fn allocate_mapped_buffer(&self, bytes: usize, access: Access) -> Result<MappedBuffer> {
            let mut flags = sys::CU_MEMHOSTALLOC_DEVICEMAP;
            if access == Access::WriteOnly {
                flags |= sys::CU_MEMHOSTALLOC_WRITECOMBINED;
            }
            let mut host: Handle<*mut c_void, HostAllocTraits> = Handle::null();
            unsafe { check(sys::cuMemHostAlloc(host.out(), bytes, flags))? };

            let mut device_ptr: sys::CUdeviceptr = 0;
            unsafe { check(sys::cuMemHostGetDevicePointer_v2(&mut device_ptr, host.get(), 0))? };
            // the host allocation owns the pair; the device alias is borrowed
            Ok(MappedBuffer::from_impl(Arc::new(CudaMappedBuffer {
                host,
                mem: Handle::borrow_raw(device_ptr),
            })))
        }

        fn allocate_image(&self, descr: &ImageDescription) -> Result<Image> {
            let mut descr = *descr;
            let bytes = descr.pixel_size();
            let element = bytes.clamp(4, 16);
            let mut mem: Handle<sys::CUdeviceptr, DevicePtrTraits> = Handle::null();
            let mut pitch = 0usize;
            unsafe {
                check(sys::cuMemAllocPitch_v2(
                    mem.out(),
                    &mut pitch,
                    descr.size.x * bytes,
                    descr.size.y * descr.size.z,
                    element as u32,
                ))?
            };
            descr.stride.x = pitch;
            Ok(Image::from_impl(Arc::new(CudaImage { mem, descr })))
        }

        fn shared_image_from_buffer(
            &self,
            descr: &ImageDescription,
            buffer: &Buffer,
        ) -> Result<Image> {
            let device_ptr = device_ptr_of(buffer)?;
            Ok(Image::from_impl(Arc::new(CudaImage {
                mem: Handle::borrow_raw(device_ptr),
                descr: *descr,
            })))
        }

        fn shared_image_from_image(&self, descr: &ImageDescription, image: &Image) -> Result<Image> {
            let src = downcast_image::<CudaImage>(image)?;
            Ok(Image::from_impl(Arc::new(CudaImage {
                mem: Handle::borrow_raw(src.mem.get()),
                descr: *descr,
            })))
        }

        fn get_attribute(&self, what: DeviceAttributeId) -> Attribute {
            match what {
                DeviceAttributeId::Implementation => Attribute::from("CUDA"),
                DeviceAttributeId::Name => {
                    let mut buf = [0i8; 128];
                    let ok = unsafe {
                        sys::cuDeviceGetName(buf.as_mut_ptr(), buf.len() as i32, self.device)
                    } == sys::CUresult::CUDA_SUCCESS;
                    if !ok {
                        return Attribute::unknown();
                    }
                    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
                    Attribute::from(name.to_string_lossy().into_owned())
                }
                DeviceAttributeId::Vendor => Attribute::from("NVIDIA"),
                DeviceAttributeId::DriverVersion => {
                    let mut version = 0;
                    if unsafe { sys::cuDriverGetVersion(&mut version) }
                        != sys::CUresult::CUDA_SUCCESS
                    {
                        return Attribute::unknown();
                    }
                    Attribute::from(version.to_string())
                }
                DeviceAttributeId::SubUnitCount => self
                    .attribute_i32(
                        sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT,
                    )
                    .map(Attribute::from)
                    .unwrap_or_default(),
                DeviceAttributeId::MaxThreadsPerGroup => self
                    .attribute_i32(
                        sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
                    )
                    .map(Attribute::from)
                    .unwrap_or_default(),
                DeviceAttributeId::SupportsMappedBuffer => self
                    .attribute_i32(
                        sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_CAN_MAP_HOST_MEMORY,
                    )
                    .map(|v| Attribute::from(v != 0))
                    .unwrap_or_default(),
                DeviceAttributeId::SupportsProgramConstants => Attribute::from(false),
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

    /// A CUDA stream; syncing an adopted null stream syncs the context
    pub struct CudaStream {
        pub(crate) queue: Handle<sys::CUstream, StreamTraits>,
    }

    unsafe impl Send for CudaStream {}
    unsafe impl Sync for CudaStream {}

    impl StreamImpl for CudaStream {
        fn sync(&self) -> Result<()> {
            if self.queue.is_null() {
                check(unsafe { sys::cuCtxSynchronize() })
            } else {
                check(unsafe { sys::cuStreamSynchronize(self.queue.get()) })
            }
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub(crate) fn queue_of(stream: &Stream) -> Result<sys::CUstream> {
        Ok(downcast_stream::<CudaStream>(stream)?.queue.get())
    }

    /// Device memory of a buffer argument, whichever concrete type backs it
    pub(crate) fn device_ptr_of(buffer: &Buffer) -> Result<sys::CUdeviceptr> {
        let any = buffer.imp().as_any();
        if let Some(b) = any.downcast_ref::<CudaBuffer>() {
            return Ok(b.mem.get());
        }
        if let Some(b) = any.downcast_ref::<CudaMappedBuffer>() {
            return Ok(b.mem.get());
        }
        Err(Error::Unsupported("buffer belongs to a different backend"))
    }

    /// Stable address of the device-pointer field, for kernel param arrays
    pub(crate) fn device_ptr_ref_of(buffer: &Buffer) -> Result<*const sys::CUdeviceptr> {
        let any = buffer.imp().as_any();
        if let Some(b) = any.downcast_ref::<CudaBuffer>() {
            return Ok(b.mem.raw_ptr());
        }
        if let Some(b) = any.downcast_ref::<CudaMappedBuffer>() {
            return Ok(b.mem.raw_ptr());
        }
        Err(Error::Unsupported("buffer belongs to a different backend"))
    }

    fn memcpy_htod(mem: sys::CUdeviceptr, src: &[u8], stream: &Stream) -> Result<()> {
        let queue = queue_of(stream)?;
        check(unsafe {
            sys::cuMemcpyHtoDAsync_v2(mem, src.as_ptr() as *const c_void, src.len(), queue)
        })
    }

    fn memcpy_dtoh(dst: &mut [u8], mem: sys::CUdeviceptr, stream: &Stream) -> Result<()> {
        let queue = queue_of(stream)?;
        check(unsafe {
            sys::cuMemcpyDtoHAsync_v2(dst.as_mut_ptr() as *mut c_void, mem, dst.len(), queue)
        })
    }

    fn memcpy_dtod(dst: sys::CUdeviceptr, src: &Buffer, bytes: usize, stream: &Stream) -> Result<()> {
        let queue = queue_of(stream)?;
        let src = device_ptr_of(src)?;
        check(unsafe { sys::cuMemcpyDtoDAsync_v2(dst, src, bytes, queue) })
    }

    /// Device memory obtained from `cuMemAlloc`
    pub struct CudaBuffer {
        pub(crate) mem: Handle<sys::CUdeviceptr, DevicePtrTraits>,
    }

    unsafe impl Send for CudaBuffer {}
    unsafe impl Sync for CudaBuffer {}

    impl BufferImpl for CudaBuffer {
        fn copy_from_buffer(&self, stream: &Stream, src: &Buffer, bytes: usize) -> Result<()> {
            memcpy_dtod(self.mem.get(), src, bytes, stream)
        }

        fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<()> {
            memcpy_htod(self.mem.get(), src, stream)
        }

        fn copy_to_host(&self, stream: &Stream, dst: &mut [u8]) -> Result<()> {
            memcpy_dtoh(dst, self.mem.get(), stream)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Page-locked host memory with a device-side alias
    ///
    /// The host allocation owns the pair; the device pointer is a borrowed
    /// view and is never freed on its own.
    pub struct CudaMappedBuffer {
        host: Handle<*mut c_void, HostAllocTraits>,
        pub(crate) mem: Handle<sys::CUdeviceptr, DevicePtrTraits>,
    }

    unsafe impl Send for CudaMappedBuffer {}
    unsafe impl Sync for CudaMappedBuffer {}

    impl BufferImpl for CudaMappedBuffer {
        fn copy_from_buffer(&self, stream: &Stream, src: &Buffer, bytes: usize) -> Result<()> {
            memcpy_dtod(self.mem.get(), src, bytes, stream)
        }

        fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<()> {
            memcpy_htod(self.mem.get(), src, stream)
        }

        fn copy_to_host(&self, stream: &Stream, dst: &mut [u8]) -> Result<()> {
            memcpy_dtoh(dst, self.mem.get(), stream)
        }

        fn map(&self, _stream: &Stream, _access: Access, _sync: bool) -> Result<*mut u8> {
            // the device pointer aliases this allocation, so there is no
            // separate staging copy to wait for
            Ok(self.host.get() as *mut u8)
        }

        fn unmap(&self, _stream: &Stream) -> Result<()> {
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    enum Side {
        Device(sys::CUdeviceptr),
        HostSrc(*const c_void),
        HostDst(*mut c_void),
    }

    struct CopyPlane {
        side: Side,
        pitch: usize,
        height: usize,
    }

    fn memcpy_image(
        stream: &Stream,
        src: CopyPlane,
        dst: CopyPlane,
        width_bytes: usize,
        height: usize,
        depth: usize,
    ) -> Result<()> {
        let queue = queue_of(stream)?;
        if depth > 1 {
            let mut a: sys::CUDA_MEMCPY3D = unsafe { std::mem::zeroed() };
            match src.side {
                Side::Device(ptr) => {
                    a.srcMemoryType = sys::CUmemorytype_enum::CU_MEMORYTYPE_DEVICE;
                    a.srcDevice = ptr;
                }
                Side::HostSrc(ptr) => {
                    a.srcMemoryType = sys::CUmemorytype_enum::CU_MEMORYTYPE_HOST;
                    a.srcHost = ptr;
                }
                Side::HostDst(_) => unreachable!("host destination used as copy source"),
            }
            a.srcPitch = src.pitch;
            a.srcHeight = src.height;
            match dst.side {
                Side::Device(ptr) => {
                    a.dstMemoryType = sys::CUmemorytype_enum::CU_MEMORYTYPE_DEVICE;
                    a.dstDevice = ptr;
                }
                Side::HostDst(ptr) => {
                    a.dstMemoryType = sys::CUmemorytype_enum::CU_MEMORYTYPE_HOST;
                    a.dstHost = ptr;
                }
                Side::HostSrc(_) => unreachable!("host source used as copy destination"),
            }
            a.dstPitch = dst.pitch;
            a.dstHeight = dst.height;
            a.WidthInBytes = width_bytes;
            a.Height = height;
            a.Depth = depth;
            check(unsafe { sys::cuMemcpy3DAsync_v2(&a, queue) })
        } else {
            let mut a: sys::CUDA_MEMCPY2D = unsafe { std::mem::zeroed() };
            match src.side {
                Side::Device(ptr) => {
                    a.srcMemoryType = sys::CUmemorytype_enum::CU_MEMORYTYPE_DEVICE;
                    a.srcDevice = ptr;
                }
                Side::HostSrc(ptr) => {
                    a.srcMemoryType = sys::CUmemorytype_enum::CU_MEMORYTYPE_HOST;
                    a.srcHost = ptr;
                }
                Side::HostDst(_) => unreachable!("host destination used as copy source"),
            }
            a.srcPitch = src.pitch;
            match dst.side {
                Side::Device(ptr) => {
                    a.dstMemoryType = sys::CUmemorytype_enum::CU_MEMORYTYPE_DEVICE;
                    a.dstDevice = ptr;
                }
                Side::HostDst(ptr) => {
                    a.dstMemoryType = sys::CUmemorytype_enum::CU_MEMORYTYPE_HOST;
                    a.dstHost = ptr;
                }
                Side::HostSrc(_) => unreachable!("host source used as copy destination"),
            }
            a.dstPitch = dst.pitch;
            a.WidthInBytes = width_bytes;
            a.Height = height;
            check(unsafe { sys::cuMemcpy2DAsync_v2(&a, queue) })
        }
    }

    /// A pitched device allocation with image geometry
    pub struct CudaImage {
        pub(crate) mem: Handle<sys::CUdeviceptr, DevicePtrTraits>,
        pub(crate) descr: ImageDescription,
    }

    unsafe impl Send for CudaImage {}
    unsafe impl Sync for CudaImage {}

    impl CudaImage {
        fn plane(&self) -> CopyPlane {
            CopyPlane {
                side: Side::Device(self.mem.get()),
                pitch: self.descr.stride.x,
                height: self.descr.stride.y,
            }
        }
    }

    impl ImageImpl for CudaImage {
        fn copy_from_image(&self, stream: &Stream, src: &Image) -> Result<()> {
            let src = downcast_image::<CudaImage>(src)?;
            memcpy_image(
                stream,
                src.plane(),
                self.plane(),
                self.descr.size.x * self.descr.pixel_size(),
                self.descr.size.y,
                self.descr.size.z,
            )
        }

        fn copy_from_buffer(
            &self,
            stream: &Stream,
            src: &Buffer,
            descr: &ImageDescription,
        ) -> Result<()> {
            let src_plane = CopyPlane {
                side: Side::Device(device_ptr_of(src)?),
                pitch: descr.stride.x,
                height: descr.stride.y,
            };
            memcpy_image(
                stream,
                src_plane,
                self.plane(),
                self.descr.size.x * self.descr.pixel_size(),
                self.descr.size.y,
                self.descr.size.z,
            )
        }

        fn copy_from_host(
            &self,
            stream: &Stream,
            src: &[u8],
            descr: &ImageDescription,
        ) -> Result<()> {
            let src_plane = CopyPlane {
                side: Side::HostSrc(src.as_ptr() as *const c_void),
                pitch: descr.stride.x,
                height: descr.stride.y,
            };
            memcpy_image(
                stream,
                src_plane,
                self.plane(),
                self.descr.size.x * self.descr.pixel_size(),
                self.descr.size.y,
                self.descr.size.z,
            )
        }

        fn copy_to_buffer(
            &self,
            stream: &Stream,
            dst: &Buffer,
            descr: &ImageDescription,
        ) -> Result<()> {
            let dst_plane = CopyPlane {
                side: Side::Device(device_ptr_of(dst)?),
                pitch: descr.stride.x,
                height: descr.stride.y,
            };
            memcpy_image(
                stream,
                self.plane(),
                dst_plane,
                descr.size.x * descr.pixel_size(),
                descr.size.y,
                descr.size.z,
            )
        }

        fn copy_to_host(
            &self,
            stream: &Stream,
            dst: &mut [u8],
            descr: &ImageDescription,
        ) -> Result<()> {
            let dst_plane = CopyPlane {
                side: Side::HostDst(dst.as_mut_ptr() as *mut c_void),
                pitch: descr.stride.x,
                height: descr.stride.y,
            };
            memcpy_image(
                stream,
                self.plane(),
                dst_plane,
                descr.size.x * descr.pixel_size(),
                descr.size.y,
                descr.size.z,
            )
        }

        fn description(&self) -> &ImageDescription {
            &self.descr
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// A texture object created for one launch over an image argument
    pub(crate) fn create_texture_object(
        image: &CudaImage,
    ) -> Result<Handle<sys::CUtexObject, TexObjectTraits>> {
        let format = match image.descr.data_type {
            DataType::UInt8 => sys::CUarray_format_enum::CU_AD_FORMAT_UNSIGNED_INT8,
            DataType::Int8 => sys::CUarray_format_enum::CU_AD_FORMAT_SIGNED_INT8,
            DataType::UInt16 => sys::CUarray_format_enum::CU_AD_FORMAT_UNSIGNED_INT16,
            DataType::Int16 => sys::CUarray_format_enum::CU_AD_FORMAT_SIGNED_INT16,
            DataType::Float16 => sys::CUarray_format_enum::CU_AD_FORMAT_HALF,
            DataType::Float32 => sys::CUarray_format_enum::CU_AD_FORMAT_FLOAT,
            DataType::Float64 => {
                return Err(Error::unsupported("64-bit float image sampling"))
            }
        };

        let mut res: sys::CUDA_RESOURCE_DESC = unsafe { std::mem::zeroed() };
        res.resType = sys::CUresourcetype_enum::CU_RESOURCE_TYPE_PITCH2D;
        res.res.pitch2D.devPtr = image.mem.get();
        res.res.pitch2D.format = format;
        res.res.pitch2D.numChannels = image.descr.channels as u32;
        res.res.pitch2D.width = image.descr.size.x;
        res.res.pitch2D.height = image.descr.size.y;
        res.res.pitch2D.pitchInBytes = image.descr.stride.x;

        let mut tex: sys::CUDA_TEXTURE_DESC = unsafe { std::mem::zeroed() };
        tex.addressMode[0] = sys::CUaddress_mode_enum::CU_TR_ADDRESS_MODE_CLAMP;
        tex.addressMode[1] = sys::CUaddress_mode_enum::CU_TR_ADDRESS_MODE_CLAMP;
        tex.filterMode = sys::CUfilter_mode_enum::CU_TR_FILTER_MODE_LINEAR;
        // coordinates stay non-normalised: no flags

        let mut handle: Handle<sys::CUtexObject, TexObjectTraits> = Handle::null();
        check(unsafe {
            sys::cuTexObjectCreate(handle.out(), &res, &tex, std::ptr::null())
        })?;
        Ok(handle)
    }

    /// Launch marshalling shared with `library.rs`
    pub(crate) fn launch_kernel(
        kernel: sys::CUfunction,
        stream: &Stream,
        launch: &crate::launch::LaunchArgs,
        args: &[Attribute],
    ) -> Result<()> {
        let mut shared_mem = 0usize;
        // texture objects must outlive the launch call on this frame;
        // capacity is reserved so the param pointers stay stable
        let mut textures: Vec<Handle<sys::CUtexObject, TexObjectTraits>> =
            Vec::with_capacity(args.len());
        let mut params: Vec<*mut c_void> = Vec::with_capacity(args.len());

        for attr in args {
            match attr.kind() {
                AttributeKind::Float => {
                    params.push(attr.f32_array().as_ptr() as *mut c_void);
                }
                AttributeKind::Int => {
                    params.push(attr.i32_array().as_ptr() as *mut c_void);
                }
                AttributeKind::Buffer => {
                    let buffer = attr.as_buffer().expect("buffer attribute");
                    params.push(device_ptr_ref_of(buffer)? as *mut c_void);
                }
                AttributeKind::Image => {
                    let image = attr.as_image().expect("image attribute");
                    let image = downcast_image::<CudaImage>(image)?;
                    textures.push(create_texture_object(image)?);
                    let tex = textures.last().expect("just pushed");
                    params.push(tex.raw_ptr() as *mut c_void);
                }
                AttributeKind::LocalMem => {
                    shared_mem += attr.local_mem_bytes() as usize;
                }
                _ => {}
            }
        }

        let queue = queue_of(stream)?;
        let g = launch.global_size();
        let l = launch.local_size();
        check(unsafe {
            sys::cuLaunchKernel(
                kernel,
                g[0],
                g[1],
                g[2],
                l[0],
                l[1],
                l[2],
                shared_mem as u32,
                queue,
                params.as_mut_ptr(),
                std::ptr::null_mut(),
            )
        })
        // textures drop here, after the launch has consumed them
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::image::{PixelOrder, Size3, Stride2};

        #[test]
        fn test_cuda_availability_probe_does_not_panic() {
            let _ = CudaDevice::is_available();
        }

        #[test]
        fn test_cuda_device_round_trip() {
            if !CudaDevice::is_available() {
                return;
            }
            let device = CudaDevice::create().unwrap();
            let stream = device.default_stream();

            let buffer = device.allocate_buffer(64, Access::ReadWrite).unwrap();
            let data: Vec<u8> = (0..64).collect();
            buffer.copy_from_host(&stream, &data).unwrap();

            let mut out = vec![0u8; 64];
            buffer.copy_to_host(&stream, &mut out).unwrap();
            stream.sync().unwrap();
            assert_eq!(out, data);
        }

        #[test]
        fn test_cuda_image_allocation_sets_pitch() {
            if !CudaDevice::is_available() {
                return;
            }
            let device = CudaDevice::create().unwrap();
            let descr = ImageDescription::new(
                Size3::new(100, 10, 1),
                4,
                PixelOrder::Rgba,
                DataType::UInt8,
                Stride2::new(400, 4000),
            );
            let image = device.allocate_image(&descr).unwrap();
            assert!(image.description().stride.x >= 400);
        }
    }
}

/// Stub when the `cuda` feature is disabled
#[cfg(not(feature = "cuda"))]
pub struct CudaDevice;

#[cfg(not(feature = "cuda"))]
impl CudaDevice {
    pub fn create() -> Result<Device> {
        Err(Error::unsupported("CUDA backend requires the 'cuda' feature"))
    }

    pub fn create_with_context(_share: &SharedContext) -> Result<Device> {
        Err(Error::unsupported("CUDA backend requires the 'cuda' feature"))
    }

    pub fn is_available() -> bool {
        false
    }
}
