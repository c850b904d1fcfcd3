//! OpenCL-class backend for cross-vendor GPUs
//!
//! Drives the OpenCL ICD through its documented C ABI (`cl-sys`). Native
//! objects are reference-counted, so every [`Handle`] here carries retain
//! traits and shared contexts are adopted with a retain. The default queue
//! asks for out-of-order execution when the device grants it; program order
//! is then enforced by an event chain: every enqueue waits on the previous
//! command's completion event and emits its own.
//!
//! ```text
//! ClDevice
//! ├── ClStream        - command queue + event chain
//! ├── ClBuffer        - clCreateBuffer memory object
//! ├── ClMappedBuffer  - ALLOC_HOST_PTR buffer, map/unmap enqueued
//! ├── ClImage         - 1-D/2-D/3-D image, format validated
//! └── ClLibrary       - program from source/IL/binaries, build-log capture
//! ```

#[cfg(feature = "opencl")]
mod library;

#[cfg(feature = "opencl")]
pub use imp::*;

#[cfg(not(feature = "opencl"))]
use crate::backend::SharedContext;
#[cfg(not(feature = "opencl"))]
use crate::device::Device;
#[cfg(not(feature = "opencl"))]
use crate::error::{Error, Result};

#[cfg(feature = "opencl")]
mod imp {
    use super::library::{load_from_il, load_from_source};
    use std::any::Any;
    use std::collections::HashSet;
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use cl_sys::*;
    use parking_lot::Mutex;
    use tracing::debug;

    use crate::attribute::Attribute;
    use crate::backend::{
        downcast_image, downcast_stream, BufferImpl, DeviceAttributeId, DeviceImpl, ImageImpl,
        SharedContext, StreamImpl,
    };
    use crate::cache::{BinaryCache, DeviceFingerprint};
    use crate::device::{Buffer, Device, Image, MappedBuffer, Stream};
    use crate::error::{Error, Result};
    use crate::function::Library;
    use crate::handle::{Handle, HandleTraits, RetainTraits};
    use crate::image::{Access, DataType, ImageDescription, PixelOrder};

    macro_rules! retain_traits {
        ($name:ident, $ty:ty, $release:ident, $retain:ident) => {
            pub(crate) struct $name;

            impl HandleTraits<$ty> for $name {
                const NULL: $ty = std::ptr::null_mut();

                fn release(raw: $ty) {
                    unsafe {
                        let _ = $release(raw);
                    }
                }
            }

            impl RetainTraits<$ty> for $name {
                fn retain(raw: $ty) {
                    unsafe {
                        let _ = $retain(raw);
                    }
                }
            }
        };
    }

    retain_traits!(ContextTraits, cl_context, clReleaseContext, clRetainContext);
    retain_traits!(QueueTraits, cl_command_queue, clReleaseCommandQueue, clRetainCommandQueue);
    retain_traits!(MemTraits, cl_mem, clReleaseMemObject, clRetainMemObject);
    retain_traits!(ProgramTraits, cl_program, clReleaseProgram, clRetainProgram);
    retain_traits!(KernelTraits, cl_kernel, clReleaseKernel, clRetainKernel);
    retain_traits!(EventTraits, cl_event, clReleaseEvent, clRetainEvent);

    fn error_name(code: cl_int) -> &'static str {
        match code {
            CL_DEVICE_NOT_FOUND => "CL_DEVICE_NOT_FOUND",
            CL_DEVICE_NOT_AVAILABLE => "CL_DEVICE_NOT_AVAILABLE",
            CL_COMPILER_NOT_AVAILABLE => "CL_COMPILER_NOT_AVAILABLE",
            CL_MEM_OBJECT_ALLOCATION_FAILURE => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            CL_OUT_OF_RESOURCES => "CL_OUT_OF_RESOURCES",
            CL_OUT_OF_HOST_MEMORY => "CL_OUT_OF_HOST_MEMORY",
            CL_BUILD_PROGRAM_FAILURE => "CL_BUILD_PROGRAM_FAILURE",
            CL_IMAGE_FORMAT_NOT_SUPPORTED => "CL_IMAGE_FORMAT_NOT_SUPPORTED",
            CL_INVALID_VALUE => "CL_INVALID_VALUE",
            CL_INVALID_DEVICE => "CL_INVALID_DEVICE",
            CL_INVALID_CONTEXT => "CL_INVALID_CONTEXT",
            CL_INVALID_QUEUE_PROPERTIES => "CL_INVALID_QUEUE_PROPERTIES",
            CL_INVALID_COMMAND_QUEUE => "CL_INVALID_COMMAND_QUEUE",
            CL_INVALID_MEM_OBJECT => "CL_INVALID_MEM_OBJECT",
            CL_INVALID_IMAGE_FORMAT_DESCRIPTOR => "CL_INVALID_IMAGE_FORMAT_DESCRIPTOR",
            CL_INVALID_IMAGE_SIZE => "CL_INVALID_IMAGE_SIZE",
            CL_INVALID_BINARY => "CL_INVALID_BINARY",
            CL_INVALID_BUILD_OPTIONS => "CL_INVALID_BUILD_OPTIONS",
            CL_INVALID_PROGRAM => "CL_INVALID_PROGRAM",
            CL_INVALID_PROGRAM_EXECUTABLE => "CL_INVALID_PROGRAM_EXECUTABLE",
            CL_INVALID_KERNEL_NAME => "CL_INVALID_KERNEL_NAME",
            CL_INVALID_KERNEL => "CL_INVALID_KERNEL",
            CL_INVALID_ARG_INDEX => "CL_INVALID_ARG_INDEX",
            CL_INVALID_ARG_SIZE => "CL_INVALID_ARG_SIZE",
            CL_INVALID_KERNEL_ARGS => "CL_INVALID_KERNEL_ARGS",
            CL_INVALID_WORK_DIMENSION => "CL_INVALID_WORK_DIMENSION",
            CL_INVALID_WORK_GROUP_SIZE => "CL_INVALID_WORK_GROUP_SIZE",
            CL_INVALID_WORK_ITEM_SIZE => "CL_INVALID_WORK_ITEM_SIZE",
            CL_INVALID_EVENT_WAIT_LIST => "CL_INVALID_EVENT_WAIT_LIST",
            CL_INVALID_OPERATION => "CL_INVALID_OPERATION",
            CL_INVALID_BUFFER_SIZE => "CL_INVALID_BUFFER_SIZE",
            _ => "CL_ERROR",
        }
    }

    /// Convert an OpenCL status into our error family
    pub(crate) fn check(code: cl_int) -> Result<()> {
        if code == CL_SUCCESS {
            return Ok(());
        }
        Err(Error::native("OpenCL", code as i64, error_name(code)))
    }

    fn mem_flags(access: Access) -> cl_mem_flags {
        match access {
            Access::ReadOnly => CL_MEM_READ_ONLY,
            Access::WriteOnly => CL_MEM_WRITE_ONLY,
            Access::ReadWrite => CL_MEM_READ_WRITE,
        }
    }

    /// Map a descriptor onto an OpenCL image format, then confirm the
    /// context actually supports it
    fn image_format(
        context: cl_context,
        descr: &ImageDescription,
        image_type: cl_mem_object_type,
        flags: cl_mem_flags,
    ) -> Result<cl_image_format> {
        let channel_type = match descr.data_type {
            DataType::Float16 => CL_HALF_FLOAT,
            DataType::Float32 => CL_FLOAT,
            DataType::Float64 => return Err(Error::unsupported("64-bit float image formats")),
            DataType::UInt16 => CL_UNORM_INT16,
            DataType::Int16 => CL_SNORM_INT16,
            DataType::Int8 => CL_SNORM_INT8,
            DataType::UInt8 => CL_UNORM_INT8,
        };
        let channel_order = match descr.channels {
            1 => CL_INTENSITY,
            2 => CL_RA,
            3 => CL_RGB,
            _ => match descr.order {
                PixelOrder::Rgba => CL_RGBA,
                PixelOrder::Argb => CL_ARGB,
                PixelOrder::Bgra => CL_BGRA,
                PixelOrder::Abgr => {
                    return Err(Error::unsupported("ABGR image ordering on this platform"))
                }
            },
        };
        let wanted = cl_image_format {
            image_channel_order: channel_order,
            image_channel_data_type: channel_type,
        };

        let mut count: cl_uint = 0;
        check(unsafe {
            clGetSupportedImageFormats(context, flags, image_type, 0, std::ptr::null_mut(), &mut count)
        })?;
        let mut formats = vec![
            cl_image_format {
                image_channel_order: 0,
                image_channel_data_type: 0,
            };
            count as usize
        ];
        if !formats.is_empty() {
            check(unsafe {
                clGetSupportedImageFormats(
                    context,
                    flags,
                    image_type,
                    count,
                    formats.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            })?;
        }
        let supported = formats.iter().any(|f| {
            f.image_channel_order == wanted.image_channel_order
                && f.image_channel_data_type == wanted.image_channel_data_type
        });
        if !supported {
            return Err(Error::unsupported("image format on this device"));
        }
        Ok(wanted)
    }

    fn image_type_for(descr: &ImageDescription) -> cl_mem_object_type {
        if descr.size.z > 1 {
            CL_MEM_OBJECT_IMAGE3D
        } else if descr.size.y > 1 {
            CL_MEM_OBJECT_IMAGE2D
        } else {
            CL_MEM_OBJECT_IMAGE1D
        }
    }

    /// A cross-vendor GPU behind the OpenCL ICD
    pub struct ClDevice {
        pub(crate) context: Handle<cl_context, ContextTraits>,
        version: String,
        extensions: HashSet<String>,
        default_stream: Arc<ClStream>,
        pool_size: AtomicUsize,
        cache: Arc<BinaryCache>,
    }

    unsafe impl Send for ClDevice {}
    unsafe impl Sync for ClDevice {}

    impl ClDevice {
        pub fn create() -> Result<Device> {
            Self::create_with_context(&SharedContext::default())
        }

        pub fn create_with_context(share: &SharedContext) -> Result<Device> {
            let mut context: Handle<cl_context, ContextTraits> = if share.context.is_null() {
                Handle::null()
            } else {
                Handle::wrap_shared(share.context as cl_context)
            };

            if context.is_null() {
                let mut platform = share.platform as cl_platform_id;
                let mut devices: Vec<cl_device_id> = Vec::new();
                if !share.device.is_null() {
                    let device = share.device as cl_device_id;
                    devices.push(device);
                    if platform.is_null() {
                        let mut value: cl_platform_id = std::ptr::null_mut();
                        check(unsafe {
                            clGetDeviceInfo(
                                device,
                                CL_DEVICE_PLATFORM,
                                std::mem::size_of::<cl_platform_id>(),
                                (&mut value as *mut cl_platform_id).cast(),
                                std::ptr::null_mut(),
                            )
                        })?;
                        platform = value;
                    }
                } else {
                    let platforms = if platform.is_null() {
                        Self::platform_ids()?
                    } else {
                        vec![platform]
                    };
                    for candidate in platforms {
                        let mut found = Self::gpu_device_ids(candidate)?;
                        if !found.is_empty() {
                            // one device per context keeps binaries per-unit
                            found.truncate(1);
                            platform = candidate;
                            devices = found;
                            break;
                        }
                    }
                }
                if devices.is_empty() {
                    return Err(Error::native(
                        "OpenCL",
                        CL_DEVICE_NOT_FOUND as i64,
                        "no GPU device on any platform",
                    ));
                }

                let properties: [cl_context_properties; 3] = [
                    CL_CONTEXT_PLATFORM as cl_context_properties,
                    platform as cl_context_properties,
                    0,
                ];
                let mut status: cl_int = CL_SUCCESS;
                let raw = unsafe {
                    clCreateContext(
                        properties.as_ptr(),
                        devices.len() as cl_uint,
                        devices.as_ptr(),
                        None,
                        std::ptr::null_mut(),
                        &mut status,
                    )
                };
                check(status)?;
                context = Handle::adopt(raw);
            }

            let devices = context_devices(context.get())?;
            let first = devices[0];

            let queue: Handle<cl_command_queue, QueueTraits> = if share.queue.is_null() {
                create_queue(context.get(), first)?
            } else {
                Handle::wrap_shared(share.queue as cl_command_queue)
            };

            let version = device_info_string(first, CL_DEVICE_VERSION)?;
            let mut extensions = HashSet::new();
            for word in device_info_string(first, CL_DEVICE_EXTENSIONS)?.split_whitespace() {
                extensions.insert(word.to_owned());
            }
            if let Ok(platform_ext) = platform_extensions(first) {
                for word in platform_ext.split_whitespace() {
                    extensions.insert(word.to_owned());
                }
            }
            debug!(version = %version, "created OpenCL device");

            let default_stream = Arc::new(ClStream {
                queue,
                out_of_order: true,
                chain: Mutex::new(None),
            });
            let imp = Arc::new(ClDevice {
                context,
                version,
                extensions,
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
            Self::platform_ids()
                .map(|platforms| {
                    platforms
                        .into_iter()
                        .any(|p| Self::gpu_device_ids(p).map(|d| !d.is_empty()).unwrap_or(false))
                })
                .unwrap_or(false)
        }

        fn platform_ids() -> Result<Vec<cl_platform_id>> {
            let mut count: cl_uint = 0;
            let status = unsafe { clGetPlatformIDs(0, std::ptr::null_mut(), &mut count) };
            if status != CL_SUCCESS {
                return Ok(Vec::new());
            }
            let mut platforms = vec![std::ptr::null_mut(); count as usize];
            if !platforms.is_empty() {
                check(unsafe {
                    clGetPlatformIDs(count, platforms.as_mut_ptr(), std::ptr::null_mut())
                })?;
            }
            Ok(platforms)
        }

        fn gpu_device_ids(platform: cl_platform_id) -> Result<Vec<cl_device_id>> {
            let mut count: cl_uint = 0;
            let status = unsafe {
                clGetDeviceIDs(platform, CL_DEVICE_TYPE_GPU, 0, std::ptr::null_mut(), &mut count)
            };
            if status == CL_DEVICE_NOT_FOUND || count == 0 {
                return Ok(Vec::new());
            }
            check(status)?;
            let mut devices = vec![std::ptr::null_mut(); count as usize];
            check(unsafe {
                clGetDeviceIDs(
                    platform,
                    CL_DEVICE_TYPE_GPU,
                    count,
                    devices.as_mut_ptr(),
                    std::ptr::null_mut(),
                )
            })?;
            Ok(devices)
        }

        pub(crate) fn devices(&self) -> Result<Vec<cl_device_id>> {
            context_devices(self.context.get())
        }

        pub(crate) fn check_extension(&self, name: &str) -> bool {
            self.extensions.contains(name)
        }

        pub(crate) fn check_version(&self, version: &str) -> bool {
            self.version.as_str() >= version
        }

        pub(crate) fn cache(&self) -> &Arc<BinaryCache> {
            &self.cache
        }
    }

    pub(crate) fn context_devices(context: cl_context) -> Result<Vec<cl_device_id>> {
        let mut bytes = 0usize;
        check(unsafe {
            clGetContextInfo(context, CL_CONTEXT_DEVICES, 0, std::ptr::null_mut(), &mut bytes)
        })?;
        let count = bytes / std::mem::size_of::<cl_device_id>();
        let mut devices: Vec<cl_device_id> = vec![std::ptr::null_mut(); count];
        check(unsafe {
            clGetContextInfo(
                context,
                CL_CONTEXT_DEVICES,
                bytes,
                devices.as_mut_ptr().cast(),
                std::ptr::null_mut(),
            )
        })?;
        Ok(devices)
    }

    fn create_queue(
        context: cl_context,
        device: cl_device_id,
    ) -> Result<Handle<cl_command_queue, QueueTraits>> {
        let mut supported: cl_command_queue_properties = 0;
        check(unsafe {
            clGetDeviceInfo(
                device,
                CL_DEVICE_QUEUE_PROPERTIES,
                std::mem::size_of::<cl_command_queue_properties>(),
                (&mut supported as *mut cl_command_queue_properties).cast(),
                std::ptr::null_mut(),
            )
        })?;
        let properties = CL_QUEUE_OUT_OF_ORDER_EXEC_MODE_ENABLE & supported;
        let mut status: cl_int = CL_SUCCESS;
        let raw = unsafe { clCreateCommandQueue(context, device, properties, &mut status) };
        check(status)?;
        Ok(Handle::adopt(raw))
    }

    fn device_info_string(device: cl_device_id, what: cl_device_info) -> Result<String> {
        let mut bytes = 0usize;
        check(unsafe { clGetDeviceInfo(device, what, 0, std::ptr::null_mut(), &mut bytes) })?;
        if bytes == 0 {
            return Ok(String::new());
        }
        let mut buf = vec![0u8; bytes];
        check(unsafe {
            clGetDeviceInfo(device, what, bytes, buf.as_mut_ptr().cast(), std::ptr::null_mut())
        })?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    fn platform_extensions(device: cl_device_id) -> Result<String> {
        let mut platform: cl_platform_id = std::ptr::null_mut();
        check(unsafe {
            clGetDeviceInfo(
                device,
                CL_DEVICE_PLATFORM,
                std::mem::size_of::<cl_platform_id>(),
                (&mut platform as *mut cl_platform_id).cast(),
                std::ptr::null_mut(),
            )
        })?;
        let mut bytes = 0usize;
        check(unsafe {
            clGetPlatformInfo(platform, CL_PLATFORM_EXTENSIONS, 0, std::ptr::null_mut(), &mut bytes)
        })?;
        if bytes == 0 {
            return Ok(String::new());
        }
        let mut buf = vec![0u8; bytes];
        check(unsafe {
            clGetPlatformInfo(
                platform,
                CL_PLATFORM_EXTENSIONS,
                bytes,
                buf.as_mut_ptr().cast(),
                std::ptr::null_mut(),
            )
        })?;
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        Ok(String::from_utf8_lossy(&buf[..end]).into_owned())
    }

    impl DeviceImpl for ClDevice {
        fn load_library_from_text(&self, text: &str, options: &str) -> Result<Library> {
            load_from_source(self, text, options)
        }

        fn load_library_from_data(&self, data: &[u8], options: &str) -> Result<Library> {
            load_from_il(self, data, options)
        }

        fn share_context(&self) -> SharedContext {
            SharedContext {
                context: self.context.get() as *mut c_void,
                queue: self.default_stream.queue.get() as *mut c_void,
                ..SharedContext::default()
            }
        }

        fn create_stream(&self) -> Result<Stream> {
            let devices = self.devices()?;
            let queue = create_queue(self.context.get(), devices[0])?;
            Ok(Stream::from_impl(Arc::new(ClStream {
                queue,
                out_of_order: true,
                chain: Mutex::new(None),
            })))
        }

        fn memory_pool_size(&self) -> usize {
            self.pool_size.load(Ordering::Relaxed)
        }

        fn set_memory_pool_size(&self, bytes: usize) {
            self.pool_size.store(bytes, Ordering::Relaxed);
        }

        fn allocate_buffer(&self, bytes: usize, access: Access) -> Result<Buffer> {
            let mut status: cl_int = CL_SUCCESS;
            let raw = unsafe {
                clCreateBuffer(
                    self.context.get(),
                    mem_flags(access),
                    bytes,
                    std::ptr::null_mut(),
                    &mut status,
                )
            };
            check(status)?;
            Ok(Buffer::from_impl(Arc::new(ClBuffer {
                mem: Handle::adopt(raw),
            })))
        }

        fn allocate_mapped_buffer(&self, bytes: usize, access: Access) -> Result<MappedBuffer> {
            let mut status: cl_int = CL_SUCCESS;
            let raw = unsafe {
                clCreateBuffer(
                    self.context.get(),
                    mem_flags(access) | CL_MEM_ALLOC_HOST_PTR,
                    bytes,
                    std::ptr::null_mut(),
                    &mut status,
                )
            };
            check(status)?;
            Ok(MappedBuffer::from_impl(Arc::new(ClMappedBuffer {
                base: ClBuffer {
                    mem: Handle::adopt(raw),
                },
                len: bytes,
                mapped: Mutex::new(std::ptr::null_mut()),
            })))
        }

        fn allocate_image(&self, descr: &ImageDescription) -> Result<Image> {
            self.build_image(descr, std::ptr::null_mut())
        }

        fn shared_image_from_buffer(
            &self,
            descr: &ImageDescription,
            buffer: &Buffer,
        ) -> Result<Image> {
            let mem = mem_of(buffer)?;
            self.build_image(descr, mem)
        }

        fn shared_image_from_image(&self, descr: &ImageDescription, image: &Image) -> Result<Image> {
            // image views share the underlying memory object directly
            let src = downcast_image::<ClImage>(image)?;
            Ok(Image::from_impl(Arc::new(ClImage {
                mem: src.mem.clone(),
                descr: *descr,
            })))
        }

        fn get_attribute(&self, what: DeviceAttributeId) -> Attribute {
            let device = match self.devices() {
                Ok(devices) if !devices.is_empty() => devices[0],
                _ => return Attribute::unknown(),
            };
            match what {
                DeviceAttributeId::Implementation => Attribute::from("OpenCL"),
                DeviceAttributeId::Name => device_info_string(device, CL_DEVICE_NAME)
                    .map(Attribute::from)
                    .unwrap_or_default(),
                DeviceAttributeId::Vendor => device_info_string(device, CL_DEVICE_VENDOR)
                    .map(Attribute::from)
                    .unwrap_or_default(),
                DeviceAttributeId::DriverVersion => device_info_string(device, CL_DRIVER_VERSION)
                    .map(Attribute::from)
                    .unwrap_or_default(),
                DeviceAttributeId::SubUnitCount => self
                    .devices()
                    .map(|d| Attribute::from(d.len() as i32))
                    .unwrap_or_default(),
                DeviceAttributeId::SupportsMappedBuffer => Attribute::from(true),
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

    impl ClDevice {
        fn build_image(&self, descr: &ImageDescription, buffer: cl_mem) -> Result<Image> {
            let flags = mem_flags(descr.access);
            let image_type = image_type_for(descr);
            let format = image_format(self.context.get(), descr, image_type, flags)?;

            let mut desc: cl_image_desc = unsafe { std::mem::zeroed() };
            desc.image_type = image_type;
            desc.image_width = descr.size.x;
            desc.image_height = descr.size.y;
            desc.image_depth = descr.size.z;
            desc.image_row_pitch = descr.stride.x;
            desc.image_slice_pitch = descr.stride.y;
            desc.buffer = buffer;

            let mut status: cl_int = CL_SUCCESS;
            let raw = unsafe {
                clCreateImage(
                    self.context.get(),
                    flags,
                    &format,
                    &desc,
                    std::ptr::null_mut(),
                    &mut status,
                )
            };
            check(status)?;
            Ok(Image::from_impl(Arc::new(ClImage {
                mem: Handle::adopt(raw),
                descr: *descr,
            })))
        }
    }

    /// A command queue plus the event chain that keeps it FIFO
    pub struct ClStream {
        pub(crate) queue: Handle<cl_command_queue, QueueTraits>,
        out_of_order: bool,
        /// completion event of the most recent enqueue
        chain: Mutex<Option<Handle<cl_event, EventTraits>>>,
    }

    unsafe impl Send for ClStream {}
    unsafe impl Sync for ClStream {}

    impl ClStream {
        /// Run one enqueue under the event chain: the command waits on the
        /// previous out-event and replaces it with its own
        pub(crate) fn enqueue_with<T>(
            &self,
            f: impl FnOnce(cl_uint, *const cl_event, *mut cl_event) -> (cl_int, T),
        ) -> Result<T> {
            let mut chain = self.chain.lock();
            let previous = chain.take();
            let (wait_ptr, wait_len): (*const cl_event, cl_uint) = match &previous {
                Some(event) => (event.raw_ptr(), 1),
                None => (std::ptr::null(), 0),
            };
            let mut out: cl_event = std::ptr::null_mut();
            let out_ptr = if self.out_of_order {
                &mut out as *mut cl_event
            } else {
                std::ptr::null_mut()
            };
            let (status, value) = f(wait_len, wait_ptr, out_ptr);
            check(status)?;
            if self.out_of_order && !out.is_null() {
                *chain = Some(Handle::adopt(out));
            }
            Ok(value)
            // the previous event's reference drops here
        }

        pub(crate) fn enqueue(
            &self,
            f: impl FnOnce(cl_uint, *const cl_event, *mut cl_event) -> cl_int,
        ) -> Result<()> {
            self.enqueue_with(|len, wait, out| (f(len, wait, out), ()))
        }
    }

    impl StreamImpl for ClStream {
        fn sync(&self) -> Result<()> {
            // waiting on the chain's tail covers everything before it
            let tail = self.chain.lock().take();
            if let Some(event) = tail {
                let raw = event.get();
                check(unsafe { clWaitForEvents(1, &raw) })?;
            }
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    pub(crate) fn stream_of(stream: &Stream) -> Result<&ClStream> {
        downcast_stream::<ClStream>(stream)
    }

    /// Memory object of a buffer argument, whichever concrete type backs it
    pub(crate) fn mem_of(buffer: &Buffer) -> Result<cl_mem> {
        let any = buffer.imp().as_any();
        if let Some(b) = any.downcast_ref::<ClBuffer>() {
            return Ok(b.mem.get());
        }
        if let Some(b) = any.downcast_ref::<ClMappedBuffer>() {
            return Ok(b.base.mem.get());
        }
        Err(Error::Unsupported("buffer belongs to a different backend"))
    }

    /// A device memory object
    pub struct ClBuffer {
        pub(crate) mem: Handle<cl_mem, MemTraits>,
    }

    unsafe impl Send for ClBuffer {}
    unsafe impl Sync for ClBuffer {}

    fn buffer_copy_from_buffer(
        dst: cl_mem,
        stream: &Stream,
        src: &Buffer,
        bytes: usize,
    ) -> Result<()> {
        let stream = stream_of(stream)?;
        let src = mem_of(src)?;
        stream.enqueue(|len, wait, out| unsafe {
            clEnqueueCopyBuffer(stream.queue.get(), src, dst, 0, 0, bytes, len, wait, out)
        })
    }

    fn buffer_copy_from_host(dst: cl_mem, stream: &Stream, src: &[u8]) -> Result<()> {
        let stream = stream_of(stream)?;
        stream.enqueue(|len, wait, out| unsafe {
            clEnqueueWriteBuffer(
                stream.queue.get(),
                dst,
                CL_FALSE,
                0,
                src.len(),
                src.as_ptr().cast(),
                len,
                wait,
                out,
            )
        })
    }

    fn buffer_copy_to_host(src: cl_mem, stream: &Stream, dst: &mut [u8]) -> Result<()> {
        let stream = stream_of(stream)?;
        stream.enqueue(|len, wait, out| unsafe {
            clEnqueueReadBuffer(
                stream.queue.get(),
                src,
                CL_FALSE,
                0,
                dst.len(),
                dst.as_mut_ptr().cast(),
                len,
                wait,
                out,
            )
        })
    }

    impl BufferImpl for ClBuffer {
        fn copy_from_buffer(&self, stream: &Stream, src: &Buffer, bytes: usize) -> Result<()> {
            buffer_copy_from_buffer(self.mem.get(), stream, src, bytes)
        }

        fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<()> {
            buffer_copy_from_host(self.mem.get(), stream, src)
        }

        fn copy_to_host(&self, stream: &Stream, dst: &mut [u8]) -> Result<()> {
            buffer_copy_to_host(self.mem.get(), stream, dst)
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// A host-allocated buffer with enqueued map/unmap
    pub struct ClMappedBuffer {
        base: ClBuffer,
        len: usize,
        mapped: Mutex<*mut c_void>,
    }

    unsafe impl Send for ClMappedBuffer {}
    unsafe impl Sync for ClMappedBuffer {}

    impl BufferImpl for ClMappedBuffer {
        fn copy_from_buffer(&self, stream: &Stream, src: &Buffer, bytes: usize) -> Result<()> {
            buffer_copy_from_buffer(self.base.mem.get(), stream, src, bytes)
        }

        fn copy_from_host(&self, stream: &Stream, src: &[u8]) -> Result<()> {
            buffer_copy_from_host(self.base.mem.get(), stream, src)
        }

        fn copy_to_host(&self, stream: &Stream, dst: &mut [u8]) -> Result<()> {
            buffer_copy_to_host(self.base.mem.get(), stream, dst)
        }

        fn map(&self, stream: &Stream, access: Access, sync: bool) -> Result<*mut u8> {
            let flags: cl_map_flags = match access {
                Access::ReadOnly => CL_MAP_READ,
                Access::WriteOnly => CL_MAP_WRITE_INVALIDATE_REGION,
                Access::ReadWrite => {
                    return Err(Error::unsupported("read-write mapping (pick one direction)"))
                }
            };
            let stream_impl = stream_of(stream)?;
            let ptr = stream_impl.enqueue_with(|len, wait, out| {
                let mut status: cl_int = CL_SUCCESS;
                let ptr = unsafe {
                    clEnqueueMapBuffer(
                        stream_impl.queue.get(),
                        self.base.mem.get(),
                        sync as cl_bool,
                        flags,
                        0,
                        self.len,
                        len,
                        wait,
                        out,
                        &mut status,
                    )
                };
                (status, ptr)
            })?;
            *self.mapped.lock() = ptr;
            Ok(ptr as *mut u8)
        }

        fn unmap(&self, stream: &Stream) -> Result<()> {
            let ptr = std::mem::replace(&mut *self.mapped.lock(), std::ptr::null_mut());
            if ptr.is_null() {
                return Ok(());
            }
            let stream = stream_of(stream)?;
            stream.enqueue(|len, wait, out| unsafe {
                clEnqueueUnmapMemObject(stream.queue.get(), self.base.mem.get(), ptr, len, wait, out)
            })
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// A formatted image memory object
    pub struct ClImage {
        pub(crate) mem: Handle<cl_mem, MemTraits>,
        descr: ImageDescription,
    }

    unsafe impl Send for ClImage {}
    unsafe impl Sync for ClImage {}

    impl ImageImpl for ClImage {
        fn copy_from_image(&self, stream: &Stream, src: &Image) -> Result<()> {
            let stream = stream_of(stream)?;
            let src = downcast_image::<ClImage>(src)?;
            let origin = [0usize; 3];
            let region = [self.descr.size.x, self.descr.size.y, self.descr.size.z];
            stream.enqueue(|len, wait, out| unsafe {
                clEnqueueCopyImage(
                    stream.queue.get(),
                    src.mem.get(),
                    self.mem.get(),
                    origin.as_ptr(),
                    origin.as_ptr(),
                    region.as_ptr(),
                    len,
                    wait,
                    out,
                )
            })
        }

        fn copy_from_buffer(
            &self,
            stream: &Stream,
            src: &Buffer,
            descr: &ImageDescription,
        ) -> Result<()> {
            let stream = stream_of(stream)?;
            let src = mem_of(src)?;
            let origin = [0usize; 3];
            let region = [descr.size.x, descr.size.y, descr.size.z];
            stream.enqueue(|len, wait, out| unsafe {
                clEnqueueCopyBufferToImage(
                    stream.queue.get(),
                    src,
                    self.mem.get(),
                    0,
                    origin.as_ptr(),
                    region.as_ptr(),
                    len,
                    wait,
                    out,
                )
            })
        }

        fn copy_from_host(
            &self,
            stream: &Stream,
            src: &[u8],
            descr: &ImageDescription,
        ) -> Result<()> {
            let stream = stream_of(stream)?;
            let origin = [0usize; 3];
            let region = [descr.size.x, descr.size.y, descr.size.z];
            stream.enqueue(|len, wait, out| unsafe {
                clEnqueueWriteImage(
                    stream.queue.get(),
                    self.mem.get(),
                    CL_FALSE,
                    origin.as_ptr(),
                    region.as_ptr(),
                    descr.stride.x,
                    descr.stride.y,
                    src.as_ptr().cast(),
                    len,
                    wait,
                    out,
                )
            })
        }

        fn copy_to_buffer(
            &self,
            stream: &Stream,
            dst: &Buffer,
            descr: &ImageDescription,
        ) -> Result<()> {
            let stream = stream_of(stream)?;
            let dst = mem_of(dst)?;
            let origin = [0usize; 3];
            let region = [descr.size.x, descr.size.y, descr.size.z];
            stream.enqueue(|len, wait, out| unsafe {
                clEnqueueCopyImageToBuffer(
                    stream.queue.get(),
                    self.mem.get(),
                    dst,
                    origin.as_ptr(),
                    region.as_ptr(),
                    0,
                    len,
                    wait,
                    out,
                )
            })
        }

        fn copy_to_host(
            &self,
            stream: &Stream,
            dst: &mut [u8],
            descr: &ImageDescription,
        ) -> Result<()> {
            let stream = stream_of(stream)?;
            let origin = [0usize; 3];
            let region = [descr.size.x, descr.size.y, descr.size.z];
            stream.enqueue(|len, wait, out| unsafe {
                clEnqueueReadImage(
                    stream.queue.get(),
                    self.mem.get(),
                    CL_FALSE,
                    origin.as_ptr(),
                    region.as_ptr(),
                    descr.stride.x,
                    descr.stride.y,
                    dst.as_mut_ptr().cast(),
                    len,
                    wait,
                    out,
                )
            })
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
        fn test_opencl_availability_probe_does_not_panic() {
            let _ = ClDevice::is_available();
        }

        #[test]
        fn test_opencl_buffer_round_trip() {
            if !ClDevice::is_available() {
                return;
            }
            let device = ClDevice::create().unwrap();
            let stream = device.default_stream();

            let buffer = device.allocate_buffer(64, Access::ReadWrite).unwrap();
            let data: Vec<u8> = (0..64).collect();
            buffer.copy_from_host(&stream, &data).unwrap();

            let mut out = vec![0u8; 64];
            buffer.copy_to_host(&stream, &mut out).unwrap();
            stream.sync().unwrap();
            assert_eq!(out, data);
        }
    }
}

/// Stub when the `opencl` feature is disabled
#[cfg(not(feature = "opencl"))]
pub struct ClDevice;

#[cfg(not(feature = "opencl"))]
impl ClDevice {
    pub fn create() -> Result<Device> {
        Err(Error::unsupported("OpenCL backend requires the 'opencl' feature"))
    }

    pub fn create_with_context(_share: &SharedContext) -> Result<Device> {
        Err(Error::unsupported("OpenCL backend requires the 'opencl' feature"))
    }

    pub fn is_available() -> bool {
        false
    }
}
