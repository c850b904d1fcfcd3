//! OpenCL program builds: cache consult, source/IL/binary loads, kernels

use std::ffi::{c_void, CString};
use std::sync::Arc;

use cl_sys::*;
use tracing::debug;

use crate::attribute::{Attribute, AttributeKind};
use crate::backend::{FunctionAttributeId, FunctionImpl, LibraryImpl};
use crate::cache::DeviceFingerprint;
use crate::device::Stream;
use crate::error::{Error, Result};
use crate::function::{Function, Library};
use crate::handle::Handle;
use crate::launch::LaunchArgs;

use super::{check, mem_of, stream_of, ClDevice, KernelTraits, ProgramTraits};

/// A built OpenCL program
pub struct ClLibrary {
    program: Handle<cl_program, ProgramTraits>,
    /// context devices at build time, for kernel work-group queries
    devices: Vec<cl_device_id>,
}

unsafe impl Send for ClLibrary {}
unsafe impl Sync for ClLibrary {}

fn build_program(
    program: cl_program,
    devices: &[cl_device_id],
    options: &str,
) -> Result<()> {
    let options_c =
        CString::new(options).map_err(|_| Error::unsupported("build options with NUL byte"))?;
    let status = unsafe {
        clBuildProgram(
            program,
            0,
            std::ptr::null(),
            options_c.as_ptr(),
            None,
            std::ptr::null_mut(),
        )
    };
    if status == CL_SUCCESS {
        return Ok(());
    }

    // pull the compiler log off every device that reports a build error
    let mut log = String::new();
    for &device in devices {
        let mut build_status: cl_build_status = 0;
        let probed = unsafe {
            clGetProgramBuildInfo(
                program,
                device,
                CL_PROGRAM_BUILD_STATUS,
                std::mem::size_of::<cl_build_status>(),
                (&mut build_status as *mut cl_build_status).cast(),
                std::ptr::null_mut(),
            )
        };
        if probed != CL_SUCCESS || build_status != CL_BUILD_ERROR {
            continue;
        }
        let mut bytes = 0usize;
        if unsafe {
            clGetProgramBuildInfo(
                program,
                device,
                CL_PROGRAM_BUILD_LOG,
                0,
                std::ptr::null_mut(),
                &mut bytes,
            )
        } != CL_SUCCESS
        {
            continue;
        }
        let mut buf = vec![0u8; bytes];
        if unsafe {
            clGetProgramBuildInfo(
                program,
                device,
                CL_PROGRAM_BUILD_LOG,
                bytes,
                buf.as_mut_ptr().cast(),
                std::ptr::null_mut(),
            )
        } == CL_SUCCESS
        {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            log.push_str(&String::from_utf8_lossy(&buf[..end]));
        }
    }
    if log.is_empty() {
        check(status)
    } else {
        Err(Error::build(log))
    }
}

/// Extract the per-device binaries of a built program for the cache
fn program_binaries(program: cl_program, device_count: usize) -> Result<Vec<Vec<u8>>> {
    let mut sizes = vec![0usize; device_count];
    check(unsafe {
        clGetProgramInfo(
            program,
            CL_PROGRAM_BINARY_SIZES,
            device_count * std::mem::size_of::<usize>(),
            sizes.as_mut_ptr().cast(),
            std::ptr::null_mut(),
        )
    })?;
    let mut binaries: Vec<Vec<u8>> = sizes.iter().map(|&s| vec![0u8; s]).collect();
    let mut pointers: Vec<*mut u8> = binaries.iter_mut().map(|b| b.as_mut_ptr()).collect();
    check(unsafe {
        clGetProgramInfo(
            program,
            CL_PROGRAM_BINARIES,
            device_count * std::mem::size_of::<*mut u8>(),
            pointers.as_mut_ptr().cast(),
            std::ptr::null_mut(),
        )
    })?;
    Ok(binaries)
}

fn finish_and_cache(
    dev: &ClDevice,
    program: Handle<cl_program, ProgramTraits>,
    devices: Vec<cl_device_id>,
    fingerprint: &DeviceFingerprint,
    data: &[u8],
    options: &str,
) -> Result<Library> {
    if dev.cache().is_enabled() {
        match program_binaries(program.get(), devices.len()) {
            Ok(binaries) => {
                let slices: Vec<&[u8]> = binaries.iter().map(|b| b.as_slice()).collect();
                dev.cache().save(fingerprint, &slices, data, options);
            }
            Err(err) => debug!(error = %err, "program binary extraction failed; not cached"),
        }
    }
    Ok(Library::from_impl(Arc::new(ClLibrary { program, devices })))
}

fn try_cached(
    dev: &ClDevice,
    fingerprint: &DeviceFingerprint,
    data: &[u8],
    options: &str,
) -> Result<Option<Library>> {
    let Some(binaries) = dev.cache().load(fingerprint, data, options) else {
        return Ok(None);
    };
    load_from_binaries(dev, &binaries, options).map(Some)
}

/// Build a program from kernel source, consulting the cache first
pub(super) fn load_from_source(dev: &ClDevice, text: &str, options: &str) -> Result<Library> {
    let fingerprint = DeviceFingerprint::from_device(dev);
    if let Some(library) = try_cached(dev, &fingerprint, text.as_bytes(), options)? {
        return Ok(library);
    }

    let devices = dev.devices()?;
    let mut status: cl_int = CL_SUCCESS;
    let text_ptr = text.as_ptr() as *const std::os::raw::c_char;
    let lengths = [text.len()];
    let raw = unsafe {
        clCreateProgramWithSource(
            dev.context.get(),
            1,
            &text_ptr,
            lengths.as_ptr(),
            &mut status,
        )
    };
    check(status)?;
    let program = Handle::adopt(raw);
    build_program(program.get(), &devices, options)?;
    finish_and_cache(dev, program, devices, &fingerprint, text.as_bytes(), options)
}

/// Build a program from intermediate representation, if the platform has it
pub(super) fn load_from_il(dev: &ClDevice, data: &[u8], options: &str) -> Result<Library> {
    if !dev.check_version("OpenCL 2.1") && !dev.check_extension("cl_khr_il_program") {
        return Err(Error::unsupported("intermediate-representation programs"));
    }
    let fingerprint = DeviceFingerprint::from_device(dev);
    if let Some(library) = try_cached(dev, &fingerprint, data, options)? {
        return Ok(library);
    }

    let devices = dev.devices()?;
    let mut status: cl_int = CL_SUCCESS;
    let raw = unsafe {
        clCreateProgramWithIL(
            dev.context.get(),
            data.as_ptr() as *const c_void,
            data.len(),
            &mut status,
        )
    };
    check(status)?;
    let program = Handle::adopt(raw);
    build_program(program.get(), &devices, options)?;
    finish_and_cache(dev, program, devices, &fingerprint, data, options)
}

/// Rebuild a program from previously compiled per-device binaries
pub(super) fn load_from_binaries(
    dev: &ClDevice,
    binaries: &[Vec<u8>],
    options: &str,
) -> Result<Library> {
    let devices = dev.devices()?;
    let lengths: Vec<usize> = binaries.iter().map(|b| b.len()).collect();
    let pointers: Vec<*const u8> = binaries.iter().map(|b| b.as_ptr()).collect();
    let mut status: cl_int = CL_SUCCESS;
    let raw = unsafe {
        clCreateProgramWithBinary(
            dev.context.get(),
            devices.len() as cl_uint,
            devices.as_ptr(),
            lengths.as_ptr(),
            pointers.as_ptr(),
            std::ptr::null_mut(),
            &mut status,
        )
    };
    check(status)?;
    let program = Handle::adopt(raw);
    build_program(program.get(), &devices, options)?;
    Ok(Library::from_impl(Arc::new(ClLibrary { program, devices })))
}

impl LibraryImpl for ClLibrary {
    fn lookup_function(self: Arc<Self>, name: &str) -> Result<Function> {
        let cname =
            CString::new(name).map_err(|_| Error::unsupported("kernel name with NUL byte"))?;
        let mut status: cl_int = CL_SUCCESS;
        let raw = unsafe { clCreateKernel(self.program.get(), cname.as_ptr(), &mut status) };
        check(status)?;
        Ok(Function::from_impl(Arc::new(ClFunction {
            kernel: Handle::adopt(raw),
            device: self.devices[0],
            _library: self,
        })))
    }
}

/// One kernel of a built program
pub struct ClFunction {
    kernel: Handle<cl_kernel, KernelTraits>,
    device: cl_device_id,
    /// keeps the program alive while the kernel is
    _library: Arc<ClLibrary>,
}

unsafe impl Send for ClFunction {}
unsafe impl Sync for ClFunction {}

impl FunctionImpl for ClFunction {
    fn execute(&self, stream: &Stream, launch: &LaunchArgs, args: &[Attribute]) -> Result<()> {
        let kernel = self.kernel.get();
        let mut index: cl_uint = 0;
        for attr in args {
            match attr.kind() {
                AttributeKind::Float => {
                    // 3-vectors share the 4-vector layout
                    let count = if attr.count() == 3 { 4 } else { attr.count() };
                    check(unsafe {
                        clSetKernelArg(
                            kernel,
                            index,
                            std::mem::size_of::<f32>() * count,
                            attr.f32_array().as_ptr().cast(),
                        )
                    })?;
                    index += 1;
                }
                AttributeKind::Int => {
                    let count = if attr.count() == 3 { 4 } else { attr.count() };
                    check(unsafe {
                        clSetKernelArg(
                            kernel,
                            index,
                            std::mem::size_of::<i32>() * count,
                            attr.i32_array().as_ptr().cast(),
                        )
                    })?;
                    index += 1;
                }
                AttributeKind::Bool => {
                    let count = if attr.count() == 3 { 4 } else { attr.count() };
                    let bytes: [u8; 4] = attr.bool_array().map(u8::from);
                    check(unsafe {
                        clSetKernelArg(kernel, index, count, bytes.as_ptr().cast())
                    })?;
                    index += 1;
                }
                AttributeKind::Buffer => {
                    let buffer = attr.as_buffer().expect("buffer attribute");
                    let mem = mem_of(buffer)?;
                    check(unsafe {
                        clSetKernelArg(
                            kernel,
                            index,
                            std::mem::size_of::<cl_mem>(),
                            (&mem as *const cl_mem).cast(),
                        )
                    })?;
                    index += 1;
                }
                AttributeKind::Image => {
                    let image = attr.as_image().expect("image attribute");
                    let image = crate::backend::downcast_image::<super::ClImage>(image)?;
                    let mem = image.mem.get();
                    check(unsafe {
                        clSetKernelArg(
                            kernel,
                            index,
                            std::mem::size_of::<cl_mem>(),
                            (&mem as *const cl_mem).cast(),
                        )
                    })?;
                    index += 1;
                }
                AttributeKind::LocalMem => {
                    check(unsafe {
                        clSetKernelArg(
                            kernel,
                            index,
                            attr.local_mem_bytes() as usize,
                            std::ptr::null(),
                        )
                    })?;
                    index += 1;
                }
                AttributeKind::String | AttributeKind::Unknown => {}
            }
        }

        let stream = stream_of(stream)?;
        let global: [usize; 3] = [
            launch.global_size()[0] as usize,
            launch.global_size()[1] as usize,
            launch.global_size()[2] as usize,
        ];
        let local: [usize; 3] = [
            launch.local_size()[0] as usize,
            launch.local_size()[1] as usize,
            launch.local_size()[2] as usize,
        ];
        stream.enqueue(|len, wait, out| unsafe {
            clEnqueueNDRangeKernel(
                stream.queue.get(),
                kernel,
                launch.dims(),
                std::ptr::null(),
                global.as_ptr(),
                if launch.is_local_defined() {
                    local.as_ptr()
                } else {
                    std::ptr::null()
                },
                len,
                wait,
                out,
            )
        })
    }

    fn get_attribute(&self, what: FunctionAttributeId) -> Result<Attribute> {
        match what {
            FunctionAttributeId::LocalMemory => {
                let mut bytes: cl_ulong = 0;
                check(unsafe {
                    clGetKernelWorkGroupInfo(
                        self.kernel.get(),
                        self.device,
                        CL_KERNEL_LOCAL_MEM_SIZE,
                        std::mem::size_of::<cl_ulong>(),
                        (&mut bytes as *mut cl_ulong).cast(),
                        std::ptr::null_mut(),
                    )
                })?;
                Ok(Attribute::from(bytes))
            }
            FunctionAttributeId::MaxLocalMemory => Ok(Attribute::from(0u64)),
            FunctionAttributeId::ThreadWidth => {
                let mut width: usize = 0;
                check(unsafe {
                    clGetKernelWorkGroupInfo(
                        self.kernel.get(),
                        self.device,
                        CL_KERNEL_PREFERRED_WORK_GROUP_SIZE_MULTIPLE,
                        std::mem::size_of::<usize>(),
                        (&mut width as *mut usize).cast(),
                        std::ptr::null_mut(),
                    )
                })?;
                Ok(Attribute::from(width as u64))
            }
            FunctionAttributeId::MaxThreads => {
                let mut max: usize = 0;
                check(unsafe {
                    clGetKernelWorkGroupInfo(
                        self.kernel.get(),
                        self.device,
                        CL_KERNEL_WORK_GROUP_SIZE,
                        std::mem::size_of::<usize>(),
                        (&mut max as *mut usize).cast(),
                        std::ptr::null_mut(),
                    )
                })?;
                Ok(Attribute::from(max as u64))
            }
            FunctionAttributeId::RequiredWorkSize => {
                let mut sizes = [0usize; 3];
                check(unsafe {
                    clGetKernelWorkGroupInfo(
                        self.kernel.get(),
                        self.device,
                        CL_KERNEL_COMPILE_WORK_GROUP_SIZE,
                        std::mem::size_of::<[usize; 3]>(),
                        sizes.as_mut_ptr().cast(),
                        std::ptr::null_mut(),
                    )
                })?;
                Ok(Attribute::from([
                    sizes[0] as u64,
                    sizes[1] as u64,
                    sizes[2] as u64,
                ]))
            }
        }
    }
}
