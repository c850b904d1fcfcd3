//! CUDA module loading: binary cache consult, driver JIT link, kernel lookup

use std::ffi::{c_void, CString};
use std::sync::Arc;

use cudarc::driver::sys;
use tracing::debug;

use crate::attribute::Attribute;
use crate::backend::{FunctionAttributeId, FunctionImpl, LibraryImpl};
use crate::cache::{BinaryCache, DeviceFingerprint};
use crate::device::Stream;
use crate::error::{Error, Result};
use crate::function::{Function, Library};
use crate::handle::Handle;
use crate::launch::LaunchArgs;

use super::{check, launch_kernel, LinkTraits, ModuleTraits};

const JIT_LOG_BYTES: usize = 8192;

/// Fat-binary container magic (little-endian 0xBA55ED50)
const FATBIN_MAGIC: [u8; 4] = [0x50, 0xED, 0x55, 0xBA];
/// ELF magic: a cubin
const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];

enum InputKind {
    Ptx,
    Cubin,
    FatBinary,
}

fn classify(data: &[u8]) -> InputKind {
    if data.len() >= 4 && data[..4] == FATBIN_MAGIC {
        InputKind::FatBinary
    } else if data.len() >= 4 && data[..4] == ELF_MAGIC {
        InputKind::Cubin
    } else {
        // anything else is treated as PTX assembly text
        InputKind::Ptx
    }
}

fn log_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Load a module from a compiled blob, consulting the binary cache before
/// invoking the driver JIT linker
pub(super) fn load_module(
    fingerprint: &DeviceFingerprint,
    cache: &Arc<BinaryCache>,
    data: &[u8],
    options: &str,
) -> Result<Library> {
    if let Some(binaries) = cache.load(fingerprint, data, options) {
        if let Some(cubin) = binaries.first().filter(|b| !b.is_empty()) {
            let mut module: Handle<sys::CUmodule, ModuleTraits> = Handle::null();
            check(unsafe {
                sys::cuModuleLoadData(module.out(), cubin.as_ptr() as *const c_void)
            })?;
            return Ok(Library::from_impl(Arc::new(CudaLibrary { module })));
        }
    }

    let kind = classify(data);
    // the linker consumes PTX as NUL-terminated text
    let mut ptx_storage;
    let (payload, payload_len, input_type) = match kind {
        InputKind::Ptx => {
            ptx_storage = data.to_vec();
            ptx_storage.push(0);
            (
                ptx_storage.as_ptr(),
                ptx_storage.len(),
                sys::CUjitInputType_enum::CU_JIT_INPUT_PTX,
            )
        }
        InputKind::Cubin => (
            data.as_ptr(),
            data.len(),
            sys::CUjitInputType_enum::CU_JIT_INPUT_CUBIN,
        ),
        InputKind::FatBinary => (
            data.as_ptr(),
            data.len(),
            sys::CUjitInputType_enum::CU_JIT_INPUT_FATBINARY,
        ),
    };

    let mut walltime: f32 = 0.0;
    let mut info_log = vec![0u8; JIT_LOG_BYTES];
    let mut error_log = vec![0u8; JIT_LOG_BYTES];
    let mut option_keys = [
        sys::CUjit_option_enum::CU_JIT_WALL_TIME,
        sys::CUjit_option_enum::CU_JIT_INFO_LOG_BUFFER,
        sys::CUjit_option_enum::CU_JIT_INFO_LOG_BUFFER_SIZE_BYTES,
        sys::CUjit_option_enum::CU_JIT_ERROR_LOG_BUFFER,
        sys::CUjit_option_enum::CU_JIT_ERROR_LOG_BUFFER_SIZE_BYTES,
        sys::CUjit_option_enum::CU_JIT_LOG_VERBOSE,
    ];
    let mut option_vals: [*mut c_void; 6] = [
        (&mut walltime as *mut f32).cast(),
        info_log.as_mut_ptr().cast(),
        info_log.len() as *mut c_void,
        error_log.as_mut_ptr().cast(),
        error_log.len() as *mut c_void,
        1usize as *mut c_void,
    ];

    let mut link: Handle<sys::CUlinkState, LinkTraits> = Handle::null();
    check(unsafe {
        sys::cuLinkCreate_v2(
            option_keys.len() as u32,
            option_keys.as_mut_ptr(),
            option_vals.as_mut_ptr(),
            link.out(),
        )
    })?;

    let added = unsafe {
        sys::cuLinkAddData_v2(
            link.get(),
            input_type,
            payload as *mut c_void,
            payload_len,
            std::ptr::null(),
            0,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if added != sys::CUresult::CUDA_SUCCESS {
        return Err(Error::build(log_text(&error_log)));
    }

    // the cubin belongs to the link state until it is destroyed
    let mut cubin: *mut c_void = std::ptr::null_mut();
    let mut cubin_size: usize = 0;
    check(unsafe { sys::cuLinkComplete(link.get(), &mut cubin, &mut cubin_size) })?;
    debug!(walltime, bytes = cubin_size, "JIT link complete");

    let mut module: Handle<sys::CUmodule, ModuleTraits> = Handle::null();
    check(unsafe { sys::cuModuleLoadData(module.out(), cubin) })?;

    let cubin_bytes = unsafe { std::slice::from_raw_parts(cubin as *const u8, cubin_size) };
    cache.save(fingerprint, &[cubin_bytes], data, options);

    Ok(Library::from_impl(Arc::new(CudaLibrary { module })))
}

/// A loaded CUDA module
pub struct CudaLibrary {
    module: Handle<sys::CUmodule, ModuleTraits>,
}

unsafe impl Send for CudaLibrary {}
unsafe impl Sync for CudaLibrary {}

impl LibraryImpl for CudaLibrary {
    fn lookup_function(self: Arc<Self>, name: &str) -> Result<Function> {
        let cname =
            CString::new(name).map_err(|_| Error::unsupported("kernel name with NUL byte"))?;
        let mut kernel: sys::CUfunction = std::ptr::null_mut();
        check(unsafe {
            sys::cuModuleGetFunction(&mut kernel, self.module.get(), cname.as_ptr())
        })?;
        Ok(Function::from_impl(Arc::new(CudaFunction {
            kernel,
            _library: self,
        })))
    }
}

/// One kernel of a loaded module
pub struct CudaFunction {
    kernel: sys::CUfunction,
    /// keeps the module loaded while the function is alive
    _library: Arc<CudaLibrary>,
}

unsafe impl Send for CudaFunction {}
unsafe impl Sync for CudaFunction {}

impl CudaFunction {
    fn func_attribute(&self, what: sys::CUfunction_attribute) -> Result<i32> {
        let mut value = 0;
        check(unsafe { sys::cuFuncGetAttribute(&mut value, what, self.kernel) })?;
        Ok(value)
    }
}

impl FunctionImpl for CudaFunction {
    fn execute(&self, stream: &Stream, launch: &LaunchArgs, args: &[Attribute]) -> Result<()> {
        launch_kernel(self.kernel, stream, launch, args)
    }

    fn get_attribute(&self, what: FunctionAttributeId) -> Result<Attribute> {
        match what {
            FunctionAttributeId::LocalMemory => self
                .func_attribute(
                    sys::CUfunction_attribute_enum::CU_FUNC_ATTRIBUTE_SHARED_SIZE_BYTES,
                )
                .map(Attribute::from),
            FunctionAttributeId::MaxThreads => self
                .func_attribute(
                    sys::CUfunction_attribute_enum::CU_FUNC_ATTRIBUTE_MAX_THREADS_PER_BLOCK,
                )
                .map(Attribute::from),
            FunctionAttributeId::MaxLocalMemory
            | FunctionAttributeId::ThreadWidth
            | FunctionAttributeId::RequiredWorkSize => Ok(Attribute::unknown()),
        }
    }
}
