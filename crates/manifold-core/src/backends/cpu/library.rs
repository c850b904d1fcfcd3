//! Shared-library loading and kernel dispatch for the CPU backend

use std::sync::Arc;

use tracing::debug;

use crate::attribute::Attribute;
use crate::backend::{downcast_stream, FunctionImpl, LibraryImpl};
use crate::error::Result;
use crate::function::{Function, Library};
use crate::launch::LaunchArgs;
use crate::device::Stream;

use super::abi::{marshal, CpuKernelFn};
use super::CpuStream;

/// A dynamically loaded shared object exposing kernel entry points
pub struct CpuLibrary {
    module: libloading::Library,
    cores: usize,
}

impl CpuLibrary {
    pub(crate) fn load(path: &std::path::Path, cores: usize) -> Result<Library> {
        debug!(path = %path.display(), "loading CPU kernel library");
        // SAFETY: loading a shared object runs its initialisers; the library
        // contract is that kernel modules are plain C-ABI exports
        let module = unsafe { libloading::Library::new(path)? };
        Ok(Library::from_impl(Arc::new(Self { module, cores })))
    }
}

impl LibraryImpl for CpuLibrary {
    fn lookup_function(self: Arc<Self>, name: &str) -> Result<Function> {
        // SAFETY: the symbol is required to match the CpuKernelFn ABI; the
        // function keeps the library mapped for as long as it lives
        let kernel = unsafe {
            let symbol: libloading::Symbol<CpuKernelFn> = self.module.get(name.as_bytes())?;
            *symbol
        };
        Ok(Function::from_impl(Arc::new(CpuFunction {
            kernel,
            cores: self.cores,
            _library: Some(self),
        })))
    }
}

/// One kernel entry point of a loaded shared object
///
/// A launch fans out `min(launch.count(), cores)` units; each invocation
/// receives its unit index and the unit count, and iterates the work items
/// of its share itself.
pub struct CpuFunction {
    pub(crate) kernel: CpuKernelFn,
    pub(crate) cores: usize,
    pub(crate) _library: Option<Arc<CpuLibrary>>,
}

impl FunctionImpl for CpuFunction {
    fn execute(&self, stream: &Stream, launch: &LaunchArgs, args: &[Attribute]) -> Result<()> {
        let count = launch.count().min(self.cores);
        let stream = downcast_stream::<CpuStream>(stream)?;
        let block = Arc::new(marshal(args)?);
        stream.pool.submit(count, self.kernel, block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Attribute;
    use crate::backends::cpu::abi::{HostArg, HostArgKind};
    use crate::backends::cpu::CpuDevice;
    use crate::image::Access;
    use crate::{args, LaunchArgs};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_function(kernel: CpuKernelFn, cores: usize) -> Function {
        Function::from_impl(Arc::new(CpuFunction {
            kernel,
            cores,
            _library: None,
        }))
    }

    static WIDE_FAN_OUT: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

    unsafe extern "C" fn record_wide(i: usize, n: usize, _args: *const HostArg, _len: usize) {
        WIDE_FAN_OUT.lock().unwrap().push((i, n));
    }

    #[test]
    fn test_launch_fans_out_min_of_grid_and_cores() {
        let device = CpuDevice::create_with_cores(4).unwrap();
        let stream = device.default_stream();
        let kernel = test_function(record_wide, 4);

        let launch = LaunchArgs::new().global(32).local(1);
        assert_eq!(launch.count(), 32);
        kernel.launch(&stream, &launch, &[]).unwrap();
        stream.sync().unwrap();

        let mut seen = WIDE_FAN_OUT.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![(0, 4), (1, 4), (2, 4), (3, 4)]);
    }

    static SMALL_FAN_OUT: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

    unsafe extern "C" fn record_small(i: usize, n: usize, _args: *const HostArg, _len: usize) {
        SMALL_FAN_OUT.lock().unwrap().push((i, n));
    }

    #[test]
    fn test_small_grid_fans_out_grid() {
        let device = CpuDevice::create_with_cores(8).unwrap();
        let stream = device.default_stream();
        let kernel = test_function(record_small, 8);

        kernel
            .launch(&stream, &LaunchArgs::new().global_2d(2, 1).local_2d(1, 1), &[])
            .unwrap();
        stream.sync().unwrap();

        let mut seen = SMALL_FAN_OUT.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![(0, 2), (1, 2)]);
    }

    /// `mult_const_f(out, in, scale)`: every unit strides the 32-element
    /// array by the unit count, the way a real shared-library kernel would
    unsafe extern "C" fn mult_const_f(i: usize, n: usize, args: *const HostArg, len: usize) {
        let args = std::slice::from_raw_parts(args, len);
        assert_eq!(args[0].kind, HostArgKind::Buffer as u32);
        assert_eq!(args[1].kind, HostArgKind::Buffer as u32);
        assert_eq!(args[2].kind, HostArgKind::Float as u32);
        let out = args[0].buffer_as::<f32>();
        let input = args[1].buffer_as::<f32>();
        let scale = args[2].f32v[0];
        let mut idx = i;
        while idx < 32 {
            *out.add(idx) = *input.add(idx) * scale;
            idx += n;
        }
    }

    #[test]
    fn test_scalar_multiply_end_to_end() {
        let device = CpuDevice::create().unwrap();
        let stream = device.default_stream();

        let input = device.allocate_buffer(32 * 4, Access::ReadOnly).unwrap();
        let output = device.allocate_buffer(32 * 4, Access::WriteOnly).unwrap();

        let host_in: Vec<f32> = (0..32).map(|v| v as f32).collect();
        input
            .copy_from_host(&stream, bytemuck::cast_slice(&host_in))
            .unwrap();

        let cores = device
            .get_attribute(crate::DeviceAttributeId::ProcessorCount)
            .as_u32() as usize;
        let kernel = test_function(mult_const_f, cores);
        let launch = LaunchArgs::new().global(32).local(1);
        kernel
            .launch(&stream, &launch, &args![&output, &input, 1.5f32])
            .unwrap();
        stream.sync().unwrap();

        let mut host_out = vec![0f32; 32];
        output
            .copy_to_host(&stream, bytemuck::cast_slice_mut(&mut host_out))
            .unwrap();
        stream.sync().unwrap();

        for (i, v) in host_out.iter().enumerate() {
            assert_eq!(*v, 1.5 * i as f32, "element {i}");
        }
    }

    #[test]
    fn test_missing_library_file_is_an_error() {
        let device = CpuDevice::create().unwrap();
        assert!(device
            .load_library_from_file("/nonexistent/kernels.so")
            .is_err());
    }

    static ARG_CHECKS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn arg_inspector(i: usize, _n: usize, args: *const HostArg, len: usize) {
        if i == 0 {
            let args = std::slice::from_raw_parts(args, len);
            assert_eq!(args.len(), 3);
            assert_eq!(args[0].i32v[0], 7);
            assert_eq!(args[1].kind, HostArgKind::LocalMem as u32);
            assert_eq!(args[1].local_bytes, 128);
            assert_eq!(args[2].boolv[0], 1);
            ARG_CHECKS.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_arguments_cross_the_abi_intact() {
        let device = CpuDevice::create_with_cores(2).unwrap();
        let stream = device.default_stream();
        let kernel = test_function(arg_inspector, 2);

        let mut launch_args = args![7i32];
        launch_args.push(Attribute::local_mem(128));
        launch_args.push(Attribute::from(true));

        kernel
            .launch(&stream, &LaunchArgs::new().global(2).local(1), &launch_args)
            .unwrap();
        stream.sync().unwrap();

        assert_eq!(ARG_CHECKS.load(Ordering::SeqCst), 1);
    }
}
