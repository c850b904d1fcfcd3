//! C ABI between the CPU backend and shared-library kernels
//!
//! A CPU "library" is an ordinary shared object; each kernel in it is an
//! exported entry point with the [`CpuKernelFn`] signature. The launch layer
//! marshals the heterogeneous [`Attribute`] list into a flat array of
//! [`HostArg`] records so the boundary stays repr(C): numeric attributes
//! carry their 4-slot stores at both widths, buffer attributes carry the
//! host address of the backing allocation, and local-memory requests carry
//! the byte count.
//!
//! Each invocation receives its unit index `i` and the unit count `n`; the
//! kernel owns work-item partitioning below that granularity.

use crate::attribute::{Attribute, AttributeKind};
use crate::backend::downcast_buffer;
use crate::error::Result;

use super::CpuBuffer;

/// Entry-point signature of a CPU kernel
pub type CpuKernelFn =
    unsafe extern "C" fn(index: usize, total: usize, args: *const HostArg, len: usize);

/// Discriminant of a [`HostArg`]
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostArgKind {
    Unknown = 0,
    Float = 1,
    Int = 2,
    Bool = 3,
    Buffer = 4,
    Image = 5,
    LocalMem = 6,
}

/// One marshalled kernel argument
///
/// Numeric stores mirror [`Attribute`]'s dual-width slots; `ptr` is only
/// meaningful for `Buffer` arguments and `local_bytes` for `LocalMem`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HostArg {
    pub kind: u32,
    pub count: u32,
    pub f32v: [f32; 4],
    pub f64v: [f64; 4],
    pub i32v: [i32; 4],
    pub i64v: [i64; 4],
    pub boolv: [u8; 4],
    pub ptr: *mut u8,
    pub local_bytes: u64,
}

impl HostArg {
    fn zeroed(kind: HostArgKind, count: usize) -> Self {
        Self {
            kind: kind as u32,
            count: count as u32,
            f32v: [0.0; 4],
            f64v: [0.0; 4],
            i32v: [0; 4],
            i64v: [0; 4],
            boolv: [0; 4],
            ptr: std::ptr::null_mut(),
            local_bytes: 0,
        }
    }

    /// Typed view of a buffer argument's host storage
    ///
    /// # Safety
    ///
    /// The caller asserts the argument is a buffer whose allocation holds at
    /// least `len` elements of `T` and lives for the duration of the launch.
    pub unsafe fn buffer_as<T>(&self) -> *mut T {
        self.ptr.cast()
    }
}

/// The marshalled argument list of one launch
///
/// Keeps clones of the resource attributes so the buffers the raw records
/// point into stay alive until every work unit has finished.
pub struct ArgBlock {
    _attrs: Vec<Attribute>,
    raw: Vec<HostArg>,
}

// SAFETY: the raw pointers target allocations owned by the retained
// attributes; the block is immutable once built.
unsafe impl Send for ArgBlock {}
unsafe impl Sync for ArgBlock {}

impl ArgBlock {
    /// An empty argument list (used by pool sentinels)
    pub fn empty() -> Self {
        Self {
            _attrs: Vec::new(),
            raw: Vec::new(),
        }
    }

    pub fn as_ptr(&self) -> *const HostArg {
        self.raw.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// Marshal an attribute list into the C-ABI argument block
pub fn marshal(args: &[Attribute]) -> Result<ArgBlock> {
    let mut raw = Vec::with_capacity(args.len());
    for attr in args {
        let record = match attr.kind() {
            AttributeKind::Float => {
                let mut r = HostArg::zeroed(HostArgKind::Float, attr.count());
                r.f32v = *attr.f32_array();
                r.f64v = *attr.f64_array();
                r
            }
            AttributeKind::Int => {
                let mut r = HostArg::zeroed(HostArgKind::Int, attr.count());
                r.i32v = *attr.i32_array();
                r.i64v = *attr.i64_array();
                r
            }
            AttributeKind::Bool => {
                let mut r = HostArg::zeroed(HostArgKind::Bool, attr.count());
                for (dst, src) in r.boolv.iter_mut().zip(attr.bool_array()) {
                    *dst = u8::from(*src);
                }
                r
            }
            AttributeKind::Buffer => {
                let buffer = attr.as_buffer().expect("buffer attribute");
                let cpu = downcast_buffer::<CpuBuffer>(buffer)?;
                let mut r = HostArg::zeroed(HostArgKind::Buffer, 1);
                r.ptr = cpu.host_ptr();
                r
            }
            // CPU images are descriptor-only; the slot is passed through so
            // argument indices still line up with the kernel's signature
            AttributeKind::Image => HostArg::zeroed(HostArgKind::Image, 1),
            AttributeKind::LocalMem => {
                let mut r = HostArg::zeroed(HostArgKind::LocalMem, 1);
                r.local_bytes = u64::from(attr.local_mem_bytes());
                r
            }
            AttributeKind::String | AttributeKind::Unknown => {
                HostArg::zeroed(HostArgKind::Unknown, attr.count())
            }
        };
        raw.push(record);
    }
    Ok(ArgBlock {
        _attrs: args.to_vec(),
        raw,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_numeric_carries_both_widths() {
        let block = marshal(&[Attribute::from([1i32, 2, 3]), Attribute::from(1.5f32)]).unwrap();
        assert_eq!(block.len(), 2);
        let args = unsafe { std::slice::from_raw_parts(block.as_ptr(), block.len()) };

        assert_eq!(args[0].kind, HostArgKind::Int as u32);
        assert_eq!(args[0].count, 3);
        assert_eq!(args[0].i32v, [1, 2, 3, 0]);
        assert_eq!(args[0].i64v, [1, 2, 3, 0]);

        assert_eq!(args[1].kind, HostArgKind::Float as u32);
        assert_eq!(args[1].f32v[0], 1.5);
        assert_eq!(args[1].f64v[0], 1.5);
    }

    #[test]
    fn test_marshal_local_mem_and_bool() {
        let block = marshal(&[
            Attribute::local_mem(512),
            Attribute::from([true, false, true]),
        ])
        .unwrap();
        let args = unsafe { std::slice::from_raw_parts(block.as_ptr(), block.len()) };
        assert_eq!(args[0].kind, HostArgKind::LocalMem as u32);
        assert_eq!(args[0].local_bytes, 512);
        assert_eq!(args[1].boolv, [1, 0, 1, 0]);
    }
}
