//! Backend-agnostic compute-kernel dispatch
//!
//! One stable API for launching GPU- and CPU-resident kernels and moving
//! memory, over interchangeable vendor runtimes. User code writes a single
//! dispatch site; each backend owns its native handles, command queues,
//! program compilation, and memory layouts behind the shared contract.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │   Device / Stream / Buffer / Image / Library / Function  │
//! │                     (public facade)                      │
//! └───────────────────────────┬──────────────────────────────┘
//!                             │ backend contract
//!       ┌────────────┬────────┴─────┬───────────────┐
//!       ▼            ▼              ▼               ▼
//!  ┌─────────┐ ┌───────────┐ ┌────────────┐ ┌─────────────┐
//!  │   CPU   │ │ CUDA-class│ │ Metal-class│ │ OpenCL-class│
//!  │ pool +  │ │ driver JIT│ │ pipelines  │ │ event chain │
//!  │ dylibs  │ │ + textures│ │ + archives │ │ + builds    │
//!  └─────────┘ └───────────┘ └────────────┘ └─────────────┘
//! ```
//!
//! Kernel arguments are normalised to [`Attribute`]s (build them with
//! [`args!`]); JIT results are memoised across runs by the [`BinaryCache`],
//! keyed by device fingerprint, source, and options.
//!
//! # Usage
//!
//! ```no_run
//! use manifold_core::{args, Access, CpuDevice, LaunchArgs};
//!
//! # fn main() -> manifold_core::Result<()> {
//! let device = CpuDevice::create()?;
//! let stream = device.default_stream();
//!
//! let library = device.load_library_from_file("kernels.so")?;
//! let kernel = library.lookup_function("mult_const_f")?;
//!
//! let input = device.allocate_buffer(32 * 4, Access::ReadOnly)?;
//! let output = device.allocate_buffer(32 * 4, Access::WriteOnly)?;
//!
//! let launch = LaunchArgs::new().global(32).local(1);
//! kernel.launch(&stream, &launch, &args![&output, &input, 1.5f32])?;
//! stream.sync()?;
//! # Ok(())
//! # }
//! ```

pub mod attribute;
pub mod backend;
pub mod backends;
pub mod cache;
pub mod device;
pub mod digest;
pub mod error;
pub mod function;
pub mod handle;
pub mod image;
pub mod launch;

pub use attribute::{Attribute, AttributeKind};
pub use backend::{DeviceAttributeId, FunctionAttributeId, SharedContext};
pub use backends::{ClDevice, CpuDevice, CudaDevice, MetalDevice};
pub use cache::{BinaryCache, DeviceFingerprint};
pub use device::{Buffer, Device, HostMemory, Image, MappedBuffer, Stream};
pub use digest::{Digest, DIGEST_LENGTH};
pub use error::{Error, Result};
pub use function::{Function, Library};
pub use handle::{Handle, HandleTraits, RetainTraits};
pub use image::{Access, DataType, ImageDescription, PixelOrder, Size2, Size3, Stride2};
pub use launch::LaunchArgs;
