//! Public library and function surface
//!
//! A [`Library`] is a loaded module of kernels; a [`Function`] is one
//! launchable entry point. Functions keep their library's module alive
//! through shared references, never the other way around.

use std::fmt;
use std::sync::Arc;

use crate::attribute::Attribute;
use crate::backend::{FunctionAttributeId, FunctionImpl, LibraryImpl};
use crate::device::Stream;
use crate::error::Result;
use crate::launch::LaunchArgs;

/// A loaded module of kernel entry points
#[derive(Clone)]
pub struct Library {
    imp: Arc<dyn LibraryImpl>,
}

impl Library {
    pub(crate) fn from_impl(imp: Arc<dyn LibraryImpl>) -> Self {
        Self { imp }
    }

    /// Look up a kernel entry point by name
    pub fn lookup_function(&self, name: &str) -> Result<Function> {
        Arc::clone(&self.imp).lookup_function(name)
    }

    /// Look up a kernel specialised over a function-constant table
    ///
    /// The attribute list parameterises the constants; each distinct tuple
    /// compiles (and caches) its own pipeline on backends that support
    /// program constants.
    pub fn lookup_specialized_function(&self, name: &str, args: &[Attribute]) -> Result<Function> {
        Arc::clone(&self.imp).specialize_function(name, args)
    }
}

impl fmt::Debug for Library {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Library").finish_non_exhaustive()
    }
}

/// One launchable kernel
#[derive(Clone)]
pub struct Function {
    imp: Arc<dyn FunctionImpl>,
}

impl Function {
    pub(crate) fn from_impl(imp: Arc<dyn FunctionImpl>) -> Self {
        Self { imp }
    }

    /// Enqueue a launch over `launch`'s grid with the given argument list
    ///
    /// Arguments are normalised [`Attribute`]s; the [`crate::args!`] macro
    /// builds the list from a heterogeneous dispatch site. The call returns
    /// as soon as the work is enqueued.
    pub fn launch(&self, stream: &Stream, launch: &LaunchArgs, args: &[Attribute]) -> Result<()> {
        self.imp.execute(stream, launch, args)
    }

    /// Query a per-function property of the compiled kernel
    pub fn get_attribute(&self, what: FunctionAttributeId) -> Result<Attribute> {
        self.imp.get_attribute(what)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function").finish_non_exhaustive()
    }
}
