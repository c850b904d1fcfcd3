//! ND launch geometry
//!
//! A [`LaunchArgs`] describes the iteration space of one kernel launch:
//! one to three dimensions of global size, an optional per-dimension local
//! (work-group) size, and the derived work-group counts.

/// Launch geometry for a kernel dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchArgs {
    dims: u32,
    global_size: [u32; 3],
    local_size: [u32; 3],
    local_defined: bool,
}

impl LaunchArgs {
    pub fn new() -> Self {
        Self {
            dims: 0,
            global_size: [1; 3],
            local_size: [1; 3],
            local_defined: false,
        }
    }

    /// Dimensionality set so far (0 before any size was given)
    pub fn dims(&self) -> u32 {
        self.dims
    }

    pub fn global_size(&self) -> &[u32; 3] {
        &self.global_size
    }

    pub fn local_size(&self) -> &[u32; 3] {
        &self.local_size
    }

    /// Whether an explicit local size was supplied
    pub fn is_local_defined(&self) -> bool {
        self.local_defined
    }

    /// Work-group count along dimension `i`: `ceil(global / local)`
    pub fn count_dim(&self, i: usize) -> usize {
        self.global_size[i].div_ceil(self.local_size[i]) as usize
    }

    /// Total work-group count across all dimensions
    pub fn count(&self) -> usize {
        (0..self.dims as usize).fold(1, |acc, i| acc * self.count_dim(i))
    }

    pub fn global(mut self, v0: u32) -> Self {
        self.dims = 1;
        self.global_size[0] = v0;
        self
    }

    pub fn global_2d(mut self, v0: u32, v1: u32) -> Self {
        self.dims = 2;
        self.global_size[0] = v0;
        self.global_size[1] = v1;
        self
    }

    pub fn global_3d(mut self, v0: u32, v1: u32, v2: u32) -> Self {
        self.dims = 3;
        self.global_size[0] = v0;
        self.global_size[1] = v1;
        self.global_size[2] = v2;
        self
    }

    pub fn local(mut self, v0: u32) -> Self {
        self.dims = self.dims.max(1);
        self.local_size[0] = v0;
        self.local_defined = true;
        self
    }

    pub fn local_2d(mut self, v0: u32, v1: u32) -> Self {
        self.dims = self.dims.max(2);
        self.local_size[0] = v0;
        self.local_size[1] = v1;
        self.local_defined = true;
        self
    }

    pub fn local_3d(mut self, v0: u32, v1: u32, v2: u32) -> Self {
        self.dims = 3;
        self.local_size[0] = v0;
        self.local_size[1] = v1;
        self.local_size[2] = v2;
        self.local_defined = true;
        self
    }
}

impl Default for LaunchArgs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_is_ceil_div() {
        let l = LaunchArgs::new().global(1000).local(256);
        assert_eq!(l.count_dim(0), 4);
        assert_eq!(l.count(), 4);

        let l = LaunchArgs::new().global(1024).local(256);
        assert_eq!(l.count(), 4);
    }

    #[test]
    fn test_count_is_product_over_dims() {
        let l = LaunchArgs::new().global_3d(32, 16, 4).local_3d(8, 8, 1);
        assert_eq!(l.count_dim(0), 4);
        assert_eq!(l.count_dim(1), 2);
        assert_eq!(l.count_dim(2), 4);
        assert_eq!(l.count(), 32);
    }

    #[test]
    fn test_defaults() {
        let l = LaunchArgs::new();
        assert_eq!(l.dims(), 0);
        assert!(!l.is_local_defined());
        assert_eq!(l.count(), 1);
        assert_eq!(l.global_size(), &[1, 1, 1]);
        assert_eq!(l.local_size(), &[1, 1, 1]);
    }

    #[test]
    fn test_local_marks_defined() {
        let l = LaunchArgs::new().global(32).local(1);
        assert!(l.is_local_defined());
        assert_eq!(l.dims(), 1);
        assert_eq!(l.count(), 32);
    }
}
