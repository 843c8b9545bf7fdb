//! Knobs for the VM. There is no config file; the binary fills these in from its flags.

/// When the collector runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcConfig {
    /// Bytes allocated before the first collection, and the floor for every later threshold.
    pub initial_threshold: usize,
    /// After a collection the next one happens once the heap has grown to this many times its surviving size.
    pub growth_factor: usize,
    /// Collect before every single allocation. Slow, but shakes out missing roots.
    pub stress: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        GcConfig {
            initial_threshold: 1024 * 1024,
            growth_factor: 2,
            stress: cfg!(feature = "stress-gc"),
        }
    }
}

/// Settings for a whole `Vm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Collector settings for the VM's heap.
    pub gc: GcConfig,
    /// Log the disassembly of every function the compiler finishes.
    pub print_code: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            gc: GcConfig::default(),
            print_code: cfg!(feature = "print-code"),
        }
    }
}

impl VmConfig {
    /// Defaults, with collection before every allocation.
    pub fn stress_gc() -> Self {
        VmConfig {
            gc: GcConfig {
                stress: true,
                ..GcConfig::default()
            },
            ..VmConfig::default()
        }
    }
}
