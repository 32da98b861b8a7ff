//! # Boot Memory Map
//!
//! The platform memory map as handed to the kernel by the boot stage, already
//! translated from the firmware's descriptor format.

/// Classification of one memory map entry.
#[repr(u32)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemoryKind {
    /// Free RAM the frame allocator may manage.
    Usable = 0,
    /// Firmware or device memory; never touched.
    Reserved = 1,
    /// ACPI tables; reclaimable once they have been parsed.
    AcpiReclaimable = 2,
    /// ACPI non-volatile storage.
    AcpiNvs = 3,
    /// Memory reported as faulty.
    Defective = 4,
    /// Kernel image and boot modules loaded by the boot stage.
    Kernel = 5,
}

/// One `{base, length, kind}` triple of the platform memory map.
#[repr(C)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryMapEntry {
    /// Physical base address in bytes.
    pub base: u64,
    /// Length in bytes.
    pub length: u64,
    pub kind: MemoryKind,
}

impl MemoryMapEntry {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self { base, length, kind }
    }

    /// End address (exclusive), saturating at the top of the address space.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryKind::Usable)
    }
}
