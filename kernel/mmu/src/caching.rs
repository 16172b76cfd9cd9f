/// How the processor may cache accesses to a mapped page.
///
/// Every mapping operation resolves to exactly one of these.
/// Architectures that cannot express a mode treat a request for it as a programming error.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CachingMode {
    /// Whatever the platform considers normal memory
    #[default]
    Normal,
    WriteBack,
    WriteThrough,
    /// Uncached, but the processor may still combine or reorder accesses where the platform allows it
    Uncacheable,
    /// Uncached and strongly ordered
    UncacheableStrong,
    WriteProtected,
    WriteCombining,
}

impl CachingMode {
    /// Caching mode suitable for memory mapped device registers
    pub const MMIO: CachingMode = CachingMode::UncacheableStrong;

    /// Caching mode suitable for linear framebuffers
    pub const FRAMEBUFFER: CachingMode = CachingMode::WriteCombining;
}
