/*!
 * System Limits and Constants
 *
 * Centralized location for memory subsystem limits, thresholds, and
 * magic numbers.
 */

/// Default memory quota for a manager (8GB)
/// Used as the capacity cap when none is configured
pub const DEFAULT_MEMORY_QUOTA: usize = 8 * 1024 * 1024 * 1024;

/// Default allocation alignment (16 bytes)
/// Matches the strictest fundamental alignment on x86-64
pub const DEFAULT_ALIGNMENT: usize = 16;

/// Maximum supported allocation alignment (64 bytes)
/// One cache line; larger alignments are rejected at pool construction
pub const MAX_ALIGNMENT: usize = 64;

/// Machine page size assumed by page-granular allocation (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Largest size class in pages (256 pages = 1MB)
/// Size classes are powers of two from 1 up to this bound
pub const MAX_SIZE_CLASS_PAGES: usize = 256;

/// Minimum preferred allocation size (8 bytes)
/// `preferred_size` never returns less than this
pub const MIN_PREFERRED_SIZE: usize = 8;
