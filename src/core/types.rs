/*!
 * Core Types
 * Common types used across the memory subsystem
 */

/// Size type for byte counts
pub type Size = usize;

/// Page count type for page-granular allocation
pub type MachinePageCount = usize;
