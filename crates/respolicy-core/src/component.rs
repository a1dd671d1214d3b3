//! Component identifiers.

/// Identifier of a pipeline component.
///
/// Assigned sequentially upon component registration, starting from 0.
pub type Id = u32;
