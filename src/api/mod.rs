// =============================================================================
// Read API — thin wrappers over the snapshot tables and the state store
// =============================================================================

pub mod rest;
