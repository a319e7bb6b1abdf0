//! Size limits enforced at the entity-store boundary.

/// Maximum nesting depth for documents.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Maximum vector dimension accepted by the value model.
pub const MAX_VECTOR_DIM: usize = 16_384;

/// Maximum encoded key length in the shared KV namespace.
pub const MAX_KEY_LEN: usize = 8 * 1024;

/// Maximum encoded entity value length.
pub const MAX_VALUE_LEN: usize = 64 * 1024 * 1024;
