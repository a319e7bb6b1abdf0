//! Core types for ThemisDB
//!
//! This crate defines the foundational types shared by every layer of the
//! system:
//! - Value: JSON-typed document model (scalars, blobs, vectors, arrays, objects)
//! - Key layout: the shared KV namespace with its per-component prefixes
//! - Sortable encodings: order-preserving byte encodings for index keys
//! - Geometry: WGS84 points, MBRs, EWKB codec, great-circle distance
//! - ThemisError: the unified error taxonomy
//! - DbConfig: recognised configuration options

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod geo;
pub mod key;
pub mod limits;
pub mod value;

pub use config::{Compression, DbConfig, WalFsync};
pub use error::{Result, ThemisError};
pub use geo::{Geometry, GeoPoint, Mbr};
pub use key::{FieldTuple, KeyPrefix};
pub use value::Value;
