//! Data model for mapped records.
//!
//! This module contains:
//! - Value (typed field values)
//! - Entity (shared record handles and lifecycle state)
//! - Table / Column / Metadata (mapping registry)
//! - Relationship (bidirectional one-to-many descriptors)

pub mod entity;
pub mod mapping;
pub mod relationship;
pub mod value;

pub use entity::{Entity, EntityKey, EntityState, SessionId};
pub use mapping::{Column, ColumnType, Metadata, MetadataBuilder, Table, PRIMARY_KEY};
pub use relationship::{Cascade, Relationship};
pub use value::Value;
