//! Unit-of-work ORM session over SQLite.
//!
//! Entities are staged in a [`session::Session`], which tracks them as
//! pending, dirty or clean and writes them through a
//! [`storage::StorageBackend`] when flushed, committed or queried.
//! Related entities follow each other through cascading
//! [`model::Relationship`]s and are inserted parents first.
//!
//! # Architecture
//!
//! - [`model`] - Entities, values, table mappings and relationships
//! - [`session`] - Unit of work, cascade resolution and queries
//! - [`storage`] - Backend contract and the SQLite backend
//! - [`config`] - Connection string resolution
//! - [`cli`] - Command-line interface using clap
//! - [`tutorial`] - The users/addresses mapping used by the demos
//! - [`error`] - Error types and handling
//!
//! # Example
//!
//! ```no_run
//! use orm::session::Session;
//! use orm::storage::SqliteBackend;
//! use orm::tutorial;
//!
//! # fn main() -> orm::Result<()> {
//! let metadata = tutorial::metadata()?;
//! let mut backend = SqliteBackend::open_memory()?;
//! metadata.create_all(&mut backend)?;
//!
//! let mut session = Session::new(backend, metadata);
//! let user = tutorial::user("foo", "foo bar", "foo");
//! session.attach(&user)?;
//!
//! let found = session.query("users").filter_by("name", "foo").first()?;
//! assert!(found.is_some_and(|f| f.ptr_eq(&user)));
//! session.commit()?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod error;
pub mod model;
pub mod session;
pub mod storage;
pub mod tutorial;
pub mod validate;

pub use error::{Error, Result};
