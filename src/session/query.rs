//! Lazy query builder.

use crate::error::{Error, Result};
use crate::model::{Entity, Value};
use crate::session::Session;
use crate::storage::{Criteria, Order, StorageBackend};

/// A query on one table, bound to a session.
///
/// Building a query does nothing. Each terminal call ([`Query::all`],
/// [`Query::first`], [`Query::count`]) flushes the session and runs the
/// query again, so the same query can be re-run after further changes.
pub struct Query<'s, B: StorageBackend> {
    session: &'s mut Session<B>,
    criteria: Criteria,
}

impl<'s, B: StorageBackend> Query<'s, B> {
    pub(crate) fn new(session: &'s mut Session<B>, criteria: Criteria) -> Self {
        Self { session, criteria }
    }

    /// Add an equality filter. `Value::Null` matches missing values.
    #[must_use]
    pub fn filter_by(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.criteria = self.criteria.filter_by(column, value);
        self
    }

    #[must_use]
    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.criteria = self.criteria.order_by(column, order);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.criteria = self.criteria.limit(limit);
        self
    }

    /// The criteria this query will run.
    #[must_use]
    pub fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    /// Run the query and return every match.
    ///
    /// # Errors
    ///
    /// See [`Session::select`].
    pub fn all(&mut self) -> Result<Vec<Entity>> {
        self.session.select(&self.criteria)
    }

    /// Run the query and return the first match.
    ///
    /// # Errors
    ///
    /// See [`Session::select`].
    pub fn first(&mut self) -> Result<Option<Entity>> {
        let criteria = self.criteria.clone().limit(1);
        Ok(self.session.select(&criteria)?.into_iter().next())
    }

    /// Run the query and return its only match.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` unless exactly one row matches, plus the
    /// errors of [`Session::select`].
    pub fn one(&mut self) -> Result<Entity> {
        let criteria = self.criteria.clone().limit(2);
        let mut found = self.session.select(&criteria)?;
        match found.len() {
            1 => Ok(found.remove(0)),
            n => Err(Error::InvalidArgument(format!(
                "expected exactly one row from '{}', found {}",
                self.criteria.table,
                if n == 0 { "none" } else { "several" }
            ))),
        }
    }

    /// Count the matches with one counting select. No entity is loaded.
    ///
    /// # Errors
    ///
    /// See [`Session::count`].
    pub fn count(&mut self) -> Result<usize> {
        self.session.count(&self.criteria)
    }
}
