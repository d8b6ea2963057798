//! Unit-of-work session.
//!
//! A [`Session`] stages entity lifecycle changes in memory and synchronizes
//! them with its [`StorageBackend`] at well-defined points:
//! - [`Session::flush`] writes pending inserts (parents first) and dirty updates
//! - [`Session::commit`] flushes and makes the writes durable
//! - every read flushes first, so queries never see a stale view
//!
//! The session owns its backend connection. It opens an outer transaction
//! on the first flush and keeps it until [`Session::commit`]; each flush
//! runs in a nested level, so a failed flush discards only its own writes
//! and leaves every tracked entity exactly as it was.
//!
//! Flushed but uncommitted writes are remembered. If the outer transaction
//! is rolled back, because the commit fails or the session is dropped
//! first, the affected entities get their pending or dirty state back.
//! Dropping a session releases every entity it tracks.
//!
//! # Submodules
//!
//! - [`cascade`] - cascade closure and insert ordering
//! - [`query`] - lazy query builder

pub mod cascade;
pub mod query;

pub use query::Query;

use crate::error::{Error, Result};
use crate::model::{
    Entity, EntityKey, EntityState, Metadata, Relationship, SessionId, Table, Value, PRIMARY_KEY,
};
use crate::storage::{Criteria, Record, Row, StorageBackend};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;
use tracing::{debug, info, warn};

/// Outcome of a flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushSummary {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
}

impl FlushSummary {
    /// Returns true if the flush wrote nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inserted == 0 && self.updated == 0
    }
}

/// One staged write, applied to the entity only after the backend commits.
struct Applied {
    entity: Entity,
    id: Option<i64>,
    resolved: BTreeMap<String, Value>,
    columns: BTreeSet<String>,
}

/// A flushed write still inside the open outer transaction.
struct Uncommitted {
    entity: Entity,
    inserted: bool,
    columns: BTreeSet<String>,
}

/// Unit-of-work session over a storage backend.
pub struct Session<B: StorageBackend> {
    id: SessionId,
    metadata: Rc<Metadata>,
    backend: B,
    /// Tracked entities in attach/load order.
    tracked: Vec<Entity>,
    identity_map: HashMap<(String, i64), Entity>,
    in_transaction: bool,
    uncommitted: Vec<Uncommitted>,
}

impl<B: StorageBackend> Session<B> {
    /// Create a session that exclusively owns `backend`.
    pub fn new(backend: B, metadata: impl Into<Rc<Metadata>>) -> Self {
        let id = SessionId::generate();
        debug!(session = %id, "Session opened");
        Self {
            id,
            metadata: metadata.into(),
            backend,
            tracked: Vec::new(),
            identity_map: HashMap::new(),
            in_transaction: false,
            uncommitted: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The backend this session writes through.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether `entity` is tracked by this session.
    #[must_use]
    pub fn is_tracked(&self, entity: &Entity) -> bool {
        entity.is_tracked_by(&self.id)
    }

    /// Pending entities, waiting for their first insert.
    #[must_use]
    pub fn new_entities(&self) -> Vec<Entity> {
        self.tracked_in(|s| s == EntityState::Pending)
    }

    /// Persistent entities mutated since the last flush.
    #[must_use]
    pub fn dirty_entities(&self) -> Vec<Entity> {
        self.tracked_in(|s| s == EntityState::Persistent { dirty: true })
    }

    /// Persistent entities unchanged since the last flush.
    #[must_use]
    pub fn clean_entities(&self) -> Vec<Entity> {
        self.tracked_in(|s| s == EntityState::Persistent { dirty: false })
    }

    fn tracked_in(&self, keep: impl Fn(EntityState) -> bool) -> Vec<Entity> {
        self.tracked.iter().filter(|e| keep(e.state())).cloned().collect()
    }

    // ── Staging ───────────────────────────────────────────────

    /// Attach a transient entity, and everything it cascades to, as pending.
    ///
    /// # Errors
    ///
    /// - `AlreadyAttached` if `entity` or a cascaded entity is tracked by
    ///   this or another session (entities already tracked here are skipped
    ///   when reached through a cascade)
    /// - `DetachedEntity` for entities detached after being persisted
    /// - `UnknownTable` / `UnknownColumn` if a field does not match its mapping
    ///
    /// Nothing is attached unless every entity passes.
    pub fn attach(&mut self, entity: &Entity) -> Result<()> {
        self.attach_all(std::slice::from_ref(entity))
    }

    /// Attach several entities as one staging step.
    ///
    /// # Errors
    ///
    /// As for [`Session::attach`].
    pub fn attach_all(&mut self, entities: &[Entity]) -> Result<()> {
        for root in entities {
            if root.session_id().is_some() {
                return Err(Error::AlreadyAttached { entity: root.label() });
            }
        }

        let reached = cascade::closure(entities, &self.metadata);
        let mut staged = Vec::new();
        for entity in reached {
            if self.is_tracked(&entity) {
                continue;
            }
            self.check_attachable(&entity)?;
            self.check_fields(&entity, entity.fields().keys())?;
            staged.push(entity);
        }

        for entity in &staged {
            entity.mark_pending(&self.id);
            debug!(session = %self.id, entity = %entity.label(), "Attached");
        }
        info!(session = %self.id, count = staged.len(), "Staged pending entities");
        self.tracked.extend(staged);
        Ok(())
    }

    /// Set a field on a tracked entity. A clean entity becomes dirty.
    ///
    /// # Errors
    ///
    /// `NotTracked` if this session does not track `entity`, `UnknownColumn`
    /// if `field` is not a mapped column.
    pub fn mark_dirty(&mut self, entity: &Entity, field: &str, value: impl Into<Value>) -> Result<()> {
        if !self.is_tracked(entity) {
            return Err(Error::NotTracked { entity: entity.label() });
        }
        self.check_fields(entity, [field])?;
        entity.set(field, value);
        debug!(session = %self.id, entity = %entity.label(), field, state = entity.state().as_str(), "Field changed");
        Ok(())
    }

    /// Remove an entity from this session.
    ///
    /// Pending entities become transient again; persistent ones become
    /// detached and can no longer be attached.
    ///
    /// # Errors
    ///
    /// `NotTracked` if this session does not track `entity`.
    pub fn detach(&mut self, entity: &Entity) -> Result<()> {
        if !self.is_tracked(entity) {
            return Err(Error::NotTracked { entity: entity.label() });
        }

        self.tracked.retain(|e| !e.ptr_eq(entity));
        self.uncommitted.retain(|w| !w.entity.ptr_eq(entity));
        if let Some(id) = entity.id() {
            self.identity_map.remove(&(entity.table(), id));
        }
        entity.mark_detached();
        debug!(session = %self.id, entity = %entity.label(), "Detached");
        Ok(())
    }

    fn check_attachable(&self, entity: &Entity) -> Result<()> {
        match (entity.session_id(), entity.state()) {
            (Some(owner), _) if owner == self.id => Ok(()),
            (Some(_), _) => Err(Error::AlreadyAttached { entity: entity.label() }),
            (None, EntityState::Detached) => Err(Error::DetachedEntity { entity: entity.label() }),
            (None, _) => Ok(()),
        }
    }

    fn check_fields<I>(&self, entity: &Entity, fields: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let table = self.metadata.table(&entity.table())?;
        for field in fields {
            table.check_column(field.as_ref())?;
        }
        Ok(())
    }

    // ── Flush / commit ────────────────────────────────────────

    /// Write all staged changes to the backend.
    ///
    /// Pending entities are inserted parents-first and receive their
    /// identity; dirty entities are updated with their changed columns.
    /// Related entities reachable through cascading relationships are
    /// included and become attached.
    ///
    /// # Errors
    ///
    /// Local violations (`AlreadyAttached`, `DetachedEntity`,
    /// `UnattachedReference`, `CyclicRelationship`, unknown columns) are
    /// reported before any backend call. Backend errors roll back this
    /// flush's writes and leave every tracked entity unchanged.
    pub fn flush(&mut self) -> Result<FlushSummary> {
        let metadata = Rc::clone(&self.metadata);

        let plan = cascade::resolve(&self.tracked, &metadata)?;
        let inserts = plan.inserts;
        let updates = self.dirty_entities();

        if inserts.is_empty() && updates.is_empty() {
            debug!(session = %self.id, "Nothing to flush");
            return Ok(FlushSummary::default());
        }

        let mut staged: HashSet<_> = inserts.iter().map(Entity::key).collect();
        staged.extend(updates.iter().map(Entity::key));

        for entity in &inserts {
            self.check_attachable(entity)?;
            self.check_fields(entity, entity.fields().keys())?;
            self.check_references(entity, &staged, &metadata)?;
        }
        for entity in &updates {
            self.check_fields(entity, entity.changed_fields().iter())?;
            self.check_references(entity, &staged, &metadata)?;
        }

        if !self.in_transaction {
            self.backend.begin_transaction()?;
            self.in_transaction = true;
        }
        self.backend.begin_transaction()?;

        let written = match Self::write(&mut self.backend, &metadata, &inserts, &updates) {
            Ok(written) => self.backend.commit_transaction().map(|()| written),
            Err(e) => Err(e),
        };

        let written = match written {
            Ok(written) => written,
            Err(e) => {
                if let Err(rollback) = self.backend.rollback_transaction() {
                    warn!(session = %self.id, error = %rollback, "Rollback after failed flush also failed");
                }
                warn!(session = %self.id, error = %e, "Flush failed, changes rolled back");
                return Err(e);
            }
        };

        let summary = FlushSummary {
            inserted: inserts.len(),
            updated: updates.len(),
        };
        for applied in written {
            if applied.entity.session_id().is_none() {
                applied.entity.mark_pending(&self.id);
                self.tracked.push(applied.entity.clone());
            }
            applied.entity.mark_flushed(applied.id, &applied.resolved);
            if let Some(id) = applied.entity.id() {
                self.identity_map
                    .insert((applied.entity.table(), id), applied.entity.clone());
            }
            self.uncommitted.push(Uncommitted {
                entity: applied.entity,
                inserted: applied.id.is_some(),
                columns: applied.columns,
            });
        }

        info!(
            session = %self.id,
            inserted = summary.inserted,
            updated = summary.updated,
            "Flushed"
        );
        Ok(summary)
    }

    /// Flush, then make the backend's changes durable.
    ///
    /// # Errors
    ///
    /// Returns flush errors unchanged. If the backend commit fails, the
    /// transaction is rolled back and every entity written since the last
    /// commit is restored: inserted ones are pending again without an
    /// identity, updated ones are dirty again. A later commit retries them.
    pub fn commit(&mut self) -> Result<FlushSummary> {
        let summary = self.flush()?;

        if self.in_transaction {
            self.in_transaction = false;
            if let Err(e) = self.backend.commit_transaction() {
                if let Err(rollback) = self.backend.rollback_transaction() {
                    warn!(session = %self.id, error = %rollback, "Rollback after failed commit also failed");
                }
                let restored = self.revert_uncommitted();
                warn!(session = %self.id, error = %e, restored, "Commit failed, flushed changes restored");
                return Err(e);
            }
            self.uncommitted.clear();
        }

        info!(session = %self.id, "Committed");
        Ok(summary)
    }

    /// Give every entity written inside the rolled-back outer transaction
    /// its pre-flush state back. Returns how many writes were undone.
    fn revert_uncommitted(&mut self) -> usize {
        let writes = std::mem::take(&mut self.uncommitted);
        let count = writes.len();
        for write in writes.into_iter().rev() {
            if !write.entity.is_tracked_by(&self.id) {
                continue;
            }
            if write.inserted {
                if let Some(id) = write.entity.id() {
                    self.identity_map.remove(&(write.entity.table(), id));
                }
            }
            write.entity.revert_flush(write.inserted, &write.columns);
        }
        count
    }

    /// Every entity related to `entity` must be staged in this flush or
    /// already tracked here, and a parent it will write a foreign key for
    /// must still exist.
    fn check_references(
        &self,
        entity: &Entity,
        staged: &HashSet<EntityKey>,
        metadata: &Metadata,
    ) -> Result<()> {
        let table = entity.table();
        for rel in metadata.relationships_as_child(&table) {
            let writes_key = entity.id().is_none()
                || entity.changed_fields().contains(rel.foreign_key());
            if writes_key && entity.reference_dropped(rel.reference_attr()) {
                return Err(Error::UnattachedReference {
                    entity: entity.label(),
                    relationship: rel.name(),
                    related: format!("a dropped {} entity", rel.parent()),
                });
            }
        }

        let related = metadata
            .relationships_as_child(&table)
            .filter_map(|rel| rel.parent_of(entity).map(|p| (rel, p)))
            .chain(metadata.relationships_as_parent(&table).flat_map(|rel| {
                rel.children(entity).into_iter().map(move |c| (rel, c))
            }));

        for (rel, other) in related {
            if !staged.contains(&other.key()) && !self.is_tracked(&other) {
                return Err(Error::UnattachedReference {
                    entity: entity.label(),
                    relationship: rel.name(),
                    related: other.label(),
                });
            }
        }
        Ok(())
    }

    /// Issue the inserts and updates. Touches only the backend; the
    /// returned writes are applied to entities after commit.
    fn write(
        backend: &mut B,
        metadata: &Metadata,
        inserts: &[Entity],
        updates: &[Entity],
    ) -> Result<Vec<Applied>> {
        let mut assigned: HashMap<EntityKey, i64> = HashMap::new();
        let mut written = Vec::with_capacity(inserts.len() + updates.len());

        for entity in inserts {
            let table = entity.table();
            let resolved = resolve_foreign_keys(entity, metadata, &assigned, None);
            let mut row: Row = entity.fields();
            row.extend(resolved.clone());

            let id = backend.insert(&table, &row)?;
            debug!(entity = %entity.label(), id, "Inserted");
            assigned.insert(entity.key(), id);
            written.push(Applied {
                entity: entity.clone(),
                id: Some(id),
                resolved,
                columns: row.into_keys().collect(),
            });
        }

        for entity in updates {
            let table = entity.table();
            let Some(id) = entity.id() else {
                continue;
            };

            let changed = entity.changed_fields();
            let resolved = resolve_foreign_keys(entity, metadata, &assigned, Some(&changed));
            let mut row: Row = changed
                .iter()
                .map(|field| (field.clone(), entity.get(field).unwrap_or_default()))
                .collect();
            row.extend(resolved.clone());

            backend.update(&table, id, &row)?;
            debug!(entity = %entity.label(), columns = row.len(), "Updated");
            written.push(Applied {
                entity: entity.clone(),
                id: None,
                resolved,
                columns: row.into_keys().collect(),
            });
        }

        Ok(written)
    }

    // ── Reads ─────────────────────────────────────────────────

    /// Start a lazy query on `table`.
    pub fn query(&mut self, table: &str) -> Query<'_, B> {
        Query::new(self, Criteria::table(table))
    }

    /// Flush, then read entities matching `criteria`.
    ///
    /// Rows whose identity is already tracked come back as the tracked
    /// instance; other rows are loaded as clean entities.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable`/`UnknownColumn` for criteria that do not match
    /// the mapping, flush errors, or backend read errors.
    pub fn select(&mut self, criteria: &Criteria) -> Result<Vec<Entity>> {
        self.check_criteria(criteria)?;
        self.flush()?;

        let records = self.backend.select(criteria)?;
        debug!(session = %self.id, table = %criteria.table, rows = records.len(), "Selected");
        Ok(records
            .into_iter()
            .map(|record| self.materialize(&criteria.table, record))
            .collect())
    }

    /// Flush, then count rows matching `criteria` without loading them.
    ///
    /// # Errors
    ///
    /// As for [`Session::select`].
    pub fn count(&mut self, criteria: &Criteria) -> Result<usize> {
        self.check_criteria(criteria)?;
        self.flush()?;

        let count = self.backend.count(criteria)?;
        debug!(session = %self.id, table = %criteria.table, count, "Counted");
        Ok(count)
    }

    fn check_criteria(&self, criteria: &Criteria) -> Result<()> {
        let table = self.metadata.table(&criteria.table)?;
        for column in criteria
            .filters
            .iter()
            .map(|(c, _)| c)
            .chain(criteria.order_by.iter().map(|(c, _)| c))
        {
            check_query_column(table, column)?;
        }
        Ok(())
    }

    /// Look up an entity by identity: the identity map first, then the backend.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` for unmapped tables, flush or read errors.
    pub fn get(&mut self, table: &str, id: i64) -> Result<Option<Entity>> {
        self.metadata.table(table)?;
        if let Some(entity) = self.identity_map.get(&(table.to_string(), id)) {
            return Ok(Some(entity.clone()));
        }

        let found = self.select(&Criteria::table(table).filter_by(PRIMARY_KEY, id).limit(1))?;
        Ok(found.into_iter().next())
    }

    /// Load the collection `attr` of a tracked parent from the backend and
    /// link the loaded children to it.
    ///
    /// # Errors
    ///
    /// `NotTracked` for untracked parents, `InvalidArgument` if `attr` is not
    /// a collection of the parent's table, flush or read errors.
    pub fn load_collection(&mut self, parent: &Entity, attr: &str) -> Result<Vec<Entity>> {
        if !self.is_tracked(parent) {
            return Err(Error::NotTracked { entity: parent.label() });
        }
        let rel = self.navigation(&parent.table(), attr, true)?;

        // Pending parents need their identity before children can be matched.
        if parent.id().is_none() {
            self.flush()?;
        }
        let Some(id) = parent.id() else {
            return Ok(rel.children(parent));
        };

        let children =
            self.select(&Criteria::table(rel.child()).filter_by(rel.foreign_key(), id))?;
        for child in &children {
            if rel.parent_of(child).is_none() {
                link(&rel, parent, child);
            }
        }
        Ok(rel.children(parent))
    }

    /// Load the parent referenced by `attr` of a tracked child from the
    /// backend, using the child's foreign-key value.
    ///
    /// # Errors
    ///
    /// `NotTracked` for untracked children, `InvalidArgument` if `attr` is
    /// not a back-reference of the child's table, flush or read errors.
    pub fn load_reference(&mut self, child: &Entity, attr: &str) -> Result<Option<Entity>> {
        if !self.is_tracked(child) {
            return Err(Error::NotTracked { entity: child.label() });
        }
        let rel = self.navigation(&child.table(), attr, false)?;

        if let Some(parent) = rel.parent_of(child).filter(|p| self.is_tracked(p)) {
            return Ok(Some(parent));
        }
        let Some(parent_id) = child.get(rel.foreign_key()).and_then(|v| v.as_i64()) else {
            return Ok(None);
        };

        let parent = self.get(rel.parent(), parent_id)?;
        if let Some(p) = &parent {
            link(&rel, p, child);
        }
        Ok(parent)
    }

    fn navigation(&self, table: &str, attr: &str, collection: bool) -> Result<Relationship> {
        self.metadata
            .relationship(table, attr)
            .filter(|rel| {
                if collection {
                    rel.parent() == table && rel.collection_attr() == attr
                } else {
                    rel.child() == table && rel.reference_attr() == attr
                }
            })
            .cloned()
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "'{attr}' is not a {} of '{table}'",
                    if collection { "collection" } else { "reference" }
                ))
            })
    }

    fn materialize(&mut self, table: &str, record: Record) -> Entity {
        let key = (table.to_string(), record.id);
        if let Some(existing) = self.identity_map.get(&key) {
            return existing.clone();
        }

        let entity = Entity::loaded(table, record.id, record.values, &self.id);
        self.tracked.push(entity.clone());
        self.identity_map.insert(key, entity.clone());
        entity
    }
}

impl<B: StorageBackend> Drop for Session<B> {
    fn drop(&mut self) {
        if self.in_transaction {
            match self.backend.rollback_transaction() {
                Ok(()) => debug!(session = %self.id, "Uncommitted transaction rolled back on close"),
                Err(e) => warn!(session = %self.id, error = %e, "Failed to roll back on close"),
            }
            self.revert_uncommitted();
        }

        // Released entities may be attached to another session; persistent
        // ones become detached.
        for entity in self.tracked.drain(..) {
            entity.mark_detached();
        }
        self.identity_map.clear();
        debug!(session = %self.id, "Session closed");
    }
}

/// Foreign-key values `entity` must carry, from the parents it references.
///
/// With `only`, restrict to foreign keys in that change set.
fn resolve_foreign_keys(
    entity: &Entity,
    metadata: &Metadata,
    assigned: &HashMap<EntityKey, i64>,
    only: Option<&BTreeSet<String>>,
) -> BTreeMap<String, Value> {
    let table = entity.table();
    metadata
        .relationships_as_child(&table)
        .filter(|rel| only.is_none_or(|changed| changed.contains(rel.foreign_key())))
        .filter_map(|rel| {
            let parent = rel.parent_of(entity)?;
            let id = parent.id().or_else(|| assigned.get(&parent.key()).copied());
            Some((rel.foreign_key().to_string(), Value::from(id)))
        })
        .collect()
}

/// Link two loaded entities without recording a change: their stored
/// foreign key already agrees.
fn link(rel: &Relationship, parent: &Entity, child: &Entity) {
    parent.push_member(rel.collection_attr(), child);
    child.set_reference_raw(rel.reference_attr(), Some(parent));
}

fn check_query_column(table: &Table, column: &str) -> Result<()> {
    if column == PRIMARY_KEY {
        return Ok(());
    }
    table.check_column(column).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Cascade, Column};
    use crate::storage::{Order, SqliteBackend};
    use crate::tutorial::{self, ADDRESSES, ADDRESS_USER, USERS, USER_ADDRESSES};
    use std::cell::Cell;
    use tempfile::TempDir;

    /// SQLite backend that records insert order and can refuse the
    /// outermost commit.
    struct FlakyBackend {
        inner: SqliteBackend,
        fail_commit: Cell<bool>,
        inserted: Vec<String>,
    }

    impl StorageBackend for FlakyBackend {
        fn execute_schema(&mut self, tables: &[Table]) -> Result<()> {
            self.inner.execute_schema(tables)
        }

        fn insert(&mut self, table: &str, row: &Row) -> Result<i64> {
            let id = self.inner.insert(table, row)?;
            self.inserted.push(table.to_string());
            Ok(id)
        }

        fn update(&mut self, table: &str, id: i64, row: &Row) -> Result<()> {
            self.inner.update(table, id, row)
        }

        fn select(&self, criteria: &Criteria) -> Result<Vec<Record>> {
            self.inner.select(criteria)
        }

        fn count(&self, criteria: &Criteria) -> Result<usize> {
            self.inner.count(criteria)
        }

        fn begin_transaction(&mut self) -> Result<()> {
            self.inner.begin_transaction()
        }

        fn commit_transaction(&mut self) -> Result<()> {
            if self.fail_commit.get() && self.inner.transaction_depth() == 1 {
                return Err(Error::Other("disk I/O error".to_string()));
            }
            self.inner.commit_transaction()
        }

        fn rollback_transaction(&mut self) -> Result<()> {
            self.inner.rollback_transaction()
        }
    }

    fn open_flaky() -> Session<FlakyBackend> {
        let metadata = tutorial::metadata().unwrap();
        let mut backend = FlakyBackend {
            inner: SqliteBackend::open_memory().unwrap(),
            fail_commit: Cell::new(false),
            inserted: Vec::new(),
        };
        metadata.create_all(&mut backend).unwrap();
        Session::new(backend, metadata)
    }

    fn stored_name(conn: &rusqlite::Connection, id: i64) -> String {
        conn.query_row("SELECT name FROM users WHERE id = ?1", [id], |row| row.get(0))
            .unwrap()
    }

    fn open_with(metadata: Metadata) -> Session<SqliteBackend> {
        let mut backend = SqliteBackend::open_memory().unwrap();
        metadata.create_all(&mut backend).unwrap();
        Session::new(backend, metadata)
    }

    fn open() -> Session<SqliteBackend> {
        open_with(tutorial::metadata().unwrap())
    }

    fn user_addresses(session: &Session<SqliteBackend>) -> Relationship {
        user_addresses_of(session.metadata())
    }

    fn user_addresses_of(metadata: &Metadata) -> Relationship {
        metadata.relationship(USERS, USER_ADDRESSES).unwrap().clone()
    }

    fn row_count(session: &Session<SqliteBackend>, table: &str) -> i64 {
        session
            .backend()
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .unwrap()
    }

    fn unique_users() -> Metadata {
        Metadata::builder()
            .table(Table::new(USERS).column(Column::text("name").unique()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_attach_stages_without_writing() {
        let mut session = open();
        let user = tutorial::user("foo", "foo bar", "foo bar nick name");

        session.attach(&user).unwrap();

        assert_eq!(user.state(), EntityState::Pending);
        assert!(session.is_tracked(&user));
        assert_eq!(session.new_entities(), vec![user.clone()]);
        assert_eq!(user.id(), None);
        assert_eq!(session.backend().stats().writes(), 0);
    }

    #[test]
    fn test_attach_twice_is_rejected() {
        let mut session = open();
        let user = tutorial::user("foo", "", "");
        session.attach(&user).unwrap();

        let result = session.attach(&user);
        assert!(matches!(result, Err(Error::AlreadyAttached { .. })));
        assert_eq!(session.new_entities().len(), 1);
    }

    #[test]
    fn test_attach_to_second_session_is_rejected() {
        let mut first = open();
        let mut second = open();
        let user = tutorial::user("foo", "", "");
        first.attach(&user).unwrap();

        assert!(matches!(second.attach(&user), Err(Error::AlreadyAttached { .. })));
        assert!(!second.is_tracked(&user));
        assert!(first.is_tracked(&user));
    }

    #[test]
    fn test_attach_rejects_unmapped_fields() {
        let mut session = open();
        let user = tutorial::user("foo", "", "").with("age", 42);

        match session.attach(&user) {
            Err(Error::UnknownColumn { column, .. }) => assert_eq!(column, "age"),
            other => panic!("expected UnknownColumn, got {other:?}"),
        }
        assert_eq!(user.state(), EntityState::Transient);

        let ghost = Entity::new("accounts");
        assert!(matches!(session.attach(&ghost), Err(Error::UnknownTable { .. })));
    }

    #[test]
    fn test_mark_dirty_requires_tracking() {
        let mut session = open();
        let user = tutorial::user("foo", "", "");

        let result = session.mark_dirty(&user, "name", "bar");
        assert!(matches!(result, Err(Error::NotTracked { .. })));
        assert_eq!(user.get("name"), Some(Value::from("foo")));
    }

    #[test]
    fn test_mark_dirty_on_pending_stays_pending() {
        let mut session = open();
        let user = tutorial::user("foo", "", "");
        session.attach(&user).unwrap();

        session.mark_dirty(&user, "name", "bar").unwrap();
        assert_eq!(user.state(), EntityState::Pending);
        assert!(session.dirty_entities().is_empty());

        session.flush().unwrap();
        let stored: String = session
            .backend()
            .conn()
            .query_row("SELECT name FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(stored, "bar");
    }

    #[test]
    fn test_flush_assigns_identity_and_cleans() {
        let mut session = open();
        let user = tutorial::user("foo", "foo bar", "foo bar nick name");
        session.attach(&user).unwrap();

        let summary = session.flush().unwrap();

        assert_eq!(summary, FlushSummary { inserted: 1, updated: 0 });
        assert!(user.id().is_some());
        assert_eq!(user.state(), EntityState::Persistent { dirty: false });
        assert!(session.new_entities().is_empty());
        assert_eq!(session.clean_entities(), vec![user]);
        assert_eq!(row_count(&session, USERS), 1);
    }

    #[test]
    fn test_second_flush_writes_nothing() {
        let mut session = open();
        session.attach(&tutorial::user("foo", "", "")).unwrap();
        session.flush().unwrap();
        let before = session.backend().stats();

        let summary = session.flush().unwrap();

        assert!(summary.is_empty());
        assert_eq!(session.backend().stats(), before);
    }

    #[test]
    fn test_query_flushes_and_returns_same_instance() {
        let mut session = open();
        let user = tutorial::user("foo", "foo bar", "foo bar nick name");
        session.attach(&user).unwrap();

        let found = session.query(USERS).filter_by("name", "foo").first().unwrap();

        assert!(found.is_some_and(|f| f.ptr_eq(&user)));
        assert!(user.id().is_some());
        assert_eq!(user.state(), EntityState::Persistent { dirty: false });
    }

    #[test]
    fn test_dirty_entity_updated_once() {
        let mut session = open();
        let user = tutorial::user("foo", "foo bar", "foo bar nick name");
        session.attach(&user).unwrap();
        session.flush().unwrap();

        session.mark_dirty(&user, "name", "modified foo 1 name").unwrap();
        assert_eq!(user.state(), EntityState::Persistent { dirty: true });
        assert_eq!(session.dirty_entities(), vec![user.clone()]);

        let summary = session.commit().unwrap();
        assert_eq!(summary, FlushSummary { inserted: 0, updated: 1 });
        assert_eq!(session.backend().stats().updates, 1);
        assert!(session.dirty_entities().is_empty());

        session.flush().unwrap();
        assert_eq!(session.backend().stats().updates, 1);

        let stored: String = session
            .backend()
            .conn()
            .query_row("SELECT name FROM users WHERE id = ?1", [user.id().unwrap()], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(stored, "modified foo 1 name");
    }

    #[test]
    fn test_commit_scenario_with_bulk_attach() {
        let mut session = open();
        let user = tutorial::user("foo", "foo bar", "foo bar nick name");
        session.attach(&user).unwrap();
        session.query(USERS).filter_by("name", "foo").first().unwrap();

        session
            .attach_all(&[
                tutorial::user("foo 2", "foo bar 2", "foo bar nick name 2"),
                tutorial::user("foo 3", "foo bar 3", "foo bar nick name 3"),
                tutorial::user("foo 4", "foo bar 4", "foo bar nick name 4"),
            ])
            .unwrap();
        session.mark_dirty(&user, "name", "modified foo 1 name").unwrap();
        assert_eq!(session.new_entities().len(), 3);
        assert_eq!(session.dirty_entities(), vec![user]);

        let summary = session.commit().unwrap();
        assert_eq!(summary, FlushSummary { inserted: 3, updated: 1 });
        assert!(session.new_entities().is_empty());
        assert!(session.dirty_entities().is_empty());
        assert_eq!(session.clean_entities().len(), 4);
        assert_eq!(session.backend().transaction_depth(), 0);
    }

    #[test]
    fn test_cascade_inserts_parent_before_children() {
        let mut session = open();
        let rel = user_addresses(&session);
        let user = tutorial::user("foo", "foo_bar", "foo_bar_nick_name");
        let home = tutorial::address("foo@hotmail.com");
        let work = tutorial::address("foobar@hitmail.com");
        rel.set_children(&user, &[home.clone(), work.clone()]).unwrap();

        session.attach(&user).unwrap();
        assert_eq!(session.new_entities().len(), 3);

        let summary = session.commit().unwrap();
        assert_eq!(summary.inserted, 3);

        let user_id = user.id().unwrap();
        for address in [&home, &work] {
            assert!(address.id().is_some());
            assert_eq!(address.get("user_id"), Some(Value::Integer(user_id)));
        }
        let linked: i64 = session
            .backend()
            .conn()
            .query_row("SELECT COUNT(*) FROM addresses WHERE user_id = ?1", [user_id], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(linked, 2);
    }

    #[test]
    fn test_attaching_child_cascades_to_parent() {
        let mut session = open();
        let rel = user_addresses(&session);
        let user = tutorial::user("foo", "", "");
        let address = tutorial::address("foo@hotmail.com");
        rel.append(&user, &address).unwrap();

        session.attach(&address).unwrap();

        assert!(session.is_tracked(&user));
        session.flush().unwrap();
        assert_eq!(rel.parent_of(&address), Some(user.clone()));
        assert_eq!(address.get("user_id"), user.id().map(Value::Integer));
    }

    #[test]
    fn test_flush_attaches_members_added_later() {
        let mut session = open();
        let rel = user_addresses(&session);
        let user = tutorial::user("foo", "", "");
        session.attach(&user).unwrap();
        session.commit().unwrap();

        let late = tutorial::address("late@example.com");
        rel.append(&user, &late).unwrap();
        assert!(!session.is_tracked(&late));

        let summary = session.flush().unwrap();
        assert_eq!(summary.inserted, 1);
        assert!(session.is_tracked(&late));
        assert_eq!(late.state(), EntityState::Persistent { dirty: false });
    }

    #[test]
    fn test_non_cascading_reference_must_be_attached() {
        let metadata = Metadata::builder()
            .table(Table::new(USERS).column(Column::text("name")))
            .table(
                Table::new(ADDRESSES)
                    .column(Column::foreign_key("user_id", USERS))
                    .column(Column::text("email_address")),
            )
            .relationship(
                Relationship::one_to_many(USERS, ADDRESSES, "user_id", USER_ADDRESSES, ADDRESS_USER)
                    .with_cascade(Cascade::None),
            )
            .build()
            .unwrap();
        let mut session = open_with(metadata);
        let rel = user_addresses(&session);
        let user = Entity::new(USERS).with("name", "foo");
        let address = Entity::new(ADDRESSES).with("email_address", "foo@hotmail.com");
        rel.append(&user, &address).unwrap();

        session.attach(&address).unwrap();
        assert!(!session.is_tracked(&user));

        match session.flush() {
            Err(Error::UnattachedReference { relationship, .. }) => {
                assert_eq!(relationship, "users.addresses");
            }
            other => panic!("expected UnattachedReference, got {other:?}"),
        }
        assert_eq!(session.backend().stats().writes(), 0);
        assert_eq!(address.state(), EntityState::Pending);

        // Attaching the parent explicitly resolves it.
        session.attach(&user).unwrap();
        assert_eq!(session.flush().unwrap().inserted, 2);
    }

    #[test]
    fn test_cycle_is_reported_before_any_write() {
        let metadata = Metadata::builder()
            .table(
                Table::new("employees")
                    .column(Column::text("name"))
                    .column(Column::foreign_key("department_id", "departments").not_null()),
            )
            .table(
                Table::new("departments")
                    .column(Column::text("title"))
                    .column(Column::foreign_key("manager_id", "employees").not_null()),
            )
            .relationship(Relationship::one_to_many(
                "departments",
                "employees",
                "department_id",
                "members",
                "department",
            ))
            .relationship(Relationship::one_to_many(
                "employees",
                "departments",
                "manager_id",
                "managed",
                "manager",
            ))
            .build()
            .unwrap();
        let mut session = open_with(metadata.clone());
        let members = metadata.relationship("departments", "members").unwrap();
        let managed = metadata.relationship("employees", "managed").unwrap();
        let alice = Entity::new("employees").with("name", "alice");
        let research = Entity::new("departments").with("title", "research");
        members.append(&research, &alice).unwrap();
        managed.append(&alice, &research).unwrap();

        session.attach(&alice).unwrap();
        let result = session.flush();

        assert!(matches!(result, Err(Error::CyclicRelationship { .. })));
        assert_eq!(session.backend().stats().writes(), 0);
        assert_eq!(alice.state(), EntityState::Pending);
        assert_eq!(research.state(), EntityState::Pending);
    }

    #[test]
    fn test_failed_flush_changes_nothing() {
        let mut session = open_with(unique_users());
        let first = Entity::new(USERS).with("name", "a");
        session.attach(&first).unwrap();
        session.flush().unwrap();

        let fresh = Entity::new(USERS).with("name", "b");
        let duplicate = Entity::new(USERS).with("name", "a");
        session.attach_all(&[fresh.clone(), duplicate.clone()]).unwrap();
        session.mark_dirty(&first, "name", "c").unwrap();

        let result = session.flush();

        assert!(matches!(result, Err(Error::ConstraintViolation(_))));
        assert_eq!(fresh.state(), EntityState::Pending);
        assert_eq!(fresh.id(), None);
        assert_eq!(duplicate.id(), None);
        assert_eq!(first.state(), EntityState::Persistent { dirty: true });
        assert_eq!(session.new_entities().len(), 2);
        assert_eq!(row_count(&session, USERS), 1);

        // Recover by dropping the offending entity.
        session.detach(&duplicate).unwrap();
        let summary = session.commit().unwrap();
        assert_eq!(summary, FlushSummary { inserted: 1, updated: 1 });
        assert_eq!(row_count(&session, USERS), 2);
    }

    #[test]
    fn test_failed_commit_restores_flushed_entities() {
        let mut session = open_flaky();
        let stored = tutorial::user("bar", "", "");
        session.attach(&stored).unwrap();
        session.commit().unwrap();
        let stored_id = stored.id().unwrap();

        session.backend().fail_commit.set(true);
        let user = tutorial::user("foo", "", "");
        session.attach(&user).unwrap();
        session.mark_dirty(&stored, "name", "baz").unwrap();

        let result = session.commit();

        assert!(matches!(result, Err(Error::Other(_))));
        assert_eq!(session.backend().inner.transaction_depth(), 0);
        assert_eq!(user.state(), EntityState::Pending);
        assert_eq!(user.id(), None);
        assert_eq!(session.new_entities(), vec![user.clone()]);
        assert_eq!(stored.state(), EntityState::Persistent { dirty: true });
        assert!(stored.changed_fields().contains("name"));
        assert_eq!(session.dirty_entities(), vec![stored.clone()]);
        let conn = session.backend().inner.conn();
        let users: i64 = conn
            .query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))
            .unwrap();
        assert_eq!(users, 1);
        assert_eq!(stored_name(conn, stored_id), "bar");

        // The restored changes are written by the next commit.
        session.backend().fail_commit.set(false);
        let summary = session.commit().unwrap();
        assert_eq!(summary, FlushSummary { inserted: 1, updated: 1 });
        assert!(user.id().is_some());
        assert_eq!(stored_name(session.backend().inner.conn(), stored_id), "baz");
        let found = session.get(USERS, user.id().unwrap()).unwrap();
        assert!(found.is_some_and(|f| f.ptr_eq(&user)));
    }

    #[test]
    fn test_parents_inserted_before_children_at_backend() {
        let mut session = open_flaky();
        let rel = user_addresses_of(session.metadata());
        let user = tutorial::user("foo", "", "");
        let home = tutorial::address("foo@hotmail.com");
        let work = tutorial::address("foobar@hitmail.com");
        rel.set_children(&user, &[home.clone(), work.clone()]).unwrap();

        session.attach_all(&[work, home]).unwrap();
        session.commit().unwrap();

        assert_eq!(session.backend().inserted, vec![USERS, ADDRESSES, ADDRESSES]);
    }

    #[test]
    fn test_flushed_values_round_trip_through_backend() {
        let mut session = open();
        let rel = user_addresses(&session);
        let user = tutorial::user("foo", "foo bar", "foo bar nick name");
        let address = tutorial::address("foo@hotmail.com");
        rel.append(&user, &address).unwrap();
        session.attach(&user).unwrap();
        session.flush().unwrap();

        for entity in [&user, &address] {
            let id = entity.id().unwrap();
            let records = session
                .backend()
                .select(&Criteria::table(&entity.table()).filter_by(PRIMARY_KEY, id))
                .unwrap();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].id, id);
            assert_eq!(records[0].values, entity.fields());
        }
        assert_eq!(address.get("user_id"), user.id().map(Value::Integer));
    }

    #[test]
    fn test_dropped_parent_is_rejected() {
        let mut session = open();
        let rel = user_addresses(&session);
        let address = tutorial::address("foo@hotmail.com");
        rel.set_parent(&address, Some(&tutorial::user("foo", "", ""))).unwrap();
        assert!(rel.parent_of(&address).is_none());

        session.attach(&address).unwrap();
        match session.commit() {
            Err(Error::UnattachedReference { relationship, .. }) => {
                assert_eq!(relationship, "users.addresses");
            }
            other => panic!("expected UnattachedReference, got {other:?}"),
        }
        assert_eq!(row_count(&session, ADDRESSES), 0);
        assert_eq!(address.state(), EntityState::Pending);

        // Clearing the reference writes an address without an owner.
        rel.set_parent(&address, None).unwrap();
        assert_eq!(session.commit().unwrap().inserted, 1);
        assert_eq!(address.get("user_id"), Some(Value::Null));
    }

    #[test]
    fn test_identity_map_returns_tracked_instance() {
        let mut session = open();
        session.attach(&tutorial::user("foo", "", "")).unwrap();
        session.commit().unwrap();

        let first = session.query(USERS).first().unwrap().unwrap();
        let again = session.query(USERS).filter_by("name", "foo").one().unwrap();
        assert!(first.ptr_eq(&again));

        let by_id = session.get(USERS, first.id().unwrap()).unwrap().unwrap();
        assert!(by_id.ptr_eq(&first));
        assert!(session.get(USERS, 999).unwrap().is_none());
    }

    #[test]
    fn test_query_is_lazy_and_restartable() {
        let mut session = open();
        for name in ["b", "a", "c"] {
            session.attach(&tutorial::user(name, "", "")).unwrap();
        }
        session.flush().unwrap();
        let selects = session.backend().stats().selects;

        let mut query = session.query(USERS).order_by("name", Order::Desc);
        assert_eq!(query.criteria().order_by.len(), 1);
        let names: Vec<_> = query
            .all()
            .unwrap()
            .iter()
            .filter_map(|u| u.get("name"))
            .collect();
        assert_eq!(names, vec![Value::from("c"), Value::from("b"), Value::from("a")]);
        assert_eq!(query.count().unwrap(), 3);
        drop(query);

        assert_eq!(session.backend().stats().selects, selects + 2);
    }

    #[test]
    fn test_count_does_not_load_entities() {
        let mut session = open();
        for name in ["a", "b", "c"] {
            session
                .backend()
                .conn()
                .execute("INSERT INTO users (name) VALUES (?1)", [name])
                .unwrap();
        }
        let pending = tutorial::user("d", "", "");
        session.attach(&pending).unwrap();

        assert_eq!(session.query(USERS).count().unwrap(), 4);
        assert_eq!(session.query(USERS).filter_by("name", "b").count().unwrap(), 1);
        assert_eq!(session.clean_entities(), vec![pending]);
        assert!(matches!(
            session.query(USERS).filter_by("nmae", "b").count(),
            Err(Error::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_query_validates_columns() {
        let mut session = open();
        let result = session.query(USERS).filter_by("nmae", "foo").all();
        match result {
            Err(Error::UnknownColumn { similar, .. }) => assert!(similar.contains(&"name".to_string())),
            other => panic!("expected UnknownColumn, got {other:?}"),
        }
        assert!(matches!(session.query("user").all(), Err(Error::UnknownTable { .. })));
        assert!(matches!(
            session.query(USERS).one(),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_detach() {
        let mut session = open();
        let pending = tutorial::user("pending", "", "");
        let stored = tutorial::user("stored", "", "");
        session.attach(&stored).unwrap();
        session.flush().unwrap();
        session.attach(&pending).unwrap();

        session.detach(&pending).unwrap();
        assert_eq!(pending.state(), EntityState::Transient);
        assert!(session.new_entities().is_empty());

        session.detach(&stored).unwrap();
        assert_eq!(stored.state(), EntityState::Detached);
        assert!(!session.is_tracked(&stored));
        assert!(matches!(session.attach(&stored), Err(Error::DetachedEntity { .. })));
        assert!(matches!(session.detach(&stored), Err(Error::NotTracked { .. })));

        // A pending entity detached before its flush may be attached again.
        session.attach(&pending).unwrap();
        assert_eq!(session.flush().unwrap().inserted, 1);
    }

    #[test]
    fn test_lazy_loading_from_second_session() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orm.db");
        let metadata = Rc::new(tutorial::metadata().unwrap());

        {
            let mut backend = SqliteBackend::open(&path).unwrap();
            metadata.create_all(&mut backend).unwrap();
            let mut session = Session::new(backend, Rc::clone(&metadata));
            let rel = user_addresses(&session);
            let foo = tutorial::user("foo", "foo_bar", "foo_bar_nick_name");
            rel.set_children(
                &foo,
                &[
                    tutorial::address("foo@hotmail.com"),
                    tutorial::address("foobar@hitmail.com"),
                ],
            )
            .unwrap();
            session.attach(&foo).unwrap();
            session.commit().unwrap();
        }

        let mut session = Session::new(SqliteBackend::open(&path).unwrap(), Rc::clone(&metadata));
        let foo = session.query(USERS).filter_by("name", "foo").one().unwrap();
        assert!(foo.collection(USER_ADDRESSES).is_empty());

        let addresses = session.load_collection(&foo, USER_ADDRESSES).unwrap();
        let emails: Vec<_> = addresses.iter().filter_map(|a| a.get("email_address")).collect();
        assert_eq!(
            emails,
            vec![Value::from("foo@hotmail.com"), Value::from("foobar@hitmail.com")]
        );

        let owner = session.load_reference(&addresses[0], ADDRESS_USER).unwrap();
        assert!(owner.is_some_and(|o| o.ptr_eq(&foo)));
        assert!(matches!(
            session.load_collection(&foo, "orders"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_load_reference_from_foreign_key() {
        let mut session = open();
        let rel = user_addresses(&session);
        let user = tutorial::user("foo", "", "");
        let address = tutorial::address("foo@hotmail.com");
        rel.append(&user, &address).unwrap();
        session.attach(&user).unwrap();
        session.commit().unwrap();
        let user_id = user.id().unwrap();

        session.detach(&user).unwrap();
        session.detach(&address).unwrap();

        let reloaded = session.query(ADDRESSES).one().unwrap();
        assert!(!reloaded.ptr_eq(&address));
        let owner = session.load_reference(&reloaded, ADDRESS_USER).unwrap().unwrap();
        assert_eq!(owner.id(), Some(user_id));
        assert!(!owner.ptr_eq(&user));
        assert_eq!(rel.parent_of(&reloaded), Some(owner));
    }

    #[test]
    fn test_drop_rolls_back_uncommitted_flush() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orm.db");
        let metadata = Rc::new(tutorial::metadata().unwrap());

        {
            let mut backend = SqliteBackend::open(&path).unwrap();
            metadata.create_all(&mut backend).unwrap();
            let mut session = Session::new(backend, Rc::clone(&metadata));
            session.attach(&tutorial::user("foo", "", "")).unwrap();
            session.flush().unwrap();
            assert_eq!(row_count(&session, USERS), 1);
        }

        let session = Session::new(SqliteBackend::open(&path).unwrap(), Rc::clone(&metadata));
        assert_eq!(row_count(&session, USERS), 0);
    }

    #[test]
    fn test_drop_releases_tracked_entities() {
        let staged = tutorial::user("staged", "", "");
        let flushed = tutorial::user("flushed", "", "");
        let committed = tutorial::user("committed", "", "");
        {
            let mut first = open();
            first.attach(&committed).unwrap();
            first.commit().unwrap();
            first.attach(&flushed).unwrap();
            first.flush().unwrap();
            first.attach(&staged).unwrap();
            assert!(flushed.id().is_some());
            assert!(first.get(USERS, flushed.id().unwrap()).unwrap().is_some());
        }

        assert_eq!(staged.state(), EntityState::Transient);
        assert_eq!(flushed.state(), EntityState::Transient);
        assert_eq!(flushed.id(), None);
        assert_eq!(committed.state(), EntityState::Detached);

        let mut second = open();
        second.attach_all(&[staged.clone(), flushed.clone()]).unwrap();
        assert!(matches!(second.attach(&committed), Err(Error::DetachedEntity { .. })));
        assert_eq!(second.commit().unwrap().inserted, 2);
        assert!(second.is_tracked(&flushed));
    }
}
