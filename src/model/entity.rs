//! Entity handles and per-entity lifecycle state.
//!
//! An [`Entity`] is a cheap, cloneable handle to one shared in-memory
//! instance. Cloning the handle does not copy the record: every clone sees
//! the same fields, identity and lifecycle state, and [`Entity::ptr_eq`]
//! answers "is this the same object".
//!
//! Collections (parent → children) hold strong handles. Back-references
//! (child → parent) are non-owning, so a parent with its children never
//! forms a reference cycle. Keep a handle to a parent that is only reachable
//! through back-references.

use crate::model::value::Value;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

/// Process-unique key of an in-memory entity instance.
///
/// Unlike the identity assigned by the backend, the key exists from
/// construction and never changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntityKey(u64);

impl EntityKey {
    fn next() -> Self {
        Self(NEXT_KEY.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the session tracking an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new session ID (`sess_` + 12 hex characters).
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("sess_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of an entity.
///
/// `Transient → Pending → Persistent { dirty: false } ⇄ Persistent { dirty: true }`,
/// with persistent entities ending in `Detached` when removed from their
/// session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum EntityState {
    /// Not tracked by any session and never flushed.
    Transient,
    /// Attached, waiting for its first insert.
    Pending,
    /// Flushed at least once. `dirty` is set by mutations since the last flush.
    Persistent { dirty: bool },
    /// Removed from its session after being persisted. Terminal.
    Detached,
}

impl EntityState {
    /// Get the string representation used in logs and CLI output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Pending => "pending",
            Self::Persistent { dirty: false } => "clean",
            Self::Persistent { dirty: true } => "dirty",
            Self::Detached => "detached",
        }
    }
}

#[derive(Debug)]
struct Inner {
    key: EntityKey,
    table: String,
    id: Option<i64>,
    fields: BTreeMap<String, Value>,
    changed: BTreeSet<String>,
    collections: BTreeMap<String, Vec<Entity>>,
    references: BTreeMap<String, Weak<RefCell<Inner>>>,
    state: EntityState,
    session: Option<SessionId>,
}

/// Handle to a mapped record.
#[derive(Clone)]
pub struct Entity(Rc<RefCell<Inner>>);

impl Entity {
    /// Create a transient entity for `table`.
    #[must_use]
    pub fn new(table: &str) -> Self {
        Self(Rc::new(RefCell::new(Inner {
            key: EntityKey::next(),
            table: table.to_string(),
            id: None,
            fields: BTreeMap::new(),
            changed: BTreeSet::new(),
            collections: BTreeMap::new(),
            references: BTreeMap::new(),
            state: EntityState::Transient,
            session: None,
        })))
    }

    /// Builder form of [`Entity::set`].
    #[must_use]
    pub fn with(self, field: &str, value: impl Into<Value>) -> Self {
        self.set(field, value);
        self
    }

    /// Set a field value.
    ///
    /// The entity records the field in its change set; a clean persistent
    /// entity becomes dirty.
    pub fn set(&self, field: &str, value: impl Into<Value>) {
        let mut inner = self.0.borrow_mut();
        inner.fields.insert(field.to_string(), value.into());
        inner.record_change(field);
    }

    /// Current value of a field, if set.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<Value> {
        self.0.borrow().fields.get(field).cloned()
    }

    /// Identity assigned by the backend, `None` until the first flush.
    #[must_use]
    pub fn id(&self) -> Option<i64> {
        self.0.borrow().id
    }

    #[must_use]
    pub fn table(&self) -> String {
        self.0.borrow().table.clone()
    }

    #[must_use]
    pub fn key(&self) -> EntityKey {
        self.0.borrow().key
    }

    #[must_use]
    pub fn state(&self) -> EntityState {
        self.0.borrow().state
    }

    /// Snapshot of all field values.
    #[must_use]
    pub fn fields(&self) -> BTreeMap<String, Value> {
        self.0.borrow().fields.clone()
    }

    /// Fields modified since the last flush.
    #[must_use]
    pub fn changed_fields(&self) -> BTreeSet<String> {
        self.0.borrow().changed.clone()
    }

    /// Members of the collection attribute `attr` (empty if never set).
    #[must_use]
    pub fn collection(&self, attr: &str) -> Vec<Entity> {
        self.0.borrow().collections.get(attr).cloned().unwrap_or_default()
    }

    /// Target of the back-reference attribute `attr`, if set and still alive.
    #[must_use]
    pub fn reference(&self, attr: &str) -> Option<Entity> {
        self.0
            .borrow()
            .references
            .get(attr)
            .and_then(Weak::upgrade)
            .map(Entity)
    }

    /// Whether both handles point at the same instance.
    #[must_use]
    pub fn ptr_eq(&self, other: &Entity) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Short label for logs and errors: `users#3`, or `users#new-17` before
    /// an identity is assigned.
    #[must_use]
    pub fn label(&self) -> String {
        let inner = self.0.borrow();
        match inner.id {
            Some(id) => format!("{}#{id}", inner.table),
            None => format!("{}#new-{}", inner.table, inner.key),
        }
    }

    // ── Crate-internal state transitions ──────────────────────

    pub(crate) fn session_id(&self) -> Option<SessionId> {
        self.0.borrow().session.clone()
    }

    pub(crate) fn is_tracked_by(&self, session: &SessionId) -> bool {
        self.0.borrow().session.as_ref() == Some(session)
    }

    /// Transient → Pending under `session`.
    pub(crate) fn mark_pending(&self, session: &SessionId) {
        let mut inner = self.0.borrow_mut();
        inner.session = Some(session.clone());
        inner.state = EntityState::Pending;
    }

    /// Build a clean persistent entity from a row loaded by `session`.
    pub(crate) fn loaded(table: &str, id: i64, fields: BTreeMap<String, Value>, session: &SessionId) -> Self {
        let entity = Self::new(table);
        {
            let mut inner = entity.0.borrow_mut();
            inner.id = Some(id);
            inner.fields = fields;
            inner.state = EntityState::Persistent { dirty: false };
            inner.session = Some(session.clone());
        }
        entity
    }

    /// Record a successful flush: assign identity on first insert, write
    /// resolved foreign keys, clear the change set and become clean.
    ///
    /// An identity, once assigned, is never replaced.
    pub(crate) fn mark_flushed(&self, id: Option<i64>, resolved: &BTreeMap<String, Value>) {
        let mut inner = self.0.borrow_mut();
        if inner.id.is_none() {
            inner.id = id;
        }
        for (column, value) in resolved {
            inner.fields.insert(column.clone(), value.clone());
        }
        inner.changed.clear();
        inner.state = EntityState::Persistent { dirty: false };
    }

    /// Undo a flush whose transaction was rolled back.
    ///
    /// An entity inserted by that flush loses its identity and is pending
    /// again with every field to write; an updated one is dirty again with
    /// `columns` back in its change set.
    pub(crate) fn revert_flush(&self, inserted: bool, columns: &BTreeSet<String>) {
        let mut inner = self.0.borrow_mut();
        inner.changed.extend(columns.iter().cloned());
        if inserted {
            inner.id = None;
            let fields: Vec<String> = inner.fields.keys().cloned().collect();
            inner.changed.extend(fields);
            inner.state = EntityState::Pending;
        } else if let EntityState::Persistent { .. } = inner.state {
            inner.state = EntityState::Persistent { dirty: true };
        }
    }

    /// Whether the back-reference `attr` was set to an entity that has since
    /// been dropped.
    pub(crate) fn reference_dropped(&self, attr: &str) -> bool {
        self.0
            .borrow()
            .references
            .get(attr)
            .is_some_and(|target| target.strong_count() == 0)
    }

    /// Remove from the session: pending entities become transient again,
    /// persistent ones become detached.
    pub(crate) fn mark_detached(&self) {
        let mut inner = self.0.borrow_mut();
        inner.session = None;
        inner.state = match inner.state {
            EntityState::Pending | EntityState::Transient => EntityState::Transient,
            EntityState::Persistent { .. } | EntityState::Detached => EntityState::Detached,
        };
    }

    /// Mark a column as changed without touching its value. Used when a
    /// relationship change moves a foreign key that is resolved at flush.
    pub(crate) fn touch(&self, column: &str) {
        self.0.borrow_mut().record_change(column);
    }

    pub(crate) fn collection_contains(&self, attr: &str, member: &Entity) -> bool {
        self.0
            .borrow()
            .collections
            .get(attr)
            .is_some_and(|members| members.iter().any(|m| m.ptr_eq(member)))
    }

    pub(crate) fn push_member(&self, attr: &str, member: &Entity) {
        if !self.collection_contains(attr, member) {
            self.0
                .borrow_mut()
                .collections
                .entry(attr.to_string())
                .or_default()
                .push(member.clone());
        }
    }

    pub(crate) fn remove_member(&self, attr: &str, member: &Entity) {
        if let Some(members) = self.0.borrow_mut().collections.get_mut(attr) {
            members.retain(|m| !m.ptr_eq(member));
        }
    }

    pub(crate) fn set_reference_raw(&self, attr: &str, target: Option<&Entity>) {
        let mut inner = self.0.borrow_mut();
        match target {
            Some(t) => {
                inner.references.insert(attr.to_string(), Rc::downgrade(&t.0));
            }
            None => {
                inner.references.remove(attr);
            }
        }
    }
}

impl Inner {
    fn record_change(&mut self, field: &str) {
        self.changed.insert(field.to_string());
        if let EntityState::Persistent { dirty: false } = self.state {
            self.state = EntityState::Persistent { dirty: true };
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        f.debug_struct("Entity")
            .field("table", &inner.table)
            .field("key", &inner.key)
            .field("id", &inner.id)
            .field("state", &inner.state)
            .field("fields", &inner.fields)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.0.borrow();
        let fields = inner
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", ");
        match inner.id {
            Some(id) => write!(f, "<{}#{id}({fields})>", inner.table),
            None => write!(f, "<{}({fields})>", inner.table),
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Entity {}
