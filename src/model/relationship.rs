//! One-to-many relationship descriptors.
//!
//! A [`Relationship`] describes a bidirectional association: the parent
//! table holds a collection attribute, the child table holds a
//! back-reference attribute and the foreign-key column. All navigation
//! writes go through the descriptor so both sides change together.

use crate::error::{Error, Result};
use crate::model::entity::Entity;
use crate::model::value::Value;
use serde::Serialize;

/// Which direction lifecycle operations follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Cascade {
    /// Related entities must be attached independently.
    None,
    /// Attaching a parent attaches the members of its collection.
    FromParent,
    /// Attaching a child attaches the parent it references.
    FromChild,
    /// Both directions.
    Both,
}

impl Cascade {
    #[must_use]
    pub const fn from_parent(&self) -> bool {
        matches!(self, Self::FromParent | Self::Both)
    }

    #[must_use]
    pub const fn from_child(&self) -> bool {
        matches!(self, Self::FromChild | Self::Both)
    }
}

impl Default for Cascade {
    fn default() -> Self {
        Self::Both
    }
}

/// A one-to-many / many-to-one association between two mapped tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Relationship {
    parent: String,
    child: String,
    foreign_key: String,
    collection_attr: String,
    reference_attr: String,
    cascade: Cascade,
}

impl Relationship {
    /// Declare `parent.collection_attr ⇄ child.reference_attr`, stored as
    /// `child.foreign_key → parent.id`. Cascades in both directions.
    #[must_use]
    pub fn one_to_many(
        parent: &str,
        child: &str,
        foreign_key: &str,
        collection_attr: &str,
        reference_attr: &str,
    ) -> Self {
        Self {
            parent: parent.to_string(),
            child: child.to_string(),
            foreign_key: foreign_key.to_string(),
            collection_attr: collection_attr.to_string(),
            reference_attr: reference_attr.to_string(),
            cascade: Cascade::default(),
        }
    }

    #[must_use]
    pub fn with_cascade(mut self, cascade: Cascade) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub fn parent(&self) -> &str {
        &self.parent
    }

    #[must_use]
    pub fn child(&self) -> &str {
        &self.child
    }

    #[must_use]
    pub fn foreign_key(&self) -> &str {
        &self.foreign_key
    }

    #[must_use]
    pub fn collection_attr(&self) -> &str {
        &self.collection_attr
    }

    #[must_use]
    pub fn reference_attr(&self) -> &str {
        &self.reference_attr
    }

    #[must_use]
    pub const fn cascade(&self) -> Cascade {
        self.cascade
    }

    /// Display name, `parent.collection`.
    #[must_use]
    pub fn name(&self) -> String {
        format!("{}.{}", self.parent, self.collection_attr)
    }

    // ── Navigation ────────────────────────────────────────────

    /// Children currently in `parent`'s collection.
    #[must_use]
    pub fn children(&self, parent: &Entity) -> Vec<Entity> {
        parent.collection(&self.collection_attr)
    }

    /// Parent currently referenced by `child`.
    #[must_use]
    pub fn parent_of(&self, child: &Entity) -> Option<Entity> {
        child.reference(&self.reference_attr)
    }

    /// Add `child` to `parent`'s collection and point it back at `parent`.
    ///
    /// A child moving from another parent is removed from the old
    /// collection.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if either entity belongs to the wrong table.
    pub fn append(&self, parent: &Entity, child: &Entity) -> Result<()> {
        self.check_tables(parent, child)?;

        match child.reference(&self.reference_attr) {
            Some(old) if old.ptr_eq(parent) => {}
            Some(old) => {
                old.remove_member(&self.collection_attr, child);
                child.touch(&self.foreign_key);
            }
            None => child.touch(&self.foreign_key),
        }

        parent.push_member(&self.collection_attr, child);
        child.set_reference_raw(&self.reference_attr, Some(parent));
        Ok(())
    }

    /// Remove `child` from `parent`'s collection and clear its foreign key.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if either entity belongs to the wrong table.
    pub fn remove(&self, parent: &Entity, child: &Entity) -> Result<()> {
        self.check_tables(parent, child)?;

        parent.remove_member(&self.collection_attr, child);
        if child
            .reference(&self.reference_attr)
            .is_some_and(|p| p.ptr_eq(parent))
        {
            child.set_reference_raw(&self.reference_attr, None);
            child.set(&self.foreign_key, Value::Null);
        }
        Ok(())
    }

    /// Point `child` at `parent`, or detach it from its current parent.
    ///
    /// Clearing also forgets a parent that has been dropped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if either entity belongs to the wrong table.
    pub fn set_parent(&self, child: &Entity, parent: Option<&Entity>) -> Result<()> {
        match parent {
            Some(p) => self.append(p, child),
            None => match child.reference(&self.reference_attr) {
                Some(old) => self.remove(&old, child),
                None => {
                    if child.reference_dropped(&self.reference_attr) {
                        child.set_reference_raw(&self.reference_attr, None);
                        child.set(&self.foreign_key, Value::Null);
                    }
                    Ok(())
                }
            },
        }
    }

    /// Replace `parent`'s collection with `children`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if any entity belongs to the wrong table.
    pub fn set_children(&self, parent: &Entity, children: &[Entity]) -> Result<()> {
        for child in children {
            self.check_tables(parent, child)?;
        }

        for old in self.children(parent) {
            if !children.iter().any(|c| c.ptr_eq(&old)) {
                self.remove(parent, &old)?;
            }
        }
        for child in children {
            self.append(parent, child)?;
        }
        Ok(())
    }

    fn check_tables(&self, parent: &Entity, child: &Entity) -> Result<()> {
        if parent.table() != self.parent {
            return Err(Error::InvalidArgument(format!(
                "{} expects a '{}' parent, got {}",
                self.name(),
                self.parent,
                parent.label()
            )));
        }
        if child.table() != self.child {
            return Err(Error::InvalidArgument(format!(
                "{} expects a '{}' child, got {}",
                self.name(),
                self.child,
                child.label()
            )));
        }
        Ok(())
    }
}
