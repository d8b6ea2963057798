//! Table mappings and the metadata registry.
//!
//! `Metadata` plays the role of a declarative base: it collects the mapped
//! tables and the relationships between them, validates them once on
//! [`MetadataBuilder::build`], and hands the table definitions to a storage
//! backend for schema creation.

use crate::error::{Error, Result};
use crate::model::relationship::Relationship;
use crate::storage::StorageBackend;
use crate::validate::{find_similar_names, validate_identifier};
use serde::Serialize;

/// Name of the implicit primary-key column on every mapped table.
pub const PRIMARY_KEY: &str = "id";

/// Storage type of a mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Boolean,
}

impl ColumnType {
    /// SQL type name used in generated DDL.
    #[must_use]
    pub const fn sql_name(&self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
            Self::Boolean => "BOOLEAN",
        }
    }
}

/// A mapped column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    /// Referenced table, for foreign-key columns.
    pub references: Option<String>,
}

impl Column {
    /// A nullable column of the given type.
    #[must_use]
    pub fn new(name: &str, kind: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            kind,
            nullable: true,
            unique: false,
            references: None,
        }
    }

    #[must_use]
    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    #[must_use]
    pub fn integer(name: &str) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    /// An integer column referencing the primary key of `table`.
    #[must_use]
    pub fn foreign_key(name: &str, table: &str) -> Self {
        Self {
            references: Some(table.to_string()),
            ..Self::new(name, ColumnType::Integer)
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// A mapped table. The integer primary key `id` is implicit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
}

impl Table {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
        }
    }

    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Look up a mapped column by name.
    #[must_use]
    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Check that `name` is a writable column of this table.
    ///
    /// # Errors
    ///
    /// Returns `UnknownColumn` with close matches when it is not.
    pub fn check_column(&self, name: &str) -> Result<&Column> {
        self.get_column(name).ok_or_else(|| Error::UnknownColumn {
            table: self.name.clone(),
            column: name.to_string(),
            similar: find_similar_names(name, self.columns.iter().map(|c| c.name.as_str()), 3),
        })
    }
}

/// Registry of mapped tables and relationships.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    tables: Vec<Table>,
    relationships: Vec<Relationship>,
}

impl Metadata {
    /// Start building a metadata registry.
    #[must_use]
    pub fn builder() -> MetadataBuilder {
        MetadataBuilder::default()
    }

    /// All mapped tables, in declaration order.
    #[must_use]
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// All declared relationships.
    #[must_use]
    pub fn relationships(&self) -> &[Relationship] {
        &self.relationships
    }

    /// Look up a mapped table by name.
    #[must_use]
    pub fn get_table(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Look up a mapped table, with suggestions on failure.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTable` if no table has this name.
    pub fn table(&self, name: &str) -> Result<&Table> {
        self.get_table(name).ok_or_else(|| Error::UnknownTable {
            table: name.to_string(),
            similar: find_similar_names(name, self.tables.iter().map(|t| t.name.as_str()), 3),
        })
    }

    /// Find the relationship navigated by `attr` on `table`.
    ///
    /// `attr` is either the collection attribute on the parent table or the
    /// back-reference attribute on the child table.
    #[must_use]
    pub fn relationship(&self, table: &str, attr: &str) -> Option<&Relationship> {
        self.relationships.iter().find(|r| {
            (r.parent() == table && r.collection_attr() == attr)
                || (r.child() == table && r.reference_attr() == attr)
        })
    }

    /// Relationships in which `table` is the parent (one) side.
    pub fn relationships_as_parent<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = &'a Relationship> + 'a {
        self.relationships.iter().filter(move |r| r.parent() == table)
    }

    /// Relationships in which `table` is the child (many) side.
    pub fn relationships_as_child<'a>(
        &'a self,
        table: &'a str,
    ) -> impl Iterator<Item = &'a Relationship> + 'a {
        self.relationships.iter().filter(move |r| r.child() == table)
    }

    /// Create every mapped table that does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `Schema` if an existing table conflicts with its mapping.
    pub fn create_all<B: StorageBackend>(&self, backend: &mut B) -> Result<()> {
        backend.execute_schema(&self.tables)
    }
}

/// Builder for [`Metadata`].
#[derive(Debug, Default)]
pub struct MetadataBuilder {
    tables: Vec<Table>,
    relationships: Vec<Relationship>,
}

impl MetadataBuilder {
    #[must_use]
    pub fn table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    #[must_use]
    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Validate and freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for bad identifiers, duplicate names or
    /// foreign keys that do not match their relationship, and
    /// `UnknownTable`/`UnknownColumn` for dangling references.
    pub fn build(self) -> Result<Metadata> {
        let metadata = Metadata {
            tables: self.tables,
            relationships: self.relationships,
        };

        for (i, table) in metadata.tables.iter().enumerate() {
            validate_identifier(&table.name).map_err(Error::InvalidArgument)?;
            if metadata.tables[..i].iter().any(|t| t.name == table.name) {
                return Err(Error::InvalidArgument(format!(
                    "table '{}' is declared twice",
                    table.name
                )));
            }

            for (j, column) in table.columns.iter().enumerate() {
                validate_identifier(&column.name).map_err(Error::InvalidArgument)?;
                if column.name == PRIMARY_KEY || table.columns[..j].iter().any(|c| c.name == column.name) {
                    return Err(Error::InvalidArgument(format!(
                        "column '{}.{}' is declared twice",
                        table.name, column.name
                    )));
                }
                if let Some(target) = &column.references {
                    metadata.table(target)?;
                }
            }
        }

        for rel in &metadata.relationships {
            metadata.table(rel.parent())?;
            let child = metadata.table(rel.child())?;
            let fk = child.check_column(rel.foreign_key())?;

            if fk.references.as_deref() != Some(rel.parent()) {
                return Err(Error::InvalidArgument(format!(
                    "column '{}.{}' does not reference '{}'",
                    rel.child(),
                    rel.foreign_key(),
                    rel.parent()
                )));
            }

            let clash = metadata.relationships.iter().filter(|other| {
                (other.parent() == rel.parent() && other.collection_attr() == rel.collection_attr())
                    || (other.child() == rel.child() && other.reference_attr() == rel.reference_attr())
            });
            if clash.count() > 1 {
                return Err(Error::InvalidArgument(format!(
                    "relationship attribute '{}.{}' or '{}.{}' is declared twice",
                    rel.parent(),
                    rel.collection_attr(),
                    rel.child(),
                    rel.reference_attr()
                )));
            }
        }

        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::relationship::Relationship;

    fn users() -> Table {
        Table::new("users")
            .column(Column::text("name"))
            .column(Column::text("nick_name"))
    }

    #[test]
    fn test_build_valid_metadata() {
        let metadata = Metadata::builder()
            .table(users())
            .table(
                Table::new("addresses")
                    .column(Column::foreign_key("user_id", "users"))
                    .column(Column::text("email_address").not_null()),
            )
            .relationship(Relationship::one_to_many("users", "addresses", "user_id", "addresses", "user"))
            .build()
            .unwrap();

        assert_eq!(metadata.tables().len(), 2);
        assert!(metadata.relationship("users", "addresses").is_some());
        assert!(metadata.relationship("addresses", "user").is_some());
        assert!(metadata.relationship("users", "user").is_none());
    }

    #[test]
    fn test_unknown_table_suggests_similar() {
        let metadata = Metadata::builder().table(users()).build().unwrap();
        match metadata.table("user") {
            Err(Error::UnknownTable { similar, .. }) => assert_eq!(similar, vec!["users".to_string()]),
            other => panic!("expected UnknownTable, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_reserved_and_duplicate_names() {
        let result = Metadata::builder().table(Table::new("select")).build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let result = Metadata::builder()
            .table(Table::new("users").column(Column::text("name")).column(Column::text("name")))
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let result = Metadata::builder()
            .table(Table::new("users").column(Column::integer("id")))
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_relationship_foreign_key_must_reference_parent() {
        let result = Metadata::builder()
            .table(users())
            .table(Table::new("addresses").column(Column::integer("user_id")))
            .relationship(Relationship::one_to_many("users", "addresses", "user_id", "addresses", "user"))
            .build();
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let result = Metadata::builder()
            .table(users())
            .table(Table::new("addresses").column(Column::foreign_key("user_id", "users")))
            .relationship(Relationship::one_to_many("users", "addresses", "owner_id", "addresses", "user"))
            .build();
        assert!(matches!(result, Err(Error::UnknownColumn { .. })));
    }
}
