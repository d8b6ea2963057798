//! The users/addresses mapping used by the demos and tests.
//!
//! ```text
//! users (id, name, full_name, nick_name)
//! addresses (id, user_id -> users.id, email_address NOT NULL)
//! users.addresses <-> addresses.user
//! ```

use crate::error::Result;
use crate::model::{Column, Entity, Metadata, Relationship, Table};

pub const USERS: &str = "users";
pub const ADDRESSES: &str = "addresses";

/// Collection attribute on `users`.
pub const USER_ADDRESSES: &str = "addresses";
/// Back-reference attribute on `addresses`.
pub const ADDRESS_USER: &str = "user";

/// Build the users/addresses metadata.
///
/// # Errors
///
/// Never fails for this fixed mapping; the `Result` comes from validation.
pub fn metadata() -> Result<Metadata> {
    Metadata::builder()
        .table(
            Table::new(USERS)
                .column(Column::text("name"))
                .column(Column::text("full_name"))
                .column(Column::text("nick_name")),
        )
        .table(
            Table::new(ADDRESSES)
                .column(Column::foreign_key("user_id", USERS))
                .column(Column::text("email_address").not_null()),
        )
        .relationship(Relationship::one_to_many(
            USERS,
            ADDRESSES,
            "user_id",
            USER_ADDRESSES,
            ADDRESS_USER,
        ))
        .build()
}

/// A transient user.
#[must_use]
pub fn user(name: &str, full_name: &str, nick_name: &str) -> Entity {
    Entity::new(USERS)
        .with("name", name)
        .with("full_name", full_name)
        .with("nick_name", nick_name)
}

/// A transient address.
#[must_use]
pub fn address(email: &str) -> Entity {
    Entity::new(ADDRESSES).with("email_address", email)
}
