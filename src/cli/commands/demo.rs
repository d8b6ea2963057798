//! Demo command implementation: the two tutorial scenarios.

use crate::cli::commands::connect;
use crate::cli::DemoCommands;
use crate::error::{Error, Result};
use crate::model::{Entity, Metadata, Relationship, Value};
use crate::session::{FlushSummary, Session};
use crate::storage::SqliteBackend;
use crate::tutorial::{self, USERS, USER_ADDRESSES};
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::rc::Rc;
use tracing::info;

/// An entity as printed by the demos.
#[derive(Serialize)]
struct EntityView {
    table: String,
    id: Option<i64>,
    state: &'static str,
    fields: BTreeMap<String, Value>,
}

impl From<&Entity> for EntityView {
    fn from(entity: &Entity) -> Self {
        Self {
            table: entity.table(),
            id: entity.id(),
            state: entity.state().as_str(),
            fields: entity.fields(),
        }
    }
}

fn views(entities: &[Entity]) -> Vec<EntityView> {
    entities.iter().map(EntityView::from).collect()
}

#[derive(Serialize)]
struct BasicOutput {
    database: String,
    session: String,
    user: EntityView,
    queried: EntityView,
    same_instance: bool,
    new: Vec<EntityView>,
    dirty: Vec<EntityView>,
    commit: FlushSummary,
}

#[derive(Serialize)]
struct RelationsOutput {
    database: String,
    session: String,
    commit: FlushSummary,
    user: EntityView,
    addresses: Vec<EntityView>,
}

/// Execute a demo scenario.
///
/// # Errors
///
/// Returns configuration, schema, session or serialization errors.
pub fn execute(command: DemoCommands, database: Option<&str>, echo: bool, json: bool) -> Result<()> {
    let (config, mut backend) = connect(database, echo)?;
    let metadata = Rc::new(tutorial::metadata()?);
    metadata.create_all(&mut backend)?;

    let session = Session::new(backend, Rc::clone(&metadata));
    info!(session = %session.id(), database = %config.database_url, "Demo session opened");

    match command {
        DemoCommands::Basic => basic(session, &config.database_url, json),
        DemoCommands::Relations => relations(session, &metadata, &config.database_url, json),
    }
}

fn basic(mut session: Session<SqliteBackend>, database: &str, json: bool) -> Result<()> {
    let user = tutorial::user("foo", "foo bar", "foo bar nick name");
    session.attach(&user)?;

    // Querying flushes the pending user first.
    let queried = session
        .query(USERS)
        .filter_by("name", "foo")
        .first()?
        .ok_or_else(|| Error::Other("flushed user 'foo' was not found".to_string()))?;
    let same_instance = user.ptr_eq(&queried);

    session.attach_all(&[
        tutorial::user("foo 2", "foo bar 2", "foo bar nick name 2"),
        tutorial::user("foo 3", "foo bar 3", "foo bar nick name 3"),
        tutorial::user("foo 4", "foo bar 4", "foo bar nick name 4"),
    ])?;
    session.mark_dirty(&user, "name", "modified foo 1 name")?;

    let new = session.new_entities();
    let dirty = session.dirty_entities();

    if !json {
        println!("{} is {}: {}", user, queried, same_instance.to_string().bold());
        println!("{}", "new objects to create:".cyan().bold());
        print_entities(&new);
        println!("{}", "modified objects:".cyan().bold());
        print_entities(&dirty);
    }

    let commit = session.commit()?;

    if json {
        let output = BasicOutput {
            database: database.to_string(),
            session: session.id().to_string(),
            user: EntityView::from(&user),
            queried: EntityView::from(&queried),
            same_instance,
            new: views(&new),
            dirty: views(&dirty),
            commit,
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        print_commit(commit);
    }
    Ok(())
}

fn relations(
    mut session: Session<SqliteBackend>,
    metadata: &Metadata,
    database: &str,
    json: bool,
) -> Result<()> {
    let addresses = user_addresses(metadata)?;

    let foo = tutorial::user("foo", "foo_bar", "foo_bar_nick_name");
    addresses.set_children(
        &foo,
        &[
            tutorial::address("foo@hotmail.com"),
            tutorial::address("foobar@hitmail.com"),
        ],
    )?;

    // The addresses follow their user through the cascade.
    session.attach(&foo)?;
    let commit = session.commit()?;

    let found = session
        .query(USERS)
        .filter_by("name", "foo")
        .first()?
        .ok_or_else(|| Error::Other("committed user 'foo' was not found".to_string()))?;
    let loaded = session.load_collection(&found, USER_ADDRESSES)?;

    if json {
        let output = RelationsOutput {
            database: database.to_string(),
            session: session.id().to_string(),
            commit,
            user: EntityView::from(&found),
            addresses: views(&loaded),
        };
        println!("{}", serde_json::to_string(&output)?);
    } else {
        print_commit(commit);
        println!("{} {found}", "foo:".bold());
        let list = loaded.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        println!("{} [{list}]", "foo addresses:".bold());
    }
    Ok(())
}

fn user_addresses(metadata: &Metadata) -> Result<Relationship> {
    metadata
        .relationship(USERS, USER_ADDRESSES)
        .cloned()
        .ok_or_else(|| Error::Other(format!("relationship {USERS}.{USER_ADDRESSES} is not mapped")))
}

fn print_entities(entities: &[Entity]) {
    if entities.is_empty() {
        println!("  {}", "(none)".dimmed());
    }
    for entity in entities {
        println!("  {entity} {}", format!("[{}]", entity.state().as_str()).dimmed());
    }
}

fn print_commit(summary: FlushSummary) {
    println!(
        "{} {} inserted, {} updated",
        "committed:".green().bold(),
        summary.inserted,
        summary.updated
    );
}
