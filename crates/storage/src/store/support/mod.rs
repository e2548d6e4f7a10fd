#![forbid(unsafe_code)]

mod columns;
mod json;
mod schema;

pub(super) use columns::*;
pub(super) use json::*;
pub(super) use schema::migrate_sqlite_schema;
