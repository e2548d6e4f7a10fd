#![forbid(unsafe_code)]

mod assets;
mod cache;
mod core;
mod gates;
mod indexes;
mod jobs;
mod pragmas;
mod units;
mod verify;

pub(super) fn full_schema_sql() -> String {
    let mut sql = String::new();
    sql.push_str(pragmas::SQL);
    sql.push_str(core::SQL);
    sql.push_str(jobs::SQL);
    sql.push_str(units::SQL);
    sql.push_str(gates::SQL);
    sql.push_str(assets::SQL);
    sql.push_str(verify::SQL);
    sql.push_str(cache::SQL);
    sql.push_str(indexes::SQL);
    sql
}
