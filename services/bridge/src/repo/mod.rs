//! Relational store access. One module per table; plain async functions over
//! `&PgPool`, short transactions, no business logic.

pub mod access;
pub mod bots;
pub mod channel_states;
pub mod consumers;
pub mod grants;
pub mod interests;
pub mod stats;
pub mod subscriptions;
pub mod traces;

/// True when `err` is a Postgres unique-constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("23505"),
        _ => false,
    }
}
