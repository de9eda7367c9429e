pub mod models;
pub mod writer;

pub use writer::HistoryWriter;

/// Single-connection in-memory database with the schema applied.
/// One connection only: every new `:memory:` connection is a fresh database.
#[cfg(test)]
pub async fn test_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations apply");
    pool
}
