use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create the PostgreSQL connection pool and run pending migrations.
pub async fn create_pool(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;

    sqlx::migrate!().run(&pool).await?;

    Ok(pool)
}
