use anyhow::Result;
use sqlx::PgPool;

pub async fn run_migrations(pool: &PgPool, dims: usize) -> Result<()> {
    sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
        .execute(pool)
        .await?;

    // Embedding dimensionality is fixed per deployment; changing
    // embedding.dims requires a manual rebuild of the table.
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS issues (
            number BIGINT NOT NULL,
            repo_name TEXT NOT NULL,
            title TEXT NOT NULL,
            body TEXT NOT NULL,
            comments TEXT NOT NULL DEFAULT '[]',
            tracker_updated_at TIMESTAMPTZ NOT NULL,
            token_count BIGINT NOT NULL,
            truncated_text TEXT NOT NULL,
            embedding vector({}),
            embedding_refreshed_at TIMESTAMPTZ,
            PRIMARY KEY (number, repo_name)
        )
        "#,
        dims
    ))
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS issues_embedding_idx
        ON issues
        USING ivfflat (embedding vector_cosine_ops)
        WITH (lists = 100)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_repo_name ON issues(repo_name)")
        .execute(pool)
        .await?;

    Ok(())
}
