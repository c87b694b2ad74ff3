use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

/// Creates and returns a PostgreSQL connection pool.
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;

    info!("PostgreSQL connection pool established");
    Ok(pool)
}

struct Migration {
    description: &'static str,
    sql: &'static str,
}

/// Idempotent schema setup, run at every startup.
const MIGRATIONS: &[Migration] = &[
    Migration {
        description: "jobs table",
        sql: r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id UUID PRIMARY KEY,
            owner_id UUID NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            quota_limit BIGINT NOT NULL CHECK (quota_limit >= 1),
            total_accepted BIGINT NOT NULL DEFAULT 0,
            quota_epoch BIGINT NOT NULL DEFAULT 0,
            capped_in_epoch BOOLEAN NOT NULL DEFAULT FALSE,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    },
    Migration {
        description: "applications table (append-only attempt log)",
        sql: r#"
        CREATE TABLE IF NOT EXISTS applications (
            id UUID PRIMARY KEY,
            job_id UUID NOT NULL REFERENCES jobs(id),
            fingerprint TEXT NOT NULL,
            status TEXT NOT NULL,
            flagged_warn BOOLEAN NOT NULL DEFAULT FALSE,
            quota_epoch BIGINT NOT NULL,
            cv_ref TEXT NOT NULL,
            submitted_at TIMESTAMPTZ NOT NULL
        )
        "#,
    },
    Migration {
        description: "duplicate-detection index, scoped to accepted rows per epoch",
        sql: r#"
        CREATE INDEX IF NOT EXISTS idx_applications_accepted
            ON applications(job_id, fingerprint, quota_epoch)
            WHERE status = 'accepted'
        "#,
    },
    Migration {
        description: "per-fingerprint attempt counters (survive resets)",
        sql: r#"
        CREATE TABLE IF NOT EXISTS quota_counters (
            job_id UUID NOT NULL REFERENCES jobs(id),
            fingerprint TEXT NOT NULL,
            attempt_count BIGINT NOT NULL DEFAULT 0,
            PRIMARY KEY (job_id, fingerprint)
        )
        "#,
    },
    Migration {
        description: "screening batches",
        sql: r#"
        CREATE TABLE IF NOT EXISTS screening_batches (
            id UUID PRIMARY KEY,
            job_id UUID NOT NULL REFERENCES jobs(id),
            quota_epoch BIGINT NOT NULL,
            application_ids UUID[] NOT NULL DEFAULT '{}',
            state TEXT NOT NULL DEFAULT 'collecting',
            attempts INTEGER NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL,
            closed_at TIMESTAMPTZ
        )
        "#,
    },
    Migration {
        description: "ranking entries",
        sql: r#"
        CREATE TABLE IF NOT EXISTS ranking_entries (
            application_id UUID PRIMARY KEY,
            job_id UUID NOT NULL REFERENCES jobs(id),
            score INTEGER NOT NULL CHECK (score >= 0 AND score <= 100),
            reasoning TEXT NOT NULL,
            quota_epoch BIGINT NOT NULL,
            superseded BOOLEAN NOT NULL DEFAULT FALSE,
            submitted_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    },
    Migration {
        description: "ranked-view index over live entries",
        sql: r#"
        CREATE INDEX IF NOT EXISTS idx_ranking_entries_live
            ON ranking_entries(job_id)
            WHERE NOT superseded
        "#,
    },
];

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    for migration in MIGRATIONS {
        sqlx::query(migration.sql).execute(pool).await?;
        info!("migration applied: {}", migration.description);
    }
    Ok(())
}
