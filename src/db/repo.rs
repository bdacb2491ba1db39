use super::model::{JobChildCounts, JobRow};
use crate::dedup::{unique_categories, unique_locations, unique_occupations};
use crate::model::{FeedCursor, FeedMetadata, FeedState, ItemDetail};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

/// Key under which the last finished run is recorded in `system_parameters`.
pub const LAST_SYNC_PARAM: &str = "last_feed_sync";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    // WAL and stricter durability; foreign keys drive the child-row cascade.
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database URL {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .foreign_keys(true);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert or update a listing and replace its sub-records in one transaction.
#[instrument(skip_all, fields(id = %item.id))]
pub async fn upsert_job(pool: &Pool, item: &ItemDetail) -> Result<()> {
    let mut tx = pool.begin().await?;
    upsert_job_tx(&mut tx, item).await?;
    replace_children_tx(&mut tx, item).await?;
    tx.commit()
        .await
        .with_context(|| format!("failed to commit job {}", item.id))?;
    Ok(())
}

async fn upsert_job_tx(tx: &mut Transaction<'_, Sqlite>, item: &ItemDetail) -> Result<()> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO jobs (
            id, status, title, url, employer_name, employer_orgnr, employer_description,
            employer_homepage, description_html, municipal, county, extent, engagement_type,
            sector, application_due, application_due_at, source, source_url, start_time,
            position_count, application_url, job_title, updated_at, published_at, expires_at,
            first_seen_at, synced_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            title = excluded.title,
            url = excluded.url,
            employer_name = excluded.employer_name,
            employer_orgnr = excluded.employer_orgnr,
            employer_description = excluded.employer_description,
            employer_homepage = excluded.employer_homepage,
            description_html = excluded.description_html,
            municipal = excluded.municipal,
            county = excluded.county,
            extent = excluded.extent,
            engagement_type = excluded.engagement_type,
            sector = excluded.sector,
            application_due = excluded.application_due,
            application_due_at = excluded.application_due_at,
            source = excluded.source,
            source_url = excluded.source_url,
            start_time = excluded.start_time,
            position_count = excluded.position_count,
            application_url = excluded.application_url,
            job_title = excluded.job_title,
            updated_at = excluded.updated_at,
            published_at = excluded.published_at,
            expires_at = excluded.expires_at,
            synced_at = excluded.synced_at",
    )
    .bind(&item.id)
    .bind(&item.status)
    .bind(&item.title)
    .bind(&item.url)
    .bind(&item.employer.name)
    .bind(&item.employer.orgnr)
    .bind(&item.employer.description)
    .bind(&item.employer.homepage)
    .bind(&item.description_html)
    .bind(&item.municipal)
    .bind(&item.county)
    .bind(&item.extent)
    .bind(&item.engagement_type)
    .bind(&item.sector)
    .bind(&item.application_due)
    .bind(item.application_due_at)
    .bind(&item.source)
    .bind(&item.source_url)
    .bind(&item.start_time)
    .bind(item.position_count)
    .bind(&item.application_url)
    .bind(&item.job_title)
    .bind(item.updated_at)
    .bind(item.published_at)
    .bind(item.expires_at)
    .bind(now)
    .bind(now)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("failed to upsert job {}", item.id))?;
    Ok(())
}

async fn replace_children_tx(tx: &mut Transaction<'_, Sqlite>, item: &ItemDetail) -> Result<()> {
    for table in ["job_locations", "job_contacts", "job_categories", "job_occupations"] {
        sqlx::query(&format!("DELETE FROM {} WHERE job_id = ?", table))
            .bind(&item.id)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("failed to clear {} for job {}", table, item.id))?;
    }

    for loc in unique_locations(&item.locations) {
        sqlx::query(
            "INSERT INTO job_locations (job_id, address, city, postal_code, county, municipal, country) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&loc.address)
        .bind(&loc.city)
        .bind(&loc.postal_code)
        .bind(&loc.county)
        .bind(&loc.municipal)
        .bind(&loc.country)
        .execute(&mut **tx)
        .await
        .context("failed to insert location")?;
    }

    for contact in &item.contacts {
        sqlx::query(
            "INSERT INTO job_contacts (job_id, name, email, phone, role, title) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&contact.name)
        .bind(&contact.email)
        .bind(&contact.phone)
        .bind(&contact.role)
        .bind(&contact.title)
        .execute(&mut **tx)
        .await
        .context("failed to insert contact")?;
    }

    for cat in unique_categories(&item.categories) {
        sqlx::query(
            "INSERT INTO job_categories (job_id, category_type, code, name) VALUES (?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&cat.category_type)
        .bind(&cat.code)
        .bind(&cat.name)
        .execute(&mut **tx)
        .await
        .context("failed to insert category")?;
    }

    for occ in unique_occupations(&item.occupations) {
        sqlx::query("INSERT INTO job_occupations (job_id, level1, level2) VALUES (?, ?, ?)")
            .bind(&item.id)
            .bind(&occ.level1)
            .bind(&occ.level2)
            .execute(&mut **tx)
            .await
            .context("failed to insert occupation")?;
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_job(pool: &Pool, id: &str) -> Result<Option<JobRow>> {
    let row = sqlx::query(
        "SELECT id, status, title, employer_name, updated_at, first_seen_at, synced_at FROM jobs WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(JobRow {
        id: row.get("id"),
        status: row.try_get("status")?,
        title: row.try_get("title")?,
        employer_name: row.try_get("employer_name")?,
        updated_at: row.try_get("updated_at")?,
        first_seen_at: row.try_get("first_seen_at")?,
        synced_at: row.try_get("synced_at")?,
    }))
}

#[instrument(skip_all)]
pub async fn count_job_children(pool: &Pool, id: &str) -> Result<JobChildCounts> {
    let row = sqlx::query(
        "SELECT \
            (SELECT COUNT(*) FROM job_locations WHERE job_id = ?1) AS locations, \
            (SELECT COUNT(*) FROM job_contacts WHERE job_id = ?1) AS contacts, \
            (SELECT COUNT(*) FROM job_categories WHERE job_id = ?1) AS categories, \
            (SELECT COUNT(*) FROM job_occupations WHERE job_id = ?1) AS occupations",
    )
    .bind(id)
    .fetch_one(pool)
    .await?;
    Ok(JobChildCounts {
        locations: row.get("locations"),
        contacts: row.get("contacts"),
        categories: row.get("categories"),
        occupations: row.get("occupations"),
    })
}

#[instrument(skip_all)]
pub async fn count_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn load_feed_state(pool: &Pool) -> Result<Option<FeedState>> {
    let row = sqlx::query(
        "SELECT page_id, page_index, item_offset, title, description, home_page_url, feed_url, last_fetched_at \
         FROM feed_state WHERE id = 1",
    )
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let page_index: i64 = row.get("page_index");
    let item_offset: i64 = row.get("item_offset");
    Ok(Some(FeedState {
        cursor: FeedCursor {
            page_id: row
                .try_get::<Option<String>, _>("page_id")?
                .filter(|s| !s.trim().is_empty()),
            page_index: page_index.max(0) as u64,
            item_offset: item_offset.max(0) as usize,
        },
        metadata: FeedMetadata {
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            home_page_url: row.try_get("home_page_url")?,
            feed_url: row.try_get("feed_url")?,
            last_fetched_at: row.try_get("last_fetched_at")?,
        },
    }))
}

#[instrument(skip_all)]
pub async fn save_feed_state(
    pool: &Pool,
    cursor: &FeedCursor,
    metadata: &FeedMetadata,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO feed_state (id, page_id, page_index, item_offset, title, description, home_page_url, feed_url, last_fetched_at, updated_at) \
         VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(id) DO UPDATE SET \
            page_id = excluded.page_id, \
            page_index = excluded.page_index, \
            item_offset = excluded.item_offset, \
            title = excluded.title, \
            description = excluded.description, \
            home_page_url = excluded.home_page_url, \
            feed_url = excluded.feed_url, \
            last_fetched_at = excluded.last_fetched_at, \
            updated_at = CURRENT_TIMESTAMP",
    )
    .bind(&cursor.page_id)
    .bind(cursor.page_index as i64)
    .bind(cursor.item_offset as i64)
    .bind(&metadata.title)
    .bind(&metadata.description)
    .bind(&metadata.home_page_url)
    .bind(&metadata.feed_url)
    .bind(metadata.last_fetched_at)
    .execute(pool)
    .await
    .context("failed to persist feed state")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn clear_feed_state(pool: &Pool) -> Result<()> {
    sqlx::query("DELETE FROM feed_state")
        .execute(pool)
        .await
        .context("failed to clear feed state")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_system_parameter(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO system_parameters (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = CURRENT_TIMESTAMP",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .with_context(|| format!("failed to set system parameter {}", key))?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn get_system_parameter(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM system_parameters WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub async fn record_last_sync(pool: &Pool, at: DateTime<Utc>) -> Result<()> {
    set_system_parameter(pool, LAST_SYNC_PARAM, &at.to_rfc3339()).await
}
