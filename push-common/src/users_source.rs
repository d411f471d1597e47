//! C3: users source. Two implementations of one contract — `next_page()` — over either a CSV
//! of user ids (joined against the DB for delivery metadata) or a set of filters evaluated
//! directly against the app's users table.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use sqlx::{PgPool, QueryBuilder, Row};

use crate::error::PushError;
use crate::model::TargetUser;
use crate::object_store::ObjectStore;

#[async_trait]
pub trait UsersSource: Send {
    /// Returns the next page of users, or an empty vec when the source is exhausted (§4.3:
    /// "terminates when the underlying query returns fewer than pageSize rows").
    async fn next_page(&mut self) -> Result<Vec<TargetUser>, PushError>;
}

fn users_table(app_name: &str) -> Result<String, PushError> {
    if !app_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(PushError::Validation(format!(
            "app name {app_name:?} is not a valid table-name component"
        )));
    }
    Ok(format!("{app_name}_users"))
}

/// Streams ids out of a CSV (via C2), then resolves each page against the DB in one chunked
/// `IN` query. Ids with no matching row are silently dropped, per §4.3.
pub struct CsvUsersSource {
    pool: PgPool,
    table: String,
    remaining_ids: VecDeque<String>,
    page_size: usize,
}

impl CsvUsersSource {
    pub async fn open(
        pool: PgPool,
        store: &dyn ObjectStore,
        bucket: &str,
        csv_path: &str,
        app_name: &str,
        page_size: usize,
    ) -> Result<Self, PushError> {
        let mut lines = store
            .open_csv(bucket, csv_path)
            .await
            .map_err(PushError::transient)?;
        if !lines.is_empty() {
            lines.remove(0); // header
        }
        Ok(Self {
            pool,
            table: users_table(app_name)?,
            remaining_ids: lines.into_iter().collect(),
            page_size,
        })
    }
}

#[async_trait]
impl UsersSource for CsvUsersSource {
    async fn next_page(&mut self) -> Result<Vec<TargetUser>, PushError> {
        if self.remaining_ids.is_empty() {
            return Ok(Vec::new());
        }

        let chunk: Vec<String> = self
            .remaining_ids
            .drain(..self.remaining_ids.len().min(self.page_size))
            .collect();

        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT user_id, token, locale, tz FROM \"{}\" WHERE user_id IN (",
            self.table
        ));
        let mut separated = qb.separated(", ");
        for id in &chunk {
            separated.push_bind(id);
        }
        qb.push(")");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(PushError::from)?;

        rows.iter().map(row_to_target_user).collect()
    }
}

/// Builds a parameterized `SELECT ... WHERE <filters> ORDER BY seq LIMIT pageSize` and pages
/// via keyset pagination on `seq`, per §4.3 ("to avoid offset drift under concurrent writes").
pub struct FilterUsersSource {
    pool: PgPool,
    table: String,
    filters: HashMap<String, String>,
    page_size: i64,
    last_seq: i64,
    exhausted: bool,
}

impl FilterUsersSource {
    pub fn new(
        pool: PgPool,
        app_name: &str,
        filters: HashMap<String, String>,
        page_size: i64,
    ) -> Result<Self, PushError> {
        for key in filters.keys() {
            if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(PushError::Validation(format!(
                    "filter column {key:?} is not a valid identifier"
                )));
            }
        }
        Ok(Self {
            pool,
            table: users_table(app_name)?,
            filters,
            page_size,
            last_seq: 0,
            exhausted: false,
        })
    }
}

#[async_trait]
impl UsersSource for FilterUsersSource {
    async fn next_page(&mut self) -> Result<Vec<TargetUser>, PushError> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT user_id, token, locale, tz, seq FROM \"{}\" WHERE seq > ",
            self.table
        ));
        qb.push_bind(self.last_seq);

        for (column, value) in &self.filters {
            qb.push(format!(" AND \"{column}\" "));
            if value.contains(',') {
                let values: Vec<&str> = value.split(',').map(str::trim).collect();
                qb.push("IN (");
                let mut separated = qb.separated(", ");
                for v in &values {
                    separated.push_bind(*v);
                }
                qb.push(")");
            } else {
                qb.push("= ");
                qb.push_bind(value.clone());
            }
        }

        qb.push(" ORDER BY seq LIMIT ");
        qb.push_bind(self.page_size);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(PushError::from)?;

        if (rows.len() as i64) < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.last_seq = last.try_get::<i64, _>("seq").map_err(PushError::from)?;
        }

        rows.iter().map(row_to_target_user).collect()
    }
}

fn row_to_target_user(row: &sqlx::postgres::PgRow) -> Result<TargetUser, PushError> {
    Ok(TargetUser {
        user_id: row.try_get("user_id").map_err(PushError::from)?,
        token: row.try_get("token").map_err(PushError::from)?,
        locale: row.try_get("locale").map_err(PushError::from)?,
        tz: row.try_get("tz").map_err(PushError::from)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn users_table_rejects_unsafe_names() {
        assert!(users_table("acme").is_ok());
        assert!(users_table("acme_prod").is_ok());
        assert!(users_table("acme; DROP TABLE jobs;--").is_err());
    }
}
