//! C1: template cache. TTL-bounded, with at-most-one-in-flight load per key so a burst of
//! misses on the same `(app, name, locale, service)` collapses to a single database read
//! (grounded on the original system's `CreateTemplateCache(60)` + cache-then-DB-fallback
//! pattern in `templates/fetcher.go`, reimplemented with `tokio::sync::OnceCell` coalescing
//! rather than a mutex-guarded map).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::db::TemplateRepo;
use crate::error::PushError;
use crate::model::{Service, Template};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    app_id: Uuid,
    name: String,
    locale: String,
    service: Service,
}

struct Entry {
    template: Arc<Template>,
    inserted_at: Instant,
}

type InFlight = Arc<tokio::sync::OnceCell<Option<Arc<Template>>>>;

pub struct TemplateCache {
    repo: TemplateRepo,
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, Entry>>,
    inflight: Mutex<HashMap<CacheKey, InFlight>>,
}

impl TemplateCache {
    pub fn new(repo: TemplateRepo, ttl: Duration) -> Self {
        Self {
            repo,
            ttl,
            entries: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_ttl(repo: TemplateRepo) -> Self {
        Self::new(repo, Duration::from_secs(60))
    }

    /// Returns `None` when no template exists for this exact key (the caller is responsible
    /// for the job's default-locale fallback, §4.5 step 3 — this cache is keyed precisely).
    pub async fn get(
        &self,
        app_id: Uuid,
        name: &str,
        locale: &str,
        service: Service,
    ) -> Result<Option<Arc<Template>>, PushError> {
        let key = CacheKey {
            app_id,
            name: name.to_owned(),
            locale: locale.to_owned(),
            service,
        };

        if let Some(template) = self.fresh_hit(&key) {
            return Ok(Some(template));
        }

        let cell = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                self.repo
                    .lookup(app_id, name, locale, service)
                    .await
                    .map(|maybe| maybe.map(Arc::new))
                    .map_err(|e| e.to_string())
            })
            .await
            .cloned();

        // Always drop the in-flight slot once resolved: a failure must not be cached (the
        // OnceCell itself would otherwise remember the error forever), and a success has
        // already been promoted into `entries` below.
        self.inflight.lock().unwrap().remove(&key);

        match result {
            Ok(Some(template)) => {
                self.entries.lock().unwrap().insert(
                    key,
                    Entry {
                        template: template.clone(),
                        inserted_at: Instant::now(),
                    },
                );
                Ok(Some(template))
            }
            Ok(None) => Ok(None),
            Err(message) => Err(PushError::transient(anyhow::anyhow!(message))),
        }
    }

    fn fresh_hit(&self, key: &CacheKey) -> Option<Arc<Template>> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(key)?;
        if entry.inserted_at.elapsed() < self.ttl {
            Some(entry.template.clone())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::PgPool;

    async fn seed_template(pool: &PgPool, app_id: Uuid, locale: &str) {
        sqlx::query("INSERT INTO apps (id, name) VALUES ($1, 'acme') ON CONFLICT DO NOTHING")
            .bind(app_id)
            .execute(pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO templates (app_id, name, locale, service, body, defaults) \
             VALUES ($1, 'welcome', $2, 'apns', '{\"text\": \"hi {{name}}\"}', '{}')",
        )
        .bind(app_id)
        .bind(locale)
        .execute(pool)
        .await
        .unwrap();
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn missing_key_returns_none_and_is_not_cached_as_a_hit(pool: PgPool) {
        let cache = TemplateCache::with_default_ttl(TemplateRepo::new(pool));
        let app_id = Uuid::now_v7();
        let hit = cache
            .get(app_id, "welcome", "en-US", Service::Apns)
            .await
            .unwrap();
        assert!(hit.is_none());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn second_lookup_is_served_from_cache(pool: PgPool) {
        let app_id = Uuid::now_v7();
        seed_template(&pool, app_id, "en-US").await;
        let cache = TemplateCache::with_default_ttl(TemplateRepo::new(pool.clone()));

        let first = cache
            .get(app_id, "welcome", "en-US", Service::Apns)
            .await
            .unwrap()
            .unwrap();

        // Removing the row from the DB proves a second lookup is satisfied from the cache.
        sqlx::query("DELETE FROM templates WHERE app_id = $1")
            .bind(app_id)
            .execute(&pool)
            .await
            .unwrap();

        let second = cache
            .get(app_id, "welcome", "en-US", Service::Apns)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.locale, second.locale);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn expired_entry_is_refetched(pool: PgPool) {
        let app_id = Uuid::now_v7();
        seed_template(&pool, app_id, "en-US").await;
        let cache = TemplateCache::new(TemplateRepo::new(pool.clone()), Duration::from_millis(1));

        cache
            .get(app_id, "welcome", "en-US", Service::Apns)
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        sqlx::query("DELETE FROM templates WHERE app_id = $1")
            .bind(app_id)
            .execute(&pool)
            .await
            .unwrap();

        let after_expiry = cache
            .get(app_id, "welcome", "en-US", Service::Apns)
            .await
            .unwrap();
        assert!(after_expiry.is_none());
    }
}
