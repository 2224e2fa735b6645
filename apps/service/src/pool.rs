use std::sync::atomic::AtomicUsize;

use anyhow::Result;
use deadpool::managed::{self, Pool, RecycleResult};
use libsql::{Builder, Connection, Database, Error as LibsqlError, params};

use crate::config::Config;

pub struct LibsqlManager {
    database: Database,
    recycle_count: AtomicUsize,
}

impl LibsqlManager {
    pub fn new(database: Database) -> Self {
        Self { database, recycle_count: AtomicUsize::new(0) }
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.database.connect()?;
        // SQLite leaves referential actions off per connection.
        conn.execute("PRAGMA foreign_keys = ON", ()).await?;
        Ok(conn)
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &managed::Metrics,
    ) -> RecycleResult<Self::Error> {
        let recycle_count = self.recycle_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let row = conn
            .query("SELECT ?1", params![recycle_count as u64])
            .await?
            .next()
            .await?
            .ok_or(LibsqlError::QueryReturnedNoRows)?;
        assert!(recycle_count as u64 == row.get::<u64>(0)?);
        Ok(())
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;

/// Open the configured database and wrap it in a connection pool.
///
/// `db_url` is either a `libsql://` URL (remote sqld, requires the auth
/// token) or a local file path.
pub async fn build_pool(config: &Config) -> Result<LibsqlPool> {
    let database = if config.db_url.starts_with("libsql://") {
        Builder::new_remote(
            config.db_url.clone(),
            config.db_auth_token.clone().unwrap_or_default(),
        )
        .build()
        .await?
    } else {
        Builder::new_local(&config.db_url).build().await?
    };

    let manager = LibsqlManager::new(database);
    let pool = Pool::builder(manager).config(managed::PoolConfig::default()).build()?;
    Ok(pool)
}
