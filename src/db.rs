use crate::config::Config;
use crate::model::{CustomCssPost, MODIFIED_GMT_FORMAT};
use anyhow::Result;
use libsql::{Builder, Connection, Database as LibsqlDatabase, Row};
use std::path::Path;
use std::time::Duration;

/// Theme mod caching the id of a theme's custom CSS document, `-1` when there is none.
pub const CUSTOM_CSS_POST_ID: &str = "custom_css_post_id";

const SYSTEM_MIGRATIONS: &[(&str, &str)] =
    &[("system/000_migrations_table.sql", include_str!("migrations/system/000_migrations_table.sql"))];

const MIGRATIONS: &[(&str, &str)] = &[("001_schema.sql", include_str!("migrations/001_schema.sql"))];

pub struct Database {
    db: LibsqlDatabase,
    conn: Connection,
    turso_url: Option<String>,
    turso_auth_token: Option<String>,
}

impl Database {
    pub fn is_replica(turso_url: &Option<String>, turso_auth_token: &Option<String>) -> bool {
        turso_url.is_some() && turso_auth_token.is_some()
    }

    pub async fn sync(&self) -> Result<()> {
        if Self::is_replica(&self.turso_url, &self.turso_auth_token) {
            self.db
                .sync()
                .await
                .map_err(|e| anyhow::anyhow!("sync failed: {}", e))?;
        }
        Ok(())
    }

    async fn is_migration_applied(conn: &Connection, name: &str) -> Result<bool> {
        let query = "SELECT 1 FROM _migrations WHERE name = ?";
        match conn.query(query, libsql::params![name]).await {
            Ok(mut rows) => Ok(rows.next().await?.is_some()),
            Err(e) => {
                if e.to_string().contains("no such table") {
                    Ok(false)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn record_migration(conn: &Connection, name: &str) -> Result<()> {
        let query = r#"
            INSERT INTO _migrations (name, applied_at)
            VALUES (?, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        "#;
        conn.execute(query, libsql::params![name]).await?;
        Ok(())
    }

    async fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
        if Self::is_migration_applied(conn, name).await? {
            tracing::debug!("migration {} already applied, skipping", name);
            return Ok(());
        }

        tracing::info!("applying migration: {}", name);
        conn.execute_batch(sql)
            .await
            .map_err(|e| anyhow::anyhow!("failed to execute migration {name}: {e}"))?;

        Self::record_migration(conn, name).await?;
        Ok(())
    }

    async fn migrate(conn: &Connection) -> Result<()> {
        for (filename, sql) in SYSTEM_MIGRATIONS {
            Self::run_migration(conn, filename, sql).await?;
        }

        for (filename, sql) in MIGRATIONS {
            Self::run_migration(conn, filename, sql).await?;
        }

        Ok(())
    }

    pub async fn new(cfg: &Config, data_dir: &Path) -> Result<Self> {
        let path = data_dir.join(cfg.app.get_db());
        let turso_url = cfg.app.turso_url.clone().filter(|u| !u.is_empty());
        let turso_auth_token = cfg.app.turso_auth_token.clone().filter(|t| !t.is_empty());

        let db = match (&turso_url, &turso_auth_token) {
            (Some(url), Some(token)) => {
                tracing::info!("[db] running in synced database mode (offline writes)");
                let sync_interval = Duration::from_secs(cfg.app.sync_interval_seconds);
                Builder::new_synced_database(&path, url.clone(), token.clone())
                    .sync_interval(sync_interval)
                    .build()
                    .await?
            }
            _ => Builder::new_local(&path).build().await?,
        };

        let conn = db.connect()?;
        conn.query("SELECT 1", ()).await?;
        Self::migrate(&conn).await?;

        Ok(Database {
            db,
            conn,
            turso_url,
            turso_auth_token,
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        let conn = db.connect()?;
        Self::migrate(&conn).await?;

        Ok(Database {
            db,
            conn,
            turso_url: None,
            turso_auth_token: None,
        })
    }

    fn row_to_post(row: &Row) -> Result<CustomCssPost> {
        Ok(CustomCssPost {
            id: row.get(0)?,
            theme: row.get(1)?,
            css: row.get::<Option<String>>(2)?.unwrap_or_default(),
            modified_gmt: row.get(3)?,
        })
    }

    pub async fn find_custom_css_post(&self, theme: &str) -> Result<Option<CustomCssPost>> {
        let query = r#"
            SELECT id, theme, css, modified_gmt
            FROM custom_css WHERE theme = ?
            LIMIT 1
        "#;

        let mut rows = self.conn.query(query, libsql::params![theme]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(Self::row_to_post(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn get_custom_css_post_by_id(&self, id: i64) -> Result<Option<CustomCssPost>> {
        let query = r#"
            SELECT id, theme, css, modified_gmt
            FROM custom_css WHERE id = ?
        "#;

        let mut rows = self.conn.query(query, libsql::params![id]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(Self::row_to_post(&row)?))
        } else {
            Ok(None)
        }
    }

    pub async fn upsert_custom_css(&self, theme: &str, css: &str) -> Result<CustomCssPost> {
        let modified_gmt = chrono::Utc::now().format(MODIFIED_GMT_FORMAT).to_string();
        self.upsert_custom_css_at(theme, css, &modified_gmt).await
    }

    pub async fn upsert_custom_css_at(
        &self,
        theme: &str,
        css: &str,
        modified_gmt: &str,
    ) -> Result<CustomCssPost> {
        let query = r#"
            INSERT INTO custom_css (theme, css, modified_gmt)
            VALUES (?, ?, ?)
            ON CONFLICT(theme) DO UPDATE SET
                css = excluded.css,
                modified_gmt = excluded.modified_gmt
            RETURNING id, theme, css, modified_gmt
        "#;

        let mut rows = self
            .conn
            .query(query, libsql::params![theme, css, modified_gmt])
            .await?;

        let post = match rows.next().await? {
            Some(row) => Self::row_to_post(&row)?,
            None => anyhow::bail!("Failed to save custom css for theme {}", theme),
        };
        drop(rows);

        self.set_theme_mod(theme, CUSTOM_CSS_POST_ID, &post.id.to_string())
            .await?;
        Ok(post)
    }

    pub async fn delete_custom_css(&self, theme: &str) -> Result<bool> {
        let affected = self
            .conn
            .execute("DELETE FROM custom_css WHERE theme = ?", libsql::params![theme])
            .await?;
        Ok(affected > 0)
    }

    pub async fn get_theme_mod(&self, theme: &str, name: &str) -> Result<Option<String>> {
        let query = "SELECT value FROM theme_mods WHERE theme = ? AND name = ?";
        let mut rows = self.conn.query(query, libsql::params![theme, name]).await?;

        if let Some(row) = rows.next().await? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }

    pub async fn set_theme_mod(&self, theme: &str, name: &str, value: &str) -> Result<()> {
        let query = r#"
            INSERT INTO theme_mods (theme, name, value)
            VALUES (?, ?, ?)
            ON CONFLICT(theme, name) DO UPDATE SET value = excluded.value
        "#;
        self.conn
            .execute(query, libsql::params![theme, name, value])
            .await?;
        Ok(())
    }

    /// Resolves the custom CSS document of `theme`.
    ///
    /// For the active theme the document id is cached in the `custom_css_post_id`
    /// theme mod, with `-1` recording that no document exists. Saving a document
    /// refreshes the cached id but deleting one does not: a cached id whose document
    /// was deleted resolves to `None`.
    pub async fn custom_css_post(
        &self,
        theme: &str,
        active_theme: &str,
    ) -> Result<Option<CustomCssPost>> {
        if theme != active_theme {
            return self.find_custom_css_post(theme).await;
        }

        let cached = self
            .get_theme_mod(theme, CUSTOM_CSS_POST_ID)
            .await?
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0);

        if cached == 0 {
            let post = self.find_custom_css_post(theme).await?;
            let id = post.as_ref().map(|p| p.id).unwrap_or(-1);
            self.set_theme_mod(theme, CUSTOM_CSS_POST_ID, &id.to_string())
                .await?;
            Ok(post)
        } else if cached > 0 {
            self.get_custom_css_post_by_id(cached).await
        } else {
            Ok(None)
        }
    }

    pub async fn custom_css(&self, theme: &str, active_theme: &str) -> Result<Option<String>> {
        Ok(self
            .custom_css_post(theme, active_theme)
            .await?
            .map(|post| post.css))
    }
}
