//! Image delivery
//!
//! Routes a rendered image to the best available sink, in priority order:
//! per-user authenticated host, guest host, local file sink served by the
//! external HTTP file server. Each step's failure falls through to the next
//! and is reported in the final outcome.
//!
//! Hosted-user API keys are stored in plaintext locally. This is a known
//! operator-facing limitation; at-rest encryption can be added without
//! changing this interface.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{Datelike, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::{EaselError, Result};

const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS hosted_users (
    user_id TEXT PRIMARY KEY,
    api_key TEXT NOT NULL,
    album_id TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS uploads (
    id TEXT PRIMARY KEY,
    user_id TEXT,
    url TEXT NOT NULL,
    delete_url TEXT,
    sink TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_uploads_created ON uploads(created_at DESC);
"#;

/// A user with a personal hosting credential
#[derive(Debug, Clone, Serialize)]
pub struct HostedUser {
    pub user_id: String,
    #[serde(skip)]
    pub api_key: String,
    pub album_id: Option<String>,
}

/// Hosted-user and upload-history store (thread-safe via Mutex)
pub struct HostDb {
    conn: Mutex<Connection>,
}

impl HostDb {
    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| EaselError::Internal(format!("host db lock poisoned: {}", e)))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn()?;
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.execute(&format!("PRAGMA user_version = {}", SCHEMA_VERSION), [])?;
        }
        Ok(())
    }

    /// Register or replace a user's personal API key
    pub fn set_user_key(
        &self,
        user_id: &str,
        api_key: &str,
        album_id: Option<&str>,
    ) -> Result<()> {
        let now = crate::now_ms();
        self.conn()?.execute(
            "INSERT INTO hosted_users (user_id, api_key, album_id, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4) \
             ON CONFLICT(user_id) DO UPDATE SET \
               api_key = excluded.api_key, album_id = excluded.album_id, \
               updated_at = excluded.updated_at",
            params![user_id, api_key, album_id, now],
        )?;
        Ok(())
    }

    pub fn get_user(&self, user_id: &str) -> Result<Option<HostedUser>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT user_id, api_key, album_id FROM hosted_users WHERE user_id = ?1")?;
        let mut rows = stmt.query(params![user_id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(HostedUser {
                user_id: row.get(0)?,
                api_key: row.get(1)?,
                album_id: row.get(2)?,
            }))
        } else {
            Ok(None)
        }
    }

    pub fn remove_user(&self, user_id: &str) -> Result<bool> {
        let count = self
            .conn()?
            .execute("DELETE FROM hosted_users WHERE user_id = ?1", params![user_id])?;
        Ok(count > 0)
    }

    fn record_upload(
        &self,
        user_id: Option<&str>,
        url: &str,
        delete_url: Option<&str>,
        sink: &str,
    ) -> Result<()> {
        self.conn()?.execute(
            "INSERT INTO uploads (id, user_id, url, delete_url, sink, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![crate::new_id(), user_id, url, delete_url, sink, crate::now_ms()],
        )?;
        Ok(())
    }
}

/// Metadata attached to an upload
#[derive(Debug, Clone, Default)]
pub struct UploadMeta {
    /// File extension without the dot
    pub extension: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub user_id: Option<String>,
}

/// Where an image ended up
#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub url: String,
    pub delete_url: Option<String>,
    /// Winning sink: "host:user", "host:guest", or "local"
    pub sink: String,
    /// Failures from sinks tried before the winner
    pub failures: Vec<String>,
}

/// Prioritized image-sink pipeline
pub struct UploadRouter {
    db: HostDb,
    client: reqwest::Client,
    host_base_url: Option<String>,
    guest_api_key: Option<String>,
    timeout: Duration,
    max_file_size: u64,
    local_fallback: bool,
    local_dir: PathBuf,
    file_server_base: String,
}

impl UploadRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: HostDb,
        host_base_url: Option<String>,
        guest_api_key: Option<String>,
        timeout: Duration,
        max_file_size: u64,
        local_fallback: bool,
        local_dir: PathBuf,
        file_server_base: String,
    ) -> Self {
        Self {
            db,
            client: reqwest::Client::new(),
            host_base_url,
            guest_api_key,
            timeout,
            max_file_size,
            local_fallback,
            local_dir,
            file_server_base: file_server_base.trim_end_matches('/').to_string(),
        }
    }

    /// Local-only router (no external host configured)
    pub fn local_only(db: HostDb, local_dir: PathBuf, file_server_base: String) -> Self {
        Self::new(
            db,
            None,
            None,
            Duration::from_secs(30),
            50 * 1024 * 1024,
            true,
            local_dir,
            file_server_base,
        )
    }

    pub fn db(&self) -> &HostDb {
        &self.db
    }

    /// Route an image to the best available sink
    pub async fn upload(&self, image: &[u8], meta: &UploadMeta) -> Result<UploadOutcome> {
        if image.len() as u64 > self.max_file_size {
            return Err(EaselError::Validation(format!(
                "image is {} bytes, exceeding the {} byte limit",
                image.len(),
                self.max_file_size
            )));
        }

        let mut failures = Vec::new();

        if self.host_base_url.is_some() {
            // Per-user authenticated host first
            if let Some(user_id) = &meta.user_id {
                if let Some(user) = self.db.get_user(user_id)? {
                    match self
                        .upload_external(&user.api_key, user.album_id.as_deref(), image, meta)
                        .await
                    {
                        Ok((url, delete_url)) => {
                            self.db.record_upload(
                                Some(user_id),
                                &url,
                                delete_url.as_deref(),
                                "host:user",
                            )?;
                            return Ok(UploadOutcome {
                                url,
                                delete_url,
                                sink: "host:user".to_string(),
                                failures,
                            });
                        }
                        Err(e) => failures.push(format!("host:user: {}", e)),
                    }
                }
            }

            // Guest host next
            if let Some(guest_key) = &self.guest_api_key {
                match self.upload_external(guest_key, None, image, meta).await {
                    Ok((url, delete_url)) => {
                        self.db.record_upload(
                            meta.user_id.as_deref(),
                            &url,
                            delete_url.as_deref(),
                            "host:guest",
                        )?;
                        return Ok(UploadOutcome {
                            url,
                            delete_url,
                            sink: "host:guest".to_string(),
                            failures,
                        });
                    }
                    Err(e) => failures.push(format!("host:guest: {}", e)),
                }
            }
        }

        // Local file sink last
        if self.local_fallback {
            let url = self.upload_local(image, &meta.extension)?;
            self.db
                .record_upload(meta.user_id.as_deref(), &url, None, "local")?;
            return Ok(UploadOutcome {
                url,
                delete_url: None,
                sink: "local".to_string(),
                failures,
            });
        }

        Err(EaselError::Transport {
            component: "upload",
            message: format!("all sinks failed: {}", failures.join("; ")),
        })
    }

    /// Multipart upload to the external host. Returns (url, delete handle).
    async fn upload_external(
        &self,
        api_key: &str,
        album_id: Option<&str>,
        image: &[u8],
        meta: &UploadMeta,
    ) -> Result<(String, Option<String>)> {
        let base = self.host_base_url.as_deref().ok_or_else(|| {
            EaselError::Config("external host not configured".to_string())
        })?;

        let filename = format!("{}.{}", crate::new_id(), meta.extension);
        let part = reqwest::multipart::Part::bytes(image.to_vec())
            .file_name(filename)
            .mime_str("image/png")
            .map_err(|e| EaselError::Internal(format!("multipart: {}", e)))?;

        let mut form = reqwest::multipart::Form::new().part("source", part);
        if let Some(title) = &meta.title {
            form = form.text("title", title.clone());
        }
        if let Some(description) = &meta.description {
            form = form.text("description", description.clone());
        }
        if let Some(album) = album_id {
            form = form.text("album_id", album.to_string());
        }

        let resp = self
            .client
            .post(format!("{}/api/1/upload", base.trim_end_matches('/')))
            .header("X-API-Key", api_key)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| crate::error::transport_error("upload", e))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| crate::error::transport_error("upload", e))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("upload rejected")
                .to_string();
            return Err(EaselError::Upstream {
                component: "upload",
                message: format!("HTTP {}: {}", status.as_u16(), message),
            });
        }

        let url = body["image"]["url"]
            .as_str()
            .ok_or_else(|| EaselError::Upstream {
                component: "upload",
                message: "response missing image url".to_string(),
            })?
            .to_string();
        let delete_url = body["image"]["delete_url"].as_str().map(|s| s.to_string());

        Ok((url, delete_url))
    }

    /// Write to the local sink: `images/{yyyy}/{mm}/{dd}/{uuid}.{ext}`
    fn upload_local(&self, image: &[u8], extension: &str) -> Result<String> {
        let now = Utc::now();
        let relative = format!(
            "{:04}/{:02}/{:02}/{}.{}",
            now.year(),
            now.month(),
            now.day(),
            crate::new_id(),
            if extension.is_empty() { "png" } else { extension },
        );

        let full = self.local_dir.join(&relative);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, image)?;

        Ok(format!("{}/images/{}", self.file_server_base, relative))
    }

    /// Report which sink an upload would use right now
    pub async fn test_connection(&self) -> Result<String> {
        if let (Some(base), Some(_)) = (&self.host_base_url, &self.guest_api_key) {
            let reachable = self
                .client
                .get(base.clone())
                .timeout(self.timeout)
                .send()
                .await
                .is_ok();
            if reachable {
                return Ok("host:guest".to_string());
            }
        }
        if self.local_fallback {
            return Ok("local".to_string());
        }
        Err(EaselError::Config("no sink available".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_router(dir: &Path) -> UploadRouter {
        UploadRouter::local_only(
            HostDb::in_memory().unwrap(),
            dir.to_path_buf(),
            "http://localhost:8081".to_string(),
        )
    }

    #[tokio::test]
    async fn disabled_host_falls_through_to_local() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let router = local_router(dir.path());

        let outcome = router
            .upload(
                b"fake png bytes",
                &UploadMeta {
                    extension: "png".to_string(),
                    ..Default::default()
                },
            )
            .await?;

        assert_eq!(outcome.sink, "local");
        assert!(outcome.failures.is_empty());
        assert!(outcome.url.starts_with("http://localhost:8081/images/"));
        assert!(outcome.url.ends_with(".png"));
        Ok(())
    }

    #[tokio::test]
    async fn local_sink_writes_dated_layout() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let router = local_router(dir.path());

        let outcome = router
            .upload(
                b"bytes",
                &UploadMeta {
                    extension: "png".to_string(),
                    ..Default::default()
                },
            )
            .await?;

        let now = Utc::now();
        let expected_prefix = format!(
            "http://localhost:8081/images/{:04}/{:02}/{:02}/",
            now.year(),
            now.month(),
            now.day()
        );
        assert!(outcome.url.starts_with(&expected_prefix));

        // The file actually exists on disk
        let relative = outcome
            .url
            .strip_prefix("http://localhost:8081/images/")
            .unwrap();
        assert!(dir.path().join(relative).exists());
        Ok(())
    }

    #[tokio::test]
    async fn oversized_uploads_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut router = local_router(dir.path());
        router.max_file_size = 4;

        let err = router
            .upload(b"12345", &UploadMeta::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
        Ok(())
    }

    #[test]
    fn hosted_user_roundtrip() -> anyhow::Result<()> {
        let db = HostDb::in_memory()?;
        assert!(db.get_user("u1")?.is_none());

        db.set_user_key("u1", "secret-key", Some("album-9"))?;
        let user = db.get_user("u1")?.unwrap();
        assert_eq!(user.api_key, "secret-key");
        assert_eq!(user.album_id.as_deref(), Some("album-9"));

        db.set_user_key("u1", "rotated", None)?;
        assert_eq!(db.get_user("u1")?.unwrap().api_key, "rotated");

        assert!(db.remove_user("u1")?);
        assert!(db.get_user("u1")?.is_none());
        Ok(())
    }
}
