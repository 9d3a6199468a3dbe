//! Server registry: the in-process CRUD surface the REST adapter calls.
//!
//! Secrets are encrypted by the vault before they reach the database and are
//! never included in listings or views. Deletes are soft: the row keeps its
//! ciphertext (for audit/rotation) but the server disappears from the
//! in-memory map that every other component reads.

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::CommandError;
use crate::ssh::SshPool;
use crate::types::{AuthKind, Server, ServerId, ServerView};
use crate::vault::{CredentialVault, EncryptedSecret};

/// Input for server creation. The secret arrives in plaintext exactly once,
/// on this call path, and leaves it encrypted.
#[derive(Debug)]
pub struct NewServer {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_kind: AuthKind,
    pub secret: String,
    pub tags: Vec<String>,
    pub monitoring_enabled: bool,
}

/// Partial update; `None` fields keep their current value.
#[derive(Debug, Default)]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub auth_kind: Option<AuthKind>,
    pub secret: Option<String>,
    pub tags: Option<Vec<String>>,
    pub monitoring_enabled: Option<bool>,
}

#[derive(Debug, serde::Serialize)]
pub struct ConnectionTestReport {
    pub server_id: ServerId,
    pub ok: bool,
    pub latency_ms: u64,
    pub error: Option<String>,
}

pub struct ServerRegistry {
    pool: SqlitePool,
    vault: std::sync::Arc<CredentialVault>,
    servers: RwLock<HashMap<ServerId, Server>>,
}

impl ServerRegistry {
    pub async fn new(pool: SqlitePool, vault: std::sync::Arc<CredentialVault>) -> Result<Self> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS servers (
                id                    TEXT PRIMARY KEY,
                name                  TEXT NOT NULL,
                host                  TEXT NOT NULL,
                port                  INTEGER NOT NULL,
                username              TEXT NOT NULL,
                auth_kind             TEXT NOT NULL,
                secret_algorithm      TEXT NOT NULL,
                secret_salt           TEXT NOT NULL,
                secret_nonce          TEXT NOT NULL,
                secret_ciphertext     TEXT NOT NULL,
                secret_kdf_iterations INTEGER NOT NULL,
                tags                  TEXT NOT NULL,
                monitoring_enabled    INTEGER NOT NULL,
                created_at            TEXT NOT NULL,
                deleted_at            TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .context("failed to create servers table")?;

        let registry = Self {
            pool,
            vault,
            servers: RwLock::new(HashMap::new()),
        };
        registry.load_all().await?;
        Ok(registry)
    }

    async fn load_all(&self) -> Result<()> {
        let rows = sqlx::query("SELECT * FROM servers WHERE deleted_at IS NULL")
            .fetch_all(&self.pool)
            .await?;

        let mut servers = HashMap::with_capacity(rows.len());
        for row in rows {
            match row_to_server(&row) {
                Ok(server) => {
                    servers.insert(server.id.clone(), server);
                }
                Err(e) => warn!("skipping unreadable server row: {e}"),
            }
        }
        info!(count = servers.len(), "servers loaded");
        *self.servers.write().unwrap() = servers;
        Ok(())
    }

    pub async fn create_server(&self, new: NewServer) -> Result<ServerView> {
        let secret = self
            .vault
            .encrypt(new.secret.as_bytes())
            .context("failed to encrypt credential")?;

        let server = Server {
            id: Uuid::new_v4().to_string(),
            name: new.name,
            host: new.host,
            port: new.port,
            username: new.username,
            auth_kind: new.auth_kind,
            secret,
            tags: new.tags,
            monitoring_enabled: new.monitoring_enabled,
            created_at: Utc::now(),
            deleted_at: None,
        };

        self.persist(&server).await?;
        let view = ServerView::from(&server);
        self.servers
            .write()
            .unwrap()
            .insert(server.id.clone(), server);
        info!(server_id = %view.id, host = %view.host, "server registered");
        Ok(view)
    }

    pub async fn update_server(&self, id: &ServerId, update: ServerUpdate) -> Result<ServerView> {
        let mut server = self
            .get(id)
            .with_context(|| format!("server {id} not found"))?;

        if let Some(name) = update.name {
            server.name = name;
        }
        if let Some(host) = update.host {
            server.host = host;
        }
        if let Some(port) = update.port {
            server.port = port;
        }
        if let Some(username) = update.username {
            server.username = username;
        }
        if let Some(auth_kind) = update.auth_kind {
            server.auth_kind = auth_kind;
        }
        if let Some(secret) = update.secret {
            server.secret = self
                .vault
                .encrypt(secret.as_bytes())
                .context("failed to encrypt credential")?;
        }
        if let Some(tags) = update.tags {
            server.tags = tags;
        }
        if let Some(enabled) = update.monitoring_enabled {
            server.monitoring_enabled = enabled;
        }

        self.persist(&server).await?;
        let view = ServerView::from(&server);
        self.servers
            .write()
            .unwrap()
            .insert(server.id.clone(), server);
        info!(server_id = %id, "server updated");
        Ok(view)
    }

    /// Soft-delete. The caller is responsible for tearing down the server's
    /// scheduler task, pool sessions, rings, and subscriptions.
    pub async fn delete_server(&self, id: &ServerId) -> Result<()> {
        let existed = self.servers.write().unwrap().remove(id).is_some();
        if !existed {
            anyhow::bail!("server {id} not found");
        }
        sqlx::query("UPDATE servers SET deleted_at = ? WHERE id = ?")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        info!(server_id = %id, "server deleted");
        Ok(())
    }

    pub fn list_servers(&self) -> Vec<ServerView> {
        let mut views: Vec<ServerView> = self
            .servers
            .read()
            .unwrap()
            .values()
            .map(ServerView::from)
            .collect();
        views.sort_by(|a, b| a.name.cmp(&b.name));
        views
    }

    pub fn get(&self, id: &ServerId) -> Option<Server> {
        self.servers.read().unwrap().get(id).cloned()
    }

    pub fn monitored_servers(&self) -> Vec<Server> {
        self.servers
            .read()
            .unwrap()
            .values()
            .filter(|s| s.monitoring_enabled)
            .cloned()
            .collect()
    }

    /// Open a session and run a no-op through it, reporting round-trip time.
    pub async fn test_connection(
        &self,
        id: &ServerId,
        pool: &SshPool,
    ) -> Result<ConnectionTestReport> {
        let server = self
            .get(id)
            .with_context(|| format!("server {id} not found"))?;

        let started = tokio::time::Instant::now();
        let result: std::result::Result<(), CommandError> = async {
            let mut lease = pool.acquire(&server, Duration::from_secs(10)).await?;
            let output = tokio::time::timeout(
                Duration::from_secs(5),
                lease.session().execute("echo ok"),
            )
            .await
            .map_err(|_| CommandError::CommandTimeout {
                key: "test".to_string(),
                timeout_secs: 5,
            })?
            .map_err(CommandError::Connectivity)?;
            pool.release(lease).await;
            if output.exit_status != 0 {
                return Err(CommandError::CommandFailed {
                    key: "test".to_string(),
                    exit: output.exit_status,
                    stderr: output.stderr,
                });
            }
            Ok(())
        }
        .await;

        let latency_ms = started.elapsed().as_millis() as u64;
        Ok(match result {
            Ok(()) => ConnectionTestReport {
                server_id: id.clone(),
                ok: true,
                latency_ms,
                error: None,
            },
            Err(e) => ConnectionTestReport {
                server_id: id.clone(),
                ok: false,
                latency_ms,
                error: Some(e.to_string()),
            },
        })
    }

    async fn persist(&self, server: &Server) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO servers
                (id, name, host, port, username, auth_kind,
                 secret_algorithm, secret_salt, secret_nonce, secret_ciphertext,
                 secret_kdf_iterations, tags, monitoring_enabled, created_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                host = excluded.host,
                port = excluded.port,
                username = excluded.username,
                auth_kind = excluded.auth_kind,
                secret_algorithm = excluded.secret_algorithm,
                secret_salt = excluded.secret_salt,
                secret_nonce = excluded.secret_nonce,
                secret_ciphertext = excluded.secret_ciphertext,
                secret_kdf_iterations = excluded.secret_kdf_iterations,
                tags = excluded.tags,
                monitoring_enabled = excluded.monitoring_enabled
            "#,
        )
        .bind(&server.id)
        .bind(&server.name)
        .bind(&server.host)
        .bind(server.port as i64)
        .bind(&server.username)
        .bind(match server.auth_kind {
            AuthKind::Password => "password",
            AuthKind::Key => "key",
        })
        .bind(&server.secret.algorithm)
        .bind(BASE64.encode(&server.secret.salt))
        .bind(BASE64.encode(&server.secret.nonce))
        .bind(BASE64.encode(&server.secret.ciphertext))
        .bind(server.secret.kdf_iterations as i64)
        .bind(serde_json::to_string(&server.tags)?)
        .bind(server.monitoring_enabled as i64)
        .bind(server.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn row_to_server(row: &sqlx::sqlite::SqliteRow) -> Result<Server> {
    let auth_kind = match row.get::<String, _>("auth_kind").as_str() {
        "password" => AuthKind::Password,
        "key" => AuthKind::Key,
        other => anyhow::bail!("unknown auth kind {other:?}"),
    };

    let decode = |column: &str| -> Result<Vec<u8>> {
        BASE64
            .decode(row.get::<String, _>(column))
            .with_context(|| format!("column {column} is not base64"))
    };

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&row.get::<String, _>("created_at"))
        .context("bad created_at")?
        .with_timezone(&Utc);
    let deleted_at = row
        .get::<Option<String>, _>("deleted_at")
        .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
        .transpose()
        .context("bad deleted_at")?;

    Ok(Server {
        id: row.get("id"),
        name: row.get("name"),
        host: row.get("host"),
        port: row.get::<i64, _>("port") as u16,
        username: row.get("username"),
        auth_kind,
        secret: EncryptedSecret {
            algorithm: row.get("secret_algorithm"),
            salt: decode("secret_salt")?,
            nonce: decode("secret_nonce")?,
            ciphertext: decode("secret_ciphertext")?,
            kdf_iterations: row.get::<i64, _>("secret_kdf_iterations") as u32,
        },
        tags: serde_json::from_str(&row.get::<String, _>("tags")).unwrap_or_default(),
        monitoring_enabled: row.get::<i64, _>("monitoring_enabled") != 0,
        created_at,
        deleted_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn registry() -> (ServerRegistry, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let pool = SqlitePool::connect(&format!("sqlite:{}?mode=rwc", path.display()))
            .await
            .unwrap();
        let vault = Arc::new(CredentialVault::new(Some("test-master-key".into())));
        (ServerRegistry::new(pool, vault).await.unwrap(), dir)
    }

    fn new_server(name: &str) -> NewServer {
        NewServer {
            name: name.to_string(),
            host: format!("{name}.internal"),
            port: 22,
            username: "monitor".to_string(),
            auth_kind: AuthKind::Password,
            secret: "hunter2-ssh-password".to_string(),
            tags: vec!["prod".to_string()],
            monitoring_enabled: true,
        }
    }

    #[tokio::test]
    async fn create_list_update_delete() {
        let (registry, _dir) = registry().await;

        let view = registry.create_server(new_server("db-1")).await.unwrap();
        assert_eq!(view.name, "db-1");

        let listed = registry.list_servers();
        assert_eq!(listed.len(), 1);

        let updated = registry
            .update_server(
                &view.id,
                ServerUpdate {
                    monitoring_enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!updated.monitoring_enabled);
        assert!(registry.monitored_servers().is_empty());

        registry.delete_server(&view.id).await.unwrap();
        assert!(registry.list_servers().is_empty());
        assert!(registry.delete_server(&view.id).await.is_err());
    }

    #[tokio::test]
    async fn secrets_are_stored_encrypted_and_round_trip() {
        let (registry, _dir) = registry().await;
        let view = registry.create_server(new_server("db-1")).await.unwrap();

        let server = registry.get(&view.id).unwrap();
        assert_eq!(server.secret.algorithm, crate::vault::ALGORITHM_TAG);
        assert_ne!(server.secret.ciphertext, b"hunter2-ssh-password".to_vec());

        let vault = CredentialVault::new(Some("test-master-key".into()));
        let plain = vault.decrypt(&server.secret).unwrap();
        assert_eq!(plain.as_bytes(), b"hunter2-ssh-password");
    }

    #[tokio::test]
    async fn views_never_carry_secret_material() {
        let (registry, _dir) = registry().await;
        registry.create_server(new_server("db-1")).await.unwrap();
        let json = serde_json::to_string(&registry.list_servers()).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("ciphertext"));
        assert!(!json.contains("secret"));
    }

    #[tokio::test]
    async fn rows_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.db");
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let vault = Arc::new(CredentialVault::new(Some("test-master-key".into())));

        let id = {
            let pool = SqlitePool::connect(&url).await.unwrap();
            let registry = ServerRegistry::new(pool, vault.clone()).await.unwrap();
            let view = registry.create_server(new_server("db-1")).await.unwrap();
            registry.delete_server(&view.id).await.ok();
            let keep = registry.create_server(new_server("db-2")).await.unwrap();
            keep.id
        };

        let pool = SqlitePool::connect(&url).await.unwrap();
        let registry = ServerRegistry::new(pool, vault).await.unwrap();
        let listed = registry.list_servers();
        // Soft-deleted db-1 must not resurface.
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].name, "db-2");
    }
}
