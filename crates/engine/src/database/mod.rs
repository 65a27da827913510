//! Configuration and authentication store (sqlx + SQLite)
//!
//! Holds the replicated configuration the cluster bootstraps from: agent
//! credentials, queue definitions, client (brand) records and release
//! options. All queries are runtime-checked and fully async; the schema is
//! applied through sqlx migrations on startup.
//!
//! The store is read-mostly. The queue manager consults it to restart dead
//! queue workers, the dispatcher for its listing endpoints, and the
//! authentication service for credentials.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{info, warn};

use cpx_agent_core::types::{Agent, AgentId, Client, RingPath, SecurityLevel};

use crate::queue::Recipe;

/// One queue definition as persisted.
#[derive(Debug, Clone)]
pub struct QueueDef {
    pub name: String,
    pub weight: i64,
    pub recipe: Recipe,
    pub group: String,
}

/// Brand listing entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Brand {
    pub label: String,
    pub id: String,
}

/// Release option entry. `bias` is -1, 0 or 1.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ReleaseOpt {
    pub label: String,
    pub id: String,
    pub bias: i64,
}

/// Async store over a SQLite pool.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    /// Set when this node asserted mastership over the config tables.
    master: Arc<AtomicBool>,
}

impl Store {
    /// Connect and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        info!("🗄️ initializing config store: {}", database_url);

        // A pooled in-memory database would hand every connection its own
        // empty database, so pin it to a single connection.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| anyhow!("failed to connect to database: {e}"))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| anyhow!("failed to run migrations: {e}"))?;

        Ok(Self {
            pool,
            master: Arc::new(AtomicBool::new(false)),
        })
    }

    /// In-memory store for tests.
    pub async fn new_in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Assert that this node's copy of the config tables is authoritative.
    /// Called on node-down and inconsistent-database cluster events.
    pub fn assert_master(&self) {
        if !self.master.swap(true, Ordering::SeqCst) {
            warn!("asserting local mastership over config tables");
        }
    }

    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }

    // === agents ===

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let skills = serde_json::to_string(&agent.skills)?;
        let ring_path = match agent.ring_path {
            RingPath::Inband => "inband",
            RingPath::Outband => "outband",
        };
        sqlx::query(
            "INSERT INTO agents (login, password_hash, profile, security, skills, ring_path)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(login) DO UPDATE SET
                 password_hash = excluded.password_hash,
                 profile = excluded.profile,
                 security = excluded.security,
                 skills = excluded.skills,
                 ring_path = excluded.ring_path",
        )
        .bind(&agent.login)
        .bind(&agent.password_hash)
        .bind(&agent.profile)
        .bind(agent.security.as_str())
        .bind(skills)
        .bind(ring_path)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_agent(&self, login: &str) -> Result<Option<Agent>> {
        let row = sqlx::query(
            "SELECT login, password_hash, profile, security, skills, ring_path
             FROM agents WHERE login = ?1",
        )
        .bind(login)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let login: String = row.try_get("login")?;
        let skills: String = row.try_get("skills")?;
        let security: String = row.try_get("security")?;
        let ring_path: String = row.try_get("ring_path")?;

        Ok(Some(Agent {
            id: AgentId(login.clone()),
            login,
            profile: row.try_get("profile")?,
            skills: serde_json::from_str(&skills).unwrap_or_default(),
            security: SecurityLevel::parse(&security).unwrap_or(SecurityLevel::Agent),
            ring_path: if ring_path == "outband" { RingPath::Outband } else { RingPath::Inband },
            password_hash: row.try_get("password_hash")?,
        }))
    }

    // === queues ===

    pub async fn upsert_queue_def(&self, def: &QueueDef) -> Result<()> {
        let recipe = serde_json::to_string(&def.recipe)?;
        sqlx::query(
            "INSERT INTO queues (name, weight, recipe, queue_group)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO UPDATE SET
                 weight = excluded.weight,
                 recipe = excluded.recipe,
                 queue_group = excluded.queue_group",
        )
        .bind(&def.name)
        .bind(def.weight)
        .bind(recipe)
        .bind(&def.group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_queue_def(&self, name: &str) -> Result<Option<QueueDef>> {
        let row = sqlx::query(
            "SELECT name, weight, recipe, queue_group FROM queues WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let recipe: String = row.try_get("recipe")?;
        Ok(Some(QueueDef {
            name: row.try_get("name")?,
            weight: row.try_get("weight")?,
            recipe: serde_json::from_str(&recipe).unwrap_or_default(),
            group: row.try_get("queue_group")?,
        }))
    }

    pub async fn delete_queue_def(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM queues WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_queue_defs(&self) -> Result<Vec<QueueDef>> {
        let rows = sqlx::query("SELECT name, weight, recipe, queue_group FROM queues ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        let mut defs = Vec::with_capacity(rows.len());
        for row in rows {
            let recipe: String = row.try_get("recipe")?;
            defs.push(QueueDef {
                name: row.try_get("name")?,
                weight: row.try_get("weight")?,
                recipe: serde_json::from_str(&recipe).unwrap_or_default(),
                group: row.try_get("queue_group")?,
            });
        }
        Ok(defs)
    }

    pub async fn list_queue_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM queues ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(Into::into))
            .collect()
    }

    // === clients (brands) ===

    pub async fn upsert_client(&self, client: &Client) -> Result<()> {
        sqlx::query(
            "INSERT INTO clients (id, label, autoend_wrapup)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 label = excluded.label,
                 autoend_wrapup = excluded.autoend_wrapup",
        )
        .bind(&client.id)
        .bind(&client.label)
        .bind(client.autoend_wrapup.map(|v| v as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_client(&self, id: &str) -> Result<Option<Client>> {
        let row = sqlx::query("SELECT id, label, autoend_wrapup FROM clients WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let autoend: Option<i64> = row.try_get("autoend_wrapup")?;
        Ok(Some(Client {
            id: row.try_get("id")?,
            label: row.try_get("label")?,
            autoend_wrapup: autoend.and_then(|v| u64::try_from(v).ok()),
        }))
    }

    pub async fn list_brands(&self) -> Result<Vec<Brand>> {
        let rows = sqlx::query("SELECT id, label FROM clients ORDER BY label")
            .fetch_all(&self.pool)
            .await?;
        let mut brands = Vec::with_capacity(rows.len());
        for row in rows {
            brands.push(Brand {
                label: row.try_get("label")?,
                id: row.try_get("id")?,
            });
        }
        Ok(brands)
    }

    // === release options ===

    pub async fn upsert_release_opt(&self, opt: &ReleaseOpt) -> Result<()> {
        sqlx::query(
            "INSERT INTO release_options (id, label, bias)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET label = excluded.label, bias = excluded.bias",
        )
        .bind(&opt.id)
        .bind(&opt.label)
        .bind(opt.bias)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_release_opts(&self) -> Result<Vec<ReleaseOpt>> {
        let rows = sqlx::query("SELECT id, label, bias FROM release_options ORDER BY label")
            .fetch_all(&self.pool)
            .await?;
        let mut opts = Vec::with_capacity(rows.len());
        for row in rows {
            opts.push(ReleaseOpt {
                label: row.try_get("label")?,
                id: row.try_get("id")?,
                bias: row.try_get("bias")?,
            });
        }
        Ok(opts)
    }

    /// Seed the store with the baseline records a fresh deployment needs.
    pub async fn seed_defaults(&self) -> Result<()> {
        let brands = self.list_brands().await?;
        if brands.is_empty() {
            self.upsert_client(&Client {
                id: "00010001".to_string(),
                label: "Demo Client".to_string(),
                autoend_wrapup: None,
            })
            .await?;
        }

        let opts = self.list_release_opts().await?;
        if opts.is_empty() {
            for (id, label, bias) in [
                ("default", "Default", 0),
                ("break", "Break", -1),
                ("lunch", "Lunch", -1),
                ("meeting", "In a Meeting", 0),
            ] {
                self.upsert_release_opt(&ReleaseOpt {
                    id: id.to_string(),
                    label: label.to_string(),
                    bias,
                })
                .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn agent_round_trip() {
        let store = Store::new_in_memory().await.unwrap();
        let agent = Agent {
            id: AgentId("alice".to_string()),
            login: "alice".to_string(),
            profile: "support".to_string(),
            skills: vec!["english".to_string(), "tier1".to_string()],
            security: SecurityLevel::Supervisor,
            ring_path: RingPath::Outband,
            password_hash: "argon2-hash".to_string(),
        };

        store.upsert_agent(&agent).await.unwrap();
        let loaded = store.get_agent("alice").await.unwrap().expect("agent exists");
        assert_eq!(loaded.profile, "support");
        assert_eq!(loaded.skills, agent.skills);
        assert_eq!(loaded.security, SecurityLevel::Supervisor);
        assert_eq!(loaded.ring_path, RingPath::Outband);

        assert!(store.get_agent("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn queue_defs_round_trip() {
        let store = Store::new_in_memory().await.unwrap();
        let def = QueueDef {
            name: "support".to_string(),
            weight: 5,
            recipe: Recipe::default(),
            group: "default".to_string(),
        };
        store.upsert_queue_def(&def).await.unwrap();

        let loaded = store.get_queue_def("support").await.unwrap().expect("def exists");
        assert_eq!(loaded.weight, 5);
        assert_eq!(store.list_queue_names().await.unwrap(), vec!["support"]);

        store.delete_queue_def("support").await.unwrap();
        assert!(store.get_queue_def("support").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seeding_is_idempotent() {
        let store = Store::new_in_memory().await.unwrap();
        store.seed_defaults().await.unwrap();
        store.seed_defaults().await.unwrap();
        let opts = store.list_release_opts().await.unwrap();
        assert!(!opts.is_empty());
        assert_eq!(store.list_brands().await.unwrap().len(), 1);
    }
}
