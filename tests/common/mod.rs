#![allow(dead_code)]

use async_trait::async_trait;
use pg_provisioner::ProvisionerError;
use pg_provisioner::db::{CredentialStore, ObjectStore};
use pg_provisioner::engine::{AdminEngine, AdminSession};
use pg_provisioner::service::reconciler::{ReconcileSettings, Reconciler};
use pg_provisioner::types::{CredentialRecord, SecretKey};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// SQLite object store on a throwaway file, removed on drop.
pub struct TempStore {
    pub store: ObjectStore,
    path: PathBuf,
}

impl TempStore {
    pub async fn new(tag: &str) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX_EPOCH")
            .as_nanos();

        let mut path = std::env::temp_dir();
        path.push(format!(
            "pg-provisioner-{tag}-{}-{}.sqlite",
            std::process::id(),
            nanos
        ));

        let url = format!("sqlite:{}", path.display());
        let store = ObjectStore::open(&url)
            .await
            .expect("failed to open object store");
        Self { store, path }
    }
}

impl Drop for TempStore {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// In-process stand-in for the relational engine.
#[derive(Default)]
pub struct FakeCluster {
    /// role -> last password set
    pub roles: HashMap<String, Option<String>>,
    /// database -> owner
    pub databases: HashMap<String, String>,
    pub extensions: HashMap<String, BTreeSet<String>>,
    /// Every mutating statement, in order.
    pub ddl: Vec<String>,
    pub fail_create_database: bool,
    pub panic_on_session: bool,
    pub lookup_delay: Option<Duration>,
    pub open_sessions: usize,
    pub sessions_opened: usize,
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    pub cluster: Arc<Mutex<FakeCluster>>,
}

impl FakeEngine {
    pub fn with<R>(&self, f: impl FnOnce(&mut FakeCluster) -> R) -> R {
        f(&mut self.cluster.lock().unwrap())
    }

    pub fn ddl(&self) -> Vec<String> {
        self.with(|c| c.ddl.clone())
    }

    pub fn role_password(&self, role: &str) -> Option<String> {
        self.with(|c| c.roles.get(role).cloned().flatten())
    }
}

#[async_trait]
impl AdminEngine for FakeEngine {
    async fn session(&self) -> Result<Box<dyn AdminSession>, ProvisionerError> {
        // outside the lock so the mutex is not poisoned
        if self.with(|c| c.panic_on_session) {
            panic!("admin engine crashed");
        }
        self.with(|c| {
            c.open_sessions += 1;
            c.sessions_opened += 1;
        });
        Ok(Box::new(FakeSession {
            engine: self.clone(),
        }))
    }
}

pub struct FakeSession {
    engine: FakeEngine,
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.engine.with(|c| c.open_sessions -= 1);
    }
}

impl FakeSession {
    async fn lookup_delay(&self) {
        if let Some(delay) = self.engine.with(|c| c.lookup_delay) {
            tokio::time::sleep(delay).await;
        }
    }
}

fn refused(msg: &str) -> ProvisionerError {
    ProvisionerError::DatabaseError(sqlx::Error::Configuration(msg.to_string().into()))
}

#[async_trait]
impl AdminSession for FakeSession {
    async fn role_exists(&mut self, role: &str) -> Result<bool, ProvisionerError> {
        self.lookup_delay().await;
        Ok(self.engine.with(|c| c.roles.contains_key(role)))
    }

    async fn database_owner(&mut self, database: &str) -> Result<Option<String>, ProvisionerError> {
        self.lookup_delay().await;
        Ok(self.engine.with(|c| c.databases.get(database).cloned()))
    }

    async fn installed_extensions(
        &mut self,
        database: &str,
    ) -> Result<BTreeSet<String>, ProvisionerError> {
        Ok(self.engine.with(|c| c.extensions.get(database).cloned().unwrap_or_default()))
    }

    async fn create_role(&mut self, role: &str) -> Result<(), ProvisionerError> {
        self.engine.with(|c| {
            if c.roles.contains_key(role) {
                return Err(ProvisionerError::AlreadyExists(format!("role {role}")));
            }
            c.roles.insert(role.to_string(), None);
            c.ddl.push(format!("CREATE ROLE {role}"));
            Ok(())
        })
    }

    async fn set_role_password(
        &mut self,
        role: &str,
        password: &str,
    ) -> Result<(), ProvisionerError> {
        self.engine.with(|c| {
            let Some(slot) = c.roles.get_mut(role) else {
                return Err(refused("role does not exist"));
            };
            *slot = Some(password.to_string());
            c.ddl.push(format!("ALTER ROLE {role} PASSWORD"));
            Ok(())
        })
    }

    async fn create_database(
        &mut self,
        database: &str,
        owner: &str,
    ) -> Result<(), ProvisionerError> {
        self.engine.with(|c| {
            if c.fail_create_database {
                return Err(refused("permission denied to create database"));
            }
            if !c.roles.contains_key(owner) {
                return Err(refused("owner role does not exist"));
            }
            if c.databases.contains_key(database) {
                return Err(ProvisionerError::AlreadyExists(format!("database {database}")));
            }
            c.databases.insert(database.to_string(), owner.to_string());
            c.ddl.push(format!("CREATE DATABASE {database} OWNER {owner}"));
            Ok(())
        })
    }

    async fn alter_database_owner(
        &mut self,
        database: &str,
        owner: &str,
    ) -> Result<(), ProvisionerError> {
        self.engine.with(|c| {
            let Some(slot) = c.databases.get_mut(database) else {
                return Err(refused("database does not exist"));
            };
            *slot = owner.to_string();
            c.ddl.push(format!("ALTER DATABASE {database} OWNER TO {owner}"));
            Ok(())
        })
    }

    async fn create_extensions(
        &mut self,
        database: &str,
        extensions: &[String],
    ) -> Result<(), ProvisionerError> {
        self.engine.with(|c| {
            let installed = c.extensions.entry(database.to_string()).or_default();
            for ext in extensions {
                if !installed.insert(ext.clone()) {
                    return Err(ProvisionerError::AlreadyExists(format!("extension {ext}")));
                }
                c.ddl.push(format!("CREATE EXTENSION {ext} IN {database}"));
            }
            Ok(())
        })
    }
}

/// Credential store wrapper whose writes can be made to fail.
pub struct FlakyCredentials {
    pub inner: ObjectStore,
    pub fail_writes: AtomicBool,
    /// Request a rotation on the stored record right before the next update lands.
    pub rotate_before_update: AtomicBool,
    pub writes: AtomicUsize,
}

impl FlakyCredentials {
    pub fn new(inner: ObjectStore) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            rotate_before_update: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_writes.store(failing, Ordering::SeqCst);
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), ProvisionerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ProvisionerError::DatabaseError(sqlx::Error::PoolTimedOut));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for FlakyCredentials {
    async fn get(&self, key: &SecretKey) -> Result<Option<CredentialRecord>, ProvisionerError> {
        CredentialStore::get(&self.inner, key).await
    }

    async fn create(&self, record: &CredentialRecord) -> Result<(), ProvisionerError> {
        self.check()?;
        self.inner.create(record).await
    }

    async fn update(
        &self,
        record: &CredentialRecord,
        previous: &CredentialRecord,
    ) -> Result<(), ProvisionerError> {
        self.check()?;
        if self.rotate_before_update.swap(false, Ordering::SeqCst) {
            self.inner.request_rotation(&record.key).await?;
        }
        self.inner.update(record, previous).await
    }
}

pub fn settings() -> ReconcileSettings {
    ReconcileSettings {
        host: "db.test".to_string(),
        port: 5432,
        call_timeout: Duration::from_secs(5),
        password_length: 32,
    }
}

pub struct Harness {
    pub temp: TempStore,
    pub engine: FakeEngine,
    pub credentials: Arc<FlakyCredentials>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub async fn new(tag: &str) -> Self {
        Self::with_settings(tag, settings()).await
    }

    pub async fn with_settings(tag: &str, settings: ReconcileSettings) -> Self {
        let temp = TempStore::new(tag).await;
        let engine = FakeEngine::default();
        let credentials = Arc::new(FlakyCredentials::new(temp.store.clone()));
        let reconciler = Reconciler::new(
            Arc::new(temp.store.clone()),
            credentials.clone(),
            Arc::new(engine.clone()),
            settings,
        );
        Self {
            temp,
            engine,
            credentials,
            reconciler,
        }
    }

    pub fn store(&self) -> &ObjectStore {
        &self.temp.store
    }
}
