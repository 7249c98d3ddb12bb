//! Logical Database Set
//!
//! A server hosts a fixed number of independent databases (`SELECT 0..N`).
//! Each has its own maps, stripes and pause barrier. They share one delay
//! scheduler, and with it one task namespace, so expiration tasks are named
//! `expire:<db>:<key>` to keep equal keys in different databases apart.

use crate::config::ServerConfig;
use crate::storage::db::{CmdLine, Database, DbStats};
use crate::storage::timewheel::{DelayScheduler, TimeWheel};
use std::sync::Arc;
use tracing::info;

/// The databases of one server, indexed from 0.
pub struct Databases<V> {
    dbs: Vec<Database<V>>,
}

impl<V> std::fmt::Debug for Databases<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Databases")
            .field("count", &self.dbs.len())
            .finish()
    }
}

impl<V: Send + Sync + 'static> Databases<V> {
    /// Builds `config.databases` databases sharing `scheduler`.
    pub fn new(config: &ServerConfig, scheduler: Arc<dyn DelayScheduler>) -> Self {
        let dbs = (0..config.databases)
            .map(|index| Database::new(index, config, Arc::clone(&scheduler)))
            .collect();
        Self { dbs }
    }

    /// Builds the databases on a freshly started time wheel.
    ///
    /// Must be called from within a Tokio runtime. The wheel stops once the
    /// last database is dropped.
    pub fn start(config: &ServerConfig) -> Self {
        let wheel = Arc::new(TimeWheel::start(config.time_wheel()));
        info!(databases = config.databases, "Databases initialized");
        Self::new(config, wheel)
    }

    /// The database with the given index.
    pub fn get(&self, index: usize) -> Option<&Database<V>> {
        self.dbs.get(index)
    }

    /// Number of databases.
    pub fn len(&self) -> usize {
        self.dbs.len()
    }

    /// Returns true if there are no databases.
    pub fn is_empty(&self) -> bool {
        self.dbs.is_empty()
    }

    /// Iterates over the databases in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Database<V>> {
        self.dbs.iter()
    }

    /// Flushes every database. Returns the total number of keys removed.
    ///
    /// All databases are paused, in index order, before any is cleared, so no
    /// command observes a half-flushed server.
    pub fn flush_all(&self) -> usize {
        let paused: Vec<_> = self.dbs.iter().map(Database::pause).collect();
        let removed: usize = paused.iter().map(|p| p.flush()).sum();
        drop(paused);

        info!(removed, "All databases flushed");
        removed
    }

    /// Installs one hook on every database; it receives the database index.
    pub fn set_mutation_hook(&self, hook: impl Fn(usize, CmdLine) + Send + Sync + 'static) {
        let hook = Arc::new(hook);
        for db in &self.dbs {
            let hook = Arc::clone(&hook);
            let index = db.index();
            db.set_mutation_hook(move |line| hook(index, line));
        }
    }

    /// Per-database statistics, in index order.
    pub fn stats(&self) -> Vec<DbStats> {
        self.dbs.iter().map(Database::stats).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::{Duration, SystemTime};

    fn config(databases: usize) -> ServerConfig {
        ServerConfig {
            databases,
            lock_stripes: 16,
            data_dict_shards: 16,
            ttl_dict_shards: 16,
            wheel_interval: Duration::from_millis(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_databases_are_independent() {
        let dbs: Databases<String> = Databases::start(&config(4));
        assert_eq!(dbs.len(), 4);
        assert!(dbs.get(4).is_none());

        dbs.get(0).unwrap().put(Bytes::from("k"), "zero".to_string());
        dbs.get(1).unwrap().put(Bytes::from("k"), "one".to_string());

        assert_eq!(dbs.get(0).unwrap().get(b"k"), Some("zero".to_string()));
        assert_eq!(dbs.get(1).unwrap().get(b"k"), Some("one".to_string()));
        assert_eq!(dbs.get(2).unwrap().get(b"k"), None);

        let indexes: Vec<_> = dbs.iter().map(Database::index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_flush_all() {
        let dbs: Databases<String> = Databases::start(&config(3));
        for db in dbs.iter() {
            db.put(Bytes::from("a"), "1".to_string());
            db.put(Bytes::from("b"), "2".to_string());
        }

        assert_eq!(dbs.flush_all(), 6);
        assert!(dbs.stats().iter().all(|s| s.keys == 0));

        // usable again afterwards
        dbs.get(2).unwrap().put(Bytes::from("a"), "1".to_string());
        assert_eq!(dbs.get(2).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_hook_reports_database_index() {
        let dbs: Databases<String> = Databases::start(&config(2));
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        dbs.set_mutation_hook(move |index, line| sink.lock().unwrap().push((index, line)));

        let db = dbs.get(1).unwrap();
        db.put(Bytes::from("k"), "v".to_string());
        db.expire(b"k", SystemTime::now() - Duration::from_millis(1));

        // either the wheel or the lazy check removes it, exactly once
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(db.get(b"k"), None);

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].0, 1);
        assert_eq!(log[0].1[0], Bytes::from("DEL"));
    }

    #[tokio::test]
    async fn test_persist_in_one_database_keeps_expiry_in_another() {
        let dbs: Databases<String> = Databases::start(&config(2));
        let (db0, db1) = (dbs.get(0).unwrap(), dbs.get(1).unwrap());

        db0.put(Bytes::from("k"), "zero".to_string());
        db0.expire(b"k", SystemTime::now() + Duration::from_millis(30));

        db1.put(Bytes::from("k"), "one".to_string());
        db1.expire(b"k", SystemTime::now() + Duration::from_secs(3600));
        db1.persist(b"k");

        tokio::time::sleep(Duration::from_millis(200)).await;

        // removed by the wheel alone, nobody read it
        assert_eq!(db0.stats().expired_keys, 1);
        assert_eq!(db0.stats().keys, 0);
        assert_eq!(db1.get(b"k"), Some("one".to_string()));
    }

    #[tokio::test]
    async fn test_shared_wheel_expires_keys_in_every_database() {
        let dbs: Databases<String> = Databases::start(&config(2));
        let at = SystemTime::now() + Duration::from_millis(30);

        for db in dbs.iter() {
            db.put(Bytes::from("k"), "v".to_string());
            db.expire(b"k", at);
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(dbs.stats().iter().all(|s| s.keys == 0 && s.expired_keys == 1));
    }
}
