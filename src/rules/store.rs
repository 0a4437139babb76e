//! Persistent rule store: a single actor task owns the `rusqlite::Connection`
//! and serializes every read and write through it, matching the rest of the
//! codebase's one-writer-per-subsystem discipline. Callers talk to the
//! actor through a cheaply cloneable handle backed by an unbounded channel.

use crate::error::CoreError;
use crate::rules::model::{Rule, RuleAction, RuleSource, RuleType, RulesChanged, WildcardRootPolicy};
use chrono::{DateTime, Utc};
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

const BULK_THRESHOLD: usize = 100;
const CHANGE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct RuleStoreConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub journal_mode: String,
}

impl RuleStoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: 5_000,
            journal_mode: "WAL".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct NewRule {
    pub domain: String,
    pub action: RuleAction,
    pub priority: i32,
    pub source: RuleSource,
    pub custom_message: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub comment: Option<String>,
}

impl Default for RuleAction {
    fn default() -> Self {
        RuleAction::Block
    }
}

impl Default for RuleSource {
    fn default() -> Self {
        RuleSource::User
    }
}

enum Command {
    RuleForDomain {
        name: String,
        wildcard_root_policy: WildcardRootPolicy,
        reply: oneshot::Sender<Result<Option<Rule>, CoreError>>,
    },
    AddRules {
        batch: Vec<NewRule>,
        reply: oneshot::Sender<Result<usize, CoreError>>,
    },
    RemoveRule {
        domain: String,
        reply: oneshot::Sender<Result<bool, CoreError>>,
    },
    RemoveAllFromSource {
        source: RuleSource,
        reply: oneshot::Sender<Result<usize, CoreError>>,
    },
    RemoveExpired {
        now: DateTime<Utc>,
        reply: oneshot::Sender<Result<usize, CoreError>>,
    },
    ReplaceAllFromSource {
        source: RuleSource,
        rules: Vec<NewRule>,
        reply: oneshot::Sender<Result<usize, CoreError>>,
    },
    MostQueried {
        limit: u32,
        reply: oneshot::Sender<Result<Vec<(String, u64)>, CoreError>>,
    },
    CleanupOlderThan {
        cutoff: DateTime<Utc>,
        reply: oneshot::Sender<Result<usize, CoreError>>,
    },
    RecordQuery {
        domain: String,
        now: DateTime<Utc>,
    },
}

/// Cheaply cloneable handle to the rule store actor.
#[derive(Clone)]
pub struct RuleStore {
    tx: mpsc::UnboundedSender<Command>,
    changes: broadcast::Sender<RulesChanged>,
}

impl RuleStore {
    pub fn spawn(config: RuleStoreConfig) -> Result<Self, CoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let changes_for_actor = changes.clone();

        let conn = open_connection(&config)?;
        tokio::spawn(run_actor(conn, config, rx, changes_for_actor));

        Ok(Self { tx, changes })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RulesChanged> {
        self.changes.subscribe()
    }

    pub async fn rule_for_domain(
        &self,
        name: &str,
        wildcard_root_policy: WildcardRootPolicy,
    ) -> Result<Option<Rule>, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RuleForDomain {
            name: name.to_string(),
            wildcard_root_policy,
            reply,
        })?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub async fn add_rules(&self, batch: Vec<NewRule>) -> Result<usize, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::AddRules { batch, reply })?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub async fn remove_rule(&self, domain: &str) -> Result<bool, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoveRule {
            domain: domain.to_string(),
            reply,
        })?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub async fn remove_all_from_source(&self, source: RuleSource) -> Result<usize, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoveAllFromSource { source, reply })?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub async fn remove_expired(&self, now: DateTime<Utc>) -> Result<usize, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::RemoveExpired { now, reply })?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub async fn replace_all_from_source(
        &self,
        source: RuleSource,
        rules: Vec<NewRule>,
    ) -> Result<usize, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ReplaceAllFromSource {
            source,
            rules,
            reply,
        })?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub async fn most_queried(&self, limit: u32) -> Result<Vec<(String, u64)>, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::MostQueried { limit, reply })?;
        rx.await.map_err(|_| actor_gone())?
    }

    pub async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::CleanupOlderThan { cutoff, reply })?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Best-effort hit-counter bookkeeping for `most_queried`; fire and
    /// forget since a dropped sample under load is harmless.
    pub fn record_query(&self, domain: &str, now: DateTime<Utc>) {
        let _ = self.send(Command::RecordQuery {
            domain: domain.to_string(),
            now,
        });
    }

    fn send(&self, command: Command) -> Result<(), CoreError> {
        self.tx
            .send(command)
            .map_err(|_| CoreError::StorageUnavailable("rule store actor has shut down".into()))
    }
}

fn actor_gone() -> CoreError {
    CoreError::StorageUnavailable("rule store actor dropped the reply channel".into())
}

fn open_connection(config: &RuleStoreConfig) -> Result<Connection, CoreError> {
    let conn = Connection::open(&config.path)
        .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
    conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
        .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
    conn.pragma_update(None, "journal_mode", &config.journal_mode)
        .map_err(|e| CoreError::StorageUnavailable(e.to_string()))?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), CoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS rules (
            rowid INTEGER PRIMARY KEY AUTOINCREMENT,
            domain TEXT NOT NULL UNIQUE,
            action TEXT NOT NULL,
            rule_type TEXT NOT NULL,
            priority INTEGER NOT NULL,
            source TEXT NOT NULL,
            custom_message TEXT,
            updated_at TEXT NOT NULL,
            expires_at TEXT,
            comment TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_rules_domain_action ON rules(domain, action);
        CREATE INDEX IF NOT EXISTS idx_rules_domain_type ON rules(domain, rule_type);
        CREATE INDEX IF NOT EXISTS idx_rules_updated_at ON rules(updated_at);
        CREATE INDEX IF NOT EXISTS idx_rules_expires_at ON rules(expires_at);
        CREATE INDEX IF NOT EXISTS idx_rules_wildcard ON rules(domain) WHERE rule_type = 'wildcard';
        CREATE INDEX IF NOT EXISTS idx_rules_source_priority ON rules(source, priority DESC);

        CREATE TABLE IF NOT EXISTS query_stats (
            domain TEXT PRIMARY KEY,
            hits INTEGER NOT NULL DEFAULT 0,
            last_queried TEXT NOT NULL
        );
        ",
    )
    .map_err(|e| CoreError::StorageCorrupt(e.to_string()))
}

/// Delete and recreate the database file, used by the one-shot failure
/// recovery pass described for the store.
fn recover(config: &RuleStoreConfig) -> Result<Connection, CoreError> {
    let _ = std::fs::remove_file(&config.path);
    let _ = std::fs::remove_file(wal_sibling(&config.path, "-wal"));
    let _ = std::fs::remove_file(wal_sibling(&config.path, "-shm"));
    open_connection(config)
}

fn wal_sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

fn is_recoverable(err: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode::*;
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, DatabaseCorrupt | CannotOpen | NotADatabase)
    )
}

async fn run_actor(
    mut conn: Connection,
    config: RuleStoreConfig,
    mut rx: mpsc::UnboundedReceiver<Command>,
    changes: broadcast::Sender<RulesChanged>,
) {
    let mut regex_cache: HashMap<String, Arc<Option<Regex>>> = HashMap::new();

    while let Some(command) = rx.recv().await {
        match command {
            Command::RuleForDomain {
                name,
                wildcard_root_policy,
                reply,
            } => {
                let result = with_recovery(&mut conn, &config, "rule_for_domain", |conn| {
                    rule_for_domain(conn, &mut regex_cache, &name, wildcard_root_policy)
                });
                let _ = reply.send(result);
            }
            Command::AddRules { batch, reply } => {
                let result =
                    with_recovery(&mut conn, &config, "add_rules", |conn| add_rules(conn, &batch));
                if matches!(result, Ok(n) if n > 0) {
                    let _ = changes.send(RulesChanged {
                        source: None,
                        changed_at: Utc::now(),
                    });
                }
                let _ = reply.send(result);
            }
            Command::RemoveRule { domain, reply } => {
                let result = with_recovery(&mut conn, &config, "remove_rule", |conn| {
                    remove_rule(conn, &domain)
                });
                if matches!(result, Ok(true)) {
                    let _ = changes.send(RulesChanged {
                        source: None,
                        changed_at: Utc::now(),
                    });
                }
                let _ = reply.send(result);
            }
            Command::RemoveAllFromSource { source, reply } => {
                let result = with_recovery(&mut conn, &config, "remove_all_from_source", |conn| {
                    remove_all_from_source(conn, source)
                });
                if matches!(result, Ok(n) if n > 0) {
                    let _ = changes.send(RulesChanged {
                        source: Some(source.as_str().to_string()),
                        changed_at: Utc::now(),
                    });
                }
                let _ = reply.send(result);
            }
            Command::RemoveExpired { now, reply } => {
                let result = with_recovery(&mut conn, &config, "remove_expired", |conn| {
                    remove_expired(conn, now)
                });
                let _ = reply.send(result);
            }
            Command::ReplaceAllFromSource {
                source,
                rules,
                reply,
            } => {
                let result = with_recovery(&mut conn, &config, "replace_all_from_source", |conn| {
                    replace_all_from_source(conn, source, &rules)
                });
                let _ = changes.send(RulesChanged {
                    source: Some(source.as_str().to_string()),
                    changed_at: Utc::now(),
                });
                let _ = reply.send(result);
            }
            Command::MostQueried { limit, reply } => {
                let result = with_recovery(&mut conn, &config, "most_queried", |conn| {
                    most_queried(conn, limit)
                });
                let _ = reply.send(result);
            }
            Command::CleanupOlderThan { cutoff, reply } => {
                let result = with_recovery(&mut conn, &config, "cleanup_older_than", |conn| {
                    cleanup_older_than(conn, cutoff)
                });
                let _ = reply.send(result);
            }
            Command::RecordQuery { domain, now } => {
                let _ = with_recovery(&mut conn, &config, "record_query", |conn| {
                    record_lookup(conn, &domain, now)
                });
            }
        }
    }
}

/// Runs `op` against `conn`; on an IO/corruption-class sqlite error, closes
/// and recreates the database once and retries before surfacing
/// `StorageUnavailable`.
fn with_recovery<T>(
    conn: &mut Connection,
    config: &RuleStoreConfig,
    context: &str,
    mut op: impl FnMut(&Connection) -> rusqlite::Result<T>,
) -> Result<T, CoreError> {
    match op(conn) {
        Ok(value) => Ok(value),
        Err(err) if is_recoverable(&err) => {
            warn!(context, error = %err, "rule store recovering from corrupt database");
            match recover(config) {
                Ok(new_conn) => {
                    *conn = new_conn;
                    op(conn).map_err(|e| CoreError::StorageUnavailable(e.to_string()))
                }
                Err(_) => Err(CoreError::StorageUnavailable(format!(
                    "{context}: recovery pass failed"
                ))),
            }
        }
        Err(err) => Err(CoreError::StorageUnavailable(err.to_string())),
    }
}

fn row_to_rule(row: &rusqlite::Row) -> rusqlite::Result<Rule> {
    let action: String = row.get("action")?;
    let rule_type: String = row.get("rule_type")?;
    let source: String = row.get("source")?;
    Ok(Rule {
        domain: row.get("domain")?,
        action: RuleAction::parse(&action).unwrap_or(RuleAction::Block),
        rule_type: RuleType::parse(&rule_type).unwrap_or(RuleType::Exact),
        priority: row.get("priority")?,
        source: RuleSource::parse(&source).unwrap_or(RuleSource::User),
        custom_message: row.get("custom_message")?,
        updated_at: row.get("updated_at")?,
        expires_at: row.get("expires_at")?,
        comment: row.get("comment")?,
    })
}

fn query_exact(conn: &Connection, key: &str, now: DateTime<Utc>) -> rusqlite::Result<Option<Rule>> {
    conn.query_row(
        "SELECT domain, action, rule_type, priority, source, custom_message, updated_at, \
         expires_at, comment FROM rules WHERE domain = ?1 \
         AND (expires_at IS NULL OR expires_at >= ?2) ORDER BY priority DESC, rowid ASC LIMIT 1",
        params![key, now],
        row_to_rule,
    )
    .optional()
}

fn rule_for_domain(
    conn: &Connection,
    regex_cache: &mut HashMap<String, Arc<Option<Regex>>>,
    name: &str,
    wildcard_root_policy: WildcardRootPolicy,
) -> rusqlite::Result<Option<Rule>> {
    let now = Utc::now();

    if let Some(rule) = query_exact(conn, name, now)? {
        return Ok(Some(rule));
    }

    if wildcard_root_policy == WildcardRootPolicy::IncludeRoot {
        if let Some(rule) = query_exact(conn, &format!("*.{name}"), now)? {
            return Ok(Some(rule));
        }
    }

    let labels: Vec<&str> = name.split('.').collect();
    for i in 1..labels.len() {
        let suffix = labels[i..].join(".");
        if let Some(rule) = query_exact(conn, &format!("*.{suffix}"), now)? {
            return Ok(Some(rule));
        }
    }

    let mut stmt = conn.prepare(
        "SELECT domain, action, rule_type, priority, source, custom_message, updated_at, \
         expires_at, comment FROM rules WHERE rule_type = 'regex' \
         AND (expires_at IS NULL OR expires_at >= ?1) ORDER BY priority DESC, rowid ASC",
    )?;
    let candidates = stmt.query_map(params![now], row_to_rule)?;
    for candidate in candidates {
        let rule = candidate?;
        let pattern = rule.domain.strip_prefix("re:").unwrap_or(&rule.domain);
        let compiled = regex_cache
            .entry(pattern.to_string())
            .or_insert_with(|| Arc::new(Regex::new(pattern).ok()));
        if let Some(re) = compiled.as_ref() {
            if re.is_match(name) {
                return Ok(Some(rule));
            }
        }
    }

    Ok(None)
}

fn insert_rule(tx: &rusqlite::Transaction, rule: &NewRule, now: DateTime<Utc>) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO rules (domain, action, rule_type, priority, source, custom_message, \
         updated_at, expires_at, comment) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
         ON CONFLICT(domain) DO UPDATE SET action = excluded.action, rule_type = excluded.rule_type, \
         priority = excluded.priority, source = excluded.source, \
         custom_message = excluded.custom_message, updated_at = excluded.updated_at, \
         expires_at = excluded.expires_at, comment = excluded.comment",
        params![
            rule.domain,
            rule.action.as_str(),
            RuleType::infer(&rule.domain).as_str(),
            rule.priority,
            rule.source.as_str(),
            rule.custom_message,
            now,
            rule.expires_at,
            rule.comment,
        ],
    )?;
    Ok(())
}

fn add_rules(conn: &Connection, batch: &[NewRule]) -> rusqlite::Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }
    let bulk = batch.len() > BULK_THRESHOLD;
    if bulk {
        conn.pragma_update(None, "synchronous", "OFF")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        conn.pragma_update(None, "cache_size", -64_000i64)?;
    }

    let now = Utc::now();
    let outcome = (|| -> rusqlite::Result<usize> {
        let tx = conn.unchecked_transaction()?;
        for rule in batch {
            insert_rule(&tx, rule, now)?;
        }
        tx.commit()?;
        Ok(batch.len())
    })();

    if bulk {
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        let _ = conn.pragma_update(None, "temp_store", "DEFAULT");
    }
    outcome
}

fn remove_rule(conn: &Connection, domain: &str) -> rusqlite::Result<bool> {
    let affected = conn.execute("DELETE FROM rules WHERE domain = ?1", params![domain])?;
    Ok(affected > 0)
}

fn remove_all_from_source(conn: &Connection, source: RuleSource) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM rules WHERE source = ?1",
        params![source.as_str()],
    )
}

fn remove_expired(conn: &Connection, now: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM rules WHERE expires_at IS NOT NULL AND expires_at < ?1",
        params![now],
    )
}

fn replace_all_from_source(
    conn: &Connection,
    source: RuleSource,
    rules: &[NewRule],
) -> rusqlite::Result<usize> {
    let now = Utc::now();
    let tx = conn.unchecked_transaction()?;
    tx.execute(
        "DELETE FROM rules WHERE source = ?1",
        params![source.as_str()],
    )?;
    for rule in rules {
        insert_rule(&tx, rule, now)?;
    }
    tx.commit()?;
    Ok(rules.len())
}

fn most_queried(conn: &Connection, limit: u32) -> rusqlite::Result<Vec<(String, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT domain, hits FROM query_stats ORDER BY hits DESC, last_queried DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map(params![limit], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
    })?;
    rows.collect()
}

fn cleanup_older_than(conn: &Connection, cutoff: DateTime<Utc>) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM query_stats WHERE last_queried < ?1",
        params![cutoff],
    )
}

/// Records one lookup for `domain` in the query-statistics table. Called
/// by the proxy engine (C9) outside the main lookup hot path.
pub fn record_lookup(conn: &Connection, domain: &str, now: DateTime<Utc>) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO query_stats (domain, hits, last_queried) VALUES (?1, 1, ?2) \
         ON CONFLICT(domain) DO UPDATE SET hits = hits + 1, last_queried = excluded.last_queried",
        params![domain, now],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rule(domain: &str, action: RuleAction, priority: i32, source: RuleSource) -> NewRule {
        NewRule {
            domain: domain.to_string(),
            action,
            priority,
            source,
            custom_message: None,
            expires_at: None,
            comment: None,
        }
    }

    async fn spawn_store() -> (RuleStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let config = RuleStoreConfig::new(dir.path().join("rules.db"));
        let store = RuleStore::spawn(config).unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn exact_match_beats_wildcard() {
        let (store, _dir) = spawn_store().await;
        store
            .add_rules(vec![
                rule("ads.example.com", RuleAction::Block, 0, RuleSource::List),
                rule("*.example.com", RuleAction::Allow, 0, RuleSource::User),
            ])
            .await
            .unwrap();

        let hit = store.rule_for_domain("ads.example.com", WildcardRootPolicy::ExcludeRoot).await.unwrap().unwrap();
        assert_eq!(hit.action, RuleAction::Block);

        let parent = store.rule_for_domain("other.example.com", WildcardRootPolicy::ExcludeRoot).await.unwrap().unwrap();
        assert_eq!(parent.action, RuleAction::Allow);
    }

    #[tokio::test]
    async fn longest_suffix_wins_over_shorter() {
        let (store, _dir) = spawn_store().await;
        store
            .add_rules(vec![
                rule("*.com", RuleAction::Allow, 0, RuleSource::Builtin),
                rule("*.ads.example.com", RuleAction::Block, 0, RuleSource::List),
            ])
            .await
            .unwrap();

        let hit = store
            .rule_for_domain("track.ads.example.com", WildcardRootPolicy::ExcludeRoot)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(hit.action, RuleAction::Block);
    }

    #[tokio::test]
    async fn priority_breaks_ties_within_same_stage() {
        let (store, _dir) = spawn_store().await;
        store
            .add_rules(vec![rule(
                "example.com",
                RuleAction::Allow,
                1,
                RuleSource::User,
            )])
            .await
            .unwrap();
        store
            .add_rules(vec![rule(
                "example.com",
                RuleAction::Block,
                5,
                RuleSource::Manifest,
            )])
            .await
            .unwrap();

        // Same domain key replaces the prior row entirely (upsert), so the
        // higher-priority insert simply wins as the sole remaining row.
        let hit = store.rule_for_domain("example.com", WildcardRootPolicy::ExcludeRoot).await.unwrap().unwrap();
        assert_eq!(hit.action, RuleAction::Block);
        assert_eq!(hit.priority, 5);
    }

    #[tokio::test]
    async fn expired_rules_are_not_matched() {
        let (store, _dir) = spawn_store().await;
        let mut expired = rule("old.example.com", RuleAction::Block, 0, RuleSource::List);
        expired.expires_at = Some(Utc::now() - chrono::Duration::seconds(10));
        store.add_rules(vec![expired]).await.unwrap();

        assert!(store.rule_for_domain("old.example.com", WildcardRootPolicy::ExcludeRoot).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn regex_rule_matches_and_survives_bad_pattern() {
        let (store, _dir) = spawn_store().await;
        store
            .add_rules(vec![
                rule("re:^bad[", RuleAction::Block, 10, RuleSource::List),
                rule(r"re:^ads\d+\.example\.com$", RuleAction::Block, 0, RuleSource::List),
            ])
            .await
            .unwrap();

        let hit = store.rule_for_domain("ads42.example.com", WildcardRootPolicy::ExcludeRoot).await.unwrap();
        assert!(hit.is_some());
    }

    #[tokio::test]
    async fn remove_all_from_source_only_removes_that_source() {
        let (store, _dir) = spawn_store().await;
        store
            .add_rules(vec![
                rule("a.example.com", RuleAction::Block, 0, RuleSource::List),
                rule("b.example.com", RuleAction::Block, 0, RuleSource::User),
            ])
            .await
            .unwrap();

        let removed = store.remove_all_from_source(RuleSource::List).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.rule_for_domain("a.example.com", WildcardRootPolicy::ExcludeRoot).await.unwrap().is_none());
        assert!(store.rule_for_domain("b.example.com", WildcardRootPolicy::ExcludeRoot).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rules_changed_is_broadcast_on_mutation() {
        let (store, _dir) = spawn_store().await;
        let mut changes = store.subscribe();
        store
            .add_rules(vec![rule("x.example.com", RuleAction::Block, 0, RuleSource::User)])
            .await
            .unwrap();
        let event = changes.try_recv();
        assert!(event.is_ok());
    }

    #[tokio::test]
    async fn replace_all_from_source_clears_stale_entries() {
        let (store, _dir) = spawn_store().await;
        store
            .add_rules(vec![rule("stale.example.com", RuleAction::Block, 0, RuleSource::List)])
            .await
            .unwrap();
        store
            .replace_all_from_source(
                RuleSource::List,
                vec![rule("fresh.example.com", RuleAction::Block, 0, RuleSource::List)],
            )
            .await
            .unwrap();

        assert!(store.rule_for_domain("stale.example.com", WildcardRootPolicy::ExcludeRoot).await.unwrap().is_none());
        assert!(store.rule_for_domain("fresh.example.com", WildcardRootPolicy::ExcludeRoot).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn wildcard_root_policy_gates_whether_the_apex_itself_matches() {
        let (store, _dir) = spawn_store().await;
        store
            .add_rules(vec![rule("*.example.com", RuleAction::Block, 0, RuleSource::List)])
            .await
            .unwrap();

        assert!(store
            .rule_for_domain("example.com", WildcardRootPolicy::ExcludeRoot)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .rule_for_domain("example.com", WildcardRootPolicy::IncludeRoot)
            .await
            .unwrap()
            .is_some());
    }
}
