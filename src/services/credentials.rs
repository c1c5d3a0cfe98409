//! Credential store and account selection
//!
//! Holds the live gateway state (connections plus the read-mostly alias,
//! combo and pricing tables), orders eligible accounts, tracks cooldowns and
//! coalesces token refreshes per connection.

use crate::config::{Connection, GatewayConfig, TestStatus};
use crate::providers::{Executor, RefreshedTokens};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Refresh proactively when the access token expires within this window
const EXPIRY_BUFFER_MS: i64 = 5 * 60 * 1000;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Live gateway state shared across requests
pub struct CredentialStore {
    config: RwLock<GatewayConfig>,
    /// One async mutex per connection id; concurrent refreshes collapse into
    /// the first caller's attempt
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Persist mutations back to disk (disabled in tests)
    persist: bool,
}

impl CredentialStore {
    pub fn new(config: GatewayConfig, persist: bool) -> Self {
        Self { config: RwLock::new(config), refresh_locks: Mutex::new(HashMap::new()), persist }
    }

    /// Snapshot of the whole state, taken on request entry so alias and
    /// pricing reads cannot tear mid-request
    pub fn config_snapshot(&self) -> GatewayConfig {
        self.config.read().unwrap().clone()
    }

    pub fn get(&self, id: &str) -> Option<Connection> {
        self.config.read().unwrap().connections.iter().find(|c| c.id == id).cloned()
    }

    /// Select the best eligible connection for a provider
    ///
    /// Ordering: global priority ascending where set, then per-provider
    /// priority ascending, then creation order. A connection is eligible iff
    /// it is active, not excluded and not cooling down.
    pub fn select_connection(
        &self,
        provider: &str,
        exclude: &[String],
        _model: Option<&str>,
    ) -> Option<Connection> {
        let now = now_ms();
        let config = self.config.read().unwrap();
        let mut candidates: Vec<&Connection> = config
            .connections
            .iter()
            .filter(|c| {
                c.provider == provider
                    && c.is_active
                    && !exclude.contains(&c.id)
                    && c.cooldown_until <= now
            })
            .collect();

        candidates.sort_by_key(|c| {
            (c.global_priority.unwrap_or(i32::MAX), c.priority, c.created_at, c.id.clone())
        });
        candidates.first().map(|c| (*c).clone())
    }

    /// All connections for a provider, eligibility ignored (dashboards)
    pub fn connections_for(&self, provider: &str) -> Vec<Connection> {
        self.config
            .read()
            .unwrap()
            .connections
            .iter()
            .filter(|c| c.provider == provider)
            .cloned()
            .collect()
    }

    /// Take the connection out of rotation after a failed attempt
    pub fn mark_unavailable(&self, id: &str, cooldown: Duration, status: Option<u16>, message: &str) {
        let mut config = self.config.write().unwrap();
        if let Some(connection) = config.connections.iter_mut().find(|c| c.id == id) {
            let truncated: String = message.chars().take(100).collect();
            connection.test_status = TestStatus::Error;
            connection.last_error = Some(match status {
                Some(code) => format!("{} {}", code, truncated),
                None => truncated,
            });
            connection.last_error_at = Some(now_ms());
            connection.consecutive_failures = connection.consecutive_failures.saturating_add(1);
            connection.cooldown_until = now_ms() + cooldown.as_millis() as i64;
            warn!(
                "connection {} unavailable for {:?} ({})",
                id,
                cooldown,
                connection.last_error.as_deref().unwrap_or("")
            );
        }
        drop(config);
        self.save();
    }

    /// Clear error state after a successful call
    pub fn mark_success(&self, id: &str) {
        let mut config = self.config.write().unwrap();
        if let Some(connection) = config.connections.iter_mut().find(|c| c.id == id) {
            let had_error = connection.test_status == TestStatus::Error;
            connection.test_status = TestStatus::Active;
            connection.last_error = None;
            connection.consecutive_failures = 0;
            connection.cooldown_until = 0;
            if had_error {
                info!("connection {} recovered", id);
            }
        }
        drop(config);
        self.save();
    }

    /// Store tokens produced by a refresh
    pub fn store_tokens(&self, id: &str, tokens: &RefreshedTokens) {
        let mut config = self.config.write().unwrap();
        if let Some(connection) = config.connections.iter_mut().find(|c| c.id == id) {
            let secrets = &mut connection.secrets;
            secrets.access_token = Some(tokens.access_token.clone());
            if let Some(refresh_token) = &tokens.refresh_token {
                secrets.refresh_token = Some(refresh_token.clone());
            }
            if let Some(id_token) = &tokens.id_token {
                secrets.id_token = Some(id_token.clone());
            }
            if let Some(expires_at) = tokens.expires_at {
                secrets.expires_at = Some(expires_at);
            }
            if let Some(Value::String(profile_arn)) = tokens.extra.get("profileArn") {
                secrets.profile_arn = Some(profile_arn.clone());
            }
            if let Some(Value::String(project_id)) = tokens.extra.get("projectId") {
                secrets.project_id = Some(project_id.clone());
            }
            debug!("connection {}: stored refreshed tokens", id);
        }
        drop(config);
        self.save();
    }

    /// Proactive refresh: when the access token is close to expiry, refresh
    /// before using the connection. Failure leaves the connection unchanged;
    /// the reactive 401/403 path covers it.
    pub async fn ensure_fresh(
        &self,
        connection: Connection,
        executor: &Arc<dyn Executor>,
    ) -> Connection {
        if connection.secrets.access_token.is_none() {
            return connection;
        }
        let Some(expires_at) = connection.secrets.expires_at else { return connection };
        if expires_at - now_ms() >= EXPIRY_BUFFER_MS {
            return connection;
        }

        let lock = self.refresh_lock(&connection.id);
        let _guard = lock.lock().await;

        // A concurrent caller may have refreshed while we waited on the lock
        let current = self.get(&connection.id).unwrap_or(connection);
        if current
            .secrets
            .expires_at
            .map(|e| e - now_ms() >= EXPIRY_BUFFER_MS)
            .unwrap_or(false)
        {
            return current;
        }

        debug!("connection {}: token expires soon, refreshing", current.id);
        match executor.refresh_credentials(&current.secrets).await {
            Ok(Some(tokens)) => {
                self.store_tokens(&current.id, &tokens);
                self.get(&current.id).unwrap_or(current)
            }
            Ok(None) => {
                warn!("connection {}: proactive refresh rejected", current.id);
                current
            }
            Err(e) => {
                warn!("connection {}: proactive refresh failed: {}", current.id, e);
                current
            }
        }
    }

    /// Reactive refresh after a 401/403, with retries and short backoff.
    /// Returns the refreshed connection, or None when every attempt failed.
    pub async fn refresh_with_retry(
        &self,
        id: &str,
        executor: &Arc<dyn Executor>,
        attempts: u32,
    ) -> Option<Connection> {
        let lock = self.refresh_lock(id);
        let _guard = lock.lock().await;
        let connection = self.get(id)?;

        for attempt in 0..attempts {
            match executor.refresh_credentials(&connection.secrets).await {
                Ok(Some(tokens)) => {
                    self.store_tokens(id, &tokens);
                    return self.get(id);
                }
                Ok(None) => {
                    debug!("connection {}: refresh rejected (attempt {})", id, attempt + 1);
                }
                Err(e) => {
                    debug!("connection {}: refresh error (attempt {}): {}", id, attempt + 1, e);
                }
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(Duration::from_millis(250 * (attempt as u64 + 1))).await;
            }
        }
        None
    }

    // -- admin surface ------------------------------------------------------

    pub fn upsert_connection(&self, connection: Connection) {
        let mut config = self.config.write().unwrap();
        match config.connections.iter_mut().find(|c| c.id == connection.id) {
            Some(existing) => *existing = connection,
            None => config.connections.push(connection),
        }
        drop(config);
        self.save();
    }

    pub fn remove_connection(&self, id: &str) -> bool {
        let mut config = self.config.write().unwrap();
        let before = config.connections.len();
        config.connections.retain(|c| c.id != id);
        let removed = config.connections.len() != before;
        drop(config);
        if removed {
            self.save();
        }
        removed
    }

    /// Apply an arbitrary mutation to the config (aliases, combos, pricing)
    pub fn update_config<F: FnOnce(&mut GatewayConfig)>(&self, mutate: F) {
        let mut config = self.config.write().unwrap();
        mutate(&mut config);
        drop(config);
        self.save();
    }

    fn refresh_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.refresh_locks.lock().unwrap();
        locks.entry(id.to_string()).or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))).clone()
    }

    fn save(&self) {
        if !self.persist {
            return;
        }
        let config = self.config.read().unwrap().clone();
        if let Err(e) = config.save() {
            warn!("failed to persist gateway config: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthType, ConnectionSecrets};
    use crate::models::WireFormat;
    use crate::providers::{ExecuteArgs, ExecuteOutcome};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn connection(id: &str, provider: &str, priority: i32) -> Connection {
        Connection {
            id: id.into(),
            provider: provider.into(),
            auth_type: AuthType::Apikey,
            label: String::new(),
            priority,
            global_priority: None,
            default_model: None,
            secrets: ConnectionSecrets { api_key: Some("k".into()), ..Default::default() },
            test_status: Default::default(),
            last_error: None,
            last_error_at: None,
            cooldown_until: 0,
            consecutive_failures: 0,
            is_active: true,
            created_at: 0,
        }
    }

    fn store(connections: Vec<Connection>) -> CredentialStore {
        CredentialStore::new(GatewayConfig { connections, ..Default::default() }, false)
    }

    struct CountingRefresher {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Executor for CountingRefresher {
        fn provider_id(&self) -> &str {
            "test"
        }
        fn response_format(&self) -> WireFormat {
            WireFormat::Openai
        }
        fn build_url(&self, _: &str, _: bool, _: usize, _: &ConnectionSecrets) -> String {
            String::new()
        }
        fn build_headers(&self, _: &ConnectionSecrets, _: bool) -> Vec<(String, String)> {
            Vec::new()
        }
        async fn execute(&self, _: ExecuteArgs<'_>) -> Result<ExecuteOutcome> {
            anyhow::bail!("not used")
        }
        async fn refresh_credentials(
            &self,
            _: &ConnectionSecrets,
        ) -> Result<Option<RefreshedTokens>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Some(RefreshedTokens {
                access_token: "fresh".into(),
                expires_at: Some(now_ms() + 3_600_000),
                ..Default::default()
            }))
        }
    }

    #[test]
    fn test_selection_ordering() {
        let mut low = connection("low", "openai", 5);
        low.created_at = 1;
        let mut high = connection("high", "openai", 1);
        high.created_at = 2;
        let mut global = connection("global", "openai", 9);
        global.global_priority = Some(0);
        global.created_at = 3;

        let store = store(vec![low, high, global]);
        // Global priority beats per-provider priority
        assert_eq!(store.select_connection("openai", &[], None).unwrap().id, "global");
        // Then per-provider priority
        assert_eq!(
            store
                .select_connection("openai", &["global".to_string()], None)
                .unwrap()
                .id,
            "high"
        );
    }

    #[test]
    fn test_cooldown_excludes_until_elapsed() {
        let store = store(vec![connection("only", "openai", 0)]);
        store.mark_unavailable("only", Duration::from_secs(60), Some(429), "rate limited");
        assert!(store.select_connection("openai", &[], None).is_none());

        let marked = store.get("only").unwrap();
        assert_eq!(marked.test_status, TestStatus::Error);
        assert_eq!(marked.consecutive_failures, 1);
        assert!(marked.last_error.as_deref().unwrap().starts_with("429"));

        // Success clears the cooldown and error state
        store.mark_success("only");
        let cleared = store.get("only").unwrap();
        assert_eq!(cleared.cooldown_until, 0);
        assert_eq!(cleared.test_status, TestStatus::Active);
        assert!(store.select_connection("openai", &[], None).is_some());
    }

    #[test]
    fn test_last_error_truncated_to_100_chars() {
        let store = store(vec![connection("c", "openai", 0)]);
        let long_message = "x".repeat(500);
        store.mark_unavailable("c", Duration::from_secs(1), None, &long_message);
        assert_eq!(store.get("c").unwrap().last_error.unwrap().len(), 100);
    }

    #[test]
    fn test_inactive_and_excluded_are_skipped() {
        let mut inactive = connection("inactive", "openai", 0);
        inactive.is_active = false;
        let store = store(vec![inactive, connection("ok", "openai", 1)]);

        assert_eq!(store.select_connection("openai", &[], None).unwrap().id, "ok");
        assert!(store.select_connection("openai", &["ok".to_string()], None).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_refreshes_coalesce() {
        let mut conn = connection("c", "test", 0);
        conn.secrets.access_token = Some("stale".into());
        conn.secrets.refresh_token = Some("rt".into());
        conn.secrets.expires_at = Some(now_ms()); // already expired
        let store = Arc::new(store(vec![conn.clone()]));
        let counting = Arc::new(CountingRefresher { calls: AtomicU32::new(0) });
        let executor: Arc<dyn Executor> = counting.clone();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let executor = executor.clone();
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                store.ensure_fresh(conn, &executor).await
            }));
        }
        for handle in handles {
            let refreshed = handle.await.unwrap();
            assert_eq!(refreshed.secrets.access_token.as_deref(), Some("fresh"));
        }

        // Every caller observed the refreshed token, but only the first
        // performed the network call.
        assert_eq!(counting.calls.load(Ordering::SeqCst), 1);
        assert!(store.get("c").unwrap().secrets.expires_at.unwrap() > now_ms());
    }
}
