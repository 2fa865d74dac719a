// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! MCP server lifecycle: spawn, handshake, health checks, crash restarts.
//!
//! Each configured server runs through the state machine
//! `disconnected → connecting → connected → error → disconnected`.  A
//! monitor task watches the child process; an exit outside shutdown
//! schedules an exponential-backoff reconnect while the restart budget
//! lasts.  Failed health pings kill the child, which funnels into the same
//! exit path.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{McpClient, McpError, DEFAULT_REQUEST_TIMEOUT};
use crate::protocol::{McpToolDef, ToolCallResult};

pub const DEFAULT_MAX_RESTARTS: u32 = 3;
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Cap for one reconnect delay.
const MAX_RESTART_DELAY_MS: u64 = 30_000;

/// How long the graceful `shutdown` RPC may take before the child is killed
/// anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub restart_on_crash: bool,
    pub max_restarts: u32,
    /// `None` disables the periodic health ping.
    pub health_check_interval: Option<Duration>,
    pub request_timeout: Duration,
}

impl McpServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            restart_on_crash: true,
            max_restarts: DEFAULT_MAX_RESTARTS,
            health_check_interval: Some(DEFAULT_HEALTH_CHECK_INTERVAL),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Reconnect delay for attempt `n` (1-based): `min(1s · 2^(n-1), 30s)`.
pub fn restart_delay(attempt: u32) -> Duration {
    let ms = 1000u64
        .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(31))
        .min(MAX_RESTART_DELAY_MS);
    Duration::from_millis(ms)
}

struct ManagedServer {
    name: String,
    config: McpServerConfig,
    state: Mutex<ServerState>,
    client: Mutex<Option<Arc<McpClient>>>,
    tools: Mutex<Vec<McpToolDef>>,
    /// Counts automatic reconnects since the last caller-initiated connect.
    restart_count: AtomicU32,
    shutting_down: AtomicBool,
    kill_tx: Mutex<Option<mpsc::Sender<()>>>,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedServer {
    fn new(name: String, config: McpServerConfig) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(ServerState::Disconnected),
            client: Mutex::new(None),
            tools: Mutex::new(Vec::new()),
            restart_count: AtomicU32::new(0),
            shutting_down: AtomicBool::new(false),
            kill_tx: Mutex::new(None),
            health_task: Mutex::new(None),
        }
    }

    fn set_state(&self, state: ServerState) {
        *self.state.lock().expect("state lock poisoned") = state;
    }

    fn state(&self) -> ServerState {
        *self.state.lock().expect("state lock poisoned")
    }

    /// Spawn the child, run the handshake, cache the tool list, and start
    /// the monitor and health tasks.
    async fn connect(this: &Arc<Self>) -> Result<(), McpError> {
        if this.shutting_down.load(Ordering::SeqCst) {
            return Err(McpError::ServerUnavailable(this.name.clone()));
        }
        this.set_state(ServerState::Connecting);

        let mut cmd = Command::new(&this.config.command);
        cmd.args(&this.config.args)
            .envs(&this.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                warn!(server = %this.name, error = %e, "failed to spawn MCP server");
                this.set_state(ServerState::Error);
                return Err(McpError::Io(e));
            }
        };

        let stdin = child.stdin.take().ok_or_else(|| {
            McpError::Protocol("child stdin was not captured".into())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::Protocol("child stdout was not captured".into())
        })?;
        let client = Arc::new(McpClient::new(stdin, stdout, this.config.request_timeout));

        if let Err(e) = client.initialize().await {
            warn!(server = %this.name, error = %e, "MCP handshake failed");
            let _ = child.start_kill();
            this.set_state(ServerState::Error);
            return Err(e);
        }

        let tools = match client.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                warn!(server = %this.name, error = %e, "tools/list failed; serving no tools");
                Vec::new()
            }
        };
        info!(server = %this.name, tool_count = tools.len(), "MCP server connected");

        *this.client.lock().expect("client lock poisoned") = Some(Arc::clone(&client));
        *this.tools.lock().expect("tools lock poisoned") = tools;
        this.set_state(ServerState::Connected);

        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        *this.kill_tx.lock().expect("kill_tx lock poisoned") = Some(kill_tx.clone());

        // Monitor: wait for natural exit or a kill request, then route both
        // through the shared exit path.
        let monitor = Arc::clone(this);
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    debug!(server = %monitor.name, ?status, "MCP child exited");
                }
                _ = kill_rx.recv() => {
                    let _ = child.kill().await;
                }
            }
            ManagedServer::handle_exit(monitor);
        });

        // Health: periodic ping; a failed ping kills the child, which the
        // monitor turns into the exit/restart path.
        if let Some(interval) = this.config.health_check_interval {
            let health = Arc::clone(this);
            let health_client = client;
            let health_kill = kill_tx;
            let task = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if health.shutting_down.load(Ordering::SeqCst) || !health_client.is_alive() {
                        break;
                    }
                    if let Err(e) = health_client.ping().await {
                        warn!(server = %health.name, error = %e, "health check failed; killing server");
                        let _ = health_kill.send(()).await;
                        break;
                    }
                }
            });
            if let Some(old) = this
                .health_task
                .lock()
                .expect("health task lock poisoned")
                .replace(task)
            {
                old.abort();
            }
        }

        Ok(())
    }

    /// Shared exit path for crashes, health-kills, and shutdown kills.
    fn handle_exit(this: Arc<Self>) {
        this.set_state(ServerState::Disconnected);
        *this.client.lock().expect("client lock poisoned") = None;

        if this.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if !this.config.restart_on_crash {
            return;
        }
        let performed = this.restart_count.load(Ordering::SeqCst);
        if performed >= this.config.max_restarts {
            warn!(
                server = %this.name,
                restarts = performed,
                "restart limit reached; staying disconnected"
            );
            return;
        }
        let attempt = performed + 1;
        this.restart_count.store(attempt, Ordering::SeqCst);
        let delay = restart_delay(attempt);
        info!(server = %this.name, attempt, ?delay, "scheduling MCP reconnect");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            if let Err(e) = ManagedServer::connect(&this).await {
                warn!(server = %this.name, error = %e, "MCP reconnect failed");
            }
        });
    }

    async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Some(task) = self
            .health_task
            .lock()
            .expect("health task lock poisoned")
            .take()
        {
            task.abort();
        }
        let client = self.client.lock().expect("client lock poisoned").clone();
        if let Some(client) = client {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, client.shutdown()).await;
        }
        let kill_tx = self.kill_tx.lock().expect("kill_tx lock poisoned").take();
        if let Some(tx) = kill_tx {
            let _ = tx.send(()).await;
        }
        self.set_state(ServerState::Disconnected);
    }
}

/// Process-wide table of managed MCP servers.
#[derive(Default)]
pub struct McpServerManager {
    servers: Mutex<HashMap<String, Arc<ManagedServer>>>,
}

impl McpServerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_server(&self, name: impl Into<String>, config: McpServerConfig) {
        let name = name.into();
        self.servers
            .lock()
            .expect("server table poisoned")
            .insert(name.clone(), Arc::new(ManagedServer::new(name, config)));
    }

    fn get(&self, name: &str) -> Option<Arc<ManagedServer>> {
        self.servers
            .lock()
            .expect("server table poisoned")
            .get(name)
            .cloned()
    }

    /// Caller-initiated connect.  Resets the restart budget; automatic
    /// crash reconnects do not.
    pub async fn connect(&self, name: &str) -> Result<(), McpError> {
        let server = self
            .get(name)
            .ok_or_else(|| McpError::ServerUnavailable(name.to_string()))?;
        server.restart_count.store(0, Ordering::SeqCst);
        ManagedServer::connect(&server).await
    }

    pub fn state(&self, name: &str) -> Option<ServerState> {
        self.get(name).map(|s| s.state())
    }

    pub fn restart_count(&self, name: &str) -> Option<u32> {
        self.get(name).map(|s| s.restart_count.load(Ordering::SeqCst))
    }

    /// Cached tool definitions of one server (from connect time).
    pub fn tools(&self, name: &str) -> Vec<McpToolDef> {
        self.get(name)
            .map(|s| s.tools.lock().expect("tools lock poisoned").clone())
            .unwrap_or_default()
    }

    /// `(server, tool)` pairs for every currently-connected server.
    pub fn connected_tools(&self) -> Vec<(String, McpToolDef)> {
        let servers: Vec<Arc<ManagedServer>> = self
            .servers
            .lock()
            .expect("server table poisoned")
            .values()
            .cloned()
            .collect();
        let mut out = Vec::new();
        for server in servers {
            if server.state() != ServerState::Connected {
                continue;
            }
            for tool in server.tools.lock().expect("tools lock poisoned").iter() {
                out.push((server.name.clone(), tool.clone()));
            }
        }
        out.sort_by(|a, b| (&a.0, &a.1.name).cmp(&(&b.0, &b.1.name)));
        out
    }

    pub async fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, McpError> {
        let entry = self
            .get(server)
            .ok_or_else(|| McpError::ServerUnavailable(server.to_string()))?;
        let client = {
            if entry.state() != ServerState::Connected {
                return Err(McpError::ServerUnavailable(server.to_string()));
            }
            entry
                .client
                .lock()
                .expect("client lock poisoned")
                .clone()
                .ok_or_else(|| McpError::ServerUnavailable(server.to_string()))?
        };
        if !client.is_alive() {
            return Err(McpError::ServerUnavailable(server.to_string()));
        }
        client.call_tool(tool, arguments).await
    }

    pub async fn shutdown(&self, name: &str) {
        if let Some(server) = self.get(name) {
            server.shutdown().await;
        }
    }

    pub async fn shutdown_all(&self) {
        let servers: Vec<Arc<ManagedServer>> = self
            .servers
            .lock()
            .expect("server table poisoned")
            .values()
            .cloned()
            .collect();
        for server in servers {
            server.shutdown().await;
        }
    }
}

// ─── Unit tests ───────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// A bash MCP server that answers the handshake and then keeps serving
    /// tools/call and ping until stdin closes.
    const SERVING_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"id"'*) id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/');;
    *) continue;;
  esac
  case "$line" in
    *'"initialize"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{},\"serverInfo\":{\"name\":\"t\",\"version\":\"0\"}}}";;
    *'"tools/list"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[{\"name\":\"echo\",\"description\":\"echoes\",\"inputSchema\":{\"type\":\"object\"}}]}}";;
    *'"tools/call"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"from-mcp\"}]}}";;
    *'"ping"'*|*'"shutdown"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{}}";;
  esac
done
"#;

    /// Handshake, then exit — a server that crashes right after connecting.
    const CRASHING_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"id"'*) id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/');;
    *) continue;;
  esac
  case "$line" in
    *'"initialize"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{},\"serverInfo\":{\"name\":\"t\",\"version\":\"0\"}}}";;
    *'"tools/list"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[]}}"
      exit 0;;
  esac
done
"#;

    fn bash_config(script: &str) -> McpServerConfig {
        McpServerConfig::new("bash")
            .with_args(["-c", script])
    }

    // ── Backoff formula ───────────────────────────────────────────────────────

    #[test]
    fn restart_delay_doubles_and_caps() {
        assert_eq!(restart_delay(1), Duration::from_millis(1000));
        assert_eq!(restart_delay(2), Duration::from_millis(2000));
        assert_eq!(restart_delay(3), Duration::from_millis(4000));
        assert_eq!(restart_delay(6), Duration::from_millis(30000));
        assert_eq!(restart_delay(40), Duration::from_millis(30000));
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn connect_discovers_tools_and_serves_calls() {
        let manager = McpServerManager::new();
        let mut config = bash_config(SERVING_SCRIPT);
        config.health_check_interval = None;
        manager.add_server("fake", config);

        manager.connect("fake").await.unwrap();
        assert_eq!(manager.state("fake"), Some(ServerState::Connected));
        let tools = manager.tools("fake");
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = manager
            .call_tool("fake", "echo", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result.text(), "from-mcp");

        manager.shutdown_all().await;
        assert_eq!(manager.state("fake"), Some(ServerState::Disconnected));
    }

    #[tokio::test]
    async fn connect_to_missing_command_sets_error_state() {
        let manager = McpServerManager::new();
        manager.add_server(
            "ghost",
            McpServerConfig::new("/nonexistent/capstan-mcp-test-binary"),
        );
        let err = manager.connect("ghost").await;
        assert!(err.is_err());
        assert_eq!(manager.state("ghost"), Some(ServerState::Error));
    }

    #[tokio::test]
    async fn call_tool_on_disconnected_server_is_unavailable() {
        let manager = McpServerManager::new();
        manager.add_server("idle", bash_config(SERVING_SCRIPT));
        let err = manager
            .call_tool("idle", "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerUnavailable(name) if name == "idle"));
    }

    #[tokio::test]
    async fn call_tool_on_unknown_server_is_unavailable() {
        let manager = McpServerManager::new();
        let err = manager
            .call_tool("nope", "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerUnavailable(_)));
    }

    // ── Crash restarts ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn crash_restarts_stop_at_limit_and_leave_disconnected() {
        let manager = McpServerManager::new();
        let mut config = bash_config(CRASHING_SCRIPT);
        config.max_restarts = 2;
        config.health_check_interval = None;
        manager.add_server("crashy", config);

        manager.connect("crashy").await.unwrap();

        // Exit #1 → reconnect after 1s; exit #2 → reconnect after 2s;
        // exit #3 → budget exhausted.  Allow generous slack for process
        // startup on a loaded machine.
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(manager.restart_count("crashy"), Some(2));
        assert_eq!(manager.state("crashy"), Some(ServerState::Disconnected));

        let err = manager
            .call_tool("crashy", "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerUnavailable(_)));
        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn explicit_connect_resets_restart_budget() {
        let manager = McpServerManager::new();
        let mut config = bash_config(SERVING_SCRIPT);
        config.health_check_interval = None;
        manager.add_server("fake", config);
        manager.connect("fake").await.unwrap();

        // Simulate a consumed budget, then reconnect explicitly.
        manager
            .get("fake")
            .unwrap()
            .restart_count
            .store(3, Ordering::SeqCst);
        manager.shutdown("fake").await;
        manager
            .get("fake")
            .unwrap()
            .shutting_down
            .store(false, Ordering::SeqCst);

        manager.connect("fake").await.unwrap();
        assert_eq!(manager.restart_count("fake"), Some(0));
        manager.shutdown_all().await;
    }

    // ── Health checks ─────────────────────────────────────────────────────────

    /// Answers the handshake, then goes silent: pings time out.
    const DEAF_SCRIPT: &str = r#"
while IFS= read -r line; do
  case "$line" in
    *'"id"'*) id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/');;
    *) continue;;
  esac
  case "$line" in
    *'"initialize"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{},\"serverInfo\":{\"name\":\"t\",\"version\":\"0\"}}}";;
    *'"tools/list"'*)
      printf '%s\n' "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[]}}";;
  esac
done
"#;

    #[tokio::test]
    async fn failed_health_ping_kills_the_server() {
        let manager = McpServerManager::new();
        let mut config = bash_config(DEAF_SCRIPT);
        config.health_check_interval = Some(Duration::from_millis(100));
        config.request_timeout = Duration::from_millis(200);
        config.restart_on_crash = false;
        manager.add_server("deaf", config);

        manager.connect("deaf").await.unwrap();
        assert_eq!(manager.state("deaf"), Some(ServerState::Connected));

        // First ping fires at ~100ms and times out at ~300ms; the kill and
        // exit handling follow.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.state("deaf"), Some(ServerState::Disconnected));
        manager.shutdown_all().await;
    }
}
