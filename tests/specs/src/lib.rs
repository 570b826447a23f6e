// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end scenario tests.
//!
//! Spawns the real `droverd` binary as a subprocess and drives it with
//! WebSocket agents and dashboards plus the HTTP API.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use droverd::auth::verifier::TokenVerifier;
use droverd::auth::Identity;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Fixed HMAC key shared by the spawned server and the test token mint.
const SIGNING_KEY_BYTES: &[u8; 32] = b"spec-harness-key-0123456789abcde";

/// The `--signing-key` value for the spawned server.
pub fn signing_key() -> String {
    URL_SAFE_NO_PAD.encode(SIGNING_KEY_BYTES)
}

/// Mint an access token the spawned server will accept.
pub fn mint_token(user_id: &str, ttl: Duration) -> anyhow::Result<String> {
    let verifier = TokenVerifier::new(Some(&signing_key()), None)?;
    let identity = Identity { user_id: user_id.to_owned(), email: None, role: None };
    Ok(verifier.mint(&identity, ttl).0)
}

/// Resolve the path to the compiled `droverd` binary.
pub fn droverd_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("droverd")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `droverd` process that is killed on drop.
pub struct DroverProcess {
    child: Child,
    port: u16,
}

impl DroverProcess {
    /// Spawn droverd on a free port with the harness signing key.
    pub fn start(extra_env: &[(&str, &str)]) -> anyhow::Result<Self> {
        ensure_crypto();
        let binary = droverd_binary();
        anyhow::ensure!(binary.exists(), "droverd binary not found at {}", binary.display());

        let port = free_port()?;
        let mut command = Command::new(&binary);
        command
            .args([
                "--host",
                "127.0.0.1",
                "--port",
                &port.to_string(),
                "--signing-key",
                &signing_key(),
            ])
            .env("RUST_LOG", "warn")
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        for (key, value) in extra_env {
            command.env(key, value);
        }
        let child = command.spawn()?;

        Ok(Self { child, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Poll health until responsive.
    pub async fn wait_healthy(&self, timeout: Duration) -> anyhow::Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let client = reqwest::Client::new();
        let url = format!("{}/api/v1/health", self.base_url());
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("droverd did not become healthy within {timeout:?}");
            }
            if let Ok(resp) = client.get(&url).send().await {
                if resp.status().is_success() {
                    return Ok(());
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(
        &mut self,
        timeout: Duration,
    ) -> anyhow::Result<std::process::ExitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("droverd did not exit within {timeout:?}");
            }
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for DroverProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// -- WebSocket client ----------------------------------------------------------

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// A framed WebSocket client speaking the control-plane envelope.
pub struct WsClient {
    stream: WsStream,
    msg_counter: u64,
}

impl WsClient {
    /// Connect, optionally attaching upgrade query parameters
    /// (e.g. `?token=...&agents=all`).
    pub async fn connect(server: &DroverProcess, query: &str) -> anyhow::Result<Self> {
        let url = format!("{}{query}", server.ws_url());
        let (stream, _) = tokio_tungstenite::connect_async(&url).await?;
        Ok(Self { stream, msg_counter: 0 })
    }

    /// Connect and authenticate as an agent. Returns only after the server
    /// has processed the handshake (frames on one connection are handled in
    /// order, so an answered ping proves the connect went through).
    pub async fn connect_agent(server: &DroverProcess, agent_id: &str) -> anyhow::Result<Self> {
        let token = mint_token(&format!("svc-{agent_id}"), Duration::from_secs(3600))?;
        let mut client = Self::connect(server, "").await?;
        client
            .send(
                "AGENT_CONNECT",
                serde_json::json!({
                    "agentId": agent_id,
                    "token": token,
                    "version": "1.0.0",
                    "capabilities": ["shell"],
                }),
            )
            .await?;
        client.send("PING", serde_json::json!({"timestamp": 0})).await?;
        client.expect("PONG", Duration::from_secs(10)).await?;
        Ok(client)
    }

    /// Connect and authenticate as a dashboard subscribed to all agents.
    pub async fn connect_dashboard(server: &DroverProcess, user_id: &str) -> anyhow::Result<Self> {
        let token = mint_token(user_id, Duration::from_secs(3600))?;
        Self::connect(server, &format!("?token={token}&agents=all")).await
    }

    /// Send one envelope.
    pub async fn send(&mut self, kind: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        self.msg_counter += 1;
        let frame = serde_json::json!({
            "type": kind,
            "id": format!("client-{}", self.msg_counter),
            "timestamp": 1_700_000_000_000u64,
            "payload": payload,
        });
        self.stream.send(Message::Text(frame.to_string().into())).await?;
        Ok(())
    }

    /// Read frames until one of the wanted type arrives, skipping others
    /// (server pings included).
    pub async fn expect(&mut self, kind: &str, timeout: Duration) -> anyhow::Result<serde_json::Value> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            anyhow::ensure!(!remaining.is_zero(), "timed out waiting for {kind}");
            let msg = tokio::time::timeout(remaining, self.stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for {kind}"))?
                .ok_or_else(|| anyhow::anyhow!("socket closed waiting for {kind}"))?;
            if let Message::Text(text) = msg? {
                let value: serde_json::Value = serde_json::from_str(&text)?;
                if value["type"] == kind {
                    return Ok(value);
                }
            }
        }
    }

    /// Collect every already-delivered frame of the wanted type until the
    /// stream stays quiet for `idle`.
    pub async fn collect(
        &mut self,
        kind: &str,
        idle: Duration,
    ) -> anyhow::Result<Vec<serde_json::Value>> {
        let mut frames = Vec::new();
        loop {
            match tokio::time::timeout(idle, self.stream.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    let value: serde_json::Value = serde_json::from_str(&text)?;
                    if value["type"] == kind {
                        frames.push(value);
                    }
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) | Err(_) => return Ok(frames),
            }
        }
    }
}
