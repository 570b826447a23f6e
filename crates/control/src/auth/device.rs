// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Server side of the OAuth 2.0 Device Authorization Grant (RFC 8628),
//! backing CLI sign-in. Grants live in memory; approved grants become
//! HMAC-signed access tokens plus a rotating refresh grant.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::auth::verifier::{TokenVerifier, DEFAULT_ACCESS_TTL_SECS};
use crate::auth::{Identity, TokenResponse};

/// Device code lifetime.
const DEVICE_CODE_TTL: Duration = Duration::from_secs(900);
/// Minimum interval between token polls.
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Unambiguous alphabet for user codes (no vowels, no 0/O or 1/I).
const USER_CODE_ALPHABET: &[u8] = b"BCDFGHJKLMNPQRSTVWXZ23456789";

/// Response to `POST /device/authorize`.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: String,
    pub expires_in: u64,
    pub interval: u64,
}

/// Outcome of a `POST /device/token` poll.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Pending,
    SlowDown,
    Expired,
    Approved(TokenResponse),
}

impl PollOutcome {
    /// RFC 8628 error tag for non-approved outcomes.
    pub fn error_tag(&self) -> Option<&'static str> {
        match self {
            Self::Pending => Some("authorization_pending"),
            Self::SlowDown => Some("slow_down"),
            Self::Expired => Some("expired_token"),
            Self::Approved(_) => None,
        }
    }
}

struct Grant {
    user_code: String,
    expires_at: tokio::time::Instant,
    last_poll: Option<tokio::time::Instant>,
    approved_by: Option<Identity>,
}

/// In-memory device-authorization grants and CLI refresh grants.
pub struct DeviceAuthStore {
    verifier: Arc<TokenVerifier>,
    /// Pending grants keyed by device code.
    grants: RwLock<HashMap<String, Grant>>,
    /// Active refresh grants: refresh token → identity.
    refresh_grants: RwLock<HashMap<String, Identity>>,
}

impl DeviceAuthStore {
    pub fn new(verifier: Arc<TokenVerifier>) -> Self {
        Self {
            verifier,
            grants: RwLock::new(HashMap::new()),
            refresh_grants: RwLock::new(HashMap::new()),
        }
    }

    /// Begin a device authorization. `base_url` is the externally visible
    /// address used to build verification URIs.
    pub async fn authorize(&self, base_url: &str) -> DeviceAuthorization {
        let device_code = random_token();
        let user_code = random_user_code();

        let mut grants = self.grants.write().await;
        grants.retain(|_, g| g.expires_at > tokio::time::Instant::now());
        grants.insert(
            device_code.clone(),
            Grant {
                user_code: user_code.clone(),
                expires_at: tokio::time::Instant::now() + DEVICE_CODE_TTL,
                last_poll: None,
                approved_by: None,
            },
        );

        let verification_uri = format!("{}/device", base_url.trim_end_matches('/'));
        DeviceAuthorization {
            verification_uri_complete: format!("{verification_uri}?user_code={user_code}"),
            verification_uri,
            device_code,
            user_code,
            expires_in: DEVICE_CODE_TTL.as_secs(),
            interval: POLL_INTERVAL.as_secs(),
        }
    }

    /// Approve a pending grant by user code. Returns false when no live
    /// grant matches.
    pub async fn approve(&self, user_code: &str, identity: Identity) -> bool {
        let mut grants = self.grants.write().await;
        let now = tokio::time::Instant::now();
        for grant in grants.values_mut() {
            if grant.user_code == user_code && grant.expires_at > now {
                grant.approved_by = Some(identity);
                return true;
            }
        }
        false
    }

    /// Poll a device code for tokens.
    pub async fn poll(&self, device_code: &str) -> PollOutcome {
        let mut grants = self.grants.write().await;
        let now = tokio::time::Instant::now();

        let Some(grant) = grants.get_mut(device_code) else {
            return PollOutcome::Expired;
        };
        if grant.expires_at <= now {
            grants.remove(device_code);
            return PollOutcome::Expired;
        }
        if let Some(last) = grant.last_poll {
            if now.duration_since(last) < POLL_INTERVAL {
                grant.last_poll = Some(now);
                return PollOutcome::SlowDown;
            }
        }
        grant.last_poll = Some(now);

        let Some(identity) = grant.approved_by.clone() else {
            return PollOutcome::Pending;
        };
        grants.remove(device_code);
        drop(grants);

        PollOutcome::Approved(self.issue(identity).await)
    }

    /// Rotate a refresh grant. The old token is consumed.
    pub async fn refresh(&self, refresh_token: &str) -> Option<TokenResponse> {
        let identity = self.refresh_grants.write().await.remove(refresh_token)?;
        Some(self.issue(identity).await)
    }

    /// Revoke a refresh grant. Idempotent.
    pub async fn revoke(&self, refresh_token: &str) -> bool {
        self.refresh_grants.write().await.remove(refresh_token).is_some()
    }

    async fn issue(&self, identity: Identity) -> TokenResponse {
        let (access_token, _) =
            self.verifier.mint(&identity, Duration::from_secs(DEFAULT_ACCESS_TTL_SECS));
        let refresh_token = random_token();
        self.refresh_grants.write().await.insert(refresh_token.clone(), identity);
        TokenResponse {
            access_token,
            refresh_token: Some(refresh_token),
            expires_in: DEFAULT_ACCESS_TTL_SECS,
            token_type: Some("Bearer".to_owned()),
        }
    }
}

fn random_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a user code formatted `XXXX-XXXX`.
fn random_user_code() -> String {
    let mut rng = rand::rng();
    let mut code = String::with_capacity(9);
    for i in 0..8 {
        if i == 4 {
            code.push('-');
        }
        let idx = rng.random_range(0..USER_CODE_ALPHABET.len());
        code.push(USER_CODE_ALPHABET[idx] as char);
    }
    code
}

#[cfg(test)]
#[path = "device_tests.rs"]
mod tests;
