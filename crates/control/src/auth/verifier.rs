// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token verification.
//!
//! Tokens signed with the server's well-known key verify locally; when a
//! remote identity service is configured, tokens that fail local
//! verification fall back to it. The verifier holds no mutable state and is
//! shared freely across tasks.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use ring::hmac;
use serde::{Deserialize, Serialize};

use crate::auth::{epoch_secs, Identity};

/// Token lifetime for locally minted access tokens.
pub const DEFAULT_ACCESS_TTL_SECS: u64 = 3600;

/// Claims carried inside a locally signed token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    /// Expiry, epoch seconds.
    exp: u64,
    /// Issued-at, epoch seconds.
    iat: u64,
}

/// Successful verification result.
#[derive(Debug, Clone)]
pub struct Verified {
    pub identity: Identity,
    /// Expiry, epoch seconds.
    pub expires_at: u64,
}

/// Why a token was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    Invalid,
    Expired,
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Invalid => f.write_str("invalid token"),
            Self::Expired => f.write_str("expired token"),
        }
    }
}

/// Response shape of the remote `/cli/validate` contract.
#[derive(Debug, Deserialize)]
struct RemoteValidation {
    valid: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    expires_at: Option<u64>,
}

/// Verifies access tokens and mints locally signed ones.
pub struct TokenVerifier {
    key: hmac::Key,
    identity_url: Option<String>,
    http: reqwest::Client,
}

impl TokenVerifier {
    /// Build a verifier from a base64url signing key. A missing key gets a
    /// random one, valid for the lifetime of this process.
    pub fn new(signing_key: Option<&str>, identity_url: Option<String>) -> anyhow::Result<Self> {
        let key_bytes = match signing_key {
            Some(encoded) => URL_SAFE_NO_PAD
                .decode(encoded)
                .map_err(|e| anyhow::anyhow!("invalid --signing-key: {e}"))?,
            None => {
                let mut bytes = [0u8; 32];
                rand::rng().fill(&mut bytes);
                bytes.to_vec()
            }
        };
        if key_bytes.len() < 16 {
            anyhow::bail!("--signing-key must decode to at least 16 bytes");
        }
        let _ = rustls::crypto::ring::default_provider().install_default();
        Ok(Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, &key_bytes),
            identity_url,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        })
    }

    /// Mint a signed access token for an identity.
    pub fn mint(&self, identity: &Identity, ttl: Duration) -> (String, u64) {
        let now = epoch_secs();
        let exp = now + ttl.as_secs();
        let claims = Claims {
            sub: identity.user_id.clone(),
            email: identity.email.clone(),
            role: identity.role.clone(),
            exp,
            iat: now,
        };
        let body = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).unwrap_or_default());
        let sig = hmac::sign(&self.key, body.as_bytes());
        (format!("{body}.{}", URL_SAFE_NO_PAD.encode(sig.as_ref())), exp)
    }

    /// Verify a token: local signature check first, remote fallback second.
    ///
    /// Expired tokens are invalid regardless of signature validity.
    pub async fn verify(&self, token: &str) -> Result<Verified, VerifyError> {
        match self.verify_local(token) {
            Ok(verified) => return Ok(verified),
            Err(VerifyError::Expired) => return Err(VerifyError::Expired),
            Err(VerifyError::Invalid) => {}
        }

        match self.identity_url {
            Some(ref base) => self.verify_remote(base, token).await,
            None => Err(VerifyError::Invalid),
        }
    }

    /// Verify a local signature without consulting the remote service.
    pub fn verify_local(&self, token: &str) -> Result<Verified, VerifyError> {
        let (body, sig) = token.split_once('.').ok_or(VerifyError::Invalid)?;
        let sig_bytes = URL_SAFE_NO_PAD.decode(sig).map_err(|_| VerifyError::Invalid)?;
        hmac::verify(&self.key, body.as_bytes(), &sig_bytes).map_err(|_| VerifyError::Invalid)?;

        let claims_bytes = URL_SAFE_NO_PAD.decode(body).map_err(|_| VerifyError::Invalid)?;
        let claims: Claims =
            serde_json::from_slice(&claims_bytes).map_err(|_| VerifyError::Invalid)?;

        if claims.exp <= epoch_secs() {
            return Err(VerifyError::Expired);
        }

        Ok(Verified {
            identity: Identity { user_id: claims.sub, email: claims.email, role: claims.role },
            expires_at: claims.exp,
        })
    }

    async fn verify_remote(&self, base: &str, token: &str) -> Result<Verified, VerifyError> {
        let url = format!("{}/cli/validate", base.trim_end_matches('/'));
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "token": token }))
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(err = %e, "identity service unreachable, treating token as invalid");
                VerifyError::Invalid
            })?;

        if !resp.status().is_success() {
            return Err(VerifyError::Invalid);
        }

        let validation: RemoteValidation = resp.json().await.map_err(|_| VerifyError::Invalid)?;
        if !validation.valid {
            return Err(VerifyError::Invalid);
        }
        let expires_at = validation.expires_at.unwrap_or_else(|| epoch_secs() + 300);
        if expires_at <= epoch_secs() {
            return Err(VerifyError::Expired);
        }

        Ok(Verified {
            identity: Identity {
                user_id: validation.user_id.ok_or(VerifyError::Invalid)?,
                email: validation.email,
                role: validation.role,
            },
            expires_at,
        })
    }

    /// Rotate an access token. Returns the replacement token, its expiry,
    /// and the new refresh token when the identity service rotated one.
    ///
    /// With a remote identity service configured, the refresh token (or,
    /// lacking one, the current access token) is sent to `/cli/refresh`.
    /// Locally, a structurally valid token is re-minted with a fresh expiry
    /// even when it has just lapsed — rotation exists precisely to renew
    /// soon-to-expire credentials.
    pub async fn refresh(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> anyhow::Result<(String, u64, Option<String>)> {
        if let Some(ref base) = self.identity_url {
            let url = format!("{}/cli/refresh", base.trim_end_matches('/'));
            let grant = refresh_token.unwrap_or(access_token);
            let resp = self
                .http
                .post(&url)
                .json(&serde_json::json!({ "refresh_token": grant }))
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                anyhow::bail!("remote refresh failed ({status})");
            }
            let token: crate::auth::TokenResponse = resp.json().await?;
            let expires_at = epoch_secs() + token.expires_in.max(60);
            return Ok((token.access_token, expires_at, token.refresh_token));
        }

        let claims = self.peek_claims(access_token)?;
        let identity =
            Identity { user_id: claims.sub, email: claims.email, role: claims.role };
        let (token, expires_at) = self.mint(&identity, Duration::from_secs(DEFAULT_ACCESS_TTL_SECS));
        Ok((token, expires_at, None))
    }

    /// Decode claims after signature verification, ignoring expiry.
    fn peek_claims(&self, token: &str) -> anyhow::Result<Claims> {
        let (body, sig) = token.split_once('.').ok_or_else(|| anyhow::anyhow!("malformed token"))?;
        let sig_bytes = URL_SAFE_NO_PAD.decode(sig)?;
        hmac::verify(&self.key, body.as_bytes(), &sig_bytes)
            .map_err(|_| anyhow::anyhow!("bad token signature"))?;
        let claims: Claims = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(body)?)?;
        Ok(claims)
    }
}

#[cfg(test)]
#[path = "verifier_tests.rs"]
mod tests;
