/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: oci.rs
 *
 * The OCI content backend. Instead of a cluster-scoped Content object, the
 * compiled manifest lives in an OCI registry; the CLI pushes it before
 * writing the bundle, and the reference travels in a per-bundle access
 * secret. The controllers only consume that reference: the secret is
 * cloned into each per-cluster namespace so agents can pull with their own
 * (possibly reduced) credentials, and deleting the last consuming
 * deployment triggers a best-effort manifest delete on the registry.
 *
 * The registry client here is deliberately thin, a single manifest-delete
 * call. The wire subtleties of real registries (uploads, token auth
 * dances) live outside this control plane.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use k8s_openapi::api::core::v1::Secret;

use crate::error::{Error, Result};

/// Keys of the per-bundle OCI access secret, written by the CLI.
pub const KEY_REFERENCE: &str = "reference";
pub const KEY_USERNAME: &str = "username";
pub const KEY_PASSWORD: &str = "password";
pub const KEY_BASIC_HTTP: &str = "basicHTTP";
pub const KEY_INSECURE_SKIP_TLS: &str = "insecureSkipTLS";
pub const KEY_AGENT_USERNAME: &str = "agentUsername";
pub const KEY_AGENT_PASSWORD: &str = "agentPassword";

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Access parameters extracted from the per-bundle secret.
#[derive(Debug, Clone, Default)]
pub struct OciAccess {
    /// `host/repository`, without scheme.
    pub reference: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub basic_http: bool,
    pub insecure_skip_tls: bool,
    pub agent_username: Option<String>,
    pub agent_password: Option<String>,
}

fn secret_str(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .and_then(|b| String::from_utf8(b.0.clone()).ok())
}

fn secret_bool(secret: &Secret, key: &str) -> bool {
    secret_str(secret, key).as_deref() == Some("true")
}

impl OciAccess {
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let reference = secret_str(secret, KEY_REFERENCE).ok_or_else(|| Error::SecretError {
            name: secret.metadata.name.clone().unwrap_or_default(),
            reason: "missing reference key".to_string(),
        })?;
        Ok(OciAccess {
            reference,
            username: secret_str(secret, KEY_USERNAME),
            password: secret_str(secret, KEY_PASSWORD),
            basic_http: secret_bool(secret, KEY_BASIC_HTTP),
            insecure_skip_tls: secret_bool(secret, KEY_INSECURE_SKIP_TLS),
            agent_username: secret_str(secret, KEY_AGENT_USERNAME),
            agent_password: secret_str(secret, KEY_AGENT_PASSWORD),
        })
    }

    /// Registry base URL and repository path.
    pub fn split(&self) -> Result<(String, String)> {
        let (host, repository) = self
            .reference
            .split_once('/')
            .ok_or_else(|| Error::OciError(format!("invalid reference {:?}", self.reference)))?;
        let scheme = if self.basic_http { "http" } else { "https" };
        Ok((format!("{scheme}://{host}"), repository.to_string()))
    }
}

/// Thin registry v2 client bound to one access secret.
pub struct OciClient {
    http: reqwest::Client,
    access: OciAccess,
}

impl OciClient {
    pub fn new(access: OciAccess) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if access.insecure_skip_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder
            .build()
            .map_err(|e| Error::OciError(format!("client construction failed: {e}")))?;
        Ok(OciClient { http, access })
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (&self.access.username, &self.access.password) {
            (Some(user), password) => req.basic_auth(user, password.as_deref()),
            _ => req,
        }
    }

    /// Best-effort manifest delete for the last consumer.
    pub async fn delete_manifest(&self, manifest_id: &str) -> Result<()> {
        let (base, repository) = self.access.split()?;

        // Registries require deletion by digest; resolve the tag first.
        let head = self
            .authed(
                self.http
                    .head(format!("{base}/v2/{repository}/manifests/{manifest_id}")),
            )
            .header(reqwest::header::ACCEPT, MANIFEST_MEDIA_TYPE)
            .send()
            .await
            .map_err(|e| Error::OciError(format!("manifest lookup failed: {e}")))?;
        let digest = head
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| Error::OciError("registry returned no content digest".to_string()))?
            .to_string();

        let response = self
            .authed(
                self.http
                    .delete(format!("{base}/v2/{repository}/manifests/{digest}")),
            )
            .send()
            .await
            .map_err(|e| Error::OciError(format!("manifest delete failed: {e}")))?;
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(Error::OciError(format!(
                "manifest delete rejected: {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(pairs: &[(&str, &str)]) -> Secret {
        let data: BTreeMap<String, ByteString> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect();
        Secret {
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn access_from_secret() {
        let s = secret(&[
            (KEY_REFERENCE, "registry.example.com/fleet"),
            (KEY_USERNAME, "ci"),
            (KEY_PASSWORD, "hunter2"),
            (KEY_INSECURE_SKIP_TLS, "true"),
        ]);
        let access = OciAccess::from_secret(&s).unwrap();
        assert_eq!(access.reference, "registry.example.com/fleet");
        assert_eq!(access.username.as_deref(), Some("ci"));
        assert!(access.insecure_skip_tls);
        assert!(!access.basic_http);

        let (base, repo) = access.split().unwrap();
        assert_eq!(base, "https://registry.example.com");
        assert_eq!(repo, "fleet");
    }

    #[test]
    fn missing_reference_is_an_error() {
        let s = secret(&[(KEY_USERNAME, "ci")]);
        assert!(OciAccess::from_secret(&s).is_err());
    }

    #[test]
    fn basic_http_selects_plain_scheme() {
        let s = secret(&[
            (KEY_REFERENCE, "registry.local:5000/fleet/bundles"),
            (KEY_BASIC_HTTP, "true"),
        ]);
        let access = OciAccess::from_secret(&s).unwrap();
        let (base, repo) = access.split().unwrap();
        assert_eq!(base, "http://registry.local:5000");
        assert_eq!(repo, "fleet/bundles");
    }
}
