/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: mod.rs
 *
 * Remote git access for the GitRepo poller. The poller never clones
 * in-process; cloning happens inside Kubernetes Jobs. What it does need is
 * an `ls-remote` equivalent: connect to the remote over HTTPS or SSH with
 * credentials from a Kubernetes secret, list the advertised refs, and
 * resolve the configured branch or revision to a commit ID.
 *
 * The listing is a blocking libgit2 call; callers run it on the blocking
 * thread pool so reconcilers never stall the runtime.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use git2::{Cred, Direction, Remote, RemoteCallbacks};
use k8s_openapi::api::core::v1::Secret;

use crate::error::{Error, Result};

/// Credentials extracted from a BasicAuth or SSHAuth secret.
#[derive(Debug, Clone, Default)]
pub struct GitAuth {
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_private_key: Option<String>,
    pub known_hosts: Option<String>,
    pub insecure_skip_tls: bool,
}

impl GitAuth {
    /// Read the well-known keys of a git credential secret. BasicAuth
    /// secrets carry `username`/`password`, SSHAuth secrets carry
    /// `ssh-privatekey` and optionally `known_hosts`.
    pub fn from_secret(secret: &Secret, insecure_skip_tls: bool) -> Self {
        let get = |key: &str| {
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .and_then(|b| String::from_utf8(b.0.clone()).ok())
        };
        GitAuth {
            username: get("username"),
            password: get("password"),
            ssh_private_key: get("ssh-privatekey"),
            known_hosts: get("known_hosts"),
            insecure_skip_tls,
        }
    }
}

/// What the poller asks for: a branch to follow or an exact revision.
#[derive(Debug, Clone)]
pub enum RefSpec {
    Branch(String),
    Revision(String),
}

impl RefSpec {
    pub fn from_spec(branch: Option<&str>, revision: Option<&str>) -> Self {
        match revision {
            Some(rev) if !rev.is_empty() => RefSpec::Revision(rev.to_string()),
            _ => RefSpec::Branch(
                branch
                    .filter(|b| !b.is_empty())
                    .unwrap_or("master")
                    .to_string(),
            ),
        }
    }
}

fn callbacks(auth: &GitAuth) -> RemoteCallbacks<'_> {
    let mut cbs = RemoteCallbacks::new();

    let auth = auth.clone();
    cbs.credentials(move |_url, username_from_url, _allowed| {
        if let Some(key) = &auth.ssh_private_key {
            let user = auth
                .username
                .as_deref()
                .or(username_from_url)
                .unwrap_or("git");
            return Cred::ssh_key_from_memory(user, None, key, None);
        }
        if let (Some(user), Some(password)) = (&auth.username, &auth.password) {
            return Cred::userpass_plaintext(user, password);
        }
        Cred::default()
    });

    cbs
}

/// Resolve the latest commit for `refspec` on `url`, `git ls-remote` style.
///
/// Branch names resolve through `refs/heads/`, revisions first try an exact
/// ref (tag or fully qualified), then fall back to treating the revision as
/// a commit ID already.
pub fn latest_commit(url: &str, refspec: &RefSpec, auth: &GitAuth) -> Result<String> {
    let mut remote = Remote::create_detached(url)?;
    let mut cbs = callbacks(auth);
    if auth.insecure_skip_tls {
        cbs.certificate_check(|_cert, _host| true);
    }
    let connection = remote.connect_auth(Direction::Fetch, Some(cbs), None)?;

    let heads = connection.list()?;

    match refspec {
        RefSpec::Branch(branch) => {
            let wanted = format!("refs/heads/{branch}");
            for head in heads {
                if head.name() == wanted {
                    return Ok(head.oid().to_string());
                }
            }
            Err(Error::RetryableError(format!(
                "remote has no branch {branch:?}"
            )))
        }
        RefSpec::Revision(revision) => {
            let tag = format!("refs/tags/{revision}");
            for head in heads {
                if head.name() == revision.as_str() || head.name() == tag {
                    return Ok(head.oid().to_string());
                }
            }
            // A 40-char hex revision is already a commit ID.
            if revision.len() == 40 && revision.chars().all(|c| c.is_ascii_hexdigit()) {
                return Ok(revision.clone());
            }
            Err(Error::RetryableError(format!(
                "remote has no revision {revision:?}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    #[test]
    fn refspec_prefers_revision_over_branch() {
        match RefSpec::from_spec(Some("main"), Some("v1.2.3")) {
            RefSpec::Revision(rev) => assert_eq!(rev, "v1.2.3"),
            other => panic!("expected revision, got {other:?}"),
        }
        match RefSpec::from_spec(Some("main"), None) {
            RefSpec::Branch(branch) => assert_eq!(branch, "main"),
            other => panic!("expected branch, got {other:?}"),
        }
        match RefSpec::from_spec(None, None) {
            RefSpec::Branch(branch) => assert_eq!(branch, "master"),
            other => panic!("expected branch, got {other:?}"),
        }
    }

    #[test]
    fn auth_from_secret_reads_basic_and_ssh_keys() {
        let data: BTreeMap<String, ByteString> = [
            ("username".to_string(), ByteString(b"bot".to_vec())),
            ("password".to_string(), ByteString(b"token".to_vec())),
        ]
        .into();
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };
        let auth = GitAuth::from_secret(&secret, false);
        assert_eq!(auth.username.as_deref(), Some("bot"));
        assert_eq!(auth.password.as_deref(), Some("token"));
        assert!(auth.ssh_private_key.is_none());
    }
}
