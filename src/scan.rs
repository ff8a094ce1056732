/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/scan.rs
* In-process registry of scheduled image-scan tickets. The scan executor
* itself is external; the GitRepo reconciler registers the scans attached
* to a repo so the deletion cascade can drain them (and drop the
* schedule finalizer) before the repo's own finalizer clears.
* SPDX-License-Identifier: Apache-2.0 */

use lazy_static::lazy_static;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

lazy_static! {
    /// `namespace/repo` -> scheduled scan names.
    static ref SCHEDULES: Mutex<HashMap<String, HashSet<String>>> = Mutex::new(HashMap::new());
}

fn repo_key(namespace: &str, repo: &str) -> String {
    format!("{namespace}/{repo}")
}

fn lock() -> std::sync::MutexGuard<'static, HashMap<String, HashSet<String>>> {
    match SCHEDULES.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Record a scan ticket for a repo; idempotent.
pub fn register(namespace: &str, repo: &str, scan: &str) {
    lock()
        .entry(repo_key(namespace, repo))
        .or_default()
        .insert(scan.to_string());
}

/// Drop all tickets for a repo, returning the scan names that were
/// scheduled. Used by the deletion cascade.
pub fn drain(namespace: &str, repo: &str) -> Vec<String> {
    lock()
        .remove(&repo_key(namespace, repo))
        .map(|set| {
            let mut names: Vec<String> = set.into_iter().collect();
            names.sort();
            names
        })
        .unwrap_or_default()
}

/// Tickets currently held for a repo.
pub fn scheduled(namespace: &str, repo: &str) -> Vec<String> {
    lock()
        .get(&repo_key(namespace, repo))
        .map(|set| {
            let mut names: Vec<String> = set.iter().cloned().collect();
            names.sort();
            names
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_drain() {
        register("fleet-default", "repo-a", "scan-1");
        register("fleet-default", "repo-a", "scan-2");
        register("fleet-default", "repo-a", "scan-2");
        register("fleet-default", "repo-b", "scan-3");

        assert_eq!(scheduled("fleet-default", "repo-a"), vec!["scan-1", "scan-2"]);
        assert_eq!(drain("fleet-default", "repo-a"), vec!["scan-1", "scan-2"]);
        assert!(scheduled("fleet-default", "repo-a").is_empty());
        // Other repos are untouched.
        assert_eq!(scheduled("fleet-default", "repo-b"), vec!["scan-3"]);
        drain("fleet-default", "repo-b");
    }
}
