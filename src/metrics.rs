/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: metrics.rs
 *
 * The metric surface: a process-wide Prometheus registry initialized before
 * the controllers start, with per-object counter/gauge/histogram vectors
 * labeled by name and namespace. Label sets are removed when their object
 * is deleted so the registry does not grow without bound.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::summary::BundleState;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Wall time of git clone jobs, stamped when a job finishes.
    pub static ref GITJOB_DURATION: HistogramVec = {
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "fleet_gitjob_duration_seconds",
                "Duration of git clone jobs from creation to completion",
            ),
            &["name", "namespace"],
        )
        .expect("valid metric definition");
        REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("metric registration");
        histogram
    };

    /// Latency of the ls-remote equivalent behind the poller.
    pub static ref FETCH_DURATION: HistogramVec = {
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "fleet_gitrepo_fetch_latest_commit_duration_seconds",
                "Duration of latest-commit fetches against git remotes",
            ),
            &["name", "namespace"],
        )
        .expect("valid metric definition");
        REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("metric registration");
        histogram
    };

    /// Poll outcomes, labeled success/fail.
    pub static ref FETCH_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new(
                "fleet_gitrepo_fetch_latest_commit_total",
                "Latest-commit fetch attempts by outcome",
            ),
            &["name", "namespace", "result"],
        )
        .expect("valid metric definition");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("metric registration");
        counter
    };

    /// One 0/1 indicator gauge per bundle per state enum value.
    pub static ref BUNDLE_STATE: IntGaugeVec = {
        let gauge = IntGaugeVec::new(
            Opts::new("fleet_bundle_state", "Bundle display state indicator"),
            &["name", "namespace", "state"],
        )
        .expect("valid metric definition");
        REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("metric registration");
        gauge
    };

    /// Reconcile attempts per controller.
    pub static ref RECONCILE_TOTAL: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new("fleet_reconcile_total", "Reconcile invocations"),
            &["controller"],
        )
        .expect("valid metric definition");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("metric registration");
        counter
    };

    pub static ref RECONCILE_ERRORS: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new("fleet_reconcile_errors_total", "Failed reconcile invocations"),
            &["controller"],
        )
        .expect("valid metric definition");
        REGISTRY
            .register(Box::new(counter.clone()))
            .expect("metric registration");
        counter
    };
}

/// Set the state indicator family for one bundle: the current state reads
/// 1, every other state reads 0.
pub fn set_bundle_state(name: &str, namespace: &str, current: Option<BundleState>) {
    for state in BundleState::ALL {
        let value = match current {
            Some(cur) if cur == state => 1,
            // All-ready renders as an empty display state; count it as Ready.
            None if state == BundleState::Ready => 1,
            _ => 0,
        };
        BUNDLE_STATE
            .with_label_values(&[name, namespace, state.as_str()])
            .set(value);
    }
}

/// Drop every label set belonging to a deleted object.
pub fn forget(name: &str, namespace: &str) {
    for state in BundleState::ALL {
        let _ = BUNDLE_STATE.remove_label_values(&[name, namespace, state.as_str()]);
    }
    let _ = GITJOB_DURATION.remove_label_values(&[name, namespace]);
    let _ = FETCH_DURATION.remove_label_values(&[name, namespace]);
    for result in ["success", "fail"] {
        let _ = FETCH_TOTAL.remove_label_values(&[name, namespace, result]);
    }
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_state_is_an_indicator_family() {
        set_bundle_state("app", "fleet-default", Some(BundleState::WaitApplied));
        assert_eq!(
            BUNDLE_STATE
                .with_label_values(&["app", "fleet-default", "WaitApplied"])
                .get(),
            1
        );
        assert_eq!(
            BUNDLE_STATE
                .with_label_values(&["app", "fleet-default", "Ready"])
                .get(),
            0
        );

        set_bundle_state("app", "fleet-default", None);
        assert_eq!(
            BUNDLE_STATE
                .with_label_values(&["app", "fleet-default", "Ready"])
                .get(),
            1
        );
        forget("app", "fleet-default");
    }

    #[test]
    fn gather_renders_registered_metrics() {
        RECONCILE_TOTAL.with_label_values(&["bundle"]).inc();
        let rendered = gather();
        assert!(rendered.contains("fleet_reconcile_total"));
    }
}
