/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/crds/content.rs
* The Content custom resource: a cluster-scoped, content-addressed blob of
* rendered manifests. Its name is the sha256 digest of the canonical
* manifest serialization, so identical sources always converge on the same
* object and unrelated content never collides. Reference counting is done
* with one finalizer per referring BundleDeployment; the content reconciler
* deletes the object once the live reference count reaches zero.
* SPDX-License-Identifier: Apache-2.0 */

use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// # Content
/// Cluster-scoped manifest blob, addressed by digest.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "fleet.phgit.io",
    version = "v1alpha1",
    kind = "Content",
    shortname = "fct"
)]
#[serde(rename_all = "camelCase")]
pub struct ContentSpec {
    /// Gzip-compressed canonical JSON of the manifest.
    #[schemars(with = "String")]
    pub content: ByteString,

    /// Digest of the uncompressed serialization; also the object name
    /// without the "s-" prefix.
    pub sha256_sum: String,
}
