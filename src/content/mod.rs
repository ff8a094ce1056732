/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: mod.rs
 *
 * The content store: moves compiled manifests from the upstream cluster to
 * downstream agents. Content is addressed by the sha256 of the canonical
 * JSON serialization of the resource list: struct fields serialize in a
 * fixed order and serde_json's default map keeps object keys sorted, so the
 * same source content always yields the same name and unrelated content
 * never collides.
 *
 * Two backends exist per bundle: a cluster-scoped Content object holding
 * the gzip-compressed serialization inline (reference-counted with one
 * finalizer per referring BundleDeployment), or an OCI registry artifact
 * whose reference travels in a per-bundle access secret (see oci.rs).
 *
 * SPDX-License-Identifier: Apache-2.0
 */

pub mod oci;

use flate2::write::GzEncoder;
use flate2::Compression;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;

use crate::crds::{Content, ContentSpec};
use crate::crds::BundleResource;
use crate::error::{Error, Result};

/// Prefix distinguishing manifest IDs from other object names.
pub const MANIFEST_ID_PREFIX: &str = "s-";

/// The canonical serialization unit: the bundle's resource list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Manifest {
    pub resources: Vec<BundleResource>,
}

impl Manifest {
    pub fn new(resources: Vec<BundleResource>) -> Self {
        Manifest { resources }
    }

    /// Canonical JSON bytes of the manifest.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// `(manifestId, sha256hex)` of the canonical serialization.
    pub fn id(&self) -> Result<(String, String)> {
        let json = self.to_json()?;
        let mut hasher = Sha256::new();
        hasher.update(&json);
        let digest = hex::encode(hasher.finalize());
        Ok((format!("{MANIFEST_ID_PREFIX}{digest}"), digest))
    }
}

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::RetryableError(format!("gzip failed: {e}")))
}

/// Build the cluster-scoped Content object for a manifest. The object name
/// is the manifest ID itself.
pub fn content_object(manifest: &Manifest) -> Result<Content> {
    let (id, digest) = manifest.id()?;
    let json = manifest.to_json()?;
    let mut content = Content::new(
        &id,
        ContentSpec {
            content: ByteString(gzip(&json)?),
            sha256_sum: digest,
        },
    );
    content.metadata.name = Some(id);
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn gunzip(bytes: &[u8]) -> Vec<u8> {
        let mut decoder = flate2::read::GzDecoder::new(bytes);
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        out
    }

    fn resource(name: &str, body: &str) -> BundleResource {
        BundleResource {
            name: Some(name.to_string()),
            content: body.to_string(),
            encoding: None,
        }
    }

    #[test]
    fn identical_resource_lists_share_an_id() {
        let a = Manifest::new(vec![resource("cm.yaml", "kind: ConfigMap")]);
        let b = Manifest::new(vec![resource("cm.yaml", "kind: ConfigMap")]);
        assert_eq!(a.id().unwrap(), b.id().unwrap());
    }

    #[test]
    fn any_byte_change_changes_the_id() {
        let a = Manifest::new(vec![resource("cm.yaml", "kind: ConfigMap")]);
        let b = Manifest::new(vec![resource("cm.yaml", "kind: ConfigMaq")]);
        let c = Manifest::new(vec![resource("cm2.yaml", "kind: ConfigMap")]);
        assert_ne!(a.id().unwrap().0, b.id().unwrap().0);
        assert_ne!(a.id().unwrap().0, c.id().unwrap().0);
    }

    #[test]
    fn manifest_id_has_prefix_and_hex_digest() {
        let (id, digest) = Manifest::new(vec![]).id().unwrap();
        assert!(id.starts_with(MANIFEST_ID_PREFIX));
        assert_eq!(id, format!("{MANIFEST_ID_PREFIX}{digest}"));
        assert_eq!(digest.len(), 64);
    }

    #[test]
    fn gzip_round_trip() {
        let payload = b"kind: Deployment\nreplicas: 3\n".to_vec();
        let packed = gzip(&payload).unwrap();
        assert_eq!(gunzip(&packed), payload);
    }

    #[test]
    fn encoded_payloads_hash_as_carried() {
        // The digest covers the resource list exactly as serialized; a
        // compressed payload and its plain-text equivalent are different
        // content as far as addressing is concerned.
        let plain = Manifest::new(vec![resource("a.yaml", "kind: Secret")]);
        let wrapped = Manifest::new(vec![BundleResource {
            name: Some("a.yaml".to_string()),
            content: "H4sIAAAAAAAA/yXGt0=".to_string(),
            encoding: Some("base64+gz".to_string()),
        }]);
        assert_ne!(plain.id().unwrap().0, wrapped.id().unwrap().0);
    }

    #[test]
    fn content_object_is_named_by_digest() {
        let manifest = Manifest::new(vec![resource("cm.yaml", "kind: ConfigMap")]);
        let (id, digest) = manifest.id().unwrap();
        let content = content_object(&manifest).unwrap();
        assert_eq!(content.metadata.name.as_deref(), Some(id.as_str()));
        assert_eq!(content.spec.sha256_sum, digest);
        let unpacked = gunzip(&content.spec.content.0);
        assert_eq!(unpacked, manifest.to_json().unwrap());
    }
}
