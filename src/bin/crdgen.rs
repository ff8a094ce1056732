/* Copyright (C) 2025 Pedro Henrique / phkaiser13
* File: src/bin/crdgen.rs
* Prints the CustomResourceDefinition manifests for every fleet kind to
* stdout as a multi-document YAML stream, ready for kubectl apply. The
* definitions are generated from the Rust types, so the schema served to
* the API server can never drift from the structs the controllers use.
* SPDX-License-Identifier: Apache-2.0 */

use kube::CustomResourceExt;

use phgit_fleet_operator::crds::{
    Bundle, BundleDeployment, Cluster, ClusterGroup, Content, GitRepo, HelmOp, ImageScan,
};

fn main() -> Result<(), serde_yaml::Error> {
    let crds = [
        serde_yaml::to_string(&GitRepo::crd())?,
        serde_yaml::to_string(&HelmOp::crd())?,
        serde_yaml::to_string(&Bundle::crd())?,
        serde_yaml::to_string(&BundleDeployment::crd())?,
        serde_yaml::to_string(&Cluster::crd())?,
        serde_yaml::to_string(&ClusterGroup::crd())?,
        serde_yaml::to_string(&Content::crd())?,
        serde_yaml::to_string(&ImageScan::crd())?,
    ];
    print!("{}", crds.join("---\n"));
    Ok(())
}
