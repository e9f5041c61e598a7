//! Kubernetes object-store access for the webhooks and the snapshot controller.
//!
//! Both components talk to the cluster only through [`PersistenceKubeClient`],
//! so their logic can run against a mock or an in-memory store in tests.
//!
//! ## Architecture
//!
//! - `kube_client`: the trait and its `kube::Api` backed implementation
//! - `patch`: JSON patch diffs for admission, merge patches for pod annotations

pub mod kube_client;
pub mod patch;

pub use kube_client::{CreateOutcome, PersistenceKubeClient, PersistenceKubeClientImpl, PodEvent};
pub use patch::{annotations_patch, patch_from};

#[cfg(test)]
pub use kube_client::MockPersistenceKubeClient;
