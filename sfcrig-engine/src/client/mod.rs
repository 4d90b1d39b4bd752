//! Remote capability traits and the bounded call wrapper.
//!
//! The provisioner never talks to a concrete SDK. It sees three narrow
//! record-level capabilities, one per control-plane service, each taking and
//! returning JSON records that carry an `id`. [`Remote`] bundles them with the
//! per-call timeout and turns every failure into a
//! [`ProvisionError::RemoteOperationFailed`] naming the operation, the kind
//! and the handle involved.

pub mod records;

use futures_util::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use sfcrig_shared::errors::{CallFailure, ProvisionError, ProvisionResult, RemoteError, RemoteResult};
use sfcrig_shared::model::SubportBinding;
use sfcrig_shared::resource::{Operation, ResourceKind};

/// Future returned by every capability method
pub type ApiFuture<'a, T> = BoxFuture<'a, RemoteResult<T>>;

/// Networking service: networks, subnets, routers, ports, trunks and the
/// service-chain objects (port pairs, groups, classifiers, chains)
pub trait NetworkApi: Send + Sync {
    fn create<'a>(&'a self, kind: ResourceKind, body: Value) -> ApiFuture<'a, Value>;

    fn show<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ApiFuture<'a, Value>;

    /// Replace the listed attributes of a record
    fn update<'a>(&'a self, kind: ResourceKind, id: &'a str, body: Value) -> ApiFuture<'a, Value>;

    fn delete<'a>(&'a self, kind: ResourceKind, id: &'a str) -> ApiFuture<'a, ()>;

    fn add_router_interface<'a>(&'a self, router_id: &'a str, subnet_id: &'a str) -> ApiFuture<'a, ()>;

    fn remove_router_interface<'a>(&'a self, router_id: &'a str, subnet_id: &'a str) -> ApiFuture<'a, ()>;

    /// Bind ports to a trunk, returning the updated trunk record
    fn add_subports<'a>(&'a self, trunk_id: &'a str, subports: Vec<SubportBinding>) -> ApiFuture<'a, Value>;

    /// Unbind ports from a trunk, returning the updated trunk record
    fn remove_subports<'a>(&'a self, trunk_id: &'a str, port_ids: Vec<String>) -> ApiFuture<'a, Value>;
}

/// Compute service: virtual machines
pub trait ComputeApi: Send + Sync {
    fn boot<'a>(&'a self, request: Value) -> ApiFuture<'a, Value>;

    fn show<'a>(&'a self, id: &'a str) -> ApiFuture<'a, Value>;

    fn delete<'a>(&'a self, id: &'a str) -> ApiFuture<'a, ()>;
}

/// Identity service: projects and users
pub trait IdentityApi: Send + Sync {
    fn create_project<'a>(&'a self, body: Value) -> ApiFuture<'a, Value>;

    fn create_user<'a>(&'a self, body: Value) -> ApiFuture<'a, Value>;

    fn delete_project<'a>(&'a self, id: &'a str) -> ApiFuture<'a, ()>;

    fn delete_user<'a>(&'a self, id: &'a str) -> ApiFuture<'a, ()>;
}

/// Capability bundle with a bounded call discipline
#[derive(Clone)]
pub struct Remote {
    network: Arc<dyn NetworkApi>,
    compute: Arc<dyn ComputeApi>,
    identity: Arc<dyn IdentityApi>,
    call_timeout: Duration,
}

impl Remote {
    pub fn new(
        network: Arc<dyn NetworkApi>,
        compute: Arc<dyn ComputeApi>,
        identity: Arc<dyn IdentityApi>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            network,
            compute,
            identity,
            call_timeout,
        }
    }

    pub fn network(&self) -> &dyn NetworkApi {
        self.network.as_ref()
    }

    pub fn compute(&self) -> &dyn ComputeApi {
        self.compute.as_ref()
    }

    pub fn identity(&self) -> &dyn IdentityApi {
        self.identity.as_ref()
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Await one remote call under the call timeout.
    ///
    /// A timed out call is reported like any other remote failure and is
    /// never retried here.
    pub async fn call<T>(
        &self,
        operation: Operation,
        kind: ResourceKind,
        handle: impl Display,
        call: ApiFuture<'_, T>,
    ) -> ProvisionResult<T> {
        debug!("{} {} {}", operation, kind, handle);
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                debug!("{} {} {} rejected: {}", operation, kind, handle, err);
                Err(ProvisionError::remote(operation, kind, handle.to_string(), err))
            }
            Err(_) => {
                warn!(
                    "{} {} {} timed out after {:?}",
                    operation, kind, handle, self.call_timeout
                );
                Err(ProvisionError::remote(
                    operation,
                    kind,
                    handle.to_string(),
                    CallFailure::TimedOut(self.call_timeout),
                ))
            }
        }
    }
}

/// Whether a provisioning error is the remote side reporting the object gone
pub fn is_remote_not_found(err: &ProvisionError) -> bool {
    matches!(err, ProvisionError::RemoteOperationFailed { source, .. } if source.is_not_found())
}

/// Serialize a request body
pub fn encode<T: Serialize>(operation: Operation, kind: ResourceKind, body: &T) -> ProvisionResult<Value> {
    serde_json::to_value(body).map_err(|e| {
        ProvisionError::remote(
            operation,
            kind,
            "<request>",
            RemoteError::rejected(format!("cannot encode request: {}", e)),
        )
    })
}

/// Deserialize a record returned by the remote side
pub fn decode<T: DeserializeOwned>(operation: Operation, kind: ResourceKind, record: Value) -> ProvisionResult<T> {
    let handle = record
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or("<unknown>")
        .to_string();
    serde_json::from_value(record).map_err(|e| {
        ProvisionError::remote(
            operation,
            kind,
            handle,
            RemoteError::transport(format!("malformed {} record: {}", kind, e)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::Simulator;
    use futures_util::FutureExt;
    use serde_json::json;

    struct Stalled;

    impl ComputeApi for Stalled {
        fn boot<'a>(&'a self, _request: Value) -> ApiFuture<'a, Value> {
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            }
            .boxed()
        }

        fn show<'a>(&'a self, _id: &'a str) -> ApiFuture<'a, Value> {
            async { Ok(Value::Null) }.boxed()
        }

        fn delete<'a>(&'a self, _id: &'a str) -> ApiFuture<'a, ()> {
            async { Ok(()) }.boxed()
        }
    }

    #[tokio::test]
    async fn test_call_timeout_is_remote_failure() {
        let sim = Arc::new(Simulator::new());
        let remote = Remote::new(sim.clone(), Arc::new(Stalled), sim, Duration::from_millis(20));

        let err = remote
            .call(
                Operation::Create,
                ResourceKind::Server,
                "vm",
                remote.compute().boot(json!({})),
            )
            .await
            .unwrap_err();

        match err {
            ProvisionError::RemoteOperationFailed { source, .. } => {
                assert_eq!(source, CallFailure::TimedOut(Duration::from_millis(20)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_not_found_classification() {
        let sim = Arc::new(Simulator::new());
        let remote = Remote::new(sim.clone(), sim.clone(), sim, Duration::from_secs(1));

        let err = remote
            .call(
                Operation::Show,
                ResourceKind::Network,
                "missing",
                remote.network().show(ResourceKind::Network, "missing"),
            )
            .await
            .unwrap_err();
        assert!(is_remote_not_found(&err));
    }

    #[test]
    fn test_decode_reports_malformed_record() {
        let err = decode::<sfcrig_shared::model::Router>(
            Operation::Create,
            ResourceKind::Router,
            json!({ "id": "r1" }),
        )
        .unwrap_err();
        assert!(err.to_string().contains("malformed router record"));
        assert!(err.to_string().contains("r1"));
    }
}
