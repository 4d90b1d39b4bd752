use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

use crate::resource::{Operation, ResourceHandle, ResourceKind};

/// Errors reported by a remote control plane
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("conflict on {kind}: {message}")]
    Conflict { kind: ResourceKind, message: String },

    #[error("request rejected: {message}")]
    Rejected { message: String },

    #[error("transport failure: {message}")]
    Transport { message: String },
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound { .. })
    }

    pub fn transport(message: impl Into<String>) -> Self {
        RemoteError::Transport {
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        RemoteError::Rejected {
            message: message.into(),
        }
    }
}

/// Why a single bounded remote call did not succeed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallFailure {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("call timed out after {0:?}")]
    TimedOut(Duration),
}

impl CallFailure {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CallFailure::Remote(err) if err.is_not_found())
    }
}

/// A resource teardown could not reclaim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownFailure {
    pub kind: ResourceKind,
    pub handle: ResourceHandle,
    pub error: String,
}

impl fmt::Display for TeardownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.kind, self.handle, self.error)
    }
}

fn describe_failures(failures: &[TeardownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Provisioning, mutation and teardown errors
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("dangling reference: {kind} {id} has not been created")]
    DanglingReference { kind: ResourceKind, id: String },

    #[error("subnet {subnet} is attached to router {attached}, cannot attach it to {requested}")]
    AttachmentConflict {
        subnet: String,
        attached: String,
        requested: String,
    },

    #[error("VLAN {vlan_id} is already bound on trunk {trunk}")]
    VlanCollision { trunk: String, vlan_id: u16 },

    #[error("VLAN id {vlan_id} is outside 1..=4094")]
    InvalidVlan { vlan_id: u16 },

    #[error("subport network {network} is the parent network of trunk {trunk}")]
    SubportNetworkConflict { trunk: String, network: String },

    #[error("port pair group {stage} must keep at least one port pair (removing {node})")]
    EmptyStageNotAllowed { stage: String, node: String },

    #[error("port chain {chain} must keep at least one port pair group")]
    EmptyChainNotAllowed { chain: String },

    #[error("{kind} {id} is still referenced by {holder}")]
    ResourceInUse {
        kind: ResourceKind,
        id: String,
        holder: String,
    },

    #[error("port chain {chain} is {state}")]
    InvalidChainState { chain: String, state: String },

    #[error("address block {block} holds {capacity} addresses, {requested} requested")]
    AddressExhausted {
        block: String,
        requested: usize,
        capacity: usize,
    },

    #[error("gateway {gateway} cannot be applied: {reason}")]
    InvalidGateway { gateway: IpAddr, reason: String },

    #[error("subnet {subnet} carries host routes but has no router interface")]
    UnroutedSubnet { subnet: String },

    #[error("handle {handle} does not describe a {kind}")]
    KindHandleMismatch { kind: ResourceKind, handle: String },

    #[error("unknown resource kind '{0}'")]
    UnknownResourceKind(String),

    #[error("{operation} {kind} {handle} failed: {source}")]
    RemoteOperationFailed {
        operation: Operation,
        kind: ResourceKind,
        handle: String,
        source: CallFailure,
    },

    #[error("{kind} {handle} not ready after {waited:?} (last state: {last_state})")]
    NotReady {
        kind: ResourceKind,
        handle: String,
        waited: Duration,
        last_state: String,
    },

    #[error("teardown left {} resource(s) behind: {}", .0.len(), describe_failures(.0))]
    AggregateTeardown(Vec<TeardownFailure>),
}

impl ProvisionError {
    pub fn dangling(kind: ResourceKind, id: impl Into<String>) -> Self {
        ProvisionError::DanglingReference {
            kind,
            id: id.into(),
        }
    }

    pub fn remote(
        operation: Operation,
        kind: ResourceKind,
        handle: impl Into<String>,
        source: impl Into<CallFailure>,
    ) -> Self {
        ProvisionError::RemoteOperationFailed {
            operation,
            kind,
            handle: handle.into(),
            source: source.into(),
        }
    }

    /// Whether the error was raised locally before any remote call was made
    pub fn is_precondition(&self) -> bool {
        !matches!(
            self,
            ProvisionError::RemoteOperationFailed { .. }
                | ProvisionError::NotReady { .. }
                | ProvisionError::AggregateTeardown(_)
        )
    }
}

/// Result type aliases for convenience
pub type ProvisionResult<T> = Result<T, ProvisionError>;
pub type RemoteResult<T> = Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_lists_every_failure() {
        let err = ProvisionError::AggregateTeardown(vec![
            TeardownFailure {
                kind: ResourceKind::Port,
                handle: ResourceHandle::id("port-1"),
                error: "boom".to_string(),
            },
            TeardownFailure {
                kind: ResourceKind::RouterInterface,
                handle: ResourceHandle::router_interface("r1", "s1"),
                error: "busy".to_string(),
            },
        ]);
        let message = err.to_string();
        assert!(message.contains("2 resource(s)"));
        assert!(message.contains("port port-1: boom"));
        assert!(message.contains("router_interface r1<-s1: busy"));
    }

    #[test]
    fn test_precondition_classification() {
        assert!(ProvisionError::InvalidVlan { vlan_id: 0 }.is_precondition());
        let remote = ProvisionError::remote(
            Operation::Create,
            ResourceKind::Network,
            "net",
            RemoteError::transport("reset"),
        );
        assert!(!remote.is_precondition());
    }

    #[test]
    fn test_call_failure_not_found() {
        let failure = CallFailure::from(RemoteError::NotFound {
            kind: ResourceKind::Port,
            id: "p".to_string(),
        });
        assert!(failure.is_not_found());
        assert!(!CallFailure::TimedOut(Duration::from_secs(1)).is_not_found());
    }
}
