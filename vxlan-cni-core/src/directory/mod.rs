use std::{collections::BTreeMap, future::Future, net::Ipv4Addr};

use thiserror::Error;

use crate::{
    identity::{IdentityError, OverlayIdentity},
    ip::{Subnet, SubnetError},
};

pub mod kubernetes;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use kubernetes::KubeDirectory;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Couldn't reach the cluster! {}", .0)]
    Kube(#[from] kube::Error),
    #[error("Member '{}' isn't registered in the cluster!", .0)]
    MemberNotFound(String),
    #[error("Member '{}' has an invalid pod CIDR! {}", .0, .1)]
    InvalidPodCidr(String, SubnetError),
    #[error("Member '{}' has an invalid overlay identity! {}", .0, .1)]
    InvalidIdentity(String, IdentityError),
}

/// A cluster member as far as the overlay is concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberRecord {
    pub name: String,
    pub internal_addresses: Vec<Ipv4Addr>,
    pub pod_cidr: Option<String>,
    pub annotations: BTreeMap<String, String>,
}

impl MemberRecord {
    pub fn subnet(&self) -> Result<Option<Subnet>, DirectoryError> {
        self.pod_cidr
            .as_deref()
            .map(|cidr| {
                cidr.parse()
                    .map_err(|err| DirectoryError::InvalidPodCidr(self.name.clone(), err))
            })
            .transpose()
    }

    pub fn identity(&self) -> Result<Option<OverlayIdentity>, DirectoryError> {
        OverlayIdentity::from_annotations(&self.annotations)
            .map_err(|err| DirectoryError::InvalidIdentity(self.name.clone(), err))
    }
}

/// The source of truth about cluster members and the place a node publishes
/// its own overlay identity to.
pub trait ClusterDirectory {
    fn list_members(&self) -> impl Future<Output = Result<Vec<MemberRecord>, DirectoryError>> + Send;

    fn publish_identity(
        &self,
        member: &str,
        identity: &OverlayIdentity,
    ) -> impl Future<Output = Result<(), DirectoryError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::{DirectoryError, MemberRecord};

    #[test]
    fn member_without_pod_cidr_has_no_subnet() {
        let member = MemberRecord {
            name: "node-a".to_owned(),
            ..Default::default()
        };

        assert!(member.subnet().unwrap().is_none());
        assert!(member.identity().unwrap().is_none());
    }

    #[test]
    fn invalid_pod_cidr_names_the_member() {
        let member = MemberRecord {
            name: "node-a".to_owned(),
            pod_cidr: Some("10.244.1.0/33".to_owned()),
            ..Default::default()
        };

        match member.subnet() {
            Err(DirectoryError::InvalidPodCidr(name, _)) => assert_eq!(name, "node-a"),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
