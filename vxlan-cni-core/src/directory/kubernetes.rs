use std::net::Ipv4Addr;

use k8s_openapi::api::core::v1::Node;
use kube::{
    api::{ListParams, Patch, PatchParams},
    core::ObjectMeta,
    Api, Client, ResourceExt,
};
use log::info;

use crate::identity::OverlayIdentity;

use super::{ClusterDirectory, DirectoryError, MemberRecord};

pub const FIELD_MANAGER: &str = "vxlan-cni-agent";
pub const INTERNAL_ADDRESS_TYPE: &str = "InternalIP";

/// Cluster members backed by the `Node` objects of the API server.
#[derive(Clone)]
pub struct KubeDirectory {
    api: Api<Node>,
    patch_params: PatchParams,
}

impl KubeDirectory {
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
            patch_params: PatchParams::apply(FIELD_MANAGER).force(),
        }
    }
}

impl ClusterDirectory for KubeDirectory {
    async fn list_members(&self) -> Result<Vec<MemberRecord>, DirectoryError> {
        let nodes = self.api.list(&ListParams::default()).await?;

        Ok(nodes.items.iter().map(MemberRecord::from).collect())
    }

    async fn publish_identity(
        &self,
        member: &str,
        identity: &OverlayIdentity,
    ) -> Result<(), DirectoryError> {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(member.to_owned()),
                annotations: Some(identity.to_annotations()),
                ..Default::default()
            },
            ..Default::default()
        };

        info!("Publishing overlay identity of '{member}'...");
        self.api
            .patch(member, &self.patch_params, &Patch::Apply(node))
            .await?;

        Ok(())
    }
}

impl From<&Node> for MemberRecord {
    fn from(node: &Node) -> Self {
        let internal_addresses = node
            .status
            .as_ref()
            .and_then(|status| status.addresses.as_ref())
            .map(|addresses| {
                addresses
                    .iter()
                    .filter(|address| address.type_ == INTERNAL_ADDRESS_TYPE)
                    .filter_map(|address| address.address.parse::<Ipv4Addr>().ok())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: node.name_any(),
            internal_addresses,
            pod_cidr: node.spec.as_ref().and_then(|spec| spec.pod_cidr.clone()),
            annotations: node.annotations().clone(),
        }
    }
}
