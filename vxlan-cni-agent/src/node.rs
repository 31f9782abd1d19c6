use futures::{Future, Stream, StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Node, NodeSpec, NodeStatus};
use kube::{
    runtime::{
        reflector::{self, reflector, Store},
        watcher::{self, default_backoff, watcher, Config, Event},
        WatchStreamExt,
    },
    Api, Client, ResourceExt,
};
use log::warn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use vxlan_cni_core::directory::MemberRecord;

/// Watches every node of the cluster and keeps the parts the mesh cares
/// about in a local store. A unit is sent on the channel whenever a node
/// is applied or deleted.
pub fn start_node_reflector(
    client: &Client,
) -> (impl Future<Output = ()>, Store<Node>, UnboundedReceiver<()>) {
    let events =
        watcher(Api::<Node>::all(client.clone()), Config::default()).backoff(default_backoff());

    watch_nodes(events)
}

fn watch_nodes<S>(events: S) -> (impl Future<Output = ()>, Store<Node>, UnboundedReceiver<()>)
where
    S: Stream<Item = Result<Event<Node>, watcher::Error>>,
{
    let (tx, rx) = unbounded_channel::<()>();
    let events = events.map_ok(|event| event.modify(trim_node));
    let (store, writer) = reflector::store();
    let reflector = reflector(writer, events)
        .touched_objects()
        .for_each(move |result| {
            match result {
                // the receiver is gone only once the agent is shutting down
                Ok(_) => {
                    let _ = tx.send(());
                }
                Err(error) => warn!("Node watch failed! {error}"),
            }
            std::future::ready(())
        });

    (reflector, store, rx)
}

fn trim_node(node: &mut Node) {
    node.managed_fields_mut().clear();
    node.labels_mut().clear();
    node.finalizers_mut().clear();
    node.owner_references_mut().clear();

    let pod_cidr = node.spec.as_ref().and_then(|spec| spec.pod_cidr.to_owned());
    let addresses = node
        .status
        .as_ref()
        .and_then(|status| status.addresses.to_owned());

    node.spec = Some(NodeSpec {
        pod_cidr,
        ..Default::default()
    });
    node.status = Some(NodeStatus {
        addresses,
        ..Default::default()
    })
}

pub fn members_of(store: &Store<Node>) -> Vec<MemberRecord> {
    store
        .state()
        .iter()
        .map(|node| MemberRecord::from(node.as_ref()))
        .collect()
}
