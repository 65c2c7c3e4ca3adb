//! Headless service for stable member DNS names.

use std::collections::BTreeSet;

use tracing::{debug, info};

use super::controller::{NodeSetReconciler, SyncResult};
use super::utils::headless_service_name;
use crate::api::{NodeSet, ObjectKey, ObjectMeta, OwnerReference, Service, ServicePort, ServiceSpec};

/// The service this NodeSet should have.
pub fn desired_service(nodeset: &NodeSet) -> Service {
    let mut seen = BTreeSet::new();
    let ports = nodeset
        .spec
        .template
        .spec
        .containers
        .iter()
        .flat_map(|c| c.ports.iter())
        .filter(|p| seen.insert((p.container_port, p.protocol.clone())))
        .map(|p| ServicePort {
            name: p.name.clone(),
            port: p.container_port,
            target_port: Some(p.container_port),
            protocol: p.protocol.clone(),
        })
        .collect();

    Service {
        metadata: ObjectMeta {
            name: headless_service_name(nodeset),
            namespace: nodeset.metadata.namespace.clone(),
            labels: nodeset.spec.selector.match_labels.clone(),
            owner_references: vec![OwnerReference::controller_for(nodeset)],
            ..Default::default()
        },
        spec: ServiceSpec {
            cluster_ip: "None".into(),
            selector: nodeset.spec.selector.match_labels.clone(),
            ports,
            publish_not_ready_addresses: true,
            ..Default::default()
        },
    }
}

fn spec_drifted(have: &ServiceSpec, want: &ServiceSpec) -> bool {
    have.cluster_ip != want.cluster_ip
        || have.selector != want.selector
        || have.ports != want.ports
        || have.publish_not_ready_addresses != want.publish_not_ready_addresses
}

impl NodeSetReconciler {
    /// Create the headless service, or bring its spec back in line.
    pub(crate) async fn sync_service(&self, nodeset: &NodeSet) -> SyncResult<()> {
        let want = desired_service(nodeset);
        let key = ObjectKey::new(&want.metadata.namespace, &want.metadata.name);

        let have = match self.store.services().get(&key).await {
            Ok(have) => have,
            Err(err) if err.is_not_found() => {
                info!(service = %key, "Creating headless service");
                return match self.store.services().create(&want).await {
                    Err(err) if !err.is_already_exists() => Err(err.into()),
                    _ => Ok(()),
                };
            }
            Err(err) => return Err(err.into()),
        };

        if !spec_drifted(&have.spec, &want.spec) {
            debug!(service = %key, "Headless service up to date");
            return Ok(());
        }

        info!(service = %key, "Updating headless service");
        let mut updated = (*have).clone();
        // clusterIP is immutable once allocated
        let cluster_ip = updated.spec.cluster_ip.clone();
        updated.spec = ServiceSpec {
            extra: updated.spec.extra.clone(),
            ..want.spec
        };
        if !cluster_ip.is_empty() {
            updated.spec.cluster_ip = cluster_ip;
        }
        self.store.services().update(&updated).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::api::{Container, ContainerPort, LabelSelector, Resource};
    use crate::events::MemoryRecorder;
    use crate::slurm::ClientMap;
    use crate::slurmcontrol::RealSlurmControl;
    use crate::store::memory::MemoryStore;
    use crate::store::ObjectStore;

    fn nodeset() -> NodeSet {
        let mut nodeset = NodeSet::default();
        nodeset.metadata.name = "compute".into();
        nodeset.metadata.namespace = "slurm".into();
        nodeset.metadata.uid = "uid-1".into();
        nodeset.spec.selector = LabelSelector::from_labels([("app", "slurmd")]);
        nodeset.spec.template.spec.containers.push(Container {
            name: "slurmd".into(),
            ports: vec![ContainerPort {
                name: Some("slurmd".into()),
                container_port: 6818,
                protocol: Some("TCP".into()),
            }],
            ..Default::default()
        });
        nodeset
    }

    #[test]
    fn test_desired_service_shape() {
        let svc = desired_service(&nodeset());
        assert_eq!(svc.metadata.name, "compute-headless");
        assert_eq!(svc.spec.cluster_ip, "None");
        assert!(svc.spec.publish_not_ready_addresses);
        assert_eq!(svc.spec.selector.get("app").map(String::as_str), Some("slurmd"));
        assert_eq!(svc.spec.ports.len(), 1);
        assert_eq!(svc.spec.ports[0].port, 6818);
        assert!(svc.metadata.is_controlled_by("uid-1"));
    }

    #[tokio::test]
    async fn test_service_created_then_repaired() {
        let store = Arc::new(MemoryStore::new());
        let reconciler = NodeSetReconciler::new(
            store.clone(),
            Arc::new(RealSlurmControl::new(Arc::new(ClientMap::new()))),
            Arc::new(MemoryRecorder::new()),
        );
        let ns = nodeset();

        reconciler.sync_service(&ns).await.unwrap();
        let key = ObjectKey::new("slurm", "compute-headless");
        let created = store.services().get(&key).await.unwrap();
        assert_eq!(created.spec.ports.len(), 1);

        let mut drifted = (*created).clone();
        drifted.spec.publish_not_ready_addresses = false;
        drifted.spec.ports.clear();
        store.services().update(&drifted).await.unwrap();

        reconciler.sync_service(&ns).await.unwrap();
        let repaired = store.services().get(&key).await.unwrap();
        assert!(repaired.spec.publish_not_ready_addresses);
        assert_eq!(repaired.spec.ports, desired_service(&ns).spec.ports);

        // nothing to do the second time round
        reconciler.sync_service(&ns).await.unwrap();
        let again = store.services().get(&key).await.unwrap();
        assert_eq!(again.metadata.resource_version, repaired.metadata.resource_version);
        assert_eq!(again.key(), key);
    }
}
