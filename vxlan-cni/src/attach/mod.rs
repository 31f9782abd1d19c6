use std::{io::Write, time::Duration};

use anyhow::{anyhow, bail, Context};
use data_encoding::HEXLOWER;
use log::{debug, info};
use rand::RngCore;
use vxlan_cni_core::{
    config::NetworkConfig,
    devices::{DeviceControlPlane, LinkKind, NetNs, Route, Scope},
    ipam::{
        lock::HostLock,
        store::{Lease, LeaseStore},
    },
};

use crate::skel::{
    error::{CniError, ErrorCode},
    CmdArgs, Handlers,
};

use self::{
    result::{Attachment, InterfaceInfo},
    saga::Saga,
};

pub mod result;
pub mod saga;

pub const HOST_VETH_PREFIX: &str = "veth";
const HOST_VETH_NAME_ATTEMPTS: usize = 16;

pub struct AttachController<D> {
    devices: D,
    lock_timeout: Option<Duration>,
}

impl<D: DeviceControlPlane> AttachController<D> {
    pub fn new(devices: D) -> Self {
        Self {
            devices,
            lock_timeout: Some(Duration::from_secs(30)),
        }
    }

    pub fn with_lock_timeout(self, lock_timeout: Option<Duration>) -> Self {
        Self {
            lock_timeout,
            ..self
        }
    }

    fn lock(&self, config: &NetworkConfig) -> HostLock {
        HostLock::in_dir(&config.data_dir).timeout(self.lock_timeout)
    }

    /// Allocates an address for the container and wires it to the node bridge
    /// through a fresh veth pair. Anything created before a failing step is
    /// torn down again before the error is returned.
    pub fn attach(&self, args: &CmdArgs, config: &NetworkConfig) -> anyhow::Result<Attachment> {
        // the lease store is only touched while the guard lives
        let _guard = self
            .lock(config)
            .acquire()
            .context("Couldn't acquire the host allocation lock!")?;

        let mut saga = Saga::new();
        match self.provision(args, config, &mut saga) {
            Ok(attachment) => {
                saga.complete();
                info!(
                    "Attached container '{}' as {} via {}",
                    args.container_id, attachment.address, attachment.host_interface.name
                );
                Ok(attachment)
            }
            Err(err) => {
                info!(
                    "Rolling back {} steps of container '{}' attachment...",
                    saga.len(),
                    args.container_id
                );
                saga.compensate();
                Err(err)
            }
        }
    }

    fn provision<'a>(
        &'a self,
        args: &'a CmdArgs,
        config: &'a NetworkConfig,
        saga: &mut Saga<'a>,
    ) -> anyhow::Result<Attachment> {
        let mut store = LeaseStore::open(&config.data_dir)?;
        if let Some(lease) = store.get(&args.container_id) {
            bail!(
                "Container '{}' is already attached with {}!",
                args.container_id,
                lease.address
            );
        }

        let address = store.allocate(&config.subnet)?;
        let host_name = self.generate_host_veth_name()?;

        store.insert(
            args.container_id.clone(),
            Lease {
                address,
                interface: args.ifname.clone(),
                host_interface: host_name.clone(),
            },
        )?;
        store
            .commit()
            .context("Couldn't persist the container's lease!")?;
        saga.push(format!("release {address}"), move || {
            LeaseStore::open(&config.data_dir)?.release(&args.container_id)?;
            Ok(())
        });

        let netns = NetNs::open(&args.netns)?;
        let gateway = config.subnet.gateway();

        let bridge = self
            .devices
            .link(Scope::Host, &config.bridge)?
            .ok_or_else(|| {
                anyhow!(
                    "Bridge '{}' doesn't exist! Is the node agent running?",
                    config.bridge
                )
            })?
            .expect_kind(LinkKind::Bridge)?;

        self.devices
            .create_veth_pair(&netns, &args.ifname, &host_name, config.mtu)?;
        let container_netns = netns.clone();
        saga.push(format!("delete {} in the container", args.ifname), move || {
            self.devices
                .delete_link(Scope::Namespace(&container_netns), &args.ifname)?;
            Ok(())
        });

        self.devices.move_to_host(&netns, &host_name)?;
        let moved_name = host_name.clone();
        saga.push(format!("delete {host_name}"), move || {
            self.devices.delete_link(Scope::Host, &moved_name)?;
            Ok(())
        });

        let container_scope = Scope::Namespace(&netns);
        self.devices
            .assign_address(container_scope, &args.ifname, address)?;
        self.devices.set_up(container_scope, &args.ifname)?;
        self.devices.replace_route(
            container_scope,
            &Route::default_via(gateway.addr(), &args.ifname),
        )?;
        let container_link = self
            .devices
            .link(container_scope, &args.ifname)?
            .with_context(|| format!("Interface '{}' vanished from the container!", args.ifname))?;

        let host_link = self
            .devices
            .link(Scope::Host, &host_name)?
            .with_context(|| format!("'{host_name}' didn't show up in the host namespace!"))?;
        self.devices.set_up(Scope::Host, &host_link.name)?;
        self.devices.set_master(&host_link.name, &bridge.name)?;

        Ok(Attachment {
            address,
            gateway: gateway.addr(),
            host_interface: InterfaceInfo {
                name: host_link.name,
                mac: host_link.mac,
                sandbox: None,
            },
            container_interface: InterfaceInfo {
                name: container_link.name,
                mac: container_link.mac,
                sandbox: Some(args.netns.clone()),
            },
        })
    }

    fn generate_host_veth_name(&self) -> anyhow::Result<String> {
        let mut rng = rand::thread_rng();

        for _ in 0..HOST_VETH_NAME_ATTEMPTS {
            let mut suffix = [0u8; 4];
            rng.fill_bytes(&mut suffix);
            let name = format!("{HOST_VETH_PREFIX}{}", HEXLOWER.encode(&suffix));

            if self.devices.link(Scope::Host, &name)?.is_none() {
                return Ok(name);
            }
            debug!("'{name}' is taken, drawing another one");
        }

        bail!("Couldn't find a free host interface name!")
    }

    /// Tears down both ends of the container's veth pair and releases its
    /// lease. Containers without a lease are left alone.
    pub fn detach(&self, args: &CmdArgs, config: &NetworkConfig) -> anyhow::Result<Option<Lease>> {
        let _guard = self
            .lock(config)
            .acquire()
            .context("Couldn't acquire the host allocation lock!")?;

        let mut store = LeaseStore::open(&config.data_dir)?;
        let lease = match store.get(&args.container_id) {
            Some(lease) => lease.clone(),
            None => {
                info!(
                    "Container '{}' holds no lease, nothing to detach",
                    args.container_id
                );
                return Ok(None);
            }
        };

        if args.netns.is_empty() {
            debug!("No namespace given for '{}'", args.container_id);
        } else {
            match NetNs::open(&args.netns) {
                Ok(netns) => {
                    self.devices
                        .delete_link(Scope::Namespace(&netns), &lease.interface)?;
                }
                Err(err) => debug!("Skipping the container side: {err}"),
            }
        }

        self.devices.delete_link(Scope::Host, &lease.host_interface)?;
        store.release(&args.container_id)?;

        info!(
            "Detached container '{}' and released {}",
            args.container_id, lease.address
        );

        Ok(Some(lease))
    }
}

fn parse_config(args: &CmdArgs) -> Result<NetworkConfig, CniError> {
    NetworkConfig::from_slice(&args.stdin_data).map_err(|err| {
        CniError::new(
            ErrorCode::InvalidNetworkConfig,
            "invalid network configuration",
        )
        .with_details(err.to_string())
    })
}

impl<D: DeviceControlPlane> Handlers for AttachController<D> {
    fn add(&self, args: &CmdArgs, out: &mut dyn Write) -> anyhow::Result<()> {
        let config = parse_config(args)?;
        let attachment = self
            .attach(args, &config)
            .context("Couldn't attach the container!")?;

        serde_json::to_writer_pretty(&mut *out, &attachment.to_result(&config.cni_version)?)?;
        writeln!(out)?;

        Ok(())
    }

    fn del(&self, args: &CmdArgs, _out: &mut dyn Write) -> anyhow::Result<()> {
        let config = parse_config(args)?;
        self.detach(args, &config)
            .context("Couldn't detach the container!")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, time::Duration};

    use tempfile::{NamedTempFile, TempDir};
    use vxlan_cni_core::{
        config::NetworkConfig,
        devices::{testing::FakeDevices, LinkKind, NetNs},
        ipam::store::LeaseStore,
    };

    use crate::skel::{error::CniError, CmdArgs, Handlers};

    use super::AttachController;

    struct Fixture {
        data_dir: TempDir,
        netns: NamedTempFile,
        controller: AttachController<FakeDevices>,
    }

    impl Fixture {
        fn new() -> Self {
            let devices = FakeDevices::new().with_link("vxcni0", LinkKind::Bridge);

            Self {
                data_dir: tempfile::tempdir().unwrap(),
                netns: NamedTempFile::new().unwrap(),
                controller: AttachController::new(devices)
                    .with_lock_timeout(Some(Duration::from_secs(5))),
            }
        }

        fn devices(&self) -> &FakeDevices {
            &self.controller.devices
        }

        fn config(&self, subnet: &str) -> NetworkConfig {
            NetworkConfig::from_slice(
                format!(
                    r#"{{"cniVersion":"0.4.0","name":"vxlan-cni","type":"vxlan-cni","subnet":"{subnet}","dataDir":{:?}}}"#,
                    self.data_dir.path().display().to_string()
                )
                .as_bytes(),
            )
            .unwrap()
        }

        fn args(&self, container_id: &str, config: &NetworkConfig) -> CmdArgs {
            CmdArgs {
                container_id: container_id.to_owned(),
                netns: self.netns.path().display().to_string(),
                ifname: "eth0".to_owned(),
                args: String::new(),
                path: "/opt/cni/bin".to_owned(),
                stdin_data: serde_json::to_vec(config).unwrap(),
            }
        }

        fn netns(&self) -> NetNs {
            NetNs::open(self.netns.path()).unwrap()
        }

        fn store(&self) -> LeaseStore {
            LeaseStore::open(self.data_dir.path()).unwrap()
        }
    }

    fn veth_links(fixture: &Fixture) -> Vec<String> {
        fixture
            .devices()
            .host_link_names()
            .into_iter()
            .filter(|name| name.starts_with("veth"))
            .collect()
    }

    fn assert_host_veth_name(name: &str) {
        assert_eq!(name.len(), 12);
        assert!(name.starts_with("veth"));
        assert!(name[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn attaches_the_first_container_to_the_bridge() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/24");
        let args = fixture.args("container-a", &config);

        let attachment = fixture.controller.attach(&args, &config).unwrap();

        assert_eq!(attachment.address.to_string(), "10.244.1.2/24");
        assert_eq!(attachment.gateway.to_string(), "10.244.1.1");
        assert_host_veth_name(&attachment.host_interface.name);

        let host_end = fixture
            .devices()
            .host_link(&attachment.host_interface.name)
            .unwrap();
        assert!(host_end.up);
        assert_eq!(host_end.master.as_deref(), Some("vxcni0"));

        let container_end = fixture
            .devices()
            .namespace_link(&fixture.netns(), "eth0")
            .unwrap();
        assert!(container_end.up);
        assert_eq!(container_end.link.mtu, 1450);
        assert_eq!(container_end.addresses, vec![attachment.address]);

        let routes = fixture.devices().namespace_routes(&fixture.netns());
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination, None);
        assert_eq!(routes[0].via.to_string(), "10.244.1.1");

        let store = fixture.store();
        let lease = store.get("container-a").unwrap();
        assert_eq!(lease.address, attachment.address);
        assert_eq!(lease.host_interface, attachment.host_interface.name);
        assert_eq!(lease.interface, "eth0");
    }

    #[test]
    fn consecutive_containers_get_consecutive_addresses() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/24");

        let first = fixture
            .controller
            .attach(&fixture.args("container-a", &config), &config)
            .unwrap();
        let other_netns = NamedTempFile::new().unwrap();
        let mut second_args = fixture.args("container-b", &config);
        second_args.netns = other_netns.path().display().to_string();
        let second = fixture.controller.attach(&second_args, &config).unwrap();

        assert_eq!(first.address.to_string(), "10.244.1.2/24");
        assert_eq!(second.address.to_string(), "10.244.1.3/24");
        assert_ne!(first.host_interface.name, second.host_interface.name);
    }

    #[test]
    fn failure_after_veth_creation_leaves_nothing_behind() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/24");
        let args = fixture.args("container-a", &config);
        fixture.devices().fail_on("set_master");

        let result = fixture.controller.attach(&args, &config);

        assert!(result.is_err());
        assert!(veth_links(&fixture).is_empty());
        assert!(fixture
            .devices()
            .namespace_link(&fixture.netns(), "eth0")
            .is_none());
        assert!(fixture.store().is_empty());
        assert!(!fixture.data_dir.path().join("lock").exists());
    }

    #[test]
    fn failure_inside_the_namespace_releases_the_lease() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/24");
        let args = fixture.args("container-a", &config);
        fixture.devices().fail_on("assign_address");

        assert!(fixture.controller.attach(&args, &config).is_err());
        assert!(fixture.store().get("container-a").is_none());
        assert!(veth_links(&fixture).is_empty());
    }

    #[test]
    fn missing_bridge_is_fatal_and_rolled_back() {
        let fixture = Fixture::new();
        let config = NetworkConfig {
            bridge: "br-missing".to_owned(),
            ..fixture.config("10.244.1.0/24")
        };
        let args = fixture.args("container-a", &config);

        let err = fixture.controller.attach(&args, &config).unwrap_err();

        assert!(err.to_string().contains("br-missing"));
        assert!(fixture.store().is_empty());
        assert!(fixture
            .devices()
            .journal()
            .iter()
            .all(|call| !call.starts_with("create_veth_pair")));
    }

    #[test]
    fn missing_namespace_is_fatal() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/24");
        let mut args = fixture.args("container-a", &config);
        args.netns = "/nonexistent/netns".to_owned();

        assert!(fixture.controller.attach(&args, &config).is_err());
        assert!(fixture.store().is_empty());
    }

    #[test]
    fn exhausted_subnet_is_reported() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/30");

        fixture
            .controller
            .attach(&fixture.args("container-a", &config), &config)
            .unwrap();
        let other_netns = NamedTempFile::new().unwrap();
        let mut args = fixture.args("container-b", &config);
        args.netns = other_netns.path().display().to_string();

        let err = fixture.controller.attach(&args, &config).unwrap_err();

        assert!(format!("{err:#}").contains("exhausted"));
    }

    #[test]
    fn attaching_twice_is_refused() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/24");
        let args = fixture.args("container-a", &config);

        fixture.controller.attach(&args, &config).unwrap();
        let err = fixture.controller.attach(&args, &config).unwrap_err();

        assert!(err.to_string().contains("already attached"));
        assert_eq!(fixture.store().len(), 1);
        assert_eq!(veth_links(&fixture).len(), 1);
    }

    #[test]
    fn detach_removes_devices_and_lease_and_is_idempotent() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/24");
        let args = fixture.args("container-a", &config);
        let attachment = fixture.controller.attach(&args, &config).unwrap();

        let lease = fixture.controller.detach(&args, &config).unwrap().unwrap();

        assert_eq!(lease.address, attachment.address);
        assert!(veth_links(&fixture).is_empty());
        assert!(fixture
            .devices()
            .namespace_link(&fixture.netns(), "eth0")
            .is_none());
        assert!(fixture.store().is_empty());
        assert!(fixture.controller.detach(&args, &config).unwrap().is_none());
    }

    #[test]
    fn detach_without_namespace_still_removes_the_host_end() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/24");
        let args = fixture.args("container-a", &config);
        fixture.controller.attach(&args, &config).unwrap();

        let mut del_args = args.clone();
        del_args.netns = String::new();
        fixture.controller.detach(&del_args, &config).unwrap();

        assert!(veth_links(&fixture).is_empty());
        assert!(fixture.store().is_empty());
    }

    #[test]
    fn released_address_is_reused() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/24");
        let args = fixture.args("container-a", &config);

        let first = fixture.controller.attach(&args, &config).unwrap();
        fixture.controller.detach(&args, &config).unwrap();
        let second = fixture
            .controller
            .attach(&fixture.args("container-b", &config), &config)
            .unwrap();

        assert_eq!(first.address, second.address);
    }

    #[test]
    fn add_handler_prints_the_versioned_result() {
        let fixture = Fixture::new();
        let config = fixture.config("10.244.1.0/24");
        let args = fixture.args("container-a", &config);
        let mut out = Vec::new();

        fixture.controller.add(&args, &mut out).unwrap();

        let result: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(result["cniVersion"], "0.4.0");
        assert_eq!(result["ips"][0]["version"], "4");
        assert_eq!(result["ips"][0]["address"], "10.244.1.2/24");
        assert_eq!(result["interfaces"][1]["name"], "eth0");
    }

    #[test]
    fn handler_rejects_configuration_without_subnet() {
        let fixture = Fixture::new();
        let mut args = fixture.args("container-a", &fixture.config("10.244.1.0/24"));
        args.stdin_data = br#"{"cniVersion":"0.4.0","name":"vxlan-cni","type":"vxlan-cni"}"#.to_vec();

        let err = fixture.controller.add(&args, &mut Vec::new()).unwrap_err();

        assert!(err.downcast_ref::<CniError>().is_some());
    }

    #[test]
    fn data_dir_is_created_on_demand() {
        let fixture = Fixture::new();
        let nested = fixture.data_dir.path().join("nested");
        let config = NetworkConfig {
            data_dir: nested.clone(),
            ..fixture.config("10.244.1.0/24")
        };

        fixture
            .controller
            .attach(&fixture.args("container-a", &config), &config)
            .unwrap();

        assert!(Path::new(&nested).join("leases.json").exists());
    }
}
