use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufReader, BufWriter, ErrorKind, Write},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use ipnet::Ipv4Net;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ip::Subnet;

use super::{allocate, IpamError, LeaseIndex};

pub const LEASES_FILE_NAME: &str = "leases.json";

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum LeaseStoreError {
    #[error("Couldn't access the lease store at '{}'! {}", .0.display(), .1)]
    Io(PathBuf, std::io::Error),
    #[error("Couldn't decode the lease store at '{}'! {}", .0.display(), .1)]
    Decode(PathBuf, serde_json::Error),
    #[error("Couldn't encode the lease store! {}", .0)]
    Encode(serde_json::Error),
    #[error("Unsupported lease store version {}!", .0)]
    UnsupportedVersion(u32),
    #[error("Address {} is leased to both '{}' and '{}'!", .0, .1, .2)]
    AddressConflict(Ipv4Addr, String, String),
    #[error("Container '{}' already holds a lease for {}!", .0, .1)]
    ContainerConflict(String, Ipv4Net),
    #[error(transparent)]
    Ipam(#[from] IpamError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lease {
    pub address: Ipv4Net,
    pub interface: String,
    pub host_interface: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LeaseDocument {
    version: u32,
    #[serde(default)]
    leases: BTreeMap<String, Lease>,
}

/// Container leases persisted as a single JSON document.
///
/// The address index is rebuilt from the container map on load and every
/// mutation is committed by replacing the whole document, so an address can
/// never be marked as used without a matching container record (and the
/// other way around). Not synchronized: hold the host lock from `open` to
/// `commit`.
#[derive(Debug)]
pub struct LeaseStore {
    path: PathBuf,
    leases: BTreeMap<String, Lease>,
    addresses: BTreeMap<Ipv4Addr, String>,
}

impl LeaseStore {
    pub fn open(data_dir: &Path) -> Result<Self, LeaseStoreError> {
        fs::create_dir_all(data_dir).map_err(|err| LeaseStoreError::Io(data_dir.to_owned(), err))?;

        let path = data_dir.join(LEASES_FILE_NAME);
        let leases = match File::open(&path) {
            Ok(file) => {
                let document: LeaseDocument = serde_json::from_reader(BufReader::new(file))
                    .map_err(|err| LeaseStoreError::Decode(path.clone(), err))?;

                if document.version != DOCUMENT_VERSION {
                    return Err(LeaseStoreError::UnsupportedVersion(document.version));
                }

                document.leases
            }
            Err(err) if err.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(LeaseStoreError::Io(path, err)),
        };

        let mut store = Self {
            path,
            leases: BTreeMap::new(),
            addresses: BTreeMap::new(),
        };

        for (container_id, lease) in leases {
            store.insert(container_id, lease)?;
        }

        debug!(
            "Loaded {} lease(s) from {}",
            store.leases.len(),
            store.path.display()
        );

        Ok(store)
    }

    pub fn get(&self, container_id: &str) -> Option<&Lease> {
        self.leases.get(container_id)
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn allocate(&self, subnet: &Subnet) -> Result<Ipv4Net, IpamError> {
        allocate(subnet, self)
    }

    /// Stages a lease in memory. Call `commit` to persist it.
    pub fn insert(&mut self, container_id: String, lease: Lease) -> Result<(), LeaseStoreError> {
        if let Some(existing) = self.leases.get(&container_id) {
            return Err(LeaseStoreError::ContainerConflict(
                container_id,
                existing.address,
            ));
        }

        let address = lease.address.addr();
        if let Some(holder) = self.addresses.get(&address) {
            return Err(LeaseStoreError::AddressConflict(
                address,
                holder.to_owned(),
                container_id,
            ));
        }

        self.addresses.insert(address, container_id.clone());
        self.leases.insert(container_id, lease);

        Ok(())
    }

    /// Stages a removal in memory. Call `commit` to persist it.
    pub fn remove(&mut self, container_id: &str) -> Option<Lease> {
        let lease = self.leases.remove(container_id)?;
        self.addresses.remove(&lease.address.addr());

        Some(lease)
    }

    /// Removes the container's lease and commits right away. Releasing a
    /// container without a lease is a no-op.
    pub fn release(&mut self, container_id: &str) -> Result<Option<Lease>, LeaseStoreError> {
        let lease = match self.remove(container_id) {
            Some(lease) => lease,
            None => {
                debug!("No lease held by '{container_id}', nothing to release");
                return Ok(None);
            }
        };

        self.commit()?;
        info!("Released {} held by '{container_id}'", lease.address);

        Ok(Some(lease))
    }

    /// Atomically replaces the on-disk document with the in-memory state.
    pub fn commit(&self) -> Result<(), LeaseStoreError> {
        let document = LeaseDocument {
            version: DOCUMENT_VERSION,
            leases: self.leases.clone(),
        };
        let staging_path = self.path.with_extension("json.tmp");
        let io_error = |err| LeaseStoreError::Io(staging_path.clone(), err);

        let file = File::create(&staging_path).map_err(io_error)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &document).map_err(LeaseStoreError::Encode)?;
        writer.flush().map_err(io_error)?;
        writer
            .get_ref()
            .sync_all()
            .map_err(io_error)?;

        fs::rename(&staging_path, &self.path)
            .map_err(|err| LeaseStoreError::Io(self.path.clone(), err))?;

        if let Some(parent) = self.path.parent() {
            File::open(parent)
                .and_then(|dir| dir.sync_all())
                .map_err(|err| LeaseStoreError::Io(parent.to_owned(), err))?;
        }

        Ok(())
    }
}

impl LeaseIndex for LeaseStore {
    fn is_leased(&self, address: &Ipv4Addr) -> bool {
        self.addresses.contains_key(address)
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, net::Ipv4Addr};

    use crate::{
        ip::Subnet,
        ipam::{IpamError, LeaseIndex},
    };

    use super::{Lease, LeaseStore, LeaseStoreError, LEASES_FILE_NAME};

    fn lease(address: &str, host_interface: &str) -> Lease {
        Lease {
            address: address.parse().unwrap(),
            interface: "eth0".to_owned(),
            host_interface: host_interface.to_owned(),
        }
    }

    #[test]
    fn open_creates_the_data_directory() {
        let temp_dir = tempfile::tempdir().unwrap();
        let data_dir = temp_dir.path().join("nested").join("state");

        let store = LeaseStore::open(&data_dir).unwrap();

        assert!(data_dir.is_dir());
        assert!(store.is_empty());
    }

    #[test]
    fn committed_leases_survive_reopening() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = LeaseStore::open(temp_dir.path()).unwrap();

        store
            .insert("container-a".to_owned(), lease("10.244.1.2/24", "veth00000001"))
            .unwrap();
        store.commit().unwrap();

        let reopened = LeaseStore::open(temp_dir.path()).unwrap();
        assert_eq!(
            reopened.get("container-a"),
            Some(&lease("10.244.1.2/24", "veth00000001"))
        );
        assert!(reopened.is_leased(&Ipv4Addr::new(10, 244, 1, 2)));
        assert!(!temp_dir.path().join("leases.json.tmp").exists());
    }

    #[test]
    fn uncommitted_changes_are_not_persisted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = LeaseStore::open(temp_dir.path()).unwrap();

        store
            .insert("container-a".to_owned(), lease("10.244.1.2/24", "veth00000001"))
            .unwrap();

        assert!(LeaseStore::open(temp_dir.path()).unwrap().is_empty());
    }

    #[test]
    fn sequential_allocations_exhaust_the_pool() {
        let temp_dir = tempfile::tempdir().unwrap();
        let subnet: Subnet = "10.244.1.0/28".parse().unwrap();
        let mut seen = Vec::new();

        for index in 0..subnet.pool_size() {
            let mut store = LeaseStore::open(temp_dir.path()).unwrap();
            let address = store.allocate(&subnet).unwrap();

            assert!(!seen.contains(&address));
            seen.push(address);

            store
                .insert(format!("container-{index}"), lease(&address.to_string(), "veth"))
                .unwrap();
            store.commit().unwrap();
        }

        let store = LeaseStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.len(), 13);
        assert!(matches!(
            store.allocate(&subnet),
            Err(IpamError::RangeExhausted(_))
        ));
    }

    #[test]
    fn release_frees_the_address_and_is_idempotent() {
        let temp_dir = tempfile::tempdir().unwrap();
        let subnet: Subnet = "10.244.1.0/24".parse().unwrap();
        let mut store = LeaseStore::open(temp_dir.path()).unwrap();
        let address = store.allocate(&subnet).unwrap();

        store
            .insert("container-a".to_owned(), lease(&address.to_string(), "veth"))
            .unwrap();
        store.commit().unwrap();

        let mut store = LeaseStore::open(temp_dir.path()).unwrap();
        assert!(store.release("container-a").unwrap().is_some());
        assert!(store.release("container-a").unwrap().is_none());
        assert!(store.release("never-attached").unwrap().is_none());

        let store = LeaseStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.allocate(&subnet).unwrap(), address);
    }

    #[test]
    fn rejects_double_booking() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut store = LeaseStore::open(temp_dir.path()).unwrap();

        store
            .insert("container-a".to_owned(), lease("10.244.1.2/24", "veth1"))
            .unwrap();

        assert!(matches!(
            store.insert("container-b".to_owned(), lease("10.244.1.2/24", "veth2")),
            Err(LeaseStoreError::AddressConflict(..))
        ));
        assert!(matches!(
            store.insert("container-a".to_owned(), lease("10.244.1.3/24", "veth3")),
            Err(LeaseStoreError::ContainerConflict(..))
        ));
    }

    #[test]
    fn detects_corrupted_documents() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join(LEASES_FILE_NAME), "{ not json").unwrap();

        assert!(matches!(
            LeaseStore::open(temp_dir.path()),
            Err(LeaseStoreError::Decode(..))
        ));

        fs::write(
            temp_dir.path().join(LEASES_FILE_NAME),
            r#"{"version":1,"leases":{
                "a":{"address":"10.244.1.2/24","interface":"eth0","hostInterface":"v1"},
                "b":{"address":"10.244.1.2/24","interface":"eth0","hostInterface":"v2"}}}"#,
        )
        .unwrap();

        assert!(matches!(
            LeaseStore::open(temp_dir.path()),
            Err(LeaseStoreError::AddressConflict(..))
        ));
    }

    #[test]
    fn allocation_race_without_the_host_lock() {
        let temp_dir = tempfile::tempdir().unwrap();
        let subnet: Subnet = "10.244.1.0/24".parse().unwrap();

        // two invocations interleaved: both read before either commits
        let mut first = LeaseStore::open(temp_dir.path()).unwrap();
        let mut second = LeaseStore::open(temp_dir.path()).unwrap();
        let first_address = first.allocate(&subnet).unwrap();
        let second_address = second.allocate(&subnet).unwrap();

        first
            .insert("container-a".to_owned(), lease(&first_address.to_string(), "v1"))
            .unwrap();
        first.commit().unwrap();
        second
            .insert("container-b".to_owned(), lease(&second_address.to_string(), "v2"))
            .unwrap();
        second.commit().unwrap();

        assert_eq!(first_address, second_address);
        // last writer wins, the first lease is lost
        let store = LeaseStore::open(temp_dir.path()).unwrap();
        assert!(store.get("container-a").is_none());
    }
}
