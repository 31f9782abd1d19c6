use std::sync::{Mutex, MutexGuard};

use crate::identity::OverlayIdentity;

use super::{ClusterDirectory, DirectoryError, MemberRecord};

/// An in-memory cluster directory.
#[derive(Debug, Default)]
pub struct FakeDirectory {
    members: Mutex<Vec<MemberRecord>>,
}

impl FakeDirectory {
    pub fn new(members: Vec<MemberRecord>) -> Self {
        Self {
            members: Mutex::new(members),
        }
    }

    pub fn members(&self) -> MutexGuard<'_, Vec<MemberRecord>> {
        self.members
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn member(&self, name: &str) -> Option<MemberRecord> {
        self.members()
            .iter()
            .find(|member| member.name == name)
            .cloned()
    }
}

impl ClusterDirectory for FakeDirectory {
    async fn list_members(&self) -> Result<Vec<MemberRecord>, DirectoryError> {
        Ok(self.members().clone())
    }

    async fn publish_identity(
        &self,
        member: &str,
        identity: &OverlayIdentity,
    ) -> Result<(), DirectoryError> {
        let mut members = self.members();
        let record = members
            .iter_mut()
            .find(|record| record.name == member)
            .ok_or_else(|| DirectoryError::MemberNotFound(member.to_owned()))?;

        record.annotations.extend(identity.to_annotations());

        Ok(())
    }
}
