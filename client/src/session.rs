//! Session context shared by the store and the sync driver.

use farmsync_engine::OrganizationId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

/// Current tenant and degraded-mode flag.
#[derive(Debug, Default)]
pub struct SessionContext {
    organization_id: RwLock<Option<OrganizationId>>,
    read_only: AtomicBool,
}

impl SessionContext {
    pub fn new(organization_id: Option<OrganizationId>) -> Self {
        Self {
            organization_id: RwLock::new(organization_id),
            read_only: AtomicBool::new(false),
        }
    }

    pub fn organization_id(&self) -> Option<OrganizationId> {
        self.organization_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_organization(&self, organization_id: Option<OrganizationId>) {
        *self
            .organization_id
            .write()
            .unwrap_or_else(|e| e.into_inner()) = organization_id;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }
}
