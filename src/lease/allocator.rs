use chrono::Utc;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

use super::Pool;
use crate::error::{EdgeError, EdgeResult};
use crate::locks::KeyedMutex;
use crate::store::{LeaseRecord, Store};

/// Attempts per allocation when another writer wins the race for an address.
const MAX_ATTEMPTS: usize = 8;

/// Assigns and releases addresses from each group's pool.
///
/// The lease table is the only record of what is taken; nothing is cached in
/// memory. Allocation within one group is serialised in-process, and the
/// table's UNIQUE constraints turn any remaining race (another process, or a
/// second allocator on the same database) into a retried conflict.
pub struct Allocator {
    store: Store,
    group_locks: KeyedMutex<i64>,
}

impl Allocator {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            group_locks: KeyedMutex::new(),
        }
    }

    /// The parsed pool of a group.
    pub async fn pool(&self, group_id: i64) -> EdgeResult<Pool> {
        let group = self.store.group(group_id).await?.ok_or_else(|| {
            EdgeError::PoolMisconfigured(format!("group {} does not exist", group_id))
        })?;
        Pool::parse(&group.ip_pool)
    }

    /// Return the user's lease in this group, creating one from the first free
    /// non-reserved address if there is none.
    pub async fn allocate(&self, username: &str, group_id: i64) -> EdgeResult<Ipv4Addr> {
        let _guard = self.group_locks.lock(&group_id).await;

        let mut attempt = 1;
        loop {
            match self.try_allocate(username, group_id).await {
                Err(EdgeError::LeaseConflict { address, .. }) if attempt < MAX_ATTEMPTS => {
                    debug!(
                        "Lease conflict on {} in group {} for {}, retrying ({}/{})",
                        address, group_id, username, attempt, MAX_ATTEMPTS
                    );
                    attempt += 1;
                }
                Err(e) => {
                    warn!("Allocation for {} in group {} failed: {}", username, group_id, e);
                    return Err(e);
                }
                Ok(address) => return Ok(address),
            }
        }
    }

    async fn try_allocate(&self, username: &str, group_id: i64) -> EdgeResult<Ipv4Addr> {
        let pool = self.pool(group_id).await?;

        if let Some(lease) = self.store.lease_for(username, group_id).await? {
            return Ok(lease.address);
        }

        let leased = self.store.leased_addresses(group_id).await?;
        let address = pool
            .candidates()
            .find(|addr| !leased.contains(addr))
            .ok_or(EdgeError::PoolExhausted { group: group_id })?;

        self.store
            .insert_lease(&LeaseRecord {
                group_id,
                address,
                username: username.to_string(),
                allocated_at: Utc::now(),
            })
            .await?;

        info!("Leased {} to {} (group {})", address, username, group_id);
        Ok(address)
    }

    /// Drop the user's lease in this group. Releasing nothing is not an error.
    pub async fn release(&self, username: &str, group_id: i64) -> EdgeResult<()> {
        if self.store.delete_lease(username, group_id).await? > 0 {
            info!("Released lease of {} (group {})", username, group_id);
        }
        Ok(())
    }

    /// Leases of a group in address order.
    pub async fn leases(&self, group_id: i64) -> EdgeResult<Vec<LeaseRecord>> {
        self.store.leases(group_id).await
    }
}
