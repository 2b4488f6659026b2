//! Address range allocation
//!
//! Contributors reserve disjoint blocks of instance numbers under a prefix so
//! they can mint addresses offline without colliding:
//!
//! ```text
//! .claims/addresses/alice.json   0.7.1 -> [1, 101)
//! .claims/addresses/bob.json     0.7.1 -> [101, 201)
//! ```
//!
//! Reservation files are per contributor, so overlaps between machines are
//! detected after sync rather than prevented. Entities already created inside
//! an overlapping span are reported with the collision and left in place.

use crate::address::Address;
use crate::contributor::{ContributorId, ContributorLedger, LedgerFile};
use crate::error::{AddressError, Result};
use crate::locks::LockScope;
use crate::store::Store;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Instances per reservation block
pub const RANGE_SIZE: u64 = 100;

/// Subdirectory of the claims dir holding reservation files
pub const ADDRESSES_DIR: &str = "addresses";

/// Exhausted-range re-reservations attempted by one `next_address` call
const MAX_RESERVE_ATTEMPTS: usize = 3;

/// A block of instance numbers `[range_start, range_end)` under a prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressReservation {
    pub contributor_id: ContributorId,
    pub prefix: Address,
    pub range_start: u64,
    /// Exclusive
    pub range_end: u64,
    pub reserved_at: DateTime<Utc>,
}

impl AddressReservation {
    pub fn contains(&self, instance: u64) -> bool {
        (self.range_start..self.range_end).contains(&instance)
    }

    /// Last instance number in the block
    pub fn last(&self) -> u64 {
        self.range_end.saturating_sub(1)
    }

    /// The shared span `[start, end)`, if the two blocks overlap
    pub fn overlap(&self, other: &AddressReservation) -> Option<(u64, u64)> {
        if self.prefix != other.prefix {
            return None;
        }
        let start = self.range_start.max(other.range_start);
        let end = self.range_end.min(other.range_end);
        (start < end).then_some((start, end))
    }
}

/// On-disk shape of `.claims/addresses/<contributor>.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationFile {
    pub contributor_id: ContributorId,
    #[serde(default)]
    pub reservations: Vec<AddressReservation>,
}

impl LedgerFile for ReservationFile {
    type Entry = AddressReservation;

    fn empty(owner: &ContributorId) -> Self {
        Self {
            contributor_id: owner.clone(),
            reservations: Vec::new(),
        }
    }

    fn entries(&self) -> &[AddressReservation] {
        &self.reservations
    }

    fn entries_mut(&mut self) -> &mut Vec<AddressReservation> {
        &mut self.reservations
    }
}

/// Overlapping reservations held by two different contributors
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressCollision {
    pub prefix: Address,
    pub first: AddressReservation,
    pub second: AddressReservation,
    pub overlap_start: u64,
    /// Exclusive
    pub overlap_end: u64,
    /// Entities already on disk inside the overlapping span
    pub affected: Vec<Address>,
}

/// Allocates addresses for one contributor
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    ledger: ContributorLedger<ReservationFile>,
    locks: crate::locks::LockManager,
    nodes_dir: PathBuf,
    range_size: u64,
}

impl AddressAllocator {
    pub fn new(store: &Store, contributor: ContributorId) -> Self {
        Self {
            ledger: ContributorLedger::new(store.claims_dir().join(ADDRESSES_DIR), contributor),
            locks: store.locks().clone(),
            nodes_dir: store.nodes_dir(),
            range_size: RANGE_SIZE,
        }
    }

    pub fn with_range_size(mut self, range_size: u64) -> Self {
        self.range_size = range_size.max(1);
        self
    }

    pub fn contributor(&self) -> &ContributorId {
        self.ledger.owner()
    }

    /// Claim the next block after every existing block under `prefix`.
    ///
    /// The read-compute-write runs under the allocation lock so two local
    /// processes cannot compute the same block.
    pub fn reserve_range(&self, prefix: &Address) -> Result<AddressReservation> {
        let guard = self.locks.acquire(&LockScope::AddressAllocation)?;
        let reservation = self.reserve_locked(prefix)?;
        guard.release()?;
        Ok(reservation)
    }

    fn reserve_locked(&self, prefix: &Address) -> Result<AddressReservation> {
        let max_end = self
            .reservations_for(prefix)?
            .iter()
            .map(|r| r.range_end)
            .max()
            .unwrap_or(1);
        let start = max_end.max(1);
        let end = start
            .checked_add(self.range_size)
            .ok_or_else(|| AddressError::InstanceSpaceExhausted { prefix: prefix.to_string() })?;

        let reservation = AddressReservation {
            contributor_id: self.ledger.owner().clone(),
            prefix: prefix.clone(),
            range_start: start,
            range_end: end,
            reserved_at: Utc::now(),
        };
        self.ledger
            .update_own(|file| file.reservations.push(reservation.clone()))?;

        info!(
            contributor = %reservation.contributor_id,
            %prefix,
            start = reservation.range_start,
            end = reservation.last(),
            "Reserved address range"
        );
        Ok(reservation)
    }

    /// Next free address in this contributor's latest block for `prefix`,
    /// reserving a block first when none exists or the current one is used up.
    ///
    /// Free means no entity directory exists yet, so callers should create
    /// the entity before asking again.
    pub fn next_address(&self, prefix: &Address) -> Result<Address> {
        let mut reservation = match self.latest_own(prefix)? {
            Some(r) => r,
            None => self.reserve_range(prefix)?,
        };

        for _ in 0..MAX_RESERVE_ATTEMPTS {
            let next = self
                .highest_used(prefix, &reservation)?
                .map_or(reservation.range_start, |n| n.saturating_add(1));
            if reservation.contains(next) {
                debug!(%prefix, instance = next, "Allocated address");
                return Ok(prefix.next_instance(next - 1)?);
            }
            debug!(%prefix, end = reservation.last(), "Address range exhausted");
            reservation = self.reserve_range(prefix)?;
        }

        // A fresh block past every known range is empty unless disk and
        // ledgers disagree; fall back to its first number.
        warn!(%prefix, start = reservation.range_start, "Fresh range reports used instances");
        Ok(prefix.next_instance(reservation.range_start - 1)?)
    }

    /// Reservations for `prefix` across every contributor, sorted by start
    pub fn reservations_for(&self, prefix: &Address) -> Result<Vec<AddressReservation>> {
        let mut found: Vec<AddressReservation> = self
            .ledger
            .all_entries()?
            .into_iter()
            .filter(|r| &r.prefix == prefix)
            .collect();
        found.sort_by_key(|r| (r.range_start, r.range_end));
        Ok(found)
    }

    pub fn my_reservations(&self) -> Result<Vec<AddressReservation>> {
        Ok(self.ledger.load_own()?.reservations)
    }

    /// Overlapping ranges between different contributors, per prefix.
    ///
    /// Overlaps within one contributor's own reservations are not reported.
    pub fn detect_collisions(&self) -> Result<Vec<AddressCollision>> {
        let mut by_prefix: BTreeMap<Address, Vec<AddressReservation>> = BTreeMap::new();
        for reservation in self.ledger.all_entries()? {
            by_prefix
                .entry(reservation.prefix.clone())
                .or_default()
                .push(reservation);
        }

        let mut collisions = Vec::new();
        for (prefix, mut ranges) in by_prefix {
            ranges.sort_by(|a, b| {
                (a.range_start, &a.contributor_id).cmp(&(b.range_start, &b.contributor_id))
            });
            for (i, first) in ranges.iter().enumerate() {
                for second in &ranges[i + 1..] {
                    if second.range_start >= first.range_end {
                        break;
                    }
                    if first.contributor_id == second.contributor_id {
                        continue;
                    }
                    let Some((start, end)) = first.overlap(second) else {
                        continue;
                    };
                    let affected = instances_on_disk(&self.nodes_dir, &prefix)?
                        .into_iter()
                        .filter(|a| a.instance_number().is_some_and(|n| (start..end).contains(&n)))
                        .collect();
                    collisions.push(AddressCollision {
                        prefix: prefix.clone(),
                        first: first.clone(),
                        second: second.clone(),
                        overlap_start: start,
                        overlap_end: end,
                        affected,
                    });
                }
            }
        }
        Ok(collisions)
    }

    fn latest_own(&self, prefix: &Address) -> Result<Option<AddressReservation>> {
        Ok(self
            .ledger
            .load_own()?
            .reservations
            .into_iter()
            .filter(|r| &r.prefix == prefix)
            .max_by_key(|r| r.range_start))
    }

    fn highest_used(&self, prefix: &Address, reservation: &AddressReservation) -> Result<Option<u64>> {
        Ok(instances_on_disk(&self.nodes_dir, prefix)?
            .iter()
            .filter_map(Address::instance_number)
            .filter(|n| reservation.contains(*n))
            .max())
    }
}

/// Instance addresses with an entity directory directly beneath `prefix`
pub fn instances_on_disk(nodes_dir: &Path, prefix: &Address) -> Result<Vec<Address>> {
    let dir = nodes_dir.join(prefix.to_path());
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut found = Vec::new();
    for entry in entries.filter_map(std::result::Result::ok) {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Ok(child) = prefix.child(name) {
            if child.is_instance() {
                found.push(child);
            }
        }
    }
    found.sort();
    Ok(found)
}
