use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::{ArcSwap, Guard};
use bytes::Bytes;
use cqlroute_cql::frame::frame_errors::LowLevelDeserializationError;
use cqlroute_cql::frame::types;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::TabletParsingError;
use crate::routing::{Shard, Token};
use crate::utils::safe_format::IteratorSafeFormatExt;

/// Custom payload key under which Scylla sends tablet routing info
/// for a request that reached a non-replica.
pub const CUSTOM_PAYLOAD_TABLETS_V1_KEY: &str = "tablets-routing-v1";

/// Identifies a table.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TableSpec {
    ks_name: String,
    table_name: String,
}

impl TableSpec {
    /// Creates a table identifier.
    pub fn new(ks_name: impl Into<String>, table_name: impl Into<String>) -> Self {
        TableSpec {
            ks_name: ks_name.into(),
            table_name: table_name.into(),
        }
    }

    /// Keyspace name.
    pub fn ks_name(&self) -> &str {
        &self.ks_name
    }

    /// Table name.
    pub fn table_name(&self) -> &str {
        &self.table_name
    }
}

// Hashes exactly like `TableSpec`, so the map can be queried
// with borrowed names without allocating a key.
#[derive(Hash)]
struct TableSpecQueryKey<'a> {
    ks_name: &'a str,
    table_name: &'a str,
}

impl hashbrown::Equivalent<TableSpec> for TableSpecQueryKey<'_> {
    fn equivalent(&self, key: &TableSpec) -> bool {
        self.ks_name == key.ks_name && self.table_name == key.table_name
    }
}

/// A token range `(first_token, last_token]` together with its replicas.
///
/// Bounds are raw i64 values: the exclusive start of the first tablet
/// of a table is `i64::MIN`, which is not a valid [`Token`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tablet {
    first_token: i64,
    last_token: i64,
    replicas: Arc<[(Uuid, Shard)]>,
}

impl Tablet {
    /// Creates a tablet owning `(first_token, last_token]`.
    pub fn new(
        first_token: i64,
        last_token: i64,
        replicas: Vec<(Uuid, Shard)>,
    ) -> Result<Self, TabletParsingError> {
        if first_token >= last_token {
            return Err(TabletParsingError::EmptyRange {
                first: first_token,
                last: last_token,
            });
        }
        Ok(Tablet {
            first_token,
            last_token,
            replicas: replicas.into(),
        })
    }

    /// Extracts the tablet from a response's custom payload.
    ///
    /// Returns `None` if the payload carries no tablet info.
    pub fn from_custom_payload(
        payload: &HashMap<String, Bytes>,
    ) -> Option<Result<Tablet, TabletParsingError>> {
        let raw = payload.get(CUSTOM_PAYLOAD_TABLETS_V1_KEY)?;
        Some(Self::deserialize(raw))
    }

    // The value is a serialized `tuple<bigint, bigint, list<tuple<uuid, int>>>`,
    // i.e. every element is prefixed with its [int] length.
    fn deserialize(mut buf: &[u8]) -> Result<Tablet, TabletParsingError> {
        let first_token = read_exact_field(&mut buf, types::read_long)?;
        let last_token = read_exact_field(&mut buf, types::read_long)?;

        let mut list = types::read_bytes(&mut buf)?;
        let count = types::read_int_length(&mut list)?;
        let mut replicas = Vec::with_capacity(count.min(list.len()));
        for _ in 0..count {
            let mut element = types::read_bytes(&mut list)?;
            let host_id = read_exact_field(&mut element, types::read_uuid)?;
            let shard = read_exact_field(&mut element, types::read_int)?;
            let shard =
                Shard::try_from(shard).map_err(|_| TabletParsingError::NegativeShard(shard))?;
            if !element.is_empty() {
                return Err(TabletParsingError::TrailingBytes(element.len()));
            }
            replicas.push((host_id, shard));
        }

        for rest in [list, buf] {
            if !rest.is_empty() {
                return Err(TabletParsingError::TrailingBytes(rest.len()));
            }
        }

        Tablet::new(first_token, last_token, replicas)
    }

    /// Exclusive lower bound.
    pub fn first_token(&self) -> i64 {
        self.first_token
    }

    /// Inclusive upper bound.
    pub fn last_token(&self) -> i64 {
        self.last_token
    }

    /// Replicas in the order the server listed them.
    pub fn replicas(&self) -> &[(Uuid, Shard)] {
        &self.replicas
    }

    fn contains(&self, token: Token) -> bool {
        self.first_token < token.value() && token.value() <= self.last_token
    }

    fn has_replica(&self, host_id: Uuid) -> bool {
        self.replicas.iter().any(|(id, _)| *id == host_id)
    }
}

fn read_exact_field<'a, T>(
    buf: &mut &'a [u8],
    read: impl FnOnce(&mut &'a [u8]) -> Result<T, LowLevelDeserializationError>,
) -> Result<T, TabletParsingError> {
    let mut field = types::read_bytes(buf)?;
    let value = read(&mut field)?;
    if !field.is_empty() {
        return Err(TabletParsingError::TrailingBytes(field.len()));
    }
    Ok(value)
}

/// Tablets of a single table: a sorted set of non-overlapping tablets.
///
/// Snapshots are immutable. Every mutation builds a new `TableTablets`.
#[derive(Clone, Debug)]
pub struct TableTablets {
    table_spec: TableSpec,
    tablet_list: Vec<Tablet>,
}

impl TableTablets {
    fn new(table_spec: TableSpec) -> Self {
        Self {
            table_spec,
            tablet_list: Vec::new(),
        }
    }

    /// The table these tablets belong to.
    pub fn table_spec(&self) -> &TableSpec {
        &self.table_spec
    }

    /// All tablets, sorted by token.
    pub fn tablets(&self) -> &[Tablet] {
        &self.tablet_list
    }

    /// The tablet covering `token`, if any.
    pub fn tablet_for_token(&self, token: Token) -> Option<&Tablet> {
        let idx = self
            .tablet_list
            .partition_point(|tablet| tablet.last_token < token.value());
        self.tablet_list
            .get(idx)
            .filter(|tablet| tablet.contains(token))
    }

    /// Evicts every tablet overlapping `tablet`, then inserts it.
    ///
    /// Overlapping tablets are removed whole, even if only part of their
    /// range is covered by the new tablet.
    fn add_tablet(&mut self, tablet: Tablet) {
        // First tablet ending after `tablet` starts.
        let left_idx = self
            .tablet_list
            .partition_point(|t| t.last_token <= tablet.first_token);
        // First tablet starting at or after `tablet` ends.
        let right_idx = self
            .tablet_list
            .partition_point(|t| t.first_token < tablet.last_token);
        self.tablet_list.drain(left_idx..right_idx);
        self.tablet_list.insert(left_idx, tablet);
    }

    /// Removes tablets listing `host_id`. Returns how many were removed
    /// and how many of those had other replicas too.
    fn remove_host(&mut self, host_id: Uuid) -> (usize, usize) {
        let mut removed = 0;
        let mut with_other_replicas = 0;
        self.tablet_list.retain(|tablet| {
            if !tablet.has_replica(host_id) {
                return true;
            }
            removed += 1;
            if tablet.replicas.iter().any(|(id, _)| *id != host_id) {
                with_other_replicas += 1;
            }
            false
        });
        (removed, with_other_replicas)
    }
}

type TableEntry = Arc<ArcSwap<TableTablets>>;

/// Tablet routing info of all tablet-enabled tables.
///
/// Readers never block: they load a snapshot of the table's tablet set.
/// Writers replace a table's snapshot with a compare-and-swap, retrying
/// when another writer got there first, so no update is lost.
#[derive(Debug, Default)]
pub struct TabletMap {
    tables: ArcSwap<hashbrown::HashMap<TableSpec, TableEntry>>,
}

impl TabletMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn table_entry(&self, keyspace: &str, table: &str) -> Option<TableEntry> {
        let query = TableSpecQueryKey {
            ks_name: keyspace,
            table_name: table,
        };
        self.tables.load().get(&query).cloned()
    }

    fn table_entry_or_insert(&self, keyspace: &str, table: &str) -> TableEntry {
        if let Some(entry) = self.table_entry(keyspace, table) {
            return entry;
        }

        let table_spec = TableSpec::new(keyspace, table);
        let fresh: TableEntry = Arc::new(ArcSwap::from_pointee(TableTablets::new(
            table_spec.clone(),
        )));
        let mut entry = Arc::clone(&fresh);
        self.tables.rcu(|tables| {
            let mut tables = hashbrown::HashMap::clone(tables);
            entry = Arc::clone(tables.entry(table_spec.clone()).or_insert_with(|| {
                debug!(
                    keyspace = table_spec.ks_name(),
                    table = table_spec.table_name(),
                    "Found new tablets table"
                );
                Arc::clone(&fresh)
            }));
            tables
        });
        entry
    }

    // Optimistic read-modify-write of one table's snapshot. `f` returns
    // `None` if it has nothing to change.
    fn update_table<R>(
        entry: &ArcSwap<TableTablets>,
        mut f: impl FnMut(&TableTablets) -> (Option<TableTablets>, R),
    ) -> R {
        let mut current = entry.load_full();
        loop {
            let (next, result) = f(&current);
            let Some(next) = next else {
                return result;
            };
            let previous = entry.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&previous, &current) {
                return result;
            }
            current = Guard::into_inner(previous);
        }
    }

    /// A snapshot of the tablets of a table.
    pub fn table_tablets(&self, keyspace: &str, table: &str) -> Option<Arc<TableTablets>> {
        self.table_entry(keyspace, table)
            .map(|entry| entry.load_full())
    }

    /// Replicas of the tablet covering `token`. Empty if the table has no
    /// tablet info or no tablet covers the token.
    pub fn get_replicas(&self, keyspace: &str, table: &str, token: Token) -> Vec<(Uuid, Shard)> {
        let Some(entry) = self.table_entry(keyspace, table) else {
            return Vec::new();
        };
        let snapshot = entry.load();
        snapshot
            .tablet_for_token(token)
            .map(|tablet| tablet.replicas().to_vec())
            .unwrap_or_default()
    }

    /// Inserts a tablet, evicting every tablet of the table it overlaps.
    pub fn add_tablet(&self, keyspace: &str, table: &str, tablet: Tablet) {
        let entry = self.table_entry_or_insert(keyspace, table);
        Self::update_table(&entry, |current| {
            let mut next = current.clone();
            next.add_tablet(tablet.clone());
            (Some(next), ())
        })
    }

    /// Drops tablet info of every table in `keyspace`.
    pub fn remove_keyspace(&self, keyspace: &str) {
        self.tables.rcu(|tables| {
            let mut tables = hashbrown::HashMap::clone(tables);
            tables.retain(|spec, _| spec.ks_name() != keyspace);
            tables
        });
    }

    /// Drops tablet info of one table.
    pub fn remove_table(&self, keyspace: &str, table: &str) {
        let query = TableSpecQueryKey {
            ks_name: keyspace,
            table_name: table,
        };
        self.tables.rcu(|tables| {
            let mut tables = hashbrown::HashMap::clone(tables);
            tables.remove(&query);
            tables
        });
    }

    /// Removes every tablet that lists `host_id` among its replicas,
    /// including tablets that still have other replicas.
    /// Returns the number of removed tablets.
    pub fn remove_host(&self, host_id: Uuid) -> usize {
        let tables = self.tables.load_full();
        let mut total_removed = 0;
        let mut affected_tables = Vec::new();
        for (spec, entry) in tables.iter() {
            let (removed, with_other_replicas) = Self::update_table(entry, |current| {
                let mut next = current.clone();
                let counts = next.remove_host(host_id);
                if counts.0 == 0 {
                    (None, counts)
                } else {
                    (Some(next), counts)
                }
            });
            total_removed += removed;
            if with_other_replicas > 0 {
                affected_tables.push((spec, with_other_replicas));
            }
        }

        if !affected_tables.is_empty() {
            warn!(
                host_id = %host_id,
                "Removed tablets that still had other replicas: {}. Requests to their ranges \
                 fall back to token ring routing until the server sends fresh tablet info.",
                affected_tables
                    .iter()
                    .map(|(spec, n)| format!("{}.{} ({})", spec.ks_name(), spec.table_name(), n))
                    .safe_format(", ")
            );
        }
        total_removed
    }

    /// Number of tables with tablet info.
    pub fn table_count(&self) -> usize {
        self.tables.load().len()
    }
}
