//! Shared destination model that loaders insert into.
//!
//! Workers insert concurrently while a UI thread iterates; readers always
//! get an owned snapshot, so they never hold the lock while rendering.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::enums::SortBy;
use crate::instance::DicomInstance;

/// What a loader needs from the aggregate it fills.
pub trait DestinationModel: Send + Sync {
    /// Adds one unit. Returns `false` if a unit with the same identity exists.
    fn insert(&self, instance: DicomInstance) -> bool;

    fn contains(&self, sop_instance_uid: &str) -> bool;

    /// Snapshot of all units in insertion order.
    fn instances(&self) -> Vec<Arc<DicomInstance>>;

    fn len(&self) -> usize {
        self.instances().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct ModelInner {
    instances: Vec<Arc<DicomInstance>>,
    sop_uids: HashSet<String>,
    series_order: Vec<String>,
    by_series: HashMap<String, Vec<Arc<DicomInstance>>>,
}

/// Append-only, thread-safe store of instances grouped by series.
pub struct DicomModel {
    inner: RwLock<ModelInner>,
    revision: watch::Sender<u64>,
}

impl Default for DicomModel {
    fn default() -> Self {
        Self::new()
    }
}

impl DicomModel {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: RwLock::new(ModelInner::default()),
            revision,
        }
    }

    /// Series Instance UIDs in first-seen order.
    pub fn series_uids(&self) -> Vec<String> {
        self.inner.read().series_order.clone()
    }

    /// Instances of one series, ordered by `sort_by`.
    pub fn series(&self, series_instance_uid: &str, sort_by: SortBy) -> Vec<Arc<DicomInstance>> {
        let mut instances = self
            .inner
            .read()
            .by_series
            .get(series_instance_uid)
            .cloned()
            .unwrap_or_default();
        sort_instances(&mut instances, sort_by);
        instances
    }

    /// Bumped on every successful insertion.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }
}

impl DestinationModel for DicomModel {
    fn insert(&self, instance: DicomInstance) -> bool {
        {
            let mut inner = self.inner.write();
            if !inner.sop_uids.insert(instance.sop_instance_uid.clone()) {
                return false;
            }
            let instance = Arc::new(instance);
            let series = instance.series_instance_uid.clone();
            if !inner.by_series.contains_key(&series) {
                inner.series_order.push(series.clone());
            }
            inner
                .by_series
                .entry(series)
                .or_default()
                .push(instance.clone());
            inner.instances.push(instance);
        }
        self.revision.send_modify(|rev| *rev += 1);
        true
    }

    fn contains(&self, sop_instance_uid: &str) -> bool {
        self.inner.read().sop_uids.contains(sop_instance_uid)
    }

    fn instances(&self) -> Vec<Arc<DicomInstance>> {
        self.inner.read().instances.clone()
    }

    fn len(&self) -> usize {
        self.inner.read().instances.len()
    }
}

fn sort_key(instance: &DicomInstance, sort_by: SortBy) -> Option<f64> {
    match sort_by {
        SortBy::ImagePositionPatient => instance.image_position_z.map(f64::from),
        SortBy::TablePosition => instance.table_position.map(f64::from),
        SortBy::InstanceNumber => instance.instance_number.map(f64::from),
        SortBy::None => Some(0.0),
    }
}

/// Stable sort; instances without the key keep their order at the end.
/// Image position is sorted descending (head first for axial stacks).
pub fn sort_instances(instances: &mut Vec<Arc<DicomInstance>>, sort_by: SortBy) {
    if matches!(sort_by, SortBy::None) {
        return;
    }

    let (mut keyed, unkeyed): (Vec<_>, Vec<_>) = instances
        .drain(..)
        .map(|instance| (sort_key(&instance, sort_by), instance))
        .partition(|(key, _)| key.is_some());

    keyed.sort_by(|a, b| {
        let (a, b) = (a.0.unwrap_or_default(), b.0.unwrap_or_default());
        a.total_cmp(&b)
    });
    if matches!(sort_by, SortBy::ImagePositionPatient) {
        keyed.reverse();
    }

    instances.extend(keyed.into_iter().chain(unkeyed).map(|(_, instance)| instance));
}
