use crate::domain::models::{DeviceRecord, DeviceSummary, DeviceType};
use serde::Serialize;
use std::collections::HashMap;

/// Host-visible snapshot of every known device
///
/// Only the coordinator's refresh path builds new registries; everyone else
/// holds an `Arc<Registry>` that never changes underneath them.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Registry {
    devices: HashMap<String, DeviceRecord>,
}

impl Registry {
    pub fn get(&self, id: &str) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// All records, ordered by id
    pub fn list(&self) -> Vec<&DeviceRecord> {
        let mut records: Vec<_> = self.devices.values().collect();
        records.sort_by(|a, b| a.id().cmp(b.id()));
        records
    }

    pub fn list_by_type(&self, device_type: DeviceType) -> Vec<&DeviceRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.device_type == device_type)
            .collect()
    }

    /// Record for `summary`, created from the listing when new
    pub(crate) fn upsert(&mut self, summary: &DeviceSummary) -> &mut DeviceRecord {
        self.devices
            .entry(summary.id.clone())
            .and_modify(|record| record.apply_summary(summary))
            .or_insert_with(|| DeviceRecord::from_summary(summary))
    }

    /// Add `summary` only if the id is unknown
    pub(crate) fn insert_if_absent(&mut self, summary: &DeviceSummary) {
        self.devices
            .entry(summary.id.clone())
            .or_insert_with(|| DeviceRecord::from_summary(summary));
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<DeviceRecord> {
        self.devices.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Feature;

    fn summary(id: &str, name: &str, device_type: DeviceType) -> DeviceSummary {
        DeviceSummary {
            id: id.into(),
            name: name.into(),
            device_type,
            features: [Feature::Lighting].into_iter().collect(),
        }
    }

    #[test]
    fn test_upsert_keeps_id_and_updates_name() {
        let mut registry = Registry::default();
        registry.upsert(&summary("b", "Old", DeviceType::Controller));
        registry.upsert(&summary("b", "New", DeviceType::Controller));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("b").map(|r| r.name.as_str()), Some("New"));
    }

    #[test]
    fn test_insert_if_absent_never_overwrites() {
        let mut registry = Registry::default();
        registry.upsert(&summary("a", "Tent", DeviceType::Controller));
        registry.insert_if_absent(&summary("a", "Renamed", DeviceType::Sensor));

        let record = registry.get("a").unwrap();
        assert_eq!(record.name, "Tent");
        assert_eq!(record.device_type, DeviceType::Controller);
    }

    #[test]
    fn test_list_is_ordered_and_filterable() {
        let mut registry = Registry::default();
        registry.upsert(&summary("c", "Fan", DeviceType::Actuator));
        registry.upsert(&summary("a", "Tent", DeviceType::Controller));
        registry.upsert(&summary("b", "Probe", DeviceType::Sensor));

        let ids: Vec<_> = registry.list().into_iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        let sensors = registry.list_by_type(DeviceType::Sensor);
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].id(), "b");

        assert!(registry.remove("b").is_some());
        assert!(!registry.contains("b"));
    }
}
