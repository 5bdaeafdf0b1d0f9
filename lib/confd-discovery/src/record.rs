use std::collections::BTreeMap;

/// One discovered service instance.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Backend-unique service identifier.
    pub id: String,

    /// Service name. Check families match on its suffix.
    pub name: String,

    /// Address the service is reachable at. May be empty, in which case the node's own address applies.
    pub address: String,

    pub port: u16,

    pub tags: Vec<String>,

    /// Backend-specific metadata.
    pub meta: BTreeMap<String, String>,
}

impl ServiceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            address: address.into(),
            port,
            ..Default::default()
        }
    }
}

/// Every service known to the discovery backend at one point in time, keyed by service identifier.
///
/// Snapshots are immutable once built; a newer snapshot replaces an older one whole.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistrySnapshot {
    services: BTreeMap<String, ServiceRecord>,
}

impl RegistrySnapshot {
    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ServiceRecord> {
        self.services.get(id)
    }

    /// Iterates over the records in identifier order.
    pub fn records(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.services.values()
    }
}

impl FromIterator<ServiceRecord> for RegistrySnapshot {
    fn from_iter<I: IntoIterator<Item = ServiceRecord>>(iter: I) -> Self {
        Self {
            services: iter.into_iter().map(|record| (record.id.clone(), record)).collect(),
        }
    }
}

/// Identity of the node this daemon runs on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    pub name: String,
    pub address: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_is_keyed_by_id() {
        let snapshot = [
            ServiceRecord::new("b", "api-go-expvar", "10.0.0.2", 8080),
            ServiceRecord::new("a", "web-php-fpm", "10.0.0.1", 9000),
            ServiceRecord::new("a", "web-php-fpm", "10.0.0.9", 9001),
        ]
        .into_iter()
        .collect::<RegistrySnapshot>();

        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("a").map(|r| r.port), Some(9001));
        assert_eq!(snapshot.records().map(|r| r.id.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
