use crate::collection::ResourceCollectionInfo;
use crate::filter::SyncFilter;

/// Comparison of a local listing ("A") against a remote listing ("B").
#[derive(Debug, Clone)]
pub struct ResourceCollectionDiff {
    a: ResourceCollectionInfo,
    b: ResourceCollectionInfo,
    only_in_a: Vec<String>,
    only_in_b: Vec<String>,
    differing: Vec<String>,
}

impl ResourceCollectionDiff {
    pub fn new(a: ResourceCollectionInfo, b: ResourceCollectionInfo) -> Self {
        let mut only_in_a = Vec::new();
        let mut differing = Vec::new();
        for (name, entry) in a.iter() {
            match b.get(name) {
                None => only_in_a.push(name.to_string()),
                Some(other) if other.checksum != entry.checksum => {
                    differing.push(name.to_string())
                }
                Some(_) => {}
            }
        }
        let only_in_b = b
            .names()
            .filter(|name| !a.contains(name))
            .map(str::to_string)
            .collect();

        Self {
            a,
            b,
            only_in_a,
            only_in_b,
            differing,
        }
    }

    pub fn a(&self) -> &ResourceCollectionInfo {
        &self.a
    }

    pub fn b(&self) -> &ResourceCollectionInfo {
        &self.b
    }

    pub fn only_in_a(&self) -> &[String] {
        &self.only_in_a
    }

    pub fn only_in_b(&self) -> &[String] {
        &self.only_in_b
    }

    pub fn differing(&self) -> &[String] {
        &self.differing
    }

    pub fn no_differences_found(&self) -> bool {
        self.only_in_a.is_empty() && self.only_in_b.is_empty() && self.differing.is_empty()
    }

    /// Drop every difference the filter declines to act on.
    ///
    /// The filter sees A's timestamp as "local" and B's as "remote".
    pub fn apply_filter(&mut self, filter: &dyn SyncFilter) {
        let (a, b) = (&self.a, &self.b);
        let keep = |name: &String| {
            filter.should_sync(name, a.last_modified(name), b.last_modified(name))
        };
        self.only_in_a.retain(keep);
        self.only_in_b.retain(keep);
        self.differing.retain(keep);
    }
}
