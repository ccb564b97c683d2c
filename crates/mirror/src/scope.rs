use std::collections::BTreeSet;

use waymark_engine::file::directory_of;
use waymark_engine::Event;

/// Which events are mirrored.
///
/// An empty entity-type set admits every type; an empty directory list admits
/// every directory. When directories are configured, an event is in scope
/// only if its payload names a `directory` (or a `path` to derive one from)
/// under one of the prefixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorScope {
    pub entity_types: BTreeSet<String>,
    pub directories: Vec<String>,
}

impl MirrorScope {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn includes(&self, event: &Event) -> bool {
        if !self.entity_types.is_empty() && !self.entity_types.contains(&event.entity_type) {
            return false;
        }
        if self.directories.is_empty() {
            return true;
        }
        let directory = event
            .payload
            .get("directory")
            .and_then(|v| v.as_str())
            .or_else(|| {
                event
                    .payload
                    .get("path")
                    .and_then(|v| v.as_str())
                    .map(directory_of)
            });
        match directory {
            Some(dir) => self.directories.iter().any(|prefix| under(dir, prefix)),
            None => false,
        }
    }
}

fn under(directory: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        return true;
    }
    let directory = directory.trim_matches('/');
    directory == prefix
        || directory
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}
