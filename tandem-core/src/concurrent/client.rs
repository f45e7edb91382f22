use std::collections::HashMap;

use crate::activity::Activity;
use crate::jupiter::Jupiter;
use crate::peer::PeerId;
use crate::resource::ResourcePath;

use super::{QueueItem, TransformationResult};

/// Per-participant side of the Jupiter link to the host.
#[derive(Debug)]
pub struct ConcurrentDocumentClient {
    local: PeerId,
    host: PeerId,
    jupiters: HashMap<ResourcePath, Jupiter>,
}

impl ConcurrentDocumentClient {
    pub fn new(local: PeerId, host: PeerId) -> Self {
        Self {
            local,
            host,
            jupiters: HashMap::new(),
        }
    }

    /// Stamp local edits for the host; other activities go to every remote
    /// participant unchanged.
    pub fn transform_outgoing(&mut self, activity: Activity, remote: &[PeerId]) -> Vec<QueueItem> {
        match activity {
            Activity::TextEdit { source, path, operation } => {
                if source != self.local {
                    log::warn!("not stamping edit of {path} authored by {source}");
                    return Vec::new();
                }
                let jupiter = self
                    .jupiters
                    .entry(path.clone())
                    .or_insert_with(|| Jupiter::new(false));
                let timestamp = jupiter.generate(operation.clone());
                vec![QueueItem::single(
                    self.host.clone(),
                    Activity::Jupiter {
                        source,
                        path,
                        timestamp,
                        operation,
                    },
                )]
            }
            other if remote.is_empty() => {
                log::debug!("no remote participants for {other:?}");
                Vec::new()
            }
            other => vec![QueueItem::new(remote.to_vec(), other)],
        }
    }

    /// Transform edits relayed by the host into plain edits for local
    /// application.
    pub fn transform_incoming(&mut self, activities: Vec<Activity>) -> TransformationResult {
        let mut result = TransformationResult::default();

        for activity in activities {
            match activity {
                Activity::Jupiter { source, path, timestamp, operation } => {
                    let jupiter = self
                        .jupiters
                        .entry(path.clone())
                        .or_insert_with(|| Jupiter::new(false));
                    match jupiter.receive(timestamp, operation) {
                        Ok(operation) => result.execute_locally.push(Activity::TextEdit {
                            source,
                            path,
                            operation,
                        }),
                        Err(e) => log::warn!("dropping edit of {path} from {source}: {e}"),
                    }
                }
                other => result.execute_locally.push(other),
            }
        }

        result
    }

    pub fn reset(&mut self, path: &ResourcePath) {
        self.jupiters.remove(path);
    }

    pub fn host(&self) -> &PeerId {
        &self.host
    }
}
