use std::collections::HashMap;

use crate::activity::Activity;
use crate::jupiter::Jupiter;
use crate::peer::PeerId;
use crate::resource::ResourcePath;

use super::{QueueItem, TransformationResult};

/// Host-side transformation of edits arriving from every participant.
#[derive(Debug)]
pub struct ConcurrentDocumentServer {
    host: PeerId,
    proxies: HashMap<ResourcePath, HashMap<PeerId, Jupiter>>,
}

impl ConcurrentDocumentServer {
    pub fn new(host: PeerId) -> Self {
        Self {
            host,
            proxies: HashMap::new(),
        }
    }

    /// Transform incoming activities and fan Jupiter edits out to every other
    /// participant. Edits destined for the host itself end up in
    /// `execute_locally` so they pass through the host's own client.
    pub fn transform_incoming(
        &mut self,
        activities: Vec<Activity>,
        participants: &[PeerId],
    ) -> TransformationResult {
        let mut result = TransformationResult::default();

        for activity in activities {
            match activity {
                Activity::Jupiter { source, path, timestamp, operation } => {
                    let proxies = self.proxies.entry(path.clone()).or_default();
                    let proxy = proxies
                        .entry(source.clone())
                        .or_insert_with(|| Jupiter::new(true));

                    let transformed = match proxy.receive(timestamp, operation) {
                        Ok(op) => op,
                        Err(e) => {
                            log::warn!("dropping edit of {path} from {source}: {e}");
                            continue;
                        }
                    };

                    for participant in participants.iter().filter(|p| **p != source) {
                        let proxy = proxies
                            .entry(participant.clone())
                            .or_insert_with(|| Jupiter::new(true));
                        let timestamp = proxy.generate(transformed.clone());
                        let stamped = Activity::Jupiter {
                            source: source.clone(),
                            path: path.clone(),
                            timestamp,
                            operation: transformed.clone(),
                        };
                        if *participant == self.host {
                            result.execute_locally.push(stamped);
                        } else {
                            result
                                .send_to_peers
                                .push(QueueItem::single(participant.clone(), stamped));
                        }
                    }
                }
                other => result.execute_locally.push(other),
            }
        }

        result
    }

    /// Drop every proxy of a participant that left.
    pub fn user_left(&mut self, peer: &PeerId) {
        for proxies in self.proxies.values_mut() {
            proxies.remove(peer);
        }
    }

    /// Forget the synchronisation state of one file.
    pub fn reset(&mut self, path: &ResourcePath) {
        self.proxies.remove(path);
    }

    pub fn proxy_count(&self, path: &ResourcePath) -> usize {
        self.proxies.get(path).map_or(0, HashMap::len)
    }
}
