use super::{ChainReport, EvidenceEvent, EvidenceStore, GENESIS_HASH, verify_chain};
use crate::errors::ConductorError;
use chrono::Utc;

/// Append/verify front for one evidence chain.
///
/// `open` verifies the stored chain once. A log found corrupt stays readable
/// but refuses every append until the store is repaired by hand.
pub struct EvidenceLog {
    store: Box<dyn EvidenceStore>,
    last_hash: String,
    len: usize,
    corruption: Option<(usize, String)>,
}

impl EvidenceLog {
    pub fn open(store: Box<dyn EvidenceStore>) -> Result<Self, ConductorError> {
        let mut log = Self {
            store,
            last_hash: GENESIS_HASH.to_string(),
            len: 0,
            corruption: None,
        };
        log.reload()?;
        Ok(log)
    }

    fn reload(&mut self) -> Result<ChainReport, ConductorError> {
        let report = match self.store.read_all() {
            Ok(events) => {
                self.len = events.len();
                self.last_hash = events
                    .last()
                    .map_or_else(|| GENESIS_HASH.to_string(), |e| e.hash.clone());
                verify_chain(&events)
            }
            Err(ConductorError::ChainCorruption { index, reason }) => {
                self.len = index;
                ChainReport::broken(index + 1, index, reason)
            }
            Err(e) => return Err(e),
        };

        self.corruption = match (&report.first_bad_index, &report.reason) {
            (Some(index), reason) => {
                let reason = reason.clone().unwrap_or_default();
                tracing::error!(
                    store = %self.store.location(),
                    index,
                    reason = %reason,
                    "evidence chain is corrupt"
                );
                Some((*index, reason))
            }
            (None, _) => None,
        };
        Ok(report)
    }

    /// Link a new event to the current tail and persist it.
    pub fn append(
        &mut self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<EvidenceEvent, ConductorError> {
        if let Some((index, reason)) = &self.corruption {
            return Err(ConductorError::ChainCorruption {
                index: *index,
                reason: format!("refusing to append to a corrupt chain: {reason}"),
            });
        }

        let event = EvidenceEvent::new(event_type, payload, Utc::now(), &self.last_hash);
        self.store.append(&event)?;
        self.last_hash = event.hash.clone();
        self.len += 1;

        tracing::debug!(
            event_type,
            index = self.len - 1,
            hash = %&event.hash[..12],
            "evidence appended"
        );
        Ok(event)
    }

    /// Re-read the store and walk the whole chain.
    pub fn verify(&mut self) -> Result<ChainReport, ConductorError> {
        self.reload()
    }

    /// Every stored event. Fails with `ChainCorruption` on undecodable records.
    pub fn events(&self) -> Result<Vec<EvidenceEvent>, ConductorError> {
        self.store.read_all()
    }

    /// Index and reason of the first bad event, if the chain is corrupt.
    pub fn corruption(&self) -> Option<(usize, &str)> {
        self.corruption.as_ref().map(|(i, r)| (*i, r.as_str()))
    }

    /// Fail with `ChainCorruption` if the chain is not intact.
    pub fn ensure_intact(&self) -> Result<(), ConductorError> {
        match &self.corruption {
            Some((index, reason)) => Err(ConductorError::ChainCorruption {
                index: *index,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn location(&self) -> String {
        self.store.location()
    }
}
