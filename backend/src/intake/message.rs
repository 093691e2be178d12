use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{PipelineError, PipelineResult};
use crate::types::InboundEvent;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedEntities {
    #[serde(default)]
    pub tokens: Vec<String>,
    /// Some producers use the singular key.
    #[serde(default)]
    pub token: Vec<String>,
    #[serde(default)]
    pub projects: Vec<String>,
    #[serde(default)]
    pub persons: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitiesExtract {
    #[serde(default)]
    pub entities: ExtractedEntities,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageBody {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub entities_extract: Option<EntitiesExtract>,
}

/// Wire form of an intelligence event. The extraction block may sit at the
/// top level or inside `data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntelligenceMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub entities_extract: Option<EntitiesExtract>,
    #[serde(default)]
    pub data: Option<MessageBody>,
}

impl IntelligenceMessage {
    pub fn event_id(&self) -> &str {
        match self.id.trim() {
            "" => self.data.as_ref().map(|d| d.id.trim()).unwrap_or(""),
            id => id,
        }
    }

    fn entities(&self) -> Option<&ExtractedEntities> {
        self.entities_extract
            .as_ref()
            .or_else(|| self.data.as_ref().and_then(|d| d.entities_extract.as_ref()))
            .map(|e| &e.entities)
    }

    /// Tokens then projects, trimmed, case-insensitively de-duplicated.
    pub fn candidate_names(&self) -> Vec<String> {
        let Some(entities) = self.entities() else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        entities
            .tokens
            .iter()
            .chain(entities.token.iter())
            .chain(entities.projects.iter())
            .map(|n| n.trim())
            .filter(|n| !n.is_empty() && seen.insert(n.to_lowercase()))
            .map(str::to_string)
            .collect()
    }

    pub fn into_event(self) -> PipelineResult<InboundEvent> {
        let event_id = self.event_id().to_string();
        if event_id.is_empty() {
            return Err(PipelineError::MalformedPayload("missing event id".to_string()));
        }
        Ok(InboundEvent {
            candidate_names: self.candidate_names(),
            event_id,
        })
    }
}

/// Decodes a raw delivery. Anything that is not a usable event is
/// `MalformedPayload`.
pub fn decode_event(payload: &[u8]) -> PipelineResult<InboundEvent> {
    let message: IntelligenceMessage = serde_json::from_slice(payload)
        .map_err(|e| PipelineError::MalformedPayload(format!("invalid JSON: {}", e)))?;
    message.into_event()
}
