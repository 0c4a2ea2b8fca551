//! Episode records — one per accepted interaction.
//!
//! Episodes are the provenance anchor: the source utterance is discarded
//! after extraction, but the episode keeps enough metadata to answer
//! "where did this edge come from" long after the conversation ended.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A compact record of one interaction that produced one or more edges
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    /// Unique identifier (UUID v4)
    pub id: String,
    /// When the interaction occurred
    pub occurred_at: DateTime<Utc>,
    /// Conversation session
    pub session_id: String,
    /// Turn within the session
    pub turn_number: u32,
    /// Channel tag (chat, voice, …)
    pub channel: String,
    /// Overall sentiment of the utterance (-1.0 to 1.0)
    pub sentiment: f64,
    /// Outcome score, updated by later feedback (0.0 to 1.0)
    pub outcome: f64,
    /// Edges this episode contributed to
    pub edge_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_episode_serializes_camel_case() {
        let ep = Episode {
            id: "ep1".to_string(),
            occurred_at: Utc::now(),
            session_id: "s1".to_string(),
            turn_number: 3,
            channel: "chat".to_string(),
            sentiment: 0.4,
            outcome: 0.0,
            edge_ids: vec!["e1".to_string()],
        };
        let json = serde_json::to_value(&ep).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["turnNumber"], 3);
        assert_eq!(json["edgeIds"][0], "e1");
    }
}
