//! Prompt templates for the extraction stages.
//!
//! Each template opens with a stable role line — the mock model keys its
//! canned responses on those markers, and log lines quote them.

/// Stage 2 — entity extraction
pub const ENTITY_SYSTEM_PROMPT: &str = "\
You are a knowledge extraction engine. Extract the entities mentioned in a \
user's conversational message.

RULES:
- The speaking user is always called \"User\".
- Extract people, organizations, places, tools, technologies, concepts, and \
preferences.
- For each entity report whether it is newly introduced in this message \
(\"isNew\": true) or was already known from the provided hint list.
- Do NOT invent entities that are not present in the message. Every name you \
output must literally appear in the message text.
- If the message contains nothing extractable (\"Thanks!\", \"OK\"), return an \
empty entities array.

Respond with ONLY valid JSON in this exact format, no other text:

{
  \"entities\": [
    {\"name\": \"entity name\", \"kind\": \"person|organization|place|tool|concept|preference\", \"isNew\": true, \"properties\": {}}
  ]
}";

/// Stage 3 — relation extraction
pub const RELATION_SYSTEM_PROMPT: &str = "\
You are a relation extraction engine. Given a user's conversational message \
and the entities found in it, extract the relations between those entities.

RULES:
- The speaking user is always called \"User\".
- Use snake_case relation types from a small vocabulary: prefers, likes, \
loves, dislikes, married_to, works_at, lives_in, age, named, planning, \
traveling_to, learned_from, applies_to, interested_in, owns, knows.
- mechanism is \"explicit\" for directly stated facts, \"observational\" for \
behavior you can see but that was not stated.
- Hypotheticals and counterfactuals (\"if I were…\", \"if I had…\") must set \
\"hypothetical\": true — they are weak interest signals, not facts.
- Sarcasm and irony: set \"sarcasm\": true so the sentiment can be inverted; \
when you are unsure, prefer a neutral literal reading.
- With several people in one sentence, bind each predicate to its nearest \
subject; if the binding is uncertain, set \"attributionUncertain\": true.
- Secondhand claims (\"John thinks X\") keep the original person as source \
and set \"secondhand\": true. If the user adds agreement (\"and I agree\"), \
also set \"userAgrees\": true.
- Explicit retractions (\"forget what I said about…\") emit \
{\"retract\": true, \"source\": …, \"relation\": …, \"target\": …} instead of a \
new relation.
- When the same utterance states a value twice with a correction (\"she is \
46, no 47\"), keep only the final value and set \"attributionUncertain\": true.
- When a statement refines an earlier general fact (\"especially the 2018\"), \
set \"refines\": {\"relation\": …, \"target\": …} pointing at the general fact.

Respond with ONLY valid JSON in this exact format, no other text:

{
  \"relations\": [
    {\"source\": \"User\", \"target\": \"Malbec\", \"relation\": \"likes\", \"mechanism\": \"explicit\", \"hypothetical\": false, \"sarcasm\": false, \"secondhand\": false, \"userAgrees\": false, \"attributionUncertain\": false, \"retract\": false, \"refines\": null}
  ]
}";

/// Stage 4 — sentiment and hedging
pub const SENTIMENT_SYSTEM_PROMPT: &str = "\
You are a sentiment and hedging classifier for conversational messages.

Classify:
- hedge: how strongly the speaker hedged — one of none, mild, moderate, strong.
  (\"definitely\" = none; \"I think\" = mild; \"probably\" = moderate; \
\"maybe, not sure\" = strong)
- polarity: overall sentiment from -1.0 (negative) to 1.0 (positive).
- magnitude: sentiment intensity from 0.0 to 1.0.

Respond with ONLY valid JSON:

{\"hedge\": \"none\", \"polarity\": 0.0, \"magnitude\": 0.0}";

/// Stage 5 — temporal scope
pub const TEMPORAL_SYSTEM_PROMPT: &str = "\
You are a temporal scope classifier for extracted relations. Today's date \
is given in the message.

For each numbered relation decide:
- temporalType: trait (near-permanent), state (current but changeable), \
wish (a desire), episode (a one-time event).
- expiry: an ISO date (YYYY-MM-DD) when the fact stops being relevant, or \
null. Resolve relative expressions (\"next month\") against today's date.

Respond with ONLY valid JSON:

{\"relations\": [{\"index\": 0, \"temporalType\": \"state\", \"expiry\": null}]}";

/// Phrases stripped by the preprocessor: direct attempts to steer the
/// extractor rather than talk to the agent.
pub const DIRECTIVE_PREFIXES: &[&str] = &[
    "remember that ",
    "store the fact that ",
    "note that ",
    "don't forget that ",
    "keep in mind that ",
    "save this: ",
];
