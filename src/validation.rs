//! Input validation for conversation and device operations

use crate::error::ChatError;
use uuid::Uuid;

/// Validates a message body: must contain at least one non-whitespace character.
pub fn validate_message_body(body: &str) -> Result<(), ChatError> {
    if body.trim().is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    Ok(())
}

/// Validates a push token: must be non-empty after trimming.
pub fn validate_push_token(token: &str) -> Result<(), ChatError> {
    if token.trim().is_empty() {
        return Err(ChatError::InvalidToken);
    }
    Ok(())
}

/// Canonicalizes a participant set for conversation creation.
///
/// Deduplicates, requires the initiator to be part of the set and at least two
/// distinct participants, and returns the ids sorted — the sorted order is the
/// conversation's canonical lookup key.
pub fn canonical_participants(initiator: Uuid, ids: &[Uuid]) -> Result<Vec<Uuid>, ChatError> {
    let mut set: Vec<Uuid> = ids.to_vec();
    set.push(initiator);
    set.sort();
    set.dedup();

    if set.len() < 2 {
        return Err(ChatError::InvalidParticipants(
            "a conversation needs at least two distinct participants".into(),
        ));
    }
    Ok(set)
}

/// Key under which a participant set is stored for idempotent lookup
pub fn participant_key(sorted_ids: &[Uuid]) -> String {
    sorted_ids
        .iter()
        .map(Uuid::to_string)
        .collect::<Vec<_>>()
        .join(":")
}
