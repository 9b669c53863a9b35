use crate::store::StoreError;

fn validate_key_segment(field: &str, value: &str) -> Result<(), StoreError> {
    if value.is_empty() {
        return Err(StoreError::Validation(format!("{field} must not be empty")));
    }
    if value.contains(':') {
        return Err(StoreError::Validation(format!(
            "{field} must not contain ':'"
        )));
    }
    Ok(())
}

fn reverse_ts(timestamp_ms: i64) -> u64 {
    u64::MAX - timestamp_ms.max(0) as u64
}

pub fn paper_key(arxiv_id: &str) -> Result<String, StoreError> {
    validate_key_segment("arxiv_id", arxiv_id)?;
    Ok(arxiv_id.to_string())
}

/// Newest first when iterated in key order.
pub fn paper_added_index_key(added_ms: i64, arxiv_id: &str) -> Result<String, StoreError> {
    validate_key_segment("arxiv_id", arxiv_id)?;
    Ok(format!("{:020}:{}", reverse_ts(added_ms), arxiv_id))
}

/// `platform:chat_id` with the chat id percent-encoded, so Matrix room ids
/// (`!room:server`) never introduce extra separators.
pub fn recipient_key(platform: &str, chat_id: &str) -> Result<String, StoreError> {
    validate_key_segment("platform", platform)?;
    if chat_id.is_empty() {
        return Err(StoreError::Validation("chat_id must not be empty".to_string()));
    }
    Ok(format!("{}:{}", platform, urlencoding::encode(chat_id)))
}

pub fn subscriber_key(platform: &str, chat_id: &str) -> Result<String, StoreError> {
    recipient_key(platform, chat_id)
}

pub fn delivery_key(arxiv_id: &str, platform: &str, chat_id: &str) -> Result<String, StoreError> {
    validate_key_segment("arxiv_id", arxiv_id)?;
    Ok(format!("{}:{}", arxiv_id, recipient_key(platform, chat_id)?))
}

pub fn delivery_prefix(arxiv_id: &str) -> Result<String, StoreError> {
    validate_key_segment("arxiv_id", arxiv_id)?;
    Ok(format!("{}:", arxiv_id))
}

pub fn recipient_delivery_key(
    platform: &str,
    chat_id: &str,
    notified_ms: i64,
    arxiv_id: &str,
) -> Result<String, StoreError> {
    validate_key_segment("arxiv_id", arxiv_id)?;
    Ok(format!(
        "{}:{:020}:{}",
        recipient_key(platform, chat_id)?,
        reverse_ts(notified_ms),
        arxiv_id
    ))
}

pub fn recipient_delivery_prefix(platform: &str, chat_id: &str) -> Result<String, StoreError> {
    Ok(format!("{}:", recipient_key(platform, chat_id)?))
}
