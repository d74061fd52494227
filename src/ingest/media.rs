// ABOUTME: Normalizes incoming media into content blocks under policy limits
// ABOUTME: Violations either fail ingest or drop the offending item, per config

use switchboard_core::config::{MediaPolicyConfig, MediaViolationAction};
use switchboard_core::error::{Error, MediaViolation};
use switchboard_core::model::ContentBlock;
use switchboard_core::IncomingMedia;

const FALLBACK_FILE_MEDIA_TYPE: &str = "application/octet-stream";

/// Result of normalizing one message's media set.
#[derive(Debug, Default)]
pub struct MediaOutcome {
    pub blocks: Vec<ContentBlock>,
    /// Items dropped under `on_policy_violation = drop`.
    pub dropped: Vec<MediaViolation>,
}

/// Check one item against the policy, without size-budget context.
fn check_item(
    item: &IncomingMedia,
    config: &MediaPolicyConfig,
) -> Result<(String, Vec<u8>), MediaViolation> {
    if !config.allowed_kinds.contains(&item.kind) {
        return Err(MediaViolation::UnsupportedKind);
    }
    let payload = item.payload.as_ref().ok_or(MediaViolation::MissingPayload)?;
    if payload.is_empty() {
        return Err(MediaViolation::InvalidMediaPayload);
    }
    let media_type = match (&item.media_type, item.kind.media_type_prefix()) {
        (Some(media_type), Some(prefix)) => {
            if !media_type.starts_with(prefix) {
                return Err(MediaViolation::InvalidMediaType);
            }
            media_type.clone()
        }
        (None, Some(_)) => return Err(MediaViolation::InvalidMediaType),
        (Some(media_type), None) => media_type.clone(),
        (None, None) => FALLBACK_FILE_MEDIA_TYPE.to_string(),
    };
    if payload.len() > config.max_item_bytes {
        return Err(MediaViolation::MaxItemBytesExceeded);
    }
    Ok((media_type, payload.clone()))
}

/// Normalize incoming media into canonical content blocks, enforcing item
/// count, per-item and total byte budgets, and kind/media-type agreement.
pub fn normalize_media(
    media: &[IncomingMedia],
    config: &MediaPolicyConfig,
) -> Result<MediaOutcome, Error> {
    let mut outcome = MediaOutcome::default();
    let mut total_bytes = 0usize;

    for item in media {
        let violation = if outcome.blocks.len() >= config.max_items {
            Some(MediaViolation::MaxItemsExceeded)
        } else {
            match check_item(item, config) {
                Ok((media_type, payload)) => {
                    if total_bytes + payload.len() > config.max_total_bytes {
                        Some(MediaViolation::MaxTotalBytesExceeded)
                    } else {
                        total_bytes += payload.len();
                        outcome.blocks.push(ContentBlock::media(
                            item.kind,
                            media_type,
                            payload,
                            item.filename.clone(),
                            item.caption.clone(),
                        ));
                        None
                    }
                }
                Err(violation) => Some(violation),
            }
        };

        if let Some(violation) = violation {
            match config.on_policy_violation {
                MediaViolationAction::Reject => {
                    return Err(Error::MediaPolicyDenied {
                        reason: violation,
                        metadata: serde_json::json!({
                            "kind": item.kind,
                            "media_type": item.media_type,
                            "filename": item.filename,
                        }),
                    });
                }
                MediaViolationAction::Drop => {
                    tracing::debug!(?violation, "dropping media item under policy");
                    outcome.dropped.push(violation);
                }
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::model::MediaKind;

    fn item(kind: MediaKind, media_type: Option<&str>, bytes: usize) -> IncomingMedia {
        IncomingMedia {
            kind,
            media_type: media_type.map(str::to_string),
            payload: Some(vec![0u8; bytes]),
            filename: None,
            caption: None,
        }
    }

    fn config() -> MediaPolicyConfig {
        MediaPolicyConfig {
            max_items: 2,
            max_item_bytes: 100,
            max_total_bytes: 150,
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_media_becomes_blocks() {
        let out = normalize_media(
            &[item(MediaKind::Image, Some("image/png"), 10)],
            &config(),
        )
        .unwrap();
        assert_eq!(out.blocks.len(), 1);
        assert!(out.dropped.is_empty());
        assert!(matches!(out.blocks[0], ContentBlock::Image { .. }));
    }

    #[test]
    fn test_media_type_must_match_kind_prefix() {
        let err = normalize_media(
            &[item(MediaKind::Image, Some("video/mp4"), 10)],
            &config(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::MediaPolicyDenied { reason: MediaViolation::InvalidMediaType, .. }
        ));
    }

    #[test]
    fn test_file_without_media_type_gets_fallback() {
        let out = normalize_media(&[item(MediaKind::File, None, 10)], &config()).unwrap();
        match &out.blocks[0] {
            ContentBlock::File { media_type, .. } => {
                assert_eq!(media_type, "application/octet-stream")
            }
            other => panic!("unexpected block {other:?}"),
        }
    }

    #[test]
    fn test_missing_payload_rejected() {
        let mut bad = item(MediaKind::Image, Some("image/png"), 0);
        bad.payload = None;
        let err = normalize_media(&[bad], &config()).unwrap_err();
        assert!(matches!(
            err,
            Error::MediaPolicyDenied { reason: MediaViolation::MissingPayload, .. }
        ));
    }

    #[test]
    fn test_empty_payload_is_invalid() {
        let err = normalize_media(
            &[item(MediaKind::Image, Some("image/png"), 0)],
            &config(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::MediaPolicyDenied { reason: MediaViolation::InvalidMediaPayload, .. }
        ));
    }

    #[test]
    fn test_item_byte_budget() {
        let err = normalize_media(
            &[item(MediaKind::Image, Some("image/png"), 101)],
            &config(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::MediaPolicyDenied { reason: MediaViolation::MaxItemBytesExceeded, .. }
        ));
    }

    #[test]
    fn test_total_byte_budget() {
        let err = normalize_media(
            &[
                item(MediaKind::Image, Some("image/png"), 100),
                item(MediaKind::Image, Some("image/png"), 60),
            ],
            &config(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::MediaPolicyDenied { reason: MediaViolation::MaxTotalBytesExceeded, .. }
        ));
    }

    #[test]
    fn test_max_items() {
        let items = vec![
            item(MediaKind::Image, Some("image/png"), 10),
            item(MediaKind::Image, Some("image/png"), 10),
            item(MediaKind::Image, Some("image/png"), 10),
        ];
        let err = normalize_media(&items, &config()).unwrap_err();
        assert!(matches!(
            err,
            Error::MediaPolicyDenied { reason: MediaViolation::MaxItemsExceeded, .. }
        ));
    }

    #[test]
    fn test_drop_mode_keeps_valid_items() {
        let mut cfg = config();
        cfg.on_policy_violation = MediaViolationAction::Drop;
        let out = normalize_media(
            &[
                item(MediaKind::Image, Some("image/png"), 10),
                item(MediaKind::Image, Some("text/plain"), 10),
            ],
            &cfg,
        )
        .unwrap();
        assert_eq!(out.blocks.len(), 1);
        assert_eq!(out.dropped, vec![MediaViolation::InvalidMediaType]);
    }

    #[test]
    fn test_unsupported_kind() {
        let mut cfg = config();
        cfg.allowed_kinds = vec![MediaKind::Image];
        let err =
            normalize_media(&[item(MediaKind::Audio, Some("audio/ogg"), 10)], &cfg).unwrap_err();
        assert!(matches!(
            err,
            Error::MediaPolicyDenied { reason: MediaViolation::UnsupportedKind, .. }
        ));
    }
}
