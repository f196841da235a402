use async_trait::async_trait;
use relay_common::Principal;
use relay_plane::{AccessSource, AccessSourceError};

/// Access source backed by the permission strings carried on the principal.
///
/// Permissions follow the `topic:<pattern>` shape with `*` wildcards, e.g.
/// `topic:*` or `topic:doc:*`. The external ACL document store resolves to
/// these strings upstream; the event plane caches our answers for 30 s, so
/// this check stays cheap and pure.
pub struct PermissionSource;

#[async_trait]
impl AccessSource for PermissionSource {
    async fn check_topic_access(
        &self,
        principal: &Principal,
        topic: &str,
    ) -> Result<bool, AccessSourceError> {
        Ok(principal.permissions.iter().any(|permission| {
            permission
                .strip_prefix("topic:")
                .is_some_and(|pattern| wildcard_match(pattern, topic))
        }))
    }
}

fn wildcard_match(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    let (mut p_idx, mut v_idx) = (0usize, 0usize);
    let (mut star_idx, mut match_idx) = (None, 0usize);
    let pattern_bytes = pattern.as_bytes();
    let value_bytes = value.as_bytes();

    while v_idx < value_bytes.len() {
        if p_idx < pattern_bytes.len() && pattern_bytes[p_idx] == b'*' {
            star_idx = Some(p_idx);
            match_idx = v_idx;
            p_idx += 1;
            continue;
        }

        if p_idx < pattern_bytes.len() && pattern_bytes[p_idx] == value_bytes[v_idx] {
            p_idx += 1;
            v_idx += 1;
            continue;
        }

        if let Some(star) = star_idx {
            p_idx = star + 1;
            match_idx += 1;
            v_idx = match_idx;
            continue;
        }

        return false;
    }

    while p_idx < pattern_bytes.len() && pattern_bytes[p_idx] == b'*' {
        p_idx += 1;
    }

    p_idx == pattern_bytes.len()
}
