//! Store key layout. These shapes are bit-exact contracts: every replica
//! of the gateway derives the same keys from the same {tenant, topic}, and
//! tenant isolation rests on the tenant id appearing in every key.
//!
//! Tenant and user ids never contain `:`; topic ids may (`doc:123`), so a
//! topic is always the *last* variable segment of a key, or is recovered by
//! splitting on the first `:` after the tenant.

pub fn stream(prefix: &str, tenant: &str, topic: &str) -> String {
    format!("{prefix}:stream:{tenant}:{topic}")
}

pub fn publish_channel(prefix: &str, tenant: &str, topic: &str) -> String {
    format!("{prefix}:pub:{tenant}:{topic}")
}

/// Pattern covering every tenant/topic publish channel under `prefix`.
pub fn publish_pattern(prefix: &str) -> String {
    format!("{prefix}:pub:*:*")
}

pub fn seq(prefix: &str, tenant: &str, topic: &str) -> String {
    format!("{prefix}:seq:{tenant}:{topic}")
}

pub fn topic_meta(prefix: &str, tenant: &str, topic: &str) -> String {
    format!("{prefix}:topic:{tenant}:{topic}:meta")
}

pub fn topic_meta_pattern(prefix: &str) -> String {
    format!("{prefix}:topic:*:meta")
}

pub fn topic_subscribers(prefix: &str, tenant: &str, topic: &str) -> String {
    format!("{prefix}:topic:{tenant}:{topic}:subscribers")
}

pub fn subscriber_meta(prefix: &str, tenant: &str, sub_id: &str) -> String {
    format!("{prefix}:subscriber:{tenant}:{sub_id}:meta")
}

pub fn subscriber_queue(prefix: &str, tenant: &str, sub_id: &str, topic: &str) -> String {
    format!("{prefix}:sub:{tenant}:{sub_id}:topic:{topic}:queue")
}

pub fn topic_rate(prefix: &str, tenant: &str, topic: &str) -> String {
    format!("{prefix}:rl:{tenant}:{topic}")
}

pub fn presence(prefix: &str, tenant: &str, topic: &str) -> String {
    format!("{prefix}:presence:{tenant}:{topic}")
}

pub fn acl(prefix: &str, topic: &str, user: &str) -> String {
    format!("{prefix}:acl:{topic}:{user}")
}

/// Per-principal action limiter keys share a fixed namespace across
/// deployments rather than the configurable prefix.
pub fn user_action_rate(user: &str, action: &str) -> String {
    format!("rate_limit:user:{user}:{action}")
}

pub fn global_rate() -> String {
    "rate_limit:global".to_string()
}

/// Recover {tenant, topic} from a publish channel name. The tenant runs up
/// to the first `:` after the prefix; the remainder is the topic.
pub fn parse_publish_channel<'a>(prefix: &str, channel: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = channel.strip_prefix(prefix)?.strip_prefix(":pub:")?;
    rest.split_once(':')
}

/// Recover {tenant, topic} from a topic metadata key.
pub fn parse_topic_meta<'a>(prefix: &str, key: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = key
        .strip_prefix(prefix)?
        .strip_prefix(":topic:")?
        .strip_suffix(":meta")?;
    rest.split_once(':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_contract() {
        assert_eq!(stream("rt", "t1", "doc:123"), "rt:stream:t1:doc:123");
        assert_eq!(publish_channel("rt", "t1", "a"), "rt:pub:t1:a");
        assert_eq!(publish_pattern("rt"), "rt:pub:*:*");
        assert_eq!(seq("rt", "t1", "a"), "rt:seq:t1:a");
        assert_eq!(topic_meta("rt", "t1", "a"), "rt:topic:t1:a:meta");
        assert_eq!(
            topic_subscribers("rt", "t1", "a"),
            "rt:topic:t1:a:subscribers"
        );
        assert_eq!(
            subscriber_meta("rt", "t1", "s9"),
            "rt:subscriber:t1:s9:meta"
        );
        assert_eq!(
            subscriber_queue("rt", "t1", "s9", "a"),
            "rt:sub:t1:s9:topic:a:queue"
        );
        assert_eq!(topic_rate("rt", "t1", "a"), "rt:rl:t1:a");
        assert_eq!(presence("rt", "t1", "a"), "rt:presence:t1:a");
        assert_eq!(acl("rt", "a", "u1"), "rt:acl:a:u1");
        assert_eq!(user_action_rate("u1", "publish"), "rate_limit:user:u1:publish");
        assert_eq!(global_rate(), "rate_limit:global");
    }

    #[test]
    fn publish_channel_round_trips_topics_with_colons() {
        let channel = publish_channel("rt", "t1", "doc:123:rev:4");
        let (tenant, topic) = parse_publish_channel("rt", &channel).expect("parse");
        assert_eq!(tenant, "t1");
        assert_eq!(topic, "doc:123:rev:4");
    }

    #[test]
    fn topic_meta_round_trips() {
        let key = topic_meta("rt", "t1", "doc:123");
        let (tenant, topic) = parse_topic_meta("rt", &key).expect("parse");
        assert_eq!(tenant, "t1");
        assert_eq!(topic, "doc:123");
    }

    #[test]
    fn parse_rejects_foreign_prefix() {
        assert!(parse_publish_channel("rt", "other:pub:t1:a").is_none());
        assert!(parse_topic_meta("rt", "rt:stream:t1:a").is_none());
    }
}
