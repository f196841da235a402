use crate::{
    glob_match, PubSubMessage, RateDecision, StoreApi, StoreError, StoreResult, StreamEntry,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

const PATTERN_CHANNEL_DEPTH: usize = 1024;

#[derive(Default)]
struct MemStream {
    entries: VecDeque<StreamEntry>,
    next_entry_id: u64,
}

#[derive(Default)]
struct RateWindow {
    // (epoch seconds, request id), oldest first.
    members: VecDeque<(u64, u64)>,
    next_id: u64,
}

struct PatternSub {
    pattern: String,
    tx: mpsc::Sender<PubSubMessage>,
}

#[derive(Default)]
struct State {
    streams: HashMap<String, MemStream>,
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    sets: HashMap<String, HashSet<String>>,
    lists: HashMap<String, VecDeque<Bytes>>,
    windows: HashMap<String, RateWindow>,
    expiries: HashMap<String, Instant>,
    subs: Vec<PatternSub>,
}

impl State {
    // Lazy expiry on access, same trade as any TTL cache without a sweeper.
    fn purge(&mut self, key: &str) {
        let expired = self
            .expiries
            .get(key)
            .is_some_and(|at| Instant::now() >= *at);
        if expired {
            self.remove_key(key);
        }
    }

    fn remove_key(&mut self, key: &str) {
        self.streams.remove(key);
        self.strings.remove(key);
        self.hashes.remove(key);
        self.sets.remove(key);
        self.lists.remove(key);
        self.windows.remove(key);
        self.expiries.remove(key);
    }

    fn live_keys(&mut self) -> Vec<String> {
        let now = Instant::now();
        let stale: Vec<String> = self
            .expiries
            .iter()
            .filter(|(_, at)| now >= **at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.remove_key(&key);
        }
        let mut keys: HashSet<String> = HashSet::new();
        keys.extend(self.streams.keys().cloned());
        keys.extend(self.strings.keys().cloned());
        keys.extend(self.hashes.keys().cloned());
        keys.extend(self.sets.keys().cloned());
        keys.extend(self.lists.keys().cloned());
        keys.extend(self.windows.keys().cloned());
        keys.into_iter().collect()
    }
}

// Redis LRANGE/LTRIM index semantics: inclusive, negatives count from the end.
fn resolve_index(len: usize, index: i64) -> i64 {
    if index < 0 {
        len as i64 + index
    } else {
        index
    }
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Full in-process implementation of the store surface, used by tests and
/// local development. A single instance shared by several plane instances
/// behaves like one store shared by several replicas.
///
/// `set_available(false)` makes every call fail with
/// [`StoreError::Unavailable`], which is how the fail-closed paths are
/// exercised without a real network partition.
pub struct MemoryStore {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn guard(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("memory store lock")
    }
}

#[async_trait]
impl StoreApi for MemoryStore {
    async fn stream_append(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<String> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        let stream = state.streams.entry(key.to_string()).or_default();
        let entry_id = format!("{}-0", stream.next_entry_id);
        stream.next_entry_id += 1;
        let seq = fields
            .iter()
            .find(|(name, _)| *name == "seq")
            .and_then(|(_, value)| value.parse().ok())
            .unwrap_or(0);
        stream.entries.push_back(StreamEntry {
            entry_id: entry_id.clone(),
            seq,
            fields: fields
                .iter()
                .map(|(name, value)| ((*name).to_string(), value.clone()))
                .collect(),
        });
        Ok(entry_id)
    }

    async fn stream_range_from(
        &self,
        key: &str,
        min_seq: u64,
        max: usize,
    ) -> StoreResult<Vec<StreamEntry>> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        Ok(state
            .streams
            .get(key)
            .map(|stream| {
                stream
                    .entries
                    .iter()
                    .take(max)
                    .filter(|entry| entry.seq >= min_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn stream_trim_approx(&self, key: &str, cap: usize) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.lock();
        if let Some(stream) = state.streams.get_mut(key) {
            while stream.entries.len() > cap {
                stream.entries.pop_front();
            }
        }
        Ok(())
    }

    async fn stream_len(&self, key: &str) -> StoreResult<usize> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        Ok(state.streams.get(key).map_or(0, |s| s.entries.len()))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.lock();
        // Prune closed subscriptions as we go; a full receiver is the
        // consumer's problem, matching real pub/sub semantics.
        state.subs.retain(|sub| !sub.tx.is_closed());
        for sub in &state.subs {
            if glob_match(&sub.pattern, channel) {
                let message = PubSubMessage {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                };
                if sub.tx.try_send(message).is_err() {
                    metrics::counter!("events.dropped").increment(1);
                }
            }
        }
        Ok(())
    }

    async fn pattern_subscribe(
        &self,
        pattern: &str,
    ) -> StoreResult<mpsc::Receiver<PubSubMessage>> {
        self.guard()?;
        let (tx, rx) = mpsc::channel(PATTERN_CHANNEL_DEPTH);
        self.lock().subs.push(PatternSub {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn incr(&self, key: &str) -> StoreResult<u64> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        let slot = state.strings.entry(key.to_string()).or_default();
        let next = slot.parse::<u64>().unwrap_or(0) + 1;
        *slot = next.to_string();
        Ok(next)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.lock();
        state.strings.insert(key.to_string(), value.to_string());
        state.expiries.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        Ok(state
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert((*field).to_string(), value.clone());
        }
        Ok(())
    }

    async fn hash_del(&self, key: &str, field: &str) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        if let Some(hash) = state.hashes.get_mut(key) {
            hash.remove(field);
        }
        Ok(())
    }

    async fn hash_keys(&self, key: &str) -> StoreResult<Vec<String>> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        Ok(state
            .hashes
            .get(key)
            .map(|hash| hash.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        state
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_rem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.lock();
        if let Some(set) = state.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        let mut members: Vec<String> = state
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        // Deterministic order keeps the distributor's rotation meaningful.
        members.sort_unstable();
        Ok(members)
    }

    async fn set_card(&self, key: &str) -> StoreResult<usize> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        Ok(state.sets.get(key).map_or(0, HashSet::len))
    }

    async fn list_push(&self, key: &str, value: Bytes) -> StoreResult<usize> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        let list = state.lists.entry(key.to_string()).or_default();
        list.push_back(value);
        Ok(list.len())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Bytes>> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len();
        let from = resolve_index(len, start).max(0) as usize;
        let to = resolve_index(len, stop);
        if to < 0 || from >= len {
            return Ok(Vec::new());
        }
        let to = (to as usize).min(len - 1);
        if to < from {
            return Ok(Vec::new());
        }
        Ok(list.iter().skip(from).take(to + 1 - from).cloned().collect())
    }

    async fn list_trim(&self, key: &str, start: i64, stop: i64) -> StoreResult<()> {
        self.guard()?;
        let mut state = self.lock();
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(());
        };
        let len = list.len();
        let from = resolve_index(len, start).max(0) as usize;
        let to = resolve_index(len, stop);
        if to < 0 || from >= len {
            list.clear();
            return Ok(());
        }
        let to = (to as usize).min(len - 1);
        if to < from {
            list.clear();
            return Ok(());
        }
        let kept: VecDeque<Bytes> = list.iter().skip(from).take(to + 1 - from).cloned().collect();
        *list = kept;
        Ok(())
    }

    async fn list_len(&self, key: &str) -> StoreResult<usize> {
        self.guard()?;
        let mut state = self.lock();
        state.purge(key);
        Ok(state.lists.get(key).map_or(0, VecDeque::len))
    }

    async fn list_rem(&self, key: &str, value: &Bytes) -> StoreResult<usize> {
        self.guard()?;
        let mut state = self.lock();
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != value);
        Ok(before - list.len())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.guard()?;
        self.lock().remove_key(key);
        Ok(())
    }

    async fn keys_by_pattern(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.guard()?;
        let mut state = self.lock();
        let mut keys: Vec<String> = state
            .live_keys()
            .into_iter()
            .filter(|key| glob_match(pattern, key))
            .collect();
        keys.sort_unstable();
        Ok(keys)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        self.guard()?;
        self.lock()
            .expiries
            .insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn rate_limit(
        &self,
        key: &str,
        window: Duration,
        limit: u32,
    ) -> StoreResult<RateDecision> {
        self.guard()?;
        let now = epoch_secs();
        let window_secs = window.as_secs().max(1);
        let mut state = self.lock();
        state.purge(key);
        let slot = state.windows.entry(key.to_string()).or_default();
        let cutoff = now.saturating_sub(window_secs);
        while slot.members.front().is_some_and(|(at, _)| *at <= cutoff) {
            slot.members.pop_front();
        }
        let mut count = slot.members.len() as u32;
        let allowed = count < limit;
        if allowed {
            slot.next_id += 1;
            let id = slot.next_id;
            slot.members.push_back((now, id));
            count += 1;
        }
        let reset_after_secs = slot
            .members
            .front()
            .map(|(oldest, _)| (*oldest + window_secs).saturating_sub(now))
            .unwrap_or(window_secs);
        state
            .expiries
            .insert(key.to_string(), Instant::now() + window);
        Ok(RateDecision {
            allowed,
            remaining: limit.saturating_sub(count),
            reset_after_secs,
            limit,
        })
    }
}
