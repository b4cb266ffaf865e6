//! Synchronized values
//!
//! A node publishes named JSON values with a strictly increasing version and
//! keeps a copy of every reachable node's value of the same name. Changes
//! travel as patches against a base version; a patch whose base does not
//! match what the receiver holds is refused and the receiver asks again
//! from its own version.

use crate::mesh::identity::{IdMap, NodeId};
use crate::mesh::message::{PatchEncoding, RoutedBody, ValuePatch};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("no synchronized value named {0}")]
    UnknownValue(String),
    #[error("synchronized value {0} is already registered")]
    AlreadyRegistered(String),
}

/// Produces the patches sent for a value
pub trait PatchStrategy: Send {
    fn encoding(&self) -> PatchEncoding;

    /// Patch turning `old` into `new`, or `None` to send the whole value
    fn diff(&self, old: &Value, new: &Value) -> Option<Value>;
}

/// Always sends the whole value
pub struct FullValue;

impl PatchStrategy for FullValue {
    fn encoding(&self) -> PatchEncoding {
        PatchEncoding::Full
    }

    fn diff(&self, _old: &Value, _new: &Value) -> Option<Value> {
        None
    }
}

/// JSON merge patches between object values
pub struct MergePatch;

impl PatchStrategy for MergePatch {
    fn encoding(&self) -> PatchEncoding {
        PatchEncoding::MergePatch
    }

    fn diff(&self, old: &Value, new: &Value) -> Option<Value> {
        merge_diff(old, new)
    }
}

/// RFC 7396 patch from `old` to `new`. `None` when the change cannot be
/// expressed, i.e. either side is not an object or `new` holds a null
/// member (null means "delete" in a merge patch).
pub fn merge_diff(old: &Value, new: &Value) -> Option<Value> {
    let (Value::Object(before), Value::Object(after)) = (old, new) else {
        return None;
    };
    let mut patch = Map::new();
    for key in before.keys() {
        if !after.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in after {
        if value.is_null() {
            return None;
        }
        match before.get(key) {
            Some(prev) if prev == value => {}
            Some(prev @ Value::Object(_)) if value.is_object() => {
                patch.insert(key.clone(), merge_diff(prev, value)?);
            }
            _ => {
                if has_null_member(value) {
                    return None;
                }
                patch.insert(key.clone(), value.clone());
            }
        }
    }
    Some(Value::Object(patch))
}

fn has_null_member(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.values().any(|v| v.is_null() || has_null_member(v)),
        _ => false,
    }
}

/// RFC 7396 application
pub fn merge_apply(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in entries {
            if value.is_null() {
                map.remove(key);
            } else {
                merge_apply(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

pub fn apply_patch(encoding: PatchEncoding, base: &Value, patch: &Value) -> Value {
    match encoding {
        PatchEncoding::Full => patch.clone(),
        PatchEncoding::MergePatch => {
            let mut value = base.clone();
            merge_apply(&mut value, patch);
            value
        }
    }
}

struct LocalValue {
    version: u64,
    value: Value,
    /// Earlier versions still usable as patch bases
    history: BTreeMap<u64, Value>,
    strategy: Box<dyn PatchStrategy>,
}

impl LocalValue {
    fn patch_from(&self, name: &str, base_version: u64) -> ValuePatch {
        let diff = self
            .history
            .get(&base_version)
            .filter(|_| base_version != self.version)
            .and_then(|base| self.strategy.diff(base, &self.value));
        let (encoding, patch) = match diff {
            Some(patch) => (self.strategy.encoding(), patch),
            None => (PatchEncoding::Full, self.value.clone()),
        };
        ValuePatch {
            name: name.to_string(),
            base_version,
            version: self.version,
            encoding,
            patch,
        }
    }
}

/// What this node knows about one remote node's copy of a value
#[derive(Clone, Debug, PartialEq)]
pub struct RemoteValueState {
    /// Version of the remote node's own value held here
    pub version: u64,
    pub value: Value,
    /// Highest local version the remote node confirmed
    pub known_local_version: u64,
    /// Local version last pushed to the remote node
    pub sent_version: u64,
    /// Set while the remote node is unavailable
    pub removal_deadline: Option<Instant>,
}

impl Default for RemoteValueState {
    fn default() -> Self {
        Self {
            version: 0,
            value: Value::Null,
            known_local_version: 0,
            sent_version: 0,
            removal_deadline: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValueUpdate {
    pub name: String,
    pub node: NodeId,
    pub version: u64,
    pub value: Value,
}

/// Routed messages to send, by target
pub type Outbox = Vec<(NodeId, RoutedBody)>;

#[derive(Default)]
pub struct SyncedValues {
    locals: BTreeMap<String, LocalValue>,
    remotes: BTreeMap<String, IdMap<RemoteValueState>>,
}

impl SyncedValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new value at version 1 and ask every available node for
    /// its copy. Remote state is only tracked for nodes that answer, so a
    /// node without the value never holds back history pruning.
    pub fn register(
        &mut self,
        name: &str,
        initial: Value,
        strategy: Box<dyn PatchStrategy>,
        available: &[NodeId],
    ) -> Result<Outbox, SyncError> {
        if self.locals.contains_key(name) {
            return Err(SyncError::AlreadyRegistered(name.to_string()));
        }
        let mut history = BTreeMap::new();
        history.insert(1, initial.clone());
        self.locals.insert(
            name.to_string(),
            LocalValue {
                version: 1,
                value: initial,
                history,
                strategy,
            },
        );
        log::info!("Registered synchronized value {}", name);

        Ok(available
            .iter()
            .map(|node| (*node, sync_request(name, self.held_version(name, node))))
            .collect())
    }

    /// Replace a local value. Unchanged values keep their version.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(u64, Outbox), SyncError> {
        let local = self
            .locals
            .get_mut(name)
            .ok_or_else(|| SyncError::UnknownValue(name.to_string()))?;
        if local.value == value {
            return Ok((local.version, Vec::new()));
        }
        local.version += 1;
        local.value = value.clone();
        local.history.insert(local.version, value);
        log::debug!("Value {} is now at version {}", name, local.version);

        let mut outbox = Vec::new();
        if let Some(remotes) = self.remotes.get_mut(name) {
            for (node, state) in remotes.iter_mut() {
                if state.removal_deadline.is_some() || state.sent_version >= local.version {
                    continue;
                }
                let patch = local.patch_from(name, state.sent_version);
                state.sent_version = local.version;
                outbox.push((*node, RoutedBody::SyncPatch(patch)));
            }
        }
        let version = local.version;
        self.prune_history(name);
        Ok((version, outbox))
    }

    /// Handle one sync message from `from`
    pub fn dispatch(&mut self, from: NodeId, body: RoutedBody) -> (Option<ValueUpdate>, Outbox) {
        match body {
            RoutedBody::SyncRequest { name, known_version } => {
                (None, self.handle_request(from, &name, known_version))
            }
            RoutedBody::SyncPatch(patch) => {
                let (update, reply) = self.handle_patch(from, patch);
                (update, reply.map(|body| (from, body)).into_iter().collect())
            }
            RoutedBody::SyncAck { name, version } => {
                self.handle_ack(from, &name, version);
                (None, Vec::new())
            }
            other => {
                log::debug!("Not a sync message: {}", other.type_name());
                (None, Vec::new())
            }
        }
    }

    pub fn handle_request(&mut self, from: NodeId, name: &str, known_version: u64) -> Outbox {
        let Some(local) = self.locals.get(name) else {
            log::debug!("Sync request for unknown value {} from {}", name, from.short());
            return Vec::new();
        };
        let remotes = self.remotes.entry(name.to_string()).or_default();
        let created = !remotes.contains_key(&from);
        let state = remotes.entry(from).or_default();
        state.known_local_version = known_version;
        state.sent_version = known_version;

        let mut outbox = Vec::new();
        if known_version < local.version {
            outbox.push((from, RoutedBody::SyncPatch(local.patch_from(name, known_version))));
            state.sent_version = local.version;
        } else if known_version > local.version {
            log::warn!(
                "{} claims version {} of {} but we are at {}",
                from.short(),
                known_version,
                name,
                local.version
            );
        }
        // The requester may have registered after it became available to us
        if created || state.version == 0 {
            outbox.push((from, sync_request(name, state.version)));
        }
        outbox
    }

    /// Apply a patch from `from`. Returns the resulting update, if any, and
    /// the reply to send back.
    pub fn handle_patch(
        &mut self,
        from: NodeId,
        patch: ValuePatch,
    ) -> (Option<ValueUpdate>, Option<RoutedBody>) {
        if !self.locals.contains_key(&patch.name) {
            log::debug!("Patch for unknown value {} from {}", patch.name, from.short());
            return (None, None);
        }
        let state = self
            .remotes
            .entry(patch.name.clone())
            .or_default()
            .entry(from)
            .or_default();

        if patch.version <= state.version {
            log::debug!(
                "Discarding stale patch {} v{} from {} (have v{})",
                patch.name,
                patch.version,
                from.short(),
                state.version
            );
            return (None, None);
        }
        if patch.base_version != state.version {
            log::warn!(
                "Rejecting patch {} from {}: base v{} but holding v{}",
                patch.name,
                from.short(),
                patch.base_version,
                state.version
            );
            return (None, Some(sync_request(&patch.name, state.version)));
        }

        state.value = apply_patch(patch.encoding, &state.value, &patch.patch);
        state.version = patch.version;
        let update = ValueUpdate {
            name: patch.name.clone(),
            node: from,
            version: state.version,
            value: state.value.clone(),
        };
        let ack = RoutedBody::SyncAck {
            name: patch.name,
            version: state.version,
        };
        (Some(update), Some(ack))
    }

    pub fn handle_ack(&mut self, from: NodeId, name: &str, version: u64) {
        let Some(state) = self.remotes.get_mut(name).and_then(|r| r.get_mut(&from)) else {
            return;
        };
        if version > state.known_local_version {
            state.known_local_version = version;
            self.prune_history(name);
        }
    }

    /// Drop history no remote node can still need as a patch base
    fn prune_history(&mut self, name: &str) {
        let Some(local) = self.locals.get_mut(name) else {
            return;
        };
        let floor = self
            .remotes
            .get(name)
            .and_then(|r| r.values().map(|s| s.known_local_version).min())
            .unwrap_or(local.version);
        let current = local.version;
        local
            .history
            .retain(|version, _| *version >= floor || *version == current);
    }

    /// Cancel pending removal and ask `node` for every registered value
    pub fn node_available(&mut self, node: NodeId) -> Outbox {
        let mut outbox = Vec::new();
        for name in self.locals.keys() {
            let mut known = 0;
            if let Some(state) = self.remotes.get_mut(name).and_then(|r| r.get_mut(&node)) {
                state.removal_deadline = None;
                known = state.version;
            }
            outbox.push((node, sync_request(name, known)));
        }
        outbox
    }

    fn held_version(&self, name: &str, node: &NodeId) -> u64 {
        self.remote_state(name, node).map_or(0, |state| state.version)
    }

    /// Schedule removal of `node`'s state at `deadline`
    pub fn node_unavailable(&mut self, node: &NodeId, deadline: Instant) {
        for remotes in self.remotes.values_mut() {
            if let Some(state) = remotes.get_mut(node) {
                state.removal_deadline = Some(deadline);
            }
        }
    }

    /// Remove state whose grace period ended. Returns how many entries went.
    pub fn expire(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for remotes in self.remotes.values_mut() {
            let before = remotes.len();
            remotes.retain(|_, state| state.removal_deadline.map_or(true, |d| d > now));
            removed += before - remotes.len();
        }
        self.remotes.retain(|_, remotes| !remotes.is_empty());
        if removed > 0 {
            log::debug!("Dropped {} synchronized value state(s) after grace", removed);
            let names: Vec<String> = self.locals.keys().cloned().collect();
            for name in names {
                self.prune_history(&name);
            }
        }
        removed
    }

    pub fn local_value(&self, name: &str) -> Option<(u64, Value)> {
        self.locals
            .get(name)
            .map(|local| (local.version, local.value.clone()))
    }

    /// Copy of `node`'s value, once at least one patch arrived
    pub fn remote_value(&self, name: &str, node: &NodeId) -> Option<(u64, Value)> {
        self.remote_state(name, node)
            .filter(|state| state.version > 0)
            .map(|state| (state.version, state.value.clone()))
    }

    pub fn remote_state(&self, name: &str, node: &NodeId) -> Option<&RemoteValueState> {
        self.remotes.get(name)?.get(node)
    }
}

fn sync_request(name: &str, known_version: u64) -> RoutedBody {
    RoutedBody::SyncRequest {
        name: name.to_string(),
        known_version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Deliver messages between two value sets until quiet. Returns updates
    /// seen by each side.
    fn pump(
        sides: &mut [(NodeId, SyncedValues); 2],
        initial: Vec<(usize, Outbox)>,
    ) -> [Vec<ValueUpdate>; 2] {
        let ids = [sides[0].0, sides[1].0];
        let mut queue = VecDeque::new();
        for (from, outbox) in initial {
            for (_, body) in outbox {
                queue.push_back((1 - from, ids[from], body));
            }
        }

        let mut updates = [Vec::new(), Vec::new()];
        let mut steps = 0;
        while let Some((to, from_id, body)) = queue.pop_front() {
            steps += 1;
            assert!(steps < 100, "sync did not settle");
            let (update, outbox) = sides[to].1.dispatch(from_id, body);
            updates[to].extend(update);
            for (_, body) in outbox {
                queue.push_back((1 - to, ids[to], body));
            }
        }
        updates
    }

    fn pair() -> [(NodeId, SyncedValues); 2] {
        [
            (NodeId::random(), SyncedValues::new()),
            (NodeId::random(), SyncedValues::new()),
        ]
    }

    #[test]
    fn test_merge_diff_and_apply() {
        let old = json!({"height": 10, "peers": {"a": 1, "b": 2}, "gone": true});
        let new = json!({"height": 11, "peers": {"a": 1, "c": 3}});
        let patch = merge_diff(&old, &new).unwrap();
        assert_eq!(
            patch,
            json!({"height": 11, "peers": {"b": null, "c": 3}, "gone": null})
        );
        assert_eq!(apply_patch(PatchEncoding::MergePatch, &old, &patch), new);

        // Nulls in the new value cannot be expressed
        assert!(merge_diff(&old, &json!({"height": null})).is_none());
        assert!(merge_diff(&json!(1), &json!(2)).is_none());
    }

    #[test]
    fn test_initial_sync_both_ways() {
        let mut sides = pair();
        let (a, b) = (sides[0].0, sides[1].0);
        let out_a = sides[0]
            .1
            .register("status", json!({"height": 1}), Box::new(MergePatch), &[b])
            .unwrap();
        let out_b = sides[1]
            .1
            .register("status", json!({"height": 7}), Box::new(FullValue), &[a])
            .unwrap();

        let updates = pump(&mut sides, vec![(0, out_a), (1, out_b)]);
        assert_eq!(
            sides[0].1.remote_value("status", &b),
            Some((1, json!({"height": 7})))
        );
        assert_eq!(
            sides[1].1.remote_value("status", &a),
            Some((1, json!({"height": 1})))
        );
        assert_eq!(updates[0].len(), 1);
        assert_eq!(updates[1].len(), 1);
    }

    #[test]
    fn test_late_registration_still_syncs() {
        let mut sides = pair();
        let (a, b) = (sides[0].0, sides[1].0);
        let out_a = sides[0]
            .1
            .register("status", json!("a"), Box::new(FullValue), &[b])
            .unwrap();
        // b has not registered yet: the request is ignored
        pump(&mut sides, vec![(0, out_a)]);
        assert!(sides[0].1.remote_value("status", &b).is_none());

        let out_b = sides[1]
            .1
            .register("status", json!("b"), Box::new(FullValue), &[a])
            .unwrap();
        pump(&mut sides, vec![(1, out_b)]);
        assert_eq!(sides[0].1.remote_value("status", &b), Some((1, json!("b"))));
        assert_eq!(sides[1].1.remote_value("status", &a), Some((1, json!("a"))));
    }

    #[test]
    fn test_set_pushes_merge_patch() {
        let mut sides = pair();
        let (a, b) = (sides[0].0, sides[1].0);
        let out_a = sides[0]
            .1
            .register("status", json!({"height": 1, "ok": true}), Box::new(MergePatch), &[b])
            .unwrap();
        let out_b = sides[1]
            .1
            .register("status", json!({}), Box::new(MergePatch), &[a])
            .unwrap();
        pump(&mut sides, vec![(0, out_a), (1, out_b)]);

        let (version, outbox) = sides[0].1.set("status", json!({"height": 2, "ok": true})).unwrap();
        assert_eq!(version, 2);
        assert_eq!(outbox.len(), 1);
        match &outbox[0].1 {
            RoutedBody::SyncPatch(patch) => {
                assert_eq!(patch.encoding, PatchEncoding::MergePatch);
                assert_eq!(patch.base_version, 1);
                assert_eq!(patch.patch, json!({"height": 2}));
            }
            other => panic!("unexpected {:?}", other),
        }

        let updates = pump(&mut sides, vec![(0, outbox)]);
        assert_eq!(updates[1][0].value, json!({"height": 2, "ok": true}));
        assert_eq!(
            sides[0].1.remote_state("status", &b).unwrap().known_local_version,
            2
        );

        // Unchanged value does not bump the version
        let (version, outbox) = sides[0].1.set("status", json!({"height": 2, "ok": true})).unwrap();
        assert_eq!(version, 2);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_base_mismatch_leaves_state_untouched() {
        let mut values = SyncedValues::new();
        let from = NodeId::random();
        values
            .register("status", json!(0), Box::new(FullValue), &[from])
            .unwrap();
        let (update, reply) = values.handle_patch(
            from,
            ValuePatch {
                name: "status".into(),
                base_version: 0,
                version: 3,
                encoding: PatchEncoding::Full,
                patch: json!("v3"),
            },
        );
        assert!(update.is_some());
        assert!(matches!(reply, Some(RoutedBody::SyncAck { version: 3, .. })));
        let before = values.remote_state("status", &from).cloned();

        let (update, reply) = values.handle_patch(
            from,
            ValuePatch {
                name: "status".into(),
                base_version: 4,
                version: 5,
                encoding: PatchEncoding::MergePatch,
                patch: json!({"x": 1}),
            },
        );
        assert!(update.is_none());
        assert_eq!(
            reply,
            Some(RoutedBody::SyncRequest {
                name: "status".into(),
                known_version: 3
            })
        );
        assert_eq!(values.remote_state("status", &from).cloned(), before);
    }

    #[test]
    fn test_stale_patch_is_ignored() {
        let mut values = SyncedValues::new();
        let from = NodeId::random();
        values
            .register("status", json!(0), Box::new(FullValue), &[from])
            .unwrap();
        let patch = ValuePatch {
            name: "status".into(),
            base_version: 0,
            version: 2,
            encoding: PatchEncoding::Full,
            patch: json!("v2"),
        };
        assert!(values.handle_patch(from, patch.clone()).0.is_some());
        assert_eq!(values.handle_patch(from, patch), (None, None));
        assert_eq!(values.remote_value("status", &from), Some((2, json!("v2"))));
    }

    #[test]
    fn test_history_pruned_below_acknowledged_version() {
        let mut values = SyncedValues::new();
        let peer = NodeId::random();
        values
            .register("status", json!({"n": 0}), Box::new(MergePatch), &[peer])
            .unwrap();
        values.handle_request(peer, "status", 0);
        for n in 1..=3 {
            values.set("status", json!({"n": n})).unwrap();
        }
        assert_eq!(values.locals["status"].history.len(), 4);

        values.handle_ack(peer, "status", 3);
        let kept: Vec<u64> = values.locals["status"].history.keys().copied().collect();
        assert_eq!(kept, vec![3, 4]);

        // A base that was pruned falls back to a full patch
        let outbox = values.handle_request(peer, "status", 1);
        match &outbox[0].1 {
            RoutedBody::SyncPatch(patch) => {
                assert_eq!(patch.encoding, PatchEncoding::Full);
                assert_eq!(patch.base_version, 1);
                assert_eq!(patch.version, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unavailable_state_survives_grace_then_goes() {
        let mut values = SyncedValues::new();
        let peer = NodeId::random();
        values
            .register("status", json!(0), Box::new(FullValue), &[peer])
            .unwrap();
        values.handle_request(peer, "status", 0);

        let now = Instant::now();
        values.node_unavailable(&peer, now + Duration::from_secs(10));
        assert_eq!(values.expire(now), 0);

        // Back within the grace period
        values.node_available(peer);
        assert_eq!(values.expire(now + Duration::from_secs(20)), 0);

        values.node_unavailable(&peer, now + Duration::from_secs(10));
        assert_eq!(values.expire(now + Duration::from_secs(11)), 1);
        assert!(values.remote_state("status", &peer).is_none());
    }

    #[test]
    fn test_silent_node_does_not_pin_history() {
        let mut values = SyncedValues::new();
        let silent = NodeId::random();
        let outbox = values
            .register("status", json!({"n": 0}), Box::new(MergePatch), &[silent])
            .unwrap();
        assert_eq!(outbox.len(), 1);
        values.node_available(silent);

        for n in 1..=500 {
            let (_, outbox) = values.set("status", json!({"n": n})).unwrap();
            assert!(outbox.is_empty());
        }
        assert!(values.locals["status"].history.len() <= 2);
        assert!(values.remote_state("status", &silent).is_none());

        // Once it asks, it is tracked and gets patches
        values.handle_request(silent, "status", 0);
        let (_, outbox) = values.set("status", json!({"n": 501})).unwrap();
        assert_eq!(outbox.len(), 1);
    }
}
