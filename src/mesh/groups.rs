//! Named group membership
//!
//! Tracks which nodes belong to which group, plus the local join handles.
//! Announcing changes to other nodes is the node actor's job; the registry
//! only tells it when an announcement is due.

use crate::mesh::identity::{IdSet, NodeId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub type GroupHandle = u64;

#[derive(Debug, Default)]
struct GroupState {
    /// Remote members
    members: IdSet,
    local_handles: BTreeSet<GroupHandle>,
}

impl GroupState {
    fn is_empty(&self) -> bool {
        self.members.is_empty() && self.local_handles.is_empty()
    }
}

/// One membership change seen from the outside
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipChange {
    Joined { group: String, node: NodeId },
    Left { group: String, node: NodeId },
}

#[derive(Clone, Debug, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub local_member: bool,
    pub members: Vec<NodeId>,
}

pub struct GroupRegistry {
    local: NodeId,
    groups: BTreeMap<String, GroupState>,
    next_handle: GroupHandle,
}

impl GroupRegistry {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            groups: BTreeMap::new(),
            next_handle: 1,
        }
    }

    /// Join `name` locally. The flag is set on the first local handle, when a
    /// join announcement must go out.
    pub fn join_local(&mut self, name: &str) -> (GroupHandle, bool) {
        let handle = self.next_handle;
        self.next_handle += 1;

        let state = self.groups.entry(name.to_string()).or_default();
        let first = state.local_handles.is_empty();
        state.local_handles.insert(handle);
        if first {
            log::info!("Joined group {}", name);
        }
        (handle, first)
    }

    /// Release a local handle. Returns `true` when it was the last one and a
    /// leave announcement must go out.
    pub fn leave_local(&mut self, name: &str, handle: GroupHandle) -> bool {
        let Some(state) = self.groups.get_mut(name) else {
            return false;
        };
        if !state.local_handles.remove(&handle) || !state.local_handles.is_empty() {
            return false;
        }
        log::info!("Left group {}", name);
        if state.is_empty() {
            self.groups.remove(name);
        }
        true
    }

    /// Record a remote join. Returns whether `node` was new to the group.
    pub fn remote_join(&mut self, name: &str, node: NodeId) -> bool {
        if node == self.local {
            return false;
        }
        let added = self
            .groups
            .entry(name.to_string())
            .or_default()
            .members
            .insert(node);
        if added {
            log::debug!("Node {} joined group {}", node.short(), name);
        }
        added
    }

    pub fn remote_leave(&mut self, name: &str, node: &NodeId) -> bool {
        let Some(state) = self.groups.get_mut(name) else {
            return false;
        };
        let removed = state.members.remove(node);
        if state.is_empty() {
            self.groups.remove(name);
        }
        if removed {
            log::debug!("Node {} left group {}", node.short(), name);
        }
        removed
    }

    /// Drop an unreachable node from every group
    pub fn node_unavailable(&mut self, node: &NodeId) -> Vec<MembershipChange> {
        let groups: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, state)| state.members.contains(node))
            .map(|(name, _)| name.clone())
            .collect();
        groups
            .into_iter()
            .filter(|group| self.remote_leave(group, node))
            .map(|group| MembershipChange::Left { group, node: *node })
            .collect()
    }

    /// Groups with at least one local handle
    pub fn groups_of_local(&self) -> Vec<String> {
        self.groups
            .iter()
            .filter(|(_, state)| !state.local_handles.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Bring `node`'s memberships in line with the full list it reported:
    /// joins for listed groups we did not know about, leaves for known ones
    /// it no longer lists
    pub fn reconcile(&mut self, node: NodeId, groups: &[String]) -> Vec<MembershipChange> {
        let reported: BTreeSet<&str> = groups.iter().map(String::as_str).collect();
        let mut changes = Vec::new();

        for group in &reported {
            if self.remote_join(group, node) {
                changes.push(MembershipChange::Joined {
                    group: group.to_string(),
                    node,
                });
            }
        }

        let dropped: Vec<String> = self
            .groups
            .iter()
            .filter(|(name, state)| {
                state.members.contains(&node) && !reported.contains(name.as_str())
            })
            .map(|(name, _)| name.clone())
            .collect();
        for group in dropped {
            if self.remote_leave(&group, &node) {
                changes.push(MembershipChange::Left { group, node });
            }
        }
        changes
    }

    /// Every member of `name`, the local node included when it has joined
    pub fn members(&self, name: &str) -> Vec<NodeId> {
        let Some(state) = self.groups.get(name) else {
            return Vec::new();
        };
        let mut members: Vec<NodeId> = state.members.iter().copied().collect();
        if !state.local_handles.is_empty() {
            members.push(self.local);
            members.sort();
        }
        members
    }

    /// Remote members of `name`
    pub fn remote_members(&self, name: &str) -> Vec<NodeId> {
        self.groups
            .get(name)
            .map(|state| state.members.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_local_member(&self, name: &str) -> bool {
        self.groups
            .get(name)
            .is_some_and(|state| !state.local_handles.is_empty())
    }

    pub fn summaries(&self) -> Vec<GroupSummary> {
        self.groups
            .keys()
            .map(|name| GroupSummary {
                name: name.clone(),
                local_member: self.is_local_member(name),
                members: self.members(name),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_join_and_last_leave_announce() {
        let mut groups = GroupRegistry::new(NodeId::random());
        let (h1, announce) = groups.join_local("signers");
        assert!(announce);
        let (h2, announce) = groups.join_local("signers");
        assert!(!announce);
        assert_ne!(h1, h2);

        assert!(!groups.leave_local("signers", h1));
        assert!(groups.is_local_member("signers"));
        assert!(groups.leave_local("signers", h2));
        assert!(!groups.is_local_member("signers"));
        // Nothing left, state is gone
        assert!(groups.summaries().is_empty());

        // Unknown handle
        assert!(!groups.leave_local("signers", h2));
    }

    #[test]
    fn test_remote_membership() {
        let local = NodeId::random();
        let mut groups = GroupRegistry::new(local);
        let node = NodeId::random();

        assert!(groups.remote_join("signers", node));
        assert!(!groups.remote_join("signers", node));
        assert!(!groups.remote_join("signers", local));
        assert_eq!(groups.members("signers"), vec![node]);
        assert!(!groups.is_local_member("signers"));

        groups.join_local("signers");
        assert_eq!(groups.members("signers").len(), 2);
        assert_eq!(groups.remote_members("signers"), vec![node]);

        assert!(groups.remote_leave("signers", &node));
        assert!(!groups.remote_leave("signers", &node));
        assert_eq!(groups.members("signers"), vec![local]);
    }

    #[test]
    fn test_unavailable_node_leaves_everything() {
        let mut groups = GroupRegistry::new(NodeId::random());
        let node = NodeId::random();
        groups.remote_join("a", node);
        groups.remote_join("b", node);
        groups.remote_join("b", NodeId::random());

        let mut changes = groups.node_unavailable(&node);
        changes.sort_by(|x, y| format!("{:?}", x).cmp(&format!("{:?}", y)));
        assert_eq!(
            changes,
            vec![
                MembershipChange::Left { group: "a".into(), node },
                MembershipChange::Left { group: "b".into(), node },
            ]
        );
        assert_eq!(groups.summaries().len(), 1);
    }

    #[test]
    fn test_reconcile_replays_missed_joins_and_leaves() {
        let mut groups = GroupRegistry::new(NodeId::random());
        let node = NodeId::random();
        groups.remote_join("stale", node);
        groups.remote_join("kept", node);

        let changes = groups.reconcile(node, &["kept".into(), "missed".into()]);
        assert_eq!(
            changes,
            vec![
                MembershipChange::Joined { group: "missed".into(), node },
                MembershipChange::Left { group: "stale".into(), node },
            ]
        );
        assert_eq!(groups.members("missed"), vec![node]);
        assert!(groups.members("stale").is_empty());

        // Same report again changes nothing
        assert!(groups
            .reconcile(node, &["kept".into(), "missed".into()])
            .is_empty());
    }

    #[test]
    fn test_groups_of_local() {
        let mut groups = GroupRegistry::new(NodeId::random());
        groups.join_local("b");
        groups.join_local("a");
        groups.remote_join("c", NodeId::random());
        assert_eq!(groups.groups_of_local(), vec!["a".to_string(), "b".to_string()]);
    }
}
