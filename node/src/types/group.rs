use serde::{Deserialize, Serialize};

use crate::utilities::hash::{hash_of, HashType};

/// One participant of a private group: the organization identity and the
/// node that receives payloads on its behalf.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct Member {
    pub org: String,
    pub node: String,
}

/// A private messaging group. Identity is the hash of the canonical member
/// list, so two groups with identical members dedupe to one id regardless of
/// who defined them or what they named them.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Group {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub members: Vec<Member>,
}

impl Group {
    pub(crate) fn new(name: Option<String>, mut members: Vec<Member>) -> Self {
        members.sort();
        members.dedup();
        Self { name, members }
    }

    pub(crate) fn hash(&self) -> anyhow::Result<HashType> {
        hash_of(&self.members)
    }

    pub(crate) fn member_nodes(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.node.as_str()).collect()
    }

    pub(crate) fn has_node(&self, node: &str) -> bool {
        self.members.iter().any(|m| m.node == node)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn member(org: &str, node: &str) -> Member {
        Member {
            org: org.to_string(),
            node: node.to_string(),
        }
    }

    #[test]
    fn test_identical_members_same_hash() {
        let g1 = Group::new(
            Some("alpha".to_string()),
            vec![member("org1", "node1"), member("org2", "node2")],
        );
        let g2 = Group::new(
            Some("beta".to_string()),
            vec![member("org2", "node2"), member("org1", "node1")],
        );
        // Name plays no part in identity, and member order is canonicalized.
        assert_eq!(g1.hash().unwrap(), g2.hash().unwrap());
    }

    #[test]
    fn test_different_members_different_hash() {
        let g1 = Group::new(None, vec![member("org1", "node1")]);
        let g2 = Group::new(None, vec![member("org1", "node3")]);
        assert_ne!(g1.hash().unwrap(), g2.hash().unwrap());
    }

    #[test]
    fn test_membership() {
        let g = Group::new(None, vec![member("org1", "node1"), member("org2", "node2")]);
        assert!(g.has_node("node2"));
        assert!(!g.has_node("node9"));
        assert_eq!(g.member_nodes(), vec!["node1", "node2"]);
    }
}
