//! Resolution of the epoch's shard layout into this node's placement.

use crate::{
    types::{GroupId, NodeId, Rank, SubgroupId},
    Layout,
};
use std::collections::{BTreeMap, HashMap};

/// One bulk-transport group this node participates in. A group is formed per
/// shard sender, with the member list rotated so the sender leads.
#[derive(Clone, Debug)]
pub(crate) struct GroupSpec {
    pub id: GroupId,
    pub subgroup: SubgroupId,
    pub sender_rank: Rank,
    pub members: Vec<NodeId>,
}

/// This node's placement within one subgroup it belongs to.
#[derive(Clone, Debug)]
pub(crate) struct SubgroupPlacement {
    /// Shard number within the subgroup.
    pub shard: u32,

    /// This node's index within the shard.
    pub rank: Rank,

    /// Shard members, in layout order.
    pub members: Vec<NodeId>,

    /// Row index of each shard member in the shared state table.
    pub table_indices: Vec<u32>,

    /// First `num_received` slot of this subgroup in the row layout.
    pub received_offset: usize,
}

/// The epoch's layout resolved against this node: subgroup placements, row
/// slot offsets, and bulk-transport group numbering.
///
/// Group identifiers are assigned by a scan over every subgroup, shard, and
/// sender of the epoch (not just those this node belongs to) so that all
/// members compute identical identifiers.
#[derive(Clone, Debug)]
pub(crate) struct Placement {
    /// Total subgroups in the epoch.
    pub subgroups: usize,

    /// Total `num_received` slots: the sum over all subgroups of the largest
    /// shard size.
    pub slots: usize,

    /// Placements for the subgroups this node belongs to.
    pub local: BTreeMap<SubgroupId, SubgroupPlacement>,

    /// Groups this node participates in (its create/destroy set).
    pub groups: Vec<GroupSpec>,

    /// The group this node posts to, per subgroup it belongs to.
    pub send_groups: BTreeMap<SubgroupId, GroupId>,

    /// Demultiplexes a delivery event to its subgroup and sender.
    pub routes: HashMap<GroupId, (SubgroupId, Rank)>,
}

impl Placement {
    pub fn new(layout: &impl Layout, members: &[NodeId], node: NodeId, offset: GroupId) -> Self {
        let subgroups = layout.subgroups(members.len()) as usize;
        let index_of = |id: NodeId| -> u32 {
            members
                .iter()
                .position(|m| *m == id)
                .expect("shard member missing from member list") as u32
        };

        let mut local = BTreeMap::new();
        let mut groups = Vec::new();
        let mut send_groups = BTreeMap::new();
        let mut routes = HashMap::new();
        let mut slots = 0;
        let mut next_group = offset;
        for subgroup in 0..subgroups as SubgroupId {
            let shards = layout.shards(members, subgroup);
            let max_shard_members = shards.iter().map(Vec::len).max().unwrap_or(0);
            for (shard, shard_members) in shards.iter().enumerate() {
                let position = shard_members.iter().position(|m| *m == node);
                for (sender, sender_id) in shard_members.iter().enumerate() {
                    let id = next_group;
                    next_group += 1;
                    let Some(rank) = position else {
                        continue;
                    };
                    // Rotate the membership so the sender leads.
                    let size = shard_members.len();
                    let rotated = (0..size)
                        .map(|l| shard_members[(sender + l) % size])
                        .collect();
                    groups.push(GroupSpec {
                        id,
                        subgroup,
                        sender_rank: sender as Rank,
                        members: rotated,
                    });
                    routes.insert(id, (subgroup, sender as Rank));
                    if *sender_id == node {
                        send_groups.insert(subgroup, id);
                        debug_assert_eq!(sender, rank as usize);
                    }
                }
                if let Some(rank) = position {
                    local.insert(
                        subgroup,
                        SubgroupPlacement {
                            shard: shard as u32,
                            rank: rank as Rank,
                            members: shard_members.clone(),
                            table_indices: shard_members.iter().map(|m| index_of(*m)).collect(),
                            received_offset: slots,
                        },
                    );
                }
            }
            slots += max_shard_members;
        }

        Self {
            subgroups,
            slots,
            local,
            groups,
            send_groups,
            routes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Fixed subgroup/shard assignment, restricted to the members actually
    /// present in the epoch.
    #[derive(Clone)]
    struct Fixed {
        shards: Vec<Vec<Vec<NodeId>>>,
    }

    impl Layout for Fixed {
        fn subgroups(&self, _: usize) -> u32 {
            self.shards.len() as u32
        }

        fn shards(&self, members: &[NodeId], subgroup: SubgroupId) -> Vec<Vec<NodeId>> {
            self.shards[subgroup as usize]
                .iter()
                .map(|shard| {
                    shard
                        .iter()
                        .copied()
                        .filter(|m| members.contains(m))
                        .collect()
                })
                .collect()
        }
    }

    #[test]
    fn test_single_shard_placement() {
        let layout = Fixed {
            shards: vec![vec![vec![10, 20, 30]]],
        };
        let members = vec![10, 20, 30];
        let placement = Placement::new(&layout, &members, 20, 0);

        assert_eq!(placement.subgroups, 1);
        assert_eq!(placement.slots, 3);
        let subgroup = &placement.local[&0];
        assert_eq!(subgroup.rank, 1);
        assert_eq!(subgroup.received_offset, 0);
        assert_eq!(subgroup.table_indices, vec![0, 1, 2]);
        // One group per shard sender, with the sender leading.
        assert_eq!(placement.groups.len(), 3);
        assert_eq!(placement.groups[1].members, vec![20, 30, 10]);
        assert_eq!(placement.send_groups[&0], 1);
    }

    #[test]
    fn test_offsets_accumulate_over_all_subgroups() {
        // Node 30 sits out subgroup 0 but its slot offsets still account for
        // that subgroup's widest shard.
        let layout = Fixed {
            shards: vec![vec![vec![10, 20]], vec![vec![20, 30]]],
        };
        let members = vec![10, 20, 30];
        let placement = Placement::new(&layout, &members, 30, 0);

        assert_eq!(placement.slots, 4);
        assert!(!placement.local.contains_key(&0));
        assert_eq!(placement.local[&1].received_offset, 2);
        assert_eq!(placement.local[&1].rank, 1);
    }

    #[test]
    fn test_group_ids_agree_across_members() {
        let layout = Fixed {
            shards: vec![vec![vec![10, 20]], vec![vec![20, 30]]],
        };
        let members = vec![10, 20, 30];
        let for_10 = Placement::new(&layout, &members, 10, 0);
        let for_20 = Placement::new(&layout, &members, 20, 0);
        let for_30 = Placement::new(&layout, &members, 30, 0);

        // Members of the same shard agree on every group identifier even
        // though they belong to different subsets of the layout.
        assert_eq!(for_10.send_groups[&0], 0);
        assert_eq!(for_20.send_groups[&0], 1);
        assert_eq!(for_20.send_groups[&1], 2);
        assert_eq!(for_30.send_groups[&1], 3);
        assert_eq!(for_10.routes[&1], (0, 1));
        assert_eq!(for_20.routes[&1], (0, 1));
        assert_eq!(for_30.routes[&2], (1, 0));
    }

    #[test]
    fn test_offset_shifts_group_ids() {
        let layout = Fixed {
            shards: vec![vec![vec![10, 20]]],
        };
        let members = vec![10, 20];
        let placement = Placement::new(&layout, &members, 10, 5);
        assert_eq!(placement.send_groups[&0], 5);
        assert!(placement.routes.contains_key(&5));
        assert!(placement.routes.contains_key(&6));
    }
}
