use crate::{Error, Rank, Result};

/// A group of transport ranks. Collectives address each other by position in the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Communicator {
    rank: Rank,
    members: Vec<Rank>,
}

impl Communicator {
    /// The identity communicator over `nproc` transport ranks.
    pub fn world(rank: Rank, nproc: usize) -> Result<Self> {
        Self::split((0..nproc).collect(), rank)
    }

    /// A communicator over `members` (global ranks, in communicator order), seen from the
    /// global rank `global_me`.
    pub fn split(members: Vec<Rank>, global_me: Rank) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::InvalidTopology("empty communicator".to_owned()));
        }
        let mut sorted = members.clone();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != members.len() {
            return Err(Error::InvalidTopology(format!(
                "duplicate ranks in communicator {:?}",
                members
            )));
        }

        let rank = members
            .iter()
            .position(|&m| m == global_me)
            .ok_or_else(|| {
                Error::InvalidTopology(format!(
                    "rank {} is not a member of {:?}",
                    global_me, members
                ))
            })?;
        Ok(Communicator { rank, members })
    }

    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    #[inline]
    pub fn nproc(&self) -> usize {
        self.members.len()
    }

    #[inline]
    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    pub fn global_rank(&self, comm_rank: Rank) -> Result<Rank> {
        self.members
            .get(comm_rank)
            .copied()
            .ok_or(Error::UnknownPartner {
                rank: comm_rank,
                nproc: self.members.len(),
            })
    }

    #[inline]
    pub fn my_global_rank(&self) -> Rank {
        self.members[self.rank]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_translates_ranks() {
        let comm = Communicator::split(vec![4, 2, 7], 7).unwrap();
        assert_eq!(comm.rank(), 2);
        assert_eq!(comm.nproc(), 3);
        assert_eq!(comm.global_rank(1).unwrap(), 2);
        assert_eq!(comm.my_global_rank(), 7);
        assert!(matches!(
            comm.global_rank(3),
            Err(Error::UnknownPartner { rank: 3, nproc: 3 })
        ));
    }

    #[test]
    fn bad_members() {
        assert!(Communicator::split(vec![], 0).is_err());
        assert!(Communicator::split(vec![1, 1], 1).is_err());
        assert!(Communicator::split(vec![0, 1], 5).is_err());
    }
}
