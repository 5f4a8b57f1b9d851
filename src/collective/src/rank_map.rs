//! Mapping a real participant count onto a power-of-two virtual rank space.
//!
//! Recursive doubling and binary-tree style algorithms are simplest when the number of
//! participants is a power of two. For other counts, the first `num_doubled` real ranks each
//! play two virtual roles so that the virtual space `[0, virtual_nproc)` is fully covered.

use smallvec::{smallvec, SmallVec};

use crate::{Error, Rank, Result};

/// The roles played by one real rank, at most two.
pub type Roles = SmallVec<[Rank; 2]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankTree {
    /// log2 of `virtual_nproc`
    pub log2nproc: u32,
    /// smallest power of two >= nproc
    pub virtual_nproc: usize,
    /// half of the virtual space, 0 when nproc == 1
    pub midpoint: usize,
    /// number of real ranks that take a second virtual role
    pub num_doubled: usize,
}

pub fn compute_tree(nproc: usize) -> Result<RankTree> {
    if nproc == 0 {
        return Err(Error::InvalidTopology(
            "a collective needs at least one participant".to_owned(),
        ));
    }

    let mut virtual_nproc = 1;
    let mut log2nproc = 0;
    while virtual_nproc < nproc {
        virtual_nproc *= 2;
        log2nproc += 1;
    }

    Ok(RankTree {
        log2nproc,
        virtual_nproc,
        midpoint: virtual_nproc / 2,
        num_doubled: virtual_nproc - nproc,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualRankMap {
    nproc: usize,
    virtual_nproc: usize,
}

impl VirtualRankMap {
    pub fn new(nproc: usize) -> Result<Self> {
        let tree = compute_tree(nproc)?;
        Ok(VirtualRankMap {
            nproc,
            virtual_nproc: tree.virtual_nproc,
        })
    }

    #[inline]
    pub fn nproc(&self) -> usize {
        self.nproc
    }

    #[inline]
    pub fn virtual_nproc(&self) -> usize {
        self.virtual_nproc
    }

    #[inline]
    pub fn num_doubled(&self) -> usize {
        self.virtual_nproc - self.nproc
    }

    pub fn real_to_virtual(&self, rank: Rank) -> Result<Roles> {
        if rank >= self.nproc {
            return Err(Error::UnknownPartner {
                rank,
                nproc: self.nproc,
            });
        }

        let num_doubled = self.num_doubled();
        if rank >= num_doubled {
            Ok(smallvec![num_doubled + rank])
        } else {
            Ok(smallvec![2 * rank, 2 * rank + 1])
        }
    }

    pub fn virtual_to_real(&self, virtual_rank: Rank) -> Result<Rank> {
        if virtual_rank >= self.virtual_nproc {
            return Err(Error::UnknownPartner {
                rank: virtual_rank,
                nproc: self.virtual_nproc,
            });
        }

        let num_doubled = self.num_doubled();
        if virtual_rank >= 2 * num_doubled {
            Ok(virtual_rank - num_doubled)
        } else {
            Ok(virtual_rank / 2)
        }
    }
}

/// Whether `virtual_partner` is one of `my_roles`: the two roles then share memory and no
/// network action is needed.
#[inline]
pub fn is_shared_role(virtual_partner: Rank, my_roles: &[Rank]) -> bool {
    my_roles.contains(&virtual_partner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_of_small_counts() {
        let t = compute_tree(1).unwrap();
        assert_eq!((t.log2nproc, t.virtual_nproc, t.midpoint, t.num_doubled), (0, 1, 0, 0));
        let t = compute_tree(5).unwrap();
        assert_eq!((t.log2nproc, t.virtual_nproc, t.midpoint, t.num_doubled), (3, 8, 4, 3));
        let t = compute_tree(16).unwrap();
        assert_eq!((t.log2nproc, t.virtual_nproc, t.midpoint, t.num_doubled), (4, 16, 8, 0));
    }

    #[test]
    fn zero_participants_is_rejected() {
        assert!(matches!(compute_tree(0), Err(Error::InvalidTopology(_))));
        assert!(VirtualRankMap::new(0).is_err());
    }

    #[test]
    fn bijection() {
        for nproc in 1..=40 {
            let map = VirtualRankMap::new(nproc).unwrap();
            let mut claimed = vec![0; map.virtual_nproc()];
            for r in 0..nproc {
                let roles = map.real_to_virtual(r).unwrap();
                assert!(!roles.is_empty() && roles.len() <= 2);
                assert_eq!(roles.len() == 2, r < map.num_doubled());
                for &v in &roles {
                    claimed[v] += 1;
                    assert_eq!(map.virtual_to_real(v).unwrap(), r);
                }
            }
            assert!(claimed.iter().all(|&c| c == 1), "nproc {}: {:?}", nproc, claimed);
        }
    }

    #[test]
    fn out_of_range_lookups() {
        let map = VirtualRankMap::new(5).unwrap();
        assert!(matches!(
            map.virtual_to_real(8),
            Err(Error::UnknownPartner { rank: 8, nproc: 8 })
        ));
        assert!(map.real_to_virtual(5).is_err());
    }

    #[test]
    fn shared_roles() {
        let map = VirtualRankMap::new(3).unwrap();
        let roles = map.real_to_virtual(0).unwrap();
        assert!(is_shared_role(1, &roles));
        assert!(!is_shared_role(2, &roles));
    }
}
