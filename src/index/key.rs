use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::revision::Revision;

/// A contiguous live span of revisions for one user key, ended by a
/// tombstone. The tombstone revision is always the last entry of its
/// generation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Generation {
    /// Version counter at the end of the generation.
    pub version: i64,
    /// Revision of the put that opened the generation.
    pub created: Revision,
    /// Strictly increasing revisions recorded within the generation.
    pub revs: Vec<Revision>,
}

impl Generation {
    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    /// Walks the revisions newest to oldest, stopping at the first revision
    /// for which `f` returns false. Returns its index, or None if `f` held
    /// for every revision.
    fn walk(&self, mut f: impl FnMut(Revision) -> bool) -> Option<usize> {
        let l = self.revs.len();
        for i in 0..l {
            let idx = l - i - 1;
            if !f(self.revs[idx]) {
                return Some(idx);
            }
        }
        None
    }
}

/// The in-memory history of one user key: every revision that ever wrote
/// the key, grouped into generations separated by tombstones.
///
/// The concatenation of the generations' revision lists is strictly
/// increasing. A record whose every generation is empty carries no
/// queryable history and must be removed from the index.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyRecord {
    pub key: Vec<u8>,
    /// The latest revision recorded for the key.
    pub modified: Revision,
    pub generations: Vec<Generation>,
}

impl KeyRecord {
    pub fn new(key: Vec<u8>) -> Self {
        Self {
            key,
            ..Default::default()
        }
    }

    /// Records a write of the key at `rev`. `rev` must be larger than any
    /// revision recorded so far.
    pub fn put(&mut self, rev: Revision) {
        if rev <= self.modified {
            panic!(
                "put with revision {rev:?} not newer than modified {:?} for key {:?}",
                self.modified, self.key
            );
        }
        if self.generations.is_empty() {
            self.generations.push(Generation::default());
        }
        let g = self.generations.last_mut().unwrap();
        if g.is_empty() {
            g.created = rev;
        }
        g.revs.push(rev);
        g.version += 1;
        self.modified = rev;
    }

    /// Seeds the record from a stored row during recovery. Only valid on a
    /// record with no generations yet.
    pub fn restore(&mut self, created: Revision, modified: Revision, version: i64) {
        if !self.generations.is_empty() {
            panic!("restore on non-empty key record {:?}", self.key);
        }
        self.modified = modified;
        self.generations.push(Generation {
            version,
            created,
            revs: vec![modified],
        });
    }

    /// Closes the current generation with a tombstone at `rev` and opens a
    /// new empty one. Fails with NotFound if the current generation is
    /// already empty (the key does not exist at this point).
    pub fn tombstone(&mut self, rev: Revision) -> Result<()> {
        if self.is_empty() {
            panic!("tombstone on empty key record {:?}", self.key);
        }
        if self.generations.last().unwrap().is_empty() {
            return Err(Error::NotFound);
        }
        self.put(rev);
        self.generations.push(Generation::default());
        Ok(())
    }

    /// Finds the record of the key as of `at_rev`: the largest revision
    /// `<= at_rev`, the creation revision of its generation, and the version
    /// at that point.
    pub fn get(&self, at_rev: i64) -> Result<(Revision, Revision, i64)> {
        if self.is_empty() {
            panic!("get on empty key record {:?}", self.key);
        }
        let g = self.find_generation(at_rev).ok_or(Error::NotFound)?;
        match g.walk(|rev| rev.main > at_rev) {
            Some(n) => Ok((
                g.revs[n],
                g.created,
                g.version - (g.revs.len() - n - 1) as i64,
            )),
            None => Err(Error::NotFound),
        }
    }

    /// Returns every revision of the key at or after `rev`, in order. When
    /// one main revision wrote the key several times, only the last write is
    /// reported.
    pub fn since(&self, rev: i64) -> Vec<Revision> {
        if self.is_empty() {
            panic!("since on empty key record {:?}", self.key);
        }
        let since = Revision::new(rev, 0);

        let mut gi = self.generations.len() - 1;
        while gi > 0 {
            let g = &self.generations[gi];
            if !g.is_empty() && since > g.created {
                break;
            }
            gi -= 1;
        }

        let mut revs: Vec<Revision> = Vec::new();
        let mut last = 0i64;
        for g in &self.generations[gi..] {
            for &r in &g.revs {
                if since > r {
                    continue;
                }
                if r.main == last {
                    // Supersede the earlier write of the same transaction;
                    // only the final sub-revision is externally visible.
                    *revs.last_mut().unwrap() = r;
                    continue;
                }
                revs.push(r);
                last = r.main;
            }
        }
        revs
    }

    /// Drops history at or below `at_rev`, keeping the largest revision
    /// `<= at_rev` of the straddling generation and everything newer.
    /// Revisions that remain queryable are added to `available`; a retained
    /// entry that turns out to be a closing tombstone is removed again since
    /// the key no longer exists at `at_rev`.
    pub fn compact(&mut self, at_rev: i64, available: &mut HashSet<Revision>) {
        if self.is_empty() {
            panic!("compact on empty key record {:?}", self.key);
        }

        // Find the first generation that ends after at_rev.
        let mut i = 0;
        while i < self.generations.len() - 1 {
            if let Some(tomb) = self.generations[i].revs.last() {
                if tomb.main > at_rev {
                    break;
                }
            }
            i += 1;
        }

        let genlen = self.generations.len();
        let g = &mut self.generations[i];
        if !g.is_empty() {
            let n = g.walk(|rev| {
                if rev.main <= at_rev {
                    available.insert(rev);
                    return false;
                }
                true
            });
            if let Some(n) = n {
                g.revs.drain(..n);
            }
            // A closed generation reduced to its tombstone is dead history.
            if g.revs.len() == 1 && i != genlen - 1 {
                available.remove(&g.revs[0]);
                i += 1;
            }
        }

        self.generations.drain(..i);
    }

    /// True once compaction has dropped every generation; the record must
    /// then be removed from the index.
    pub fn is_empty(&self) -> bool {
        self.generations.is_empty()
            || (self.generations.len() == 1 && self.generations[0].is_empty())
    }

    /// Finds the generation that contains `rev`, if the key existed then.
    fn find_generation(&self, rev: i64) -> Option<&Generation> {
        let lastg = self.generations.len() as isize - 1;
        let mut cg = lastg;
        while cg >= 0 {
            let g = &self.generations[cg as usize];
            if g.is_empty() {
                cg -= 1;
                continue;
            }
            if cg != lastg {
                // The key was deleted at or before rev: not found.
                if g.revs.last().unwrap().main <= rev {
                    return None;
                }
            }
            if g.revs[0].main <= rev {
                return Some(g);
            }
            cg -= 1;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(main: i64, sub: i64) -> Revision {
        Revision::new(main, sub)
    }

    // Builds a record with history: put@2, put@4, tombstone@6, put@8, put@10.
    fn record_with_history() -> KeyRecord {
        let mut ki = KeyRecord::new(b"foo".to_vec());
        ki.put(rev(2, 0));
        ki.put(rev(4, 0));
        ki.tombstone(rev(6, 0)).unwrap();
        ki.put(rev(8, 0));
        ki.put(rev(10, 0));
        ki
    }

    #[test]
    fn test_put_tracks_generations() {
        let ki = record_with_history();
        assert_eq!(ki.modified, rev(10, 0));
        assert_eq!(ki.generations.len(), 2);
        assert_eq!(ki.generations[0].created, rev(2, 0));
        assert_eq!(ki.generations[0].version, 3);
        assert_eq!(
            ki.generations[0].revs,
            vec![rev(2, 0), rev(4, 0), rev(6, 0)]
        );
        assert_eq!(ki.generations[1].created, rev(8, 0));
        assert_eq!(ki.generations[1].version, 2);
    }

    #[test]
    fn test_get_at_revisions() {
        let ki = record_with_history();

        // Within the first generation.
        let (modified, created, ver) = ki.get(2).unwrap();
        assert_eq!((modified, created, ver), (rev(2, 0), rev(2, 0), 1));
        let (modified, created, ver) = ki.get(5).unwrap();
        assert_eq!((modified, created, ver), (rev(4, 0), rev(2, 0), 2));

        // The deletion takes effect at the tombstone revision: the key no
        // longer exists at rev 6, nor between the generations.
        assert_eq!(ki.get(6), Err(Error::NotFound));
        assert_eq!(ki.get(7), Err(Error::NotFound));

        // Second generation.
        let (modified, created, ver) = ki.get(10).unwrap();
        assert_eq!((modified, created, ver), (rev(10, 0), rev(8, 0), 2));

        // Before the key existed.
        assert_eq!(ki.get(1), Err(Error::NotFound));
    }

    #[test]
    fn test_tombstone_on_deleted_key_fails() {
        let mut ki = record_with_history();
        ki.tombstone(rev(12, 0)).unwrap();
        assert_eq!(ki.tombstone(rev(14, 0)), Err(Error::NotFound));
    }

    #[test]
    fn test_since() {
        let ki = record_with_history();
        assert_eq!(
            ki.since(1),
            vec![rev(2, 0), rev(4, 0), rev(6, 0), rev(8, 0), rev(10, 0)]
        );
        assert_eq!(ki.since(5), vec![rev(6, 0), rev(8, 0), rev(10, 0)]);
        assert_eq!(ki.since(8), vec![rev(8, 0), rev(10, 0)]);
        assert_eq!(ki.since(11), Vec::<Revision>::new());
    }

    #[test]
    fn test_since_reports_last_sub_revision_only() {
        let mut ki = KeyRecord::new(b"foo".to_vec());
        ki.put(rev(2, 0));
        ki.put(rev(2, 1));
        ki.put(rev(2, 4));
        assert_eq!(ki.since(1), vec![rev(2, 4)]);
    }

    #[test]
    fn test_compact_within_generation() {
        let mut ki = record_with_history();
        let mut available = HashSet::new();
        ki.compact(4, &mut available);

        // Rev 4 is the latest <= 4: it stays queryable, rev 2 is dropped.
        assert_eq!(ki.generations.len(), 2);
        assert_eq!(ki.generations[0].revs, vec![rev(4, 0), rev(6, 0)]);
        assert!(available.contains(&rev(4, 0)));
        assert!(!available.contains(&rev(2, 0)));
        assert_eq!(ki.get(4).unwrap().0, rev(4, 0));
    }

    #[test]
    fn test_compact_drops_closed_generation() {
        let mut ki = record_with_history();
        let mut available = HashSet::new();
        ki.compact(7, &mut available);

        // The first generation ended at 6 <= 7; only the live one remains,
        // and the tombstone row is not retained.
        assert_eq!(ki.generations.len(), 1);
        assert_eq!(ki.generations[0].revs, vec![rev(8, 0), rev(10, 0)]);
        assert!(available.is_empty());
    }

    #[test]
    fn test_compact_to_empty_record() {
        let mut ki = KeyRecord::new(b"foo".to_vec());
        ki.put(rev(2, 0));
        ki.tombstone(rev(3, 0)).unwrap();

        let mut available = HashSet::new();
        ki.compact(4, &mut available);
        assert!(ki.is_empty());
        assert!(available.is_empty());
    }

    #[test]
    fn test_restore() {
        let mut ki = KeyRecord::new(b"foo".to_vec());
        ki.restore(rev(2, 0), rev(5, 1), 3);
        assert_eq!(ki.modified, rev(5, 1));
        assert_eq!(ki.generations.len(), 1);
        let (modified, created, ver) = ki.get(6).unwrap();
        assert_eq!((modified, created, ver), (rev(5, 1), rev(2, 0), 3));
    }

    #[test]
    #[should_panic]
    fn test_put_with_smaller_revision_panics() {
        let mut ki = KeyRecord::new(b"foo".to_vec());
        ki.put(rev(5, 0));
        ki.put(rev(4, 0));
    }
}
