use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use tracing::{debug, info, warn};

use index::{shared_entities, RetrievalIndex};
use ingest::Chunk;

/// Chunks from distinct documents where each consecutive pair shares an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub chunks: Vec<Chunk>,
    /// `bridges[i]` are the entities linking `chunks[i]` to `chunks[i + 1]`.
    pub bridges: Vec<BTreeSet<String>>,
}

impl Chain {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_ids(&self) -> Vec<String> {
        self.chunks.iter().map(|c| c.chunk_id.clone()).collect()
    }

    pub fn doc_ids(&self) -> Vec<&str> {
        self.chunks.iter().map(|c| c.doc_id.as_str()).collect()
    }
}

/// Partial path held in the BFS frontier.
struct Path<'a> {
    chunks: Vec<&'a Chunk>,
    bridges: Vec<BTreeSet<String>>,
    docs: HashSet<String>,
}

impl<'a> Path<'a> {
    fn start(seed: &'a Chunk) -> Self {
        Self {
            chunks: vec![seed],
            bridges: Vec::new(),
            docs: HashSet::from([seed.doc_id.clone()]),
        }
    }

    fn last(&self) -> &'a Chunk {
        self.chunks[self.chunks.len() - 1]
    }

    fn extend(&self, next: &'a Chunk, bridge: BTreeSet<String>) -> Self {
        let mut path = Self {
            chunks: self.chunks.clone(),
            bridges: self.bridges.clone(),
            docs: self.docs.clone(),
        };
        path.chunks.push(next);
        path.bridges.push(bridge);
        path.docs.insert(next.doc_id.clone());
        path
    }

    fn into_chain(self) -> Chain {
        Chain {
            chunks: self.chunks.into_iter().cloned().collect(),
            bridges: self.bridges,
        }
    }
}

/// Multi-hop seeds in the order a run processes them.
#[derive(Debug, Clone, Default)]
pub struct SeedPlan {
    pub chains: Vec<Chain>,
    pub zero_chain_seeds: usize,
    /// Chains dropped because an earlier seed already produced the same set of chunks.
    pub duplicate_chains: usize,
}

pub struct ChainFinder<'a> {
    index: &'a RetrievalIndex,
    frontier_limit: usize,
}

impl<'a> ChainFinder<'a> {
    pub fn new(index: &'a RetrievalIndex) -> Self {
        Self {
            index,
            frontier_limit: 10_000,
        }
    }

    /// Caps the number of partial paths kept per search.
    pub fn with_frontier_limit(mut self, frontier_limit: usize) -> Self {
        self.frontier_limit = frontier_limit.max(1);
        self
    }

    /// Chains of exactly `target_hops` chunks starting at `seed`, in BFS order,
    /// at most `max_candidates` of them.
    ///
    /// The first link shares an entity with the seed by construction. Every
    /// later link must share at least one entity the seed does not contain,
    /// so the chain really moves away from the seed's topic.
    pub fn find_chains(&self, seed: &Chunk, target_hops: usize, max_candidates: usize) -> Vec<Chain> {
        if target_hops < 2 || max_candidates == 0 {
            return Vec::new();
        }

        let mut chains = Vec::new();
        let mut frontier: VecDeque<Path<'_>> = VecDeque::from([Path::start(seed)]);
        let mut truncated = false;

        while let Some(path) = frontier.pop_front() {
            if path.chunks.len() == target_hops {
                chains.push(path.into_chain());
                if chains.len() >= max_candidates {
                    break;
                }
                continue;
            }

            let last = path.last();
            for next in self.index.entity_neighbors(last, &path.docs) {
                let bridge: BTreeSet<String> = shared_entities(last, next)
                    .into_iter()
                    .map(str::to_string)
                    .collect();
                if path.chunks.len() >= 2 && bridge.iter().all(|e| seed.entities.contains(e)) {
                    continue;
                }
                if frontier.len() >= self.frontier_limit {
                    truncated = true;
                    break;
                }
                frontier.push_back(path.extend(next, bridge));
            }
        }

        if truncated {
            warn!(
                seed = %seed.chunk_id,
                limit = self.frontier_limit,
                "Chain search frontier truncated"
            );
        }
        debug!(seed = %seed.chunk_id, target_hops, found = chains.len(), "Chain search done");
        chains
    }

    /// Chains for every chunk in corpus order; seeds without any chain are
    /// counted, not reported as errors. A chain over the same chunks as an
    /// earlier one (`[A, B]` after `[B, A]`) is dropped, since it would
    /// prompt with the same evidence.
    pub fn seed_chains(&self, chunks: &[Chunk], target_hops: usize, max_candidates_per_seed: usize) -> SeedPlan {
        let mut plan = SeedPlan::default();
        let mut seen: HashSet<BTreeSet<String>> = HashSet::new();

        for seed in chunks {
            let found = self.find_chains(seed, target_hops, max_candidates_per_seed);
            if found.is_empty() {
                debug!(seed = %seed.chunk_id, "No chain found for seed");
                plan.zero_chain_seeds += 1;
            }
            for chain in found {
                if seen.insert(chain.chunk_ids().into_iter().collect()) {
                    plan.chains.push(chain);
                } else {
                    plan.duplicate_chains += 1;
                }
            }
        }

        info!(
            seeds = chunks.len(),
            chains = plan.chains.len(),
            zero_chain_seeds = plan.zero_chain_seeds,
            duplicate_chains = plan.duplicate_chains,
            "Multi-hop seeds planned"
        );
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn chunk(doc: &str, entities: &[&str]) -> Chunk {
        let text = format!("text of {doc}");
        Chunk::new(
            doc.to_string(),
            0,
            text.clone(),
            format!("mem://{doc}"),
            (0, text.len()),
            entities.iter().map(|e| e.to_string()).collect(),
        )
    }

    fn index(chunks: &[Chunk]) -> RetrievalIndex {
        let mut index = RetrievalIndex::new(
            Arc::new(llm::HashingEmbedder::new(8)),
            llm::RetryPolicy::new(0, 1, 1),
        );
        index.add_chunks(chunks);
        index
    }

    #[test]
    fn test_three_document_chain() {
        let chunks = vec![
            chunk("doc1", &["a", "b"]),
            chunk("doc2", &["b", "c"]),
            chunk("doc3", &["c", "d"]),
        ];
        let index = index(&chunks);
        let finder = ChainFinder::new(&index);

        let chains = finder.find_chains(&chunks[0], 3, 10);
        assert_eq!(chains.len(), 1);
        assert_eq!(chains[0].doc_ids(), vec!["doc1", "doc2", "doc3"]);
        assert_eq!(chains[0].bridges[0], BTreeSet::from(["b".to_string()]));
        assert_eq!(chains[0].bridges[1], BTreeSet::from(["c".to_string()]));
    }

    #[test]
    fn test_no_shared_entity_means_no_chain() {
        let chunks = vec![chunk("doc1", &["a"]), chunk("doc2", &["z"])];
        let index = index(&chunks);
        let finder = ChainFinder::new(&index);

        assert!(finder.find_chains(&chunks[0], 2, 10).is_empty());
        let plan = finder.seed_chains(&chunks, 2, 10);
        assert!(plan.chains.is_empty());
        assert_eq!(plan.zero_chain_seeds, 2);
    }

    #[test]
    fn test_later_links_must_bridge_outside_the_seed() {
        // doc2 -> doc3 only shares "a", which the seed already has.
        let chunks = vec![
            chunk("doc1", &["a", "b"]),
            chunk("doc2", &["a", "b"]),
            chunk("doc3", &["a"]),
        ];
        let index = index(&chunks);
        let finder = ChainFinder::new(&index);

        let chains = finder.find_chains(&chunks[0], 3, 10);
        assert!(chains.is_empty());
        assert_eq!(finder.find_chains(&chunks[0], 2, 10).len(), 2);
    }

    #[test]
    fn test_documents_never_repeat() {
        let mut same_doc = chunk("doc2", &["b", "c"]);
        same_doc.ordinal = 1;
        same_doc.chunk_id = Chunk::generate_chunk_id("doc2", 1);
        let chunks = vec![
            chunk("doc1", &["a", "b"]),
            chunk("doc2", &["b", "c"]),
            same_doc,
            chunk("doc3", &["c", "d"]),
        ];
        let index = index(&chunks);
        let finder = ChainFinder::new(&index);

        for chain in finder.find_chains(&chunks[0], 3, 10) {
            let docs: HashSet<&str> = chain.doc_ids().into_iter().collect();
            assert_eq!(docs.len(), chain.len());
            assert_eq!(chain.len(), 3);
        }
    }

    #[test]
    fn test_degenerate_requests() {
        let chunks = vec![chunk("doc1", &["a"]), chunk("doc2", &["a"])];
        let index = index(&chunks);
        let finder = ChainFinder::new(&index);

        assert!(finder.find_chains(&chunks[0], 1, 10).is_empty());
        assert!(finder.find_chains(&chunks[0], 2, 0).is_empty());
        assert_eq!(finder.find_chains(&chunks[0], 2, 10).len(), 1);
    }

    #[test]
    fn test_max_candidates_and_determinism() {
        let chunks = vec![
            chunk("doc1", &["hub"]),
            chunk("doc2", &["hub"]),
            chunk("doc3", &["hub"]),
            chunk("doc4", &["hub"]),
        ];
        let index = index(&chunks);
        let finder = ChainFinder::new(&index);

        let first = finder.find_chains(&chunks[0], 2, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(first, finder.find_chains(&chunks[0], 2, 2));
    }

    #[test]
    fn test_reversed_chains_are_planned_once() {
        let chunks = vec![
            chunk("doc1", &["a", "b"]),
            chunk("doc2", &["b", "c"]),
            chunk("doc3", &["c", "d"]),
        ];
        let index = index(&chunks);
        let finder = ChainFinder::new(&index);

        // doc1 and doc3 both reach the other end; doc2 has no 3-chain.
        let plan = finder.seed_chains(&chunks, 3, 10);
        assert_eq!(plan.chains.len(), 1);
        assert_eq!(plan.chains[0].doc_ids(), vec!["doc1", "doc2", "doc3"]);
        assert_eq!(plan.duplicate_chains, 1);
        assert_eq!(plan.zero_chain_seeds, 1);

        let plan = finder.seed_chains(&chunks, 2, 10);
        let pairs: Vec<Vec<&str>> = plan.chains.iter().map(|c| c.doc_ids()).collect();
        assert_eq!(pairs, vec![vec!["doc1", "doc2"], vec!["doc2", "doc3"]]);
        assert_eq!(plan.duplicate_chains, 2);
    }
}
