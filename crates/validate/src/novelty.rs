use std::sync::{Arc, Mutex, MutexGuard};

use index::cosine_similarity;

/// Embeddings of the questions accepted so far in a run.
pub struct NoveltyIndex {
    threshold: f32,
    accepted: Mutex<Vec<(String, Arc<Vec<f32>>)>>,
}

/// The accepted question a candidate is too close to.
#[derive(Debug, Clone, PartialEq)]
pub struct NearDuplicate {
    pub case_id: String,
    pub similarity: f32,
}

impl NoveltyIndex {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            accepted: Mutex::new(Vec::new()),
        }
    }

    /// Records `vector` unless it is above the threshold against an accepted
    /// question. Check and insert happen under one lock, so two workers can
    /// never both get in with near-identical questions.
    pub fn check_and_insert(&self, case_id: &str, vector: Arc<Vec<f32>>) -> Result<(), NearDuplicate> {
        let mut accepted = self.lock();
        if let Some(duplicate) = Self::closest_above(&accepted, &vector, self.threshold) {
            return Err(duplicate);
        }
        accepted.push((case_id.to_string(), vector));
        Ok(())
    }

    /// Adds a question accepted earlier, e.g. when a run is resumed.
    pub fn insert(&self, case_id: &str, vector: Arc<Vec<f32>>) {
        self.lock().push((case_id.to_string(), vector));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn closest_above(
        accepted: &[(String, Arc<Vec<f32>>)],
        vector: &[f32],
        threshold: f32,
    ) -> Option<NearDuplicate> {
        accepted
            .iter()
            .filter_map(|(id, other)| {
                let similarity = cosine_similarity(vector, other)?;
                (similarity > threshold).then(|| NearDuplicate {
                    case_id: id.clone(),
                    similarity,
                })
            })
            .max_by(|a, b| a.similarity.total_cmp(&b.similarity))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, Arc<Vec<f32>>)>> {
        // The guarded vector is never left half-updated, so a poisoned lock is still usable.
        self.accepted.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
