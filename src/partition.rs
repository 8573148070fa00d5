use crate::error::{HarvestError, Result};
use crate::identifier::Identifier;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub index: usize,
    pub ids: Vec<Identifier>,
}

impl Partition {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Drops everything up to and including `resume_after`.
pub fn skip_through(ids: &[Identifier], resume_after: Option<&Identifier>) -> Result<Vec<Identifier>> {
    match resume_after {
        None => Ok(ids.to_vec()),
        Some(resume) => {
            let position = ids
                .iter()
                .position(|id| id == resume)
                .ok_or_else(|| HarvestError::ResumePointNotFound(resume.clone()))?;
            Ok(ids[position + 1..].to_vec())
        }
    }
}

/// Deals identifiers round-robin into `workers` partitions: position `i` goes to `i % workers`.
pub fn split_round_robin(ids: &[Identifier], workers: usize) -> Result<Vec<Partition>> {
    if workers == 0 {
        return Err(HarvestError::InvalidWorkerCount);
    }
    let mut partitions: Vec<Partition> = (0..workers)
        .map(|index| Partition {
            index,
            ids: Vec::with_capacity(ids.len() / workers + 1),
        })
        .collect();
    for (position, id) in ids.iter().enumerate() {
        partitions[position % workers].ids.push(id.clone());
    }
    Ok(partitions)
}

pub fn partition(ids: &[Identifier], workers: usize, resume_after: Option<&Identifier>) -> Result<Vec<Partition>> {
    if workers == 0 {
        return Err(HarvestError::InvalidWorkerCount);
    }
    let remaining = skip_through(ids, resume_after)?;
    split_round_robin(&remaining, workers)
}
