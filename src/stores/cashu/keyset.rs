//! Keyset filtering
//!
//! Before any send the proof set is narrowed to proofs whose keyset the target
//! mint currently recognizes. Proofs from other mints or retired keysets are
//! never handed to the mint and must survive the send untouched.

use std::collections::HashSet;

use super::types::ProofData;

/// Proofs split by whether the target mint recognizes their keyset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeysetPartition {
    /// Spendable at the target mint
    pub candidates: Vec<ProofData>,
    /// Belong to another mint or a decommissioned keyset
    pub untouched: Vec<ProofData>,
}

/// Partition proofs by the mint's current keyset IDs
pub fn partition_by_keysets(proofs: &[ProofData], keyset_ids: &[String]) -> KeysetPartition {
    let known: HashSet<&str> = keyset_ids.iter().map(String::as_str).collect();

    let (candidates, untouched) = proofs
        .iter()
        .cloned()
        .partition(|p| known.contains(p.id.as_str()));

    KeysetPartition {
        candidates,
        untouched,
    }
}

/// Total value and count of proofs per keyset, for logging
pub fn summarize_by_keyset(proofs: &[ProofData]) -> Vec<(String, usize, u64)> {
    let mut summary: Vec<(String, usize, u64)> = Vec::new();

    for proof in proofs {
        match summary.iter_mut().find(|(id, _, _)| *id == proof.id) {
            Some(entry) => {
                entry.1 += 1;
                entry.2 = entry.2.saturating_add(proof.amount);
            }
            None => summary.push((proof.id.clone(), 1, proof.amount)),
        }
    }

    summary
}
