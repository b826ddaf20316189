//! Cashu wallet utility functions

use url::Url;

use super::types::ProofData;

/// Normalize a mint URL to prevent duplicates like "mint.coinos.io" vs "mint.coinos.io/"
/// This should be called when storing or comparing mint URLs.
pub fn normalize_mint_url(url: &str) -> String {
    let mut normalized = url.trim().to_string();

    // Remove trailing slashes
    while normalized.ends_with('/') {
        normalized.pop();
    }

    // Ensure https:// prefix if no scheme
    if !normalized.starts_with("http://") && !normalized.starts_with("https://") {
        normalized = format!("https://{}", normalized);
    }

    // Hosts are case-insensitive; paths are not
    if Url::parse(&normalized).is_ok() {
        if let Some(range) = authority_range(&normalized) {
            let lowercase = normalized[range.clone()].to_lowercase();
            normalized.replace_range(range, &lowercase);
        }
    }

    normalized
}

/// Byte range of the authority (`host[:port]`) in a URL with a scheme
fn authority_range(url: &str) -> Option<std::ops::Range<usize>> {
    let start = url.find("://")? + 3;
    let end = url[start..]
        .find(|c: char| matches!(c, '/' | '?' | '#'))
        .map_or(url.len(), |i| start + i);
    Some(start..end)
}

/// Check if a mint URL matches a normalized mint URL
#[inline]
pub fn mint_matches(stored_mint: &str, normalized_mint: &str) -> bool {
    normalize_mint_url(stored_mint) == normalized_mint
}

/// Sum proof amounts, saturating instead of wrapping
pub fn sum_proofs(proofs: &[ProofData]) -> u64 {
    proofs
        .iter()
        .map(|p| p.amount)
        .fold(0u64, |acc, amt| acc.saturating_add(amt))
}

/// Sum proof amounts, failing on overflow
pub fn checked_sum_proofs(proofs: &[ProofData]) -> Option<u64> {
    proofs
        .iter()
        .map(|p| p.amount)
        .try_fold(0u64, |acc, amt| acc.checked_add(amt))
}
