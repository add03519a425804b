use flatsync_core::ListingCandidate;

/// Candidates newer than the watermark, in source order.
///
/// Scans from the front until `last_known_id`; when the watermark is absent
/// from `candidates` (or there is none yet) every candidate is new.
pub fn compute_new<'a>(
    candidates: &'a [ListingCandidate],
    last_known_id: Option<&str>,
) -> &'a [ListingCandidate] {
    let Some(last_known_id) = last_known_id else {
        return candidates;
    };
    match candidates.iter().position(|c| c.id == last_known_id) {
        Some(watermark_at) => &candidates[..watermark_at],
        None => candidates,
    }
}
