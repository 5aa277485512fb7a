use rand::Rng;
use std::collections::HashSet;

use crate::models::{SharedFlag, SharingPreference};

/// Final step of the selection algorithm: partition the filtered pool by
/// sharing flag, take the preferred partition when it has members, and pick
/// uniformly at random inside it.
pub fn choose_by_preference<T>(
    pool: Vec<T>,
    preference: SharingPreference,
    shared_of: impl Fn(&T) -> SharedFlag,
) -> Option<T> {
    let (shared, dedicated): (Vec<T>, Vec<T>) =
        pool.into_iter().partition(|t| shared_of(t).is_shared());
    let (first, second) = match preference {
        SharingPreference::PreferShared => (shared, dedicated),
        SharingPreference::PreferDedicated => (dedicated, shared),
    };
    let mut bucket = if !first.is_empty() { first } else { second };
    if bucket.is_empty() {
        return None;
    }
    let idx = rand::thread_rng().gen_range(0..bucket.len());
    Some(bucket.swap_remove(idx))
}

/// Drops candidates already burned this request.
pub fn filter_excluded<T>(
    pool: Vec<T>,
    exclude: &HashSet<String>,
    id_of: impl Fn(&T) -> &str,
) -> Vec<T> {
    pool.into_iter()
        .filter(|t| !exclude.contains(id_of(t)))
        .collect()
}
