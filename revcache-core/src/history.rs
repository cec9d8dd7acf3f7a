//! Read-only ancestry queries over a prepared cache
//!
//! These are the lookups a revision graph needs: where a path's line of
//! history starts, where a copy came from, and what was copied from a path.
//! None of them intern new paths.

use crate::path_dictionary::PathDictionary;
use crate::repository_cache::RepositoryCache;
use crate::revision::{ChangeAction, ChangedPath, CopySource, CopyTarget};

fn starts_history(paths: &PathDictionary, changed: &ChangedPath, path_index: i32) -> bool {
    (changed.action == ChangeAction::Add || changed.copied_from.is_some())
        && paths.is_ancestor(changed.path_index, path_index)
}

/// Latest revision at or below `revision` where `path_index` (or one of
/// its parents) was added or copied, i.e. where its current line begins.
pub fn find_start_revision(cache: &RepositoryCache, revision: u64, path_index: i32) -> Option<u64> {
    let paths = cache.paths();
    (1..=revision).rev().find(|&rev| {
        cache.revision(rev).is_some_and(|record| {
            record
                .changed_paths
                .iter()
                .any(|changed| starts_history(paths, changed, path_index))
        })
    })
}

/// Where `path_index` came from if `revision` copied it (or a parent of it).
///
/// The closest copied parent wins; `path_index` is re-rooted under that
/// copy's source. `None` if `revision` made no such copy or the re-rooted
/// path was never seen.
pub fn copy_source(cache: &RepositoryCache, revision: u64, path_index: i32) -> Option<CopySource> {
    let paths = cache.paths();
    let record = cache.revision(revision)?;
    let (copied, source) = record
        .changed_paths
        .iter()
        .filter_map(|changed| changed.copied_from.map(|source| (changed, source)))
        .filter(|(changed, _)| paths.is_ancestor(changed.path_index, path_index))
        .max_by_key(|(changed, _)| changed.path_index)?;

    let relative = paths.relative_segments(copied.path_index, path_index);
    let rerooted = paths.find_segments(source.path_index, &relative)?;
    Some(CopySource {
        path_index: rerooted,
        revision: source.revision,
    })
}

/// Copies taken from `path_index` or any of its parents at a source
/// revision within `start..=end`, ordered by the revision that copied.
pub fn copy_targets(cache: &RepositoryCache, path_index: i32, start: u64, end: u64) -> Vec<CopyTarget> {
    let paths = cache.paths();
    let index = cache.copy_index();
    let mut targets: Vec<CopyTarget> = index
        .sources()
        .filter(|&source| paths.is_ancestor(source, path_index))
        .flat_map(|source| index.targets(source))
        .filter(|target| {
            target
                .changed_path
                .copied_from
                .is_some_and(|from| (start..=end).contains(&from.revision))
        })
        .cloned()
        .collect();
    targets.sort_by_key(|target| (target.revision, target.changed_path.path_index));
    targets
}
