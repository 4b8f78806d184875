//! Eager-load path resolution.
//!
//! # Responsibility
//! - Turn declared eager navigations into dotted include paths
//!   (`Lines`, `Lines.Product`, ...).
//! - Cache the result per model for the lifetime of the process.
//!
//! # Invariants
//! - Resolution never recurses into a model already on the traversal stack.
//! - A depth budget of `0` yields no paths for that branch.
//! - Cached paths are ordered by ascending segment count; declaration order
//!   is kept among paths of equal depth.

use super::EntityModel;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Separator between navigation names in an include path.
pub const PATH_SEPARATOR: char = '.';

static INCLUDE_CACHE: Lazy<DashMap<&'static str, Arc<[String]>>> = Lazy::new(DashMap::new);

/// Returns the cached, depth-ordered include paths for `model`.
pub fn include_paths(model: &'static EntityModel) -> Arc<[String]> {
    if let Some(cached) = INCLUDE_CACHE.get(model.name) {
        return Arc::clone(cached.value());
    }

    let mut paths = resolve_paths(model, "", true, None);
    paths.sort_by_key(|path| segment_count(path));
    let resolved: Arc<[String]> = paths.into();

    Arc::clone(
        INCLUDE_CACHE
            .entry(model.name)
            .or_insert(resolved)
            .value(),
    )
}

/// Computes include paths for `model` in declaration (depth-first) order.
///
/// `prefix` is prepended to every path; `depth` caps the remaining
/// recursion, `None` meaning each property's own declared depth applies.
pub fn resolve_paths(
    model: &'static EntityModel,
    prefix: &str,
    recursive: bool,
    depth: Option<u32>,
) -> Vec<String> {
    let mut stack = vec![model];
    resolve_from_stack(&mut stack, prefix, recursive, depth)
}

/// Number of navigation segments in `path`.
pub fn segment_count(path: &str) -> usize {
    path.split(PATH_SEPARATOR).count()
}

fn resolve_from_stack(
    stack: &mut Vec<&'static EntityModel>,
    prefix: &str,
    recursive: bool,
    depth: Option<u32>,
) -> Vec<String> {
    let mut paths = Vec::new();
    if depth == Some(0) {
        return paths;
    }

    let Some(current) = stack.last().copied() else {
        return paths;
    };

    for navigation in current.navigations.iter().filter(|nav| nav.eager_load) {
        let path = format!("{prefix}{}", navigation.name);
        paths.push(path.clone());

        if !recursive {
            continue;
        }

        let remaining = depth
            .or(navigation.depth)
            .map(|budget| budget.saturating_sub(1));
        // Collections recurse into their element model.
        let target = navigation.target_model();
        let recurse =
            !stack.iter().any(|seen| seen.same_as(target)) && remaining != Some(0);

        stack.push(target);
        let nested_prefix = format!("{path}{PATH_SEPARATOR}");
        paths.extend(resolve_from_stack(stack, &nested_prefix, recurse, remaining));
        stack.pop();
    }

    paths
}
