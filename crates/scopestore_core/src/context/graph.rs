//! Eager loading of include paths into an `EntityNode` graph.
//!
//! # Responsibility
//! - Walk include paths, shortest first, from one root entry.
//! - Load each navigation once per distinct `(entry, path)` pair.
//! - Assemble the loaded entries into a tree limited to the include set.
//!
//! # Invariants
//! - A path whose parent path found nothing is skipped with a warning.
//! - Paths naming an unknown navigation are skipped, never fatal.

use crate::model::includes::PATH_SEPARATOR;
use crate::model::{Cardinality, EntityModel, EntityNode, Navigated};
use crate::session::{EntryId, Session};
use crate::store::StoreResult;
use log::warn;
use std::collections::{HashMap, HashSet};

const ROOT_PATH: &str = "Root";

type Frontier = HashMap<String, Vec<(EntryId, &'static EntityModel)>>;

/// Loads `paths` below `root` and returns the materialized graph.
///
/// `paths` must already be ordered by ascending segment count.
pub(crate) fn load_graph(
    session: &mut Session,
    model: &'static EntityModel,
    root: EntryId,
    paths: &[String],
) -> StoreResult<Option<EntityNode>> {
    let mut frontier: Frontier = HashMap::new();
    frontier.insert(ROOT_PATH.to_string(), vec![(root, model)]);
    let mut visited: HashSet<(EntryId, String)> = HashSet::new();
    let mut links: HashMap<(EntryId, String), Vec<EntryId>> = HashMap::new();

    for path in paths {
        let full_path = format!("{ROOT_PATH}{PATH_SEPARATOR}{path}");
        let Some((parent_path, name)) = full_path.rsplit_once(PATH_SEPARATOR) else {
            continue;
        };
        let Some(parents) = frontier.get(parent_path).cloned() else {
            warn!(
                "event=eager_load module=context status=skip model={} path={} reason=parent_not_loaded",
                model.name, path
            );
            continue;
        };

        for (owner, owner_model) in parents {
            let Some(navigation) = owner_model.navigation(name) else {
                warn!(
                    "event=eager_load module=context status=skip model={} path={} reason=unknown_navigation",
                    owner_model.name, path
                );
                continue;
            };
            if !visited.insert((owner, full_path.clone())) {
                continue;
            }

            let loaded = session.load_navigation(owner, navigation)?;
            let target = navigation.target_model();
            if navigation.cardinality == Cardinality::Many || !loaded.is_empty() {
                let reached = frontier.entry(full_path.clone()).or_default();
                for entry in &loaded {
                    if !reached.iter().any(|(seen, _)| seen == entry) {
                        reached.push((*entry, target));
                    }
                }
            }
            links.insert((owner, full_path.clone()), loaded);
        }
    }

    Ok(build_node(session, &links, root, model, ROOT_PATH))
}

fn build_node(
    session: &Session,
    links: &HashMap<(EntryId, String), Vec<EntryId>>,
    entry_id: EntryId,
    model: &'static EntityModel,
    path: &str,
) -> Option<EntityNode> {
    let entry = session.entry(entry_id)?;
    let mut node = EntityNode::new(model.name, entry.key(), entry.current().clone());

    for navigation in model.navigations {
        let child_path = format!("{path}{PATH_SEPARATOR}{}", navigation.name);
        let Some(children) = links.get(&(entry_id, child_path.clone())) else {
            continue;
        };
        let target = navigation.target_model();
        let mut built = children
            .iter()
            .filter_map(|child| build_node(session, links, *child, target, &child_path));

        let value = match navigation.cardinality {
            Cardinality::One => Navigated::One(built.next().map(Box::new)),
            Cardinality::Many => Navigated::Many(built.collect()),
        };
        node.navigations.insert(navigation.name, value);
    }

    Some(node)
}
