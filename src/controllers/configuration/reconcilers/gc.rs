use std::collections::HashSet;
use std::sync::Arc;

use kube::api::{Api, DeleteParams};
use kube::ResourceExt;
use tracing::*;

use crate::resources::revisions::Revision;
use crate::Result;

/// Revisions that may be deleted: everything outside the `retained` newest generations
/// that is not named in `keep`.
pub fn revisions_to_collect<'a>(
    owned: &'a [Arc<Revision>],
    keep: &HashSet<String>,
    retained: usize,
) -> Vec<&'a Revision> {
    let mut by_generation: Vec<&Revision> = owned
        .iter()
        .map(Arc::as_ref)
        // unlabelled revisions cannot be ordered, leave them alone
        .filter(|rev| rev.configuration_generation().is_some())
        .collect();
    by_generation.sort_by_key(|rev| std::cmp::Reverse(rev.configuration_generation()));

    by_generation
        .into_iter()
        .skip(retained)
        .filter(|rev| rev.metadata.deletion_timestamp.is_none())
        .filter(|rev| !keep.contains(&rev.name_any()))
        .collect()
}

pub async fn collect_revisions(rev_api: &Api<Revision>, revisions: &[&Revision]) -> Result<()> {
    for rev in revisions {
        let name = rev.name_any();
        match rev_api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => info!("Deleted unreferenced Revision {name}"),
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(err) => return Err(err.into()),
        }
    }

    Ok(())
}
