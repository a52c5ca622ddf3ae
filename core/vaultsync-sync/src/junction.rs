//! Junction translation.
//!
//! The sink has no association tables. A change on a membership row becomes
//! an update of the entity owning it: the parent id is read from the row and
//! the parent is reloaded with its own relations downstream.

use crate::entity::{EntityKind, Junction};
use crate::observer::Notification;
use std::sync::Arc;
use vaultsync_types::{extract_id, EntityId, Operation, Record};

/// Rewrites a junction notification into an `updated` notification for the
/// owning parent.
///
/// The parent id is read from the event entity, then from the loaded row.
/// Returns `None` when neither carries it (for example a deleted row whose
/// contents are gone); the notification is then dropped.
#[must_use]
pub fn translate(
    junction: &Junction,
    notification: &Notification,
) -> Option<(Arc<EntityKind>, Notification)> {
    let field = junction.parent_id_field();
    let parent_id = [&notification.entity, &notification.database_entity]
        .into_iter()
        .flatten()
        .find_map(|row| parent_id(row, field))?;
    let parent = Arc::clone(junction.parent());
    let translated = Notification::bare(Operation::Updated, parent.source_table(), parent_id);
    Some((parent, translated))
}

fn parent_id(row: &Record, field: &str) -> Option<EntityId> {
    let mut single = Record::new();
    single.insert("id".into(), row.get(field)?.clone());
    extract_id(&single)
}
