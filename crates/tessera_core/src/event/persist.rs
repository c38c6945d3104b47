//! Persist: save without reattaching.

use super::save::save_transient;
use super::{deleted_instance, entity_state, EntityState, OperationContext, PersistEvent, PersistEventListener};
use crate::cascade::{Cascade, CascadePoint, CascadingAction};
use crate::error::{CoreError, CoreResult};
use crate::session::Session;

/// Default handler of persist.
///
/// Unlike save, persist refuses detached instances and cascades with the
/// persist action.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPersistEventListener;

impl PersistEventListener for DefaultPersistEventListener {
    fn on_persist(
        &self,
        session: &mut Session,
        event: &mut PersistEvent,
        ctx: &mut OperationContext,
    ) -> CoreResult<()> {
        let entity = event.entity.clone();
        let action = if event.on_flush {
            CascadingAction::PersistOnFlush
        } else {
            CascadingAction::Persist
        };
        match entity_state(session, &entity, None)? {
            EntityState::Persistent => {
                let persister = session.entity_persister(entity.entity_name())?;
                Cascade::new(action, CascadePoint::BeforeInsertAfterDelete)
                    .cascade(session, &persister, &entity, ctx)?;
                Cascade::new(action, CascadePoint::AfterInsertBeforeDelete)
                    .cascade(session, &persister, &entity, ctx)
            }
            EntityState::Transient => save_transient(session, &entity, None, Some(action), ctx).map(|_| ()),
            EntityState::Detached => Err(CoreError::persistent_object(entity.entity_name(), "persist")),
            EntityState::Deleted => Err(deleted_instance(session, &entity, "persist")),
        }
    }
}
