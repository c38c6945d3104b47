//! Interceptor that records its callbacks.

use parking_lot::Mutex;
use tessera_core::{CoreError, CoreResult, EntityMetamodel, EntityRef, Identifier, Interceptor, Value};

/// One interceptor callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptorCall {
    /// `on_load`.
    Load {
        /// Entity name.
        entity: String,
        /// Identifier.
        id: Identifier,
    },
    /// `on_save`.
    Save {
        /// Entity name.
        entity: String,
        /// Identifier, unless the store generates it.
        id: Option<Identifier>,
    },
    /// `on_flush_dirty`.
    FlushDirty {
        /// Entity name.
        entity: String,
        /// Identifier.
        id: Identifier,
    },
    /// `on_delete`.
    Delete {
        /// Entity name.
        entity: String,
        /// Identifier.
        id: Identifier,
    },
    /// `pre_flush`, with the number of tracked instances.
    PreFlush(usize),
    /// `post_flush`, with the number of tracked instances.
    PostFlush(usize),
}

/// Records every callback and can stamp a text property on save and flush.
#[derive(Debug, Default)]
pub struct RecordingInterceptor {
    calls: Mutex<Vec<InterceptorCall>>,
    stamp: Option<(String, String)>,
    veto_deletes_of: Option<String>,
}

impl RecordingInterceptor {
    /// Creates an interceptor that only records.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes `text` into `property` of every saved or dirty instance that
    /// maps it.
    #[must_use]
    pub fn stamping(mut self, property: impl Into<String>, text: impl Into<String>) -> Self {
        self.stamp = Some((property.into(), text.into()));
        self
    }

    /// Rejects deletes of `entity_name`.
    #[must_use]
    pub fn vetoing_deletes_of(mut self, entity_name: impl Into<String>) -> Self {
        self.veto_deletes_of = Some(entity_name.into());
        self
    }

    /// Returns the recorded callbacks.
    #[must_use]
    pub fn calls(&self) -> Vec<InterceptorCall> {
        self.calls.lock().clone()
    }

    /// Forgets the recorded callbacks.
    pub fn reset(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: InterceptorCall) {
        self.calls.lock().push(call);
    }

    fn apply_stamp(&self, state: &mut [Value], meta: &EntityMetamodel) -> bool {
        let Some((property, text)) = &self.stamp else {
            return false;
        };
        let Some(slot) = meta.property_index(property).and_then(|index| state.get_mut(index)) else {
            return false;
        };
        if slot.as_text() == Some(text.as_str()) {
            return false;
        }
        *slot = Value::from(text.as_str());
        true
    }
}

impl Interceptor for RecordingInterceptor {
    fn on_load(
        &self,
        entity: &EntityRef,
        id: &Identifier,
        _state: &mut [Value],
        _meta: &EntityMetamodel,
    ) -> CoreResult<bool> {
        self.record(InterceptorCall::Load {
            entity: entity.entity_name().to_string(),
            id: id.clone(),
        });
        Ok(false)
    }

    fn on_save(
        &self,
        entity: &EntityRef,
        id: Option<&Identifier>,
        state: &mut [Value],
        meta: &EntityMetamodel,
    ) -> CoreResult<bool> {
        self.record(InterceptorCall::Save {
            entity: entity.entity_name().to_string(),
            id: id.cloned(),
        });
        Ok(self.apply_stamp(state, meta))
    }

    fn on_flush_dirty(
        &self,
        entity: &EntityRef,
        id: &Identifier,
        current: &mut [Value],
        _previous: Option<&[Value]>,
        meta: &EntityMetamodel,
    ) -> CoreResult<bool> {
        self.record(InterceptorCall::FlushDirty {
            entity: entity.entity_name().to_string(),
            id: id.clone(),
        });
        Ok(self.apply_stamp(current, meta))
    }

    fn on_delete(
        &self,
        entity: &EntityRef,
        id: &Identifier,
        _state: &[Value],
        _meta: &EntityMetamodel,
    ) -> CoreResult<()> {
        if self.veto_deletes_of.as_deref() == Some(entity.entity_name()) {
            return Err(CoreError::invalid_operation(format!(
                "deletes of {} are not allowed",
                entity.entity_name()
            )));
        }
        self.record(InterceptorCall::Delete {
            entity: entity.entity_name().to_string(),
            id: id.clone(),
        });
        Ok(())
    }

    fn pre_flush(&self, entities: &[EntityRef]) {
        self.record(InterceptorCall::PreFlush(entities.len()));
    }

    fn post_flush(&self, entities: &[EntityRef]) {
        self.record(InterceptorCall::PostFlush(entities.len()));
    }
}
