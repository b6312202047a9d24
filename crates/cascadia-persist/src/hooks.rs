//! Lifecycle hook dispatch.
//!
//! Entity listeners run first, in declaration order, then registry
//! subscribers in registration order. A failing hook aborts the call.

use crate::subject::Subject;
use cascadia_core::{Error, HookEvent, HookPoint, QueryRunner, Registry, dispatch_listener};
use asupersync::{Cx, Outcome};

pub(crate) struct HookDispatcher<'a> {
    registry: &'a Registry,
    enabled: bool,
}

impl<'a> HookDispatcher<'a> {
    pub fn new(registry: &'a Registry, enabled: bool) -> Self {
        Self { registry, enabled }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Fire `point` for a subject. Placeholder subjects created for orphaned
    /// rows have no caller-visible entity and get no hooks.
    pub async fn fire(
        &self,
        cx: &Cx,
        point: HookPoint,
        subject: &Subject,
        queries: &dyn QueryRunner,
    ) -> Outcome<(), Error> {
        if !self.enabled || subject.orphan {
            return Outcome::Ok(());
        }

        let listened = {
            let mut entity = subject.entity.write();
            let mut result = Ok(());
            for listener in &subject.metadata.listeners {
                result = dispatch_listener(listener.as_ref(), point, &mut entity);
                if result.is_err() {
                    break;
                }
            }
            result
        };
        if let Err(e) = listened {
            tracing::debug!(subject = %subject, hook = point.as_str(), error = %e, "Listener failed");
            return Outcome::Err(e);
        }

        for subscriber in self.registry.subscribers_for(subject.type_name()) {
            let event = HookEvent {
                cx,
                point,
                entity: &subject.entity,
                metadata: subject.metadata.as_ref(),
                queries,
            };
            match subscriber.on_event(&event).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    tracing::debug!(subject = %subject, hook = point.as_str(), error = %e, "Subscriber failed");
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::trace!(subject = %subject, hook = point.as_str(), "Hooks fired");
        Outcome::Ok(())
    }
}
