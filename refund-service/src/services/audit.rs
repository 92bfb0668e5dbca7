//! Best-effort audit trail.

use crate::models::AuditEvent;
use crate::services::store::Store;

/// Append one audit record, swallowing failures. The audit trail must never
/// block or roll back the transition it describes.
pub async fn record(store: &dyn Store, event: AuditEvent) {
    if let Err(e) = store.append_audit(&event).await {
        tracing::warn!(
            event_type = %event.event_type,
            entity_type = %event.entity_type,
            entity_id = %event.entity_id,
            error = %e,
            "Failed to append audit event"
        );
    }
}
