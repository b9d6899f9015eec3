use chrono::Utc;
use mirror_core::crd::ready_condition;
use mirror_core::{ConfigMirror, ConfigMirrorStatus, ObjectKey};
use tracing::{debug, warn};

use crate::{Context, Error};

/// Apply `mutate` to the current status and write it, refetching and re-applying on
/// optimistic-concurrency conflicts. A mirror that vanished meanwhile is not an error.
pub(crate) async fn write<F>(ctx: &Context, key: &ObjectKey, mirror: ConfigMirror, mutate: F) -> Result<(), Error>
where
    F: Fn(&mut ConfigMirrorStatus),
{
    let attempts = ctx.config.status_attempts.max(1);
    let mut current = mirror;
    for attempt in 1..=attempts {
        let mut status = current.status.clone().unwrap_or_default();
        mutate(&mut status);
        match ctx.store.write_status(&current, &status).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() => {
                debug!(attempt, "status write conflicted; refetching");
                match ctx.store.get_mirror(key).await? {
                    Some(fresh) => current = fresh,
                    None => return Ok(()),
                }
            }
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::StatusConflict { attempts })
}

/// Best-effort `Ready=False`; the pass error is what gets reported upward.
pub(crate) async fn mark_failed(ctx: &Context, key: &ObjectKey, mirror: &ConfigMirror, reason: &str, message: &str) {
    let generation = mirror.metadata.generation;
    let now = Utc::now();
    let res = write(ctx, key, mirror.clone(), |st| {
        st.set_condition(ready_condition(false, reason, message, generation, now));
    })
    .await;
    if let Err(e) = res {
        warn!(reason, error = %e, "could not record failure in status");
    }
}
