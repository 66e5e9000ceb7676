//! Maintenance scheduler: one task per periodic job, each on a jittered
//! interval so a fleet of nodes does not stampede the store in lockstep.

use std::{future::Future, sync::Arc, time::Duration};

use {
    rand::Rng,
    tracing::{debug, info, warn},
};

use crate::state::AppState;

const PREKEY_LOW_WATER: i64 = 10;
const DEVICE_TOKEN_MAX_IDLE_DAYS: i64 = 60;
const FETCH_LOG_KEEP_HOURS: i64 = 72;

fn jittered(base: Duration) -> Duration {
    // Up to +20% per tick.
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 5);
    base + Duration::from_millis(jitter_ms)
}

fn spawn_job<F, Fut>(name: &'static str, interval: Duration, job: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(jittered(interval)).await;
            match job().await {
                Ok(()) => debug!(job = name, "maintenance tick"),
                Err(e) => warn!(job = name, error = %e, "maintenance job failed"),
            }
        }
    });
}

/// Start every periodic job. Called once from `serve`.
pub fn start(state: Arc<AppState>) {
    info!("scheduler: maintenance jobs armed");

    // Ringing calls whose per-call timer was lost (e.g. node restart).
    {
        let state = Arc::clone(&state);
        spawn_job("missed_call_sweep", Duration::from_secs(30), move || {
            let state = Arc::clone(&state);
            async move {
                let missed = state.calls.sweep_stale_ringing().await?;
                if missed > 0 {
                    info!(missed, "swept stale ringing calls");
                }
                Ok(())
            }
        });
    }

    // Expired mute rules.
    {
        let state = Arc::clone(&state);
        spawn_job("mute_rule_expiry", Duration::from_secs(3600), move || {
            let state = Arc::clone(&state);
            async move {
                state.mutes.purge_expired().await?;
                Ok(())
            }
        });
    }

    // Expired bearer tokens.
    {
        let state = Arc::clone(&state);
        spawn_job("token_purge", Duration::from_secs(3600), move || {
            let state = Arc::clone(&state);
            async move {
                state.tokens.purge_expired().await?;
                Ok(())
            }
        });
    }

    // Devices that have not been seen in months.
    {
        let state = Arc::clone(&state);
        spawn_job("stale_device_tokens", Duration::from_secs(86_400), move || {
            let state = Arc::clone(&state);
            async move {
                let reaped = state.devices.reap_stale(DEVICE_TOKEN_MAX_IDLE_DAYS).await?;
                if reaped > 0 {
                    info!(reaped, "deactivated stale device tokens");
                }
                Ok(())
            }
        });
    }

    // Prekey pool audit; a low pool means clients should replenish soon.
    {
        let state = Arc::clone(&state);
        spawn_job("prekey_audit", Duration::from_secs(6 * 3600), move || {
            let state = Arc::clone(&state);
            async move {
                for (user_id, remaining) in
                    state.keys.users_below_prekey_threshold(PREKEY_LOW_WATER).await?
                {
                    state
                        .alerts
                        .raise(
                            user_id,
                            "prekey_low",
                            "low",
                            "one-time prekey pool is running low",
                            serde_json::json!({ "remaining": remaining }),
                        )
                        .await?;
                }
                Ok(())
            }
        });
    }

    // Fetch-audit log retention.
    {
        let state = Arc::clone(&state);
        spawn_job("fetch_log_trim", Duration::from_secs(86_400), move || {
            let state = Arc::clone(&state);
            async move {
                state.keys.trim_fetch_log(FETCH_LOG_KEEP_HOURS).await?;
                Ok(())
            }
        });
    }
}
