use std::env;

use tracing::{info, warn};
use twi_hook_app::{telemetry, Authentication, HookSettings, TwitchWebHook};
use twi_hook_util::{load_env_file, AppConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let hook = TwitchWebHook::with_metrics(HookSettings::from_config(&config)?, metrics)?;
    if let Some(token) = config.access_token.clone() {
        hook.authenticate(Authentication::from(token)).await?;
    }

    let addr = hook.start().await?;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "listening for hub callbacks");

    if let Ok(user_id) = env::var("DEMO_STREAM_USER_ID") {
        let outcome = hook
            .subscribe_stream_changed(&user_id, |id, payload| {
                info!(stage = "dispatch", %id, payload = %payload.to_json(), "stream changed");
            })
            .await?;
        if outcome.success {
            info!(stage = "app", id = %outcome.id, %user_id, "subscribed to stream changes");
        } else {
            warn!(stage = "app", id = %outcome.id, %user_id, "stream subscription was not confirmed");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!(stage = "app", "shutdown requested");
    hook.stop().await;
    Ok(())
}
