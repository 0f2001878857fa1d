//! Converge Agent - applies declared configuration to a management API.
//!
//! Runs one reconciliation pass over the manifest and writes the observed
//! state back, whether or not the pass succeeded.

use converge_agent::{
    AssignmentLocks, Config, HttpTransport, Manifest, Pass, PassSettings, StateFile,
};
use tracing::Instrument;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "converge_agent=info,converge_engine=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Applying {} to {}", config.manifest_path.display(), config.api_url);

    let manifest = Manifest::load(&config.manifest_path)?;
    let mut state = StateFile::load(&config.state_path)?;

    let transport = HttpTransport::new(&config)?;
    let server_version = transport.capability_version().await?;
    tracing::info!(%server_version, "Detected server capability version");

    let settings = PassSettings::from(&config);
    let locks = AssignmentLocks::new();
    let pass = Pass::new(&transport, &server_version, &settings, &locks);

    let span = tracing::info_span!("pass", pass_id = %Uuid::new_v4());
    let result = pass.run(&manifest, &mut state).instrument(span).await;

    // State is written back even when the pass failed
    state.save(&config.state_path)?;

    match result {
        Ok(summary) if summary.is_noop() => tracing::info!("Nothing to change"),
        Ok(_) => tracing::info!("Saved state to {}", config.state_path.display()),
        Err(err) => {
            tracing::error!(error = %err, "Pass failed, partial state saved");
            return Err(err.into());
        }
    }

    Ok(())
}
