//! Pours a few hundred milliliters through the simulated binding.
//!
//! ```sh
//! KEGFLOW_HMAC_SECRET=dev-secret KEGFLOW_MACHINE_ID=dev-machine \
//!     cargo run -p kegflow-agent --example simulated_pour
//! ```

use kegflow_agent::{EdgeConfig, EdgeContext};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut config = EdgeConfig::from_env()?;
    config.security.test_dispense_enabled = true;
    config.database.path = std::env::temp_dir().join("kegflow_demo.db");

    let ctx = EdgeContext::initialize(config).await?;
    ctx.start().await;

    ctx.controller().set_progress_observer(Box::new(|ml, percent| {
        println!("  {ml:.1} ml ({percent:.0}%)");
    }));

    let outcome = ctx.test_dispense(300, "demo-pilsen").await?;
    println!(
        "\n{}: {:.1} ml in {:.1}s ({} pulses)",
        outcome.status, outcome.volume_dispensed_ml, outcome.duration_seconds, outcome.pulse_count
    );

    println!("\nstatus: {}", serde_json::to_string_pretty(&ctx.status().await)?);

    ctx.shutdown().await;
    Ok(())
}
