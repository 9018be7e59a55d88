use std::sync::Arc;

use huddle_config::HuddleConfig;
use huddle_core::COORDINATOR_NAME;
use huddle_mesh::{Coordinator, CoordinatorSettings, TcpTransport};
use tracing::info;

pub(super) async fn cmd_coordinator(
    config: HuddleConfig,
    listen: Option<String>,
    port: Option<u16>,
) -> huddle_core::Result<()> {
    let mut settings = CoordinatorSettings::from(&config.coordinator);
    if let Some(listen) = listen {
        settings.listen_address = listen;
    }
    if let Some(port) = port {
        settings.port = port;
    }

    let (transport, events) = TcpTransport::new(COORDINATOR_NAME, None);
    let coordinator = Arc::new(Coordinator::new(settings, Arc::new(transport.clone())));
    let port = coordinator.start(events).await?;

    println!("Coordinator listening on {}:{port}", coordinator.settings().listen_address);
    println!("   Plan interval:   {:?}", coordinator.settings().plan_interval);
    println!("   Debounce:        {:?}", coordinator.settings().debounce);
    if !coordinator.settings().allowed_members.is_empty() {
        let members: Vec<&str> = coordinator
            .settings()
            .allowed_members
            .iter()
            .map(String::as_str)
            .collect();
        println!("   Allowed members: {}", members.join(", "));
    }
    println!("Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    coordinator.shutdown().await;
    transport.shutdown().await;
    Ok(())
}
