use std::sync::Arc;

use anyhow::Result;
use tokio::io::AsyncBufReadExt;
use tracing::info;
use uuid::Uuid;

use hublink::{
    logging, BtleplugTransport, ControllerConfig, HubController, SettingsService,
};

/// Drives the controller from terminal input. Each line is a command name;
/// an empty line reports the connection state. The rendered document is the
/// same one the HTTP collaborator serves.
#[tokio::main]
async fn main() -> Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _logging_guard = logging::init_logging(&settings.log_settings)?;
    info!("starting hublink control plane");

    let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
    let control_uuid = Uuid::parse_str(&settings.ble_command_char_uuid)?;
    let transport = Arc::new(BtleplugTransport::new(control_uuid, event_tx).await?);
    let config = ControllerConfig::from_settings(&settings)?;
    let controller = HubController::spawn(transport, event_rx, config);

    println!("commands: forward | backward | stop (empty line for state, Ctrl-D to quit)");
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let action = line.trim();
        if action.is_empty() {
            println!(
                "{}",
                serde_json::json!({ "state": controller.state_name() })
            );
            continue;
        }

        let outcome = controller.send_named(action).await;
        println!(
            "{}",
            serde_json::json!({
                "action": action,
                "result": outcome.name(),
                "state": controller.state_name(),
            })
        );
    }

    info!("stdin closed, shutting down");
    Ok(())
}
