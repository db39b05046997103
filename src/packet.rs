use std::sync::Arc;

use log::warn;
use serde_json::{Value, json};

use crate::host::{FileManager, PrinterHost};
use crate::printer_state::SharedPrinterState;
use crate::settings::SettingsStore;
use crate::system::system_info;
use crate::telemetry::timestamp_now;
use crate::upload::merge_json;

pub const PACKET_TYPE: &str = "printer_packet";

/// Builds the full state snapshot sent to the cloud.
///
/// The live printer block (`state`, `temperature_data`, `printer_data`) is
/// only included while a printer is connected to the host.
pub struct PacketBuilder {
    host: Arc<dyn PrinterHost>,
    files: Arc<dyn FileManager>,
    state: SharedPrinterState,
    settings: Arc<SettingsStore>,
}

impl PacketBuilder {
    pub fn new(
        host: Arc<dyn PrinterHost>,
        files: Arc<dyn FileManager>,
        state: SharedPrinterState,
        settings: Arc<SettingsStore>,
    ) -> Self {
        Self {
            host,
            files,
            state,
            settings,
        }
    }

    /// A snapshot with the keys of `extra` merged on top.
    pub async fn build(&self, extra: Option<Value>) -> Value {
        let settings = self.settings.get();

        let files = self.files.list_files().await.unwrap_or_else(|e| {
            warn!("Could not list printer files: {}", e);
            Value::Array(Vec::new())
        });
        let terminal_cmds = self.state.lock().terminal_commands();

        let mut packet = json!({
            "type": PACKET_TYPE,
            "token": settings.auth_token,
            "timestamp": timestamp_now(),
            "files": files,
            "terminal_cmds": terminal_cmds,
            "system": system_info(),
            "nozzle_tip_coords": {
                "nozzle_tip_coords_x": settings.nozzle_tip_coords_x,
                "nozzle_tip_coords_y": settings.nozzle_tip_coords_y,
            },
            "webcam_transforms": {
                "flip_h": settings.flip_h,
                "flip_v": settings.flip_v,
                "rotate": settings.rotate,
            },
        });

        match self.host.status().await {
            Ok(status) if status.connected => merge_json(
                &mut packet,
                json!({
                    "state": status.state,
                    "temperature_data": status.temperatures,
                    "printer_data": status.printer_data,
                }),
            ),
            Ok(_) => {}
            Err(e) => warn!("Could not read printer status for snapshot: {}", e),
        }

        if let Some(extra) = extra {
            merge_json(&mut packet, extra);
        }
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::mock::{MockFiles, MockHost};
    use crate::host::{Heater, HostStatus, Temperatures};
    use crate::printer_state::PrinterState;
    use crate::settings::Settings;

    fn builder(host: Arc<MockHost>) -> (PacketBuilder, SharedPrinterState) {
        let state = PrinterState::shared();
        let settings = Arc::new(SettingsStore::in_memory(
            "unused.json",
            Settings {
                auth_token: "tok".to_string(),
                flip_v: true,
                ..Settings::default()
            },
        ));
        let builder = PacketBuilder::new(
            host,
            Arc::new(MockFiles::new("/tmp/gcodes")),
            state.clone(),
            settings,
        );
        (builder, state)
    }

    #[tokio::test]
    async fn test_disconnected_packet_has_no_printer_block() {
        let (builder, state) = builder(Arc::new(MockHost::default()));
        state.lock().record_terminal_command("G28");

        let packet = builder.build(None).await;

        assert_eq!(packet["type"], PACKET_TYPE);
        assert_eq!(packet["token"], "tok");
        assert_eq!(packet["terminal_cmds"], json!(["G28"]));
        assert_eq!(packet["files"][0]["path"], "part.gcode");
        assert_eq!(packet["nozzle_tip_coords"]["nozzle_tip_coords_x"], 10);
        assert_eq!(packet["webcam_transforms"]["flip_v"], true);
        assert!(packet["system"]["memory"].is_array());
        assert!(packet.get("state").is_none());
        assert!(packet.get("temperature_data").is_none());
    }

    #[tokio::test]
    async fn test_connected_packet_and_extra_payload() {
        let host = Arc::new(MockHost::default());
        host.set_status(HostStatus {
            connected: true,
            state: "Printing".to_string(),
            temperatures: Temperatures {
                tool0: Heater {
                    actual: 200.0,
                    target: 210.0,
                },
                bed: Heater::default(),
            },
            printer_data: json!({"print_stats": {"state": "printing"}}),
            ..HostStatus::default()
        });
        let (builder, _) = builder(host);

        let packet = builder.build(Some(json!({"heartbeat": 42}))).await;

        assert_eq!(packet["state"], "Printing");
        assert_eq!(packet["temperature_data"]["tool0"]["target"], 210.0);
        assert_eq!(packet["printer_data"]["print_stats"]["state"], "printing");
        assert_eq!(packet["heartbeat"], 42);
    }
}
