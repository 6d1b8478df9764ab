use anyhow::Result;
use console::style;
use std::path::PathBuf;
use std::sync::Arc;

use crate::core::mcp::config::resolve_config_path;
use crate::core::mcp::{ConnectivityStatus, McpBridge, ProbeSettings, StatusMonitor, ToolBridge};
use crate::core::terminal::print_status;

pub(crate) fn styled_label(status: ConnectivityStatus) -> String {
    let label = style(status.label());
    let label = match status {
        ConnectivityStatus::Connecting => label.yellow(),
        ConnectivityStatus::Ready => label.green().bold(),
        ConnectivityStatus::Stopped => label.red(),
        ConnectivityStatus::Unavailable => label.dim(),
    };
    label.to_string()
}

/// Prints every status transition. Without `watch` it returns once the probe is over; with
/// `watch` it keeps reporting push events until Ctrl-C.
pub(crate) async fn run_status(config: Option<PathBuf>, watch: bool) -> Result<()> {
    let path = resolve_config_path(config.as_deref());
    print_status("Config", &path.display().to_string());

    let bridge: Arc<dyn ToolBridge> = Arc::new(McpBridge::new(path));
    let monitor = StatusMonitor::start(Some(bridge), ProbeSettings::default());
    let mut updates = monitor.subscribe();
    let mut shown = None;
    let mut probe_over = false;

    loop {
        let status = *updates.borrow_and_update();
        if shown != Some(status) {
            print_status("MCP", &styled_label(status));
            shown = Some(status);
        }
        if !watch && (status.is_terminal() || probe_over) {
            break;
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = monitor.probe_finished(), if !probe_over => probe_over = true,
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    monitor.stop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_keep_their_text_when_styled() {
        console::set_colors_enabled(false);
        assert_eq!(styled_label(ConnectivityStatus::Ready), "MCP connected");
        assert_eq!(styled_label(ConnectivityStatus::Stopped), "MCP not connected");
    }
}
