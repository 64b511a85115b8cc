//! Line commands read from stdin and applied to the dashboard.
//!
//! ```text
//! assign <slot> <device>   bind a device (index, /dev/videoN or path)
//! evict <slot>             stop and empty a slot, discovery may refill it
//! stop <slot>              stop, wait for release, keep the slot empty
//! fps <capture> <render>   set frame-rate targets (clamped)
//! status                   log every slot as JSON
//! quit
//! ```

use camgrid_core::{Dashboard, DeviceId, SlotIndex};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Assign { slot: SlotIndex, device: DeviceId },
    Evict(SlotIndex),
    Stop(SlotIndex),
    Fps { capture: u32, render: u32 },
    Status,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

fn parse_device(raw: &str) -> DeviceId {
    if let Ok(index) = raw.parse::<u32>() {
        return DeviceId::Index(index);
    }
    DeviceId::from_node_name(raw).unwrap_or_else(|| DeviceId::Path(raw.to_string()))
}

fn number<T: std::str::FromStr>(raw: Option<&str>, what: &str) -> Result<T, String> {
    let raw = raw.ok_or_else(|| format!("missing {what}"))?;
    raw.parse().map_err(|_| format!("invalid {what}: {raw}"))
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "assign" => {
            let slot = number(words.next(), "slot")?;
            let device = words.next().map(parse_device).ok_or("missing device")?;
            Command::Assign { slot, device }
        }
        "evict" => Command::Evict(number(words.next(), "slot")?),
        "stop" => Command::Stop(number(words.next(), "slot")?),
        "fps" => Command::Fps {
            capture: number(words.next(), "capture fps")?,
            render: number(words.next(), "render fps")?,
        },
        "status" => Command::Status,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command: {other}")),
    };

    if let Some(extra) = words.next() {
        return Err(format!("unexpected argument: {extra}"));
    }
    Ok(Some(command))
}

pub fn apply(dashboard: &mut Dashboard, command: Command) -> Flow {
    let result = match command {
        Command::Assign { slot, device } => {
            // The core treats assigning over an occupied slot as a bug
            if dashboard.snapshot(slot).is_ok_and(|s| s.device.is_some()) {
                warn!(slot, "Slot is occupied, evict it first");
                return Flow::Continue;
            }
            dashboard.assign_device(slot, device)
        }
        Command::Evict(slot) => dashboard.evict(slot),
        Command::Stop(slot) => dashboard.request_stop(slot),
        Command::Fps { capture, render } => {
            let applied = dashboard.set_target_fps(capture, render);
            info!(capture = applied.capture, render = applied.render, "FPS targets set");
            Ok(())
        }
        Command::Status => {
            for snapshot in dashboard.snapshots() {
                match serde_json::to_string(&snapshot) {
                    Ok(json) => info!(target: "camgrid::status", "{json}"),
                    Err(e) => warn!("Failed to encode slot {}: {e}", snapshot.index),
                }
            }
            Ok(())
        }
        Command::Quit => return Flow::Quit,
    };

    if let Err(e) = result {
        warn!("Command failed: {e}");
    }
    Flow::Continue
}
