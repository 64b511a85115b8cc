mod commands;
mod display;
mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use camgrid_core::platform::{ProcessReclaimer, SysfsProbe, VideoNodeEnumerator};
use camgrid_core::{Dashboard, PerformanceController, RenderLoop, SystemBackends, SystemProbe};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{interval, interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{info, warn};

use commands::Flow;
use display::LogSink;
use settings::Settings;

fn ticker(period: Duration, delay_first: bool) -> Interval {
    let mut tick = if delay_first {
        interval_at(Instant::now() + period, period)
    } else {
        interval(period)
    };
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}

fn frame_period(fps: u32) -> Duration {
    Duration::from_secs_f64(1.0 / fps.max(1) as f64)
}

fn spawn_stdin_reader() -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Stopped reading commands: {e}");
                    break;
                }
            }
        }
    });
    rx
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "camgrid=info,camgrid_core=info".into()),
        )
        .init();

    let config = Settings::load().into_core_config();
    info!(
        slots = config.slot_count,
        accelerated = config.capture.use_accelerated,
        dynamic_fps = config.performance.enabled,
        "Starting camgrid"
    );

    let mut dashboard = Dashboard::new(
        config.clone(),
        Arc::new(SystemBackends),
        Box::new(VideoNodeEnumerator::default()),
        Box::new(ProcessReclaimer::new(config.discovery.reclaim_grace)),
    );
    let mut performance = PerformanceController::new(&config);
    let mut probe = SysfsProbe::default();
    let mut render = RenderLoop::new(dashboard.slot_count(), config.render.stats_interval);
    let mut sink = LogSink::new(dashboard.slot_count());
    let mut command_rx = spawn_stdin_reader();

    // First scan right away, then on the rescan interval
    dashboard.run_discovery(std::time::Instant::now());

    let mut render_rate = dashboard.targets().render;
    let mut render_tick = ticker(frame_period(render_rate), false);
    let mut discovery_tick = ticker(config.discovery.rescan_interval, true);
    let mut perf_tick = ticker(config.performance.check_interval, true);
    let mut health_tick = ticker(config.health.log_interval, true);

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = render_tick.tick() => {
                dashboard.sync_slots();
                render.render(&dashboard, &mut sink);
                render.log_stats_if_due(std::time::Instant::now());
            }
            _ = discovery_tick.tick() => {
                let plan = dashboard.run_discovery(std::time::Instant::now());
                if !plan.is_empty() {
                    info!(
                        assigned = plan.assignments.len(),
                        evicted = plan.evictions.len(),
                        "Discovery applied"
                    );
                }
            }
            _ = perf_tick.tick(), if config.performance.enabled => {
                if let Some(targets) = performance.observe(probe.sample()) {
                    dashboard.set_target_fps(targets.capture, targets.render);
                }
            }
            _ = health_tick.tick() => {
                dashboard.health(std::time::Instant::now()).log();
            }
            Some(line) = command_rx.recv() => {
                match commands::parse(&line) {
                    Ok(Some(command)) => {
                        if commands::apply(&mut dashboard, command) == Flow::Quit {
                            info!("Quit requested");
                            break;
                        }
                        performance.sync_targets(dashboard.targets());
                    }
                    Ok(None) => {}
                    Err(e) => warn!("{e}"),
                }
            }
            result = &mut shutdown => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted");
                break;
            }
        }

        let target = dashboard.targets().render;
        if target != render_rate {
            render_rate = target;
            render_tick = ticker(frame_period(render_rate), false);
        }
    }

    dashboard.shutdown();
    info!("All cameras released");
    Ok(())
}
