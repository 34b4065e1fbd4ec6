use mercury2mqtt::config::{watch_config, ConfigBases, ConfigHolder};
use mercury2mqtt::metering_mercury::meter_definitions::Catalogue;
use mercury2mqtt::metering_mercury::meter_list::{build_meter_list, describe};
use mercury2mqtt::metering_mercury::{AgentCommand, MercuryAgent, EXIT_CONNECTION, EXIT_NO_METERS, EXIT_OK, EXIT_STARTUP};
use mercury2mqtt::mqtt::MqttManager;
use log::{error, info, warn};
use std::{env, process, sync::Arc, time::Duration};
use tokio::sync::{broadcast::error::RecvError, mpsc, RwLock};

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                warn!("Unable to listen for SIGTERM: {e}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    let default_filter = std::env::var("MERCURY_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let path = env::args().nth(1);
    let holder = match ConfigHolder::load(path.as_deref()) {
        Ok(h) => h,
        Err(e) => {
            error!("{e}");
            process::exit(EXIT_STARTUP);
        }
    };
    let config = holder.get_complete_config();
    let mut changes = holder.get_change_receiver();
    let holder = Arc::new(RwLock::new(holder));

    let catalogue = Arc::new(Catalogue::new());
    let meters = build_meter_list(&config.devices, &catalogue);
    if meters.is_empty() {
        error!("No meters configured, nothing to poll");
        process::exit(EXIT_NO_METERS);
    }
    for meter in &meters {
        info!("{}", describe(meter));
    }

    let (mut mqtt, tx) = MqttManager::new(&config.mqtt);
    tokio::spawn(async move {
        mqtt.start_thread().await;
    });

    let (commands, command_rx) = mpsc::channel(10);
    let agent = match MercuryAgent::new(config.gateway.clone(), meters, catalogue.clone(), tx, command_rx) {
        Ok(a) => a,
        Err(e) => {
            error!("{e}");
            process::exit(e.exit_code());
        }
    };
    let mut agent_task = tokio::spawn(agent.run());

    tokio::spawn(watch_config(holder.clone(), Duration::from_secs(config.watch_interval.max(1))));

    info!("Agent started, now waiting for changes or a signal to exit");
    let mut changes_open = true;
    let code = loop {
        tokio::select! {
            result = &mut agent_task => {
                break match result {
                    Ok(Ok(())) => EXIT_OK,
                    Ok(Err(e)) => e.exit_code(),
                    Err(e) => {
                        error!("Agent task failed: {e}");
                        EXIT_CONNECTION
                    }
                };
            }
            change = changes.recv(), if changes_open => {
                match change {
                    Ok(change) if change.base == "devices" => {
                        info!("Device list changed, rebuilding the meter list");
                        let _ = commands.send(AgentCommand::Suspend).await;

                        let devices = match holder.read().await.get_copy("devices") {
                            Ok(ConfigBases::Devices(d)) => d,
                            _ => continue,
                        };

                        /* an empty list ends the agent with the no meters code */
                        let meters = build_meter_list(&devices, &catalogue);
                        for meter in &meters {
                            info!("{}", describe(meter));
                        }
                        let _ = commands.send(AgentCommand::Resume(meters)).await;
                    }
                    Ok(change) => warn!("Change of {} takes effect after a restart", change.base),
                    Err(RecvError::Lagged(n)) => warn!("Missed {n} config changes"),
                    Err(RecvError::Closed) => changes_open = false,
                }
            }
            _ = shutdown_signal() => {
                info!("Signal received, shutting down");
                let _ = commands.send(AgentCommand::Shutdown).await;
            }
        }
    };

    info!("Exiting with code {code}");
    process::exit(code);
}
