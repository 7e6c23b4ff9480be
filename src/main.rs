use std::{net::SocketAddr, sync::mpsc, time::Duration};

use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::{debug, error, info, warn};

use crate::{
    artnet::{ArtNetInterface, ArtNetMode},
    live_input::LiveInputTracker,
    model::{Model, ModelEvent},
    notifier::ChangeNotifier,
    output::{DmxTransmitter, OutputLoop},
    sacn::{start_receiver_thread, SacnTransmitter},
    scenes::{
        storage::{start_writer_thread, JsonFileStorage, SceneRepository},
        SceneStore,
    },
    settings::{Cli, OutputMode},
    tether_interface::{start_tether_thread, TetherSettings},
    ui_channel::start_ui_server,
};

mod animation;
mod artnet;
mod commands;
mod live_input;
mod mixer;
mod model;
mod notifier;
mod output;
mod sacn;
mod scenes;
mod settings;
mod tether_interface;
mod ui_channel;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default().default_filter_or(&cli.log_level))
        .filter_module("paho_mqtt", log::LevelFilter::Warn)
        .filter_module("rumqttc", log::LevelFilter::Warn)
        .filter_module("tether_agent", log::LevelFilter::Warn)
        .init();

    debug!("Started with settings: {:?}", cli);

    let storage = JsonFileStorage::new(&cli.storage_path);
    let mut store = SceneStore::new();
    store.reload(storage.load_all()?);

    let (storage_tx, storage_handle) = start_writer_thread(storage);

    let (events_tx, events_rx) = mpsc::channel();

    let _receiver_handle =
        start_receiver_thread(cli.sacn_interface, &cli.universes, events_tx.clone())?;
    let (_ui_addr, _ui_handle) = start_ui_server(cli.ui_listen, events_tx.clone())?;

    let bus = if cli.tether_disable {
        warn!("Tether disabled; bus commands and status unavailable");
        None
    } else {
        let (bus_tx, _bus_handle) = start_tether_thread(
            TetherSettings {
                host: cli.tether_host.clone(),
                role: cli.tether_role.clone(),
                id: cli.tether_id.clone(),
                topic: cli.tether_topic.clone(),
                source_id: cli.tether_source_id.clone(),
            },
            events_tx.clone(),
        );
        Some(bus_tx)
    };

    let shutdown_tx = events_tx.clone();
    ctrlc::set_handler(move || {
        if shutdown_tx.send(ModelEvent::Shutdown).is_err() {
            std::process::exit(1);
        }
    })
    .context("failed to set Ctrl+C handler")?;
    drop(events_tx);

    let transmitter: Box<dyn DmxTransmitter> = match cli.output_mode {
        OutputMode::Sacn => Box::new(SacnTransmitter::new(
            cli.sacn_interface,
            &cli.source_name,
        )?),
        OutputMode::Artnet => {
            let mode = if cli.artnet_broadcast {
                ArtNetMode::Broadcast
            } else {
                ArtNetMode::Unicast(
                    SocketAddr::from((cli.unicast_src, 6453)),
                    SocketAddr::from((cli.unicast_dst, 6454)),
                )
            };
            Box::new(ArtNetInterface::new(mode)?)
        }
    };

    let mut output = OutputLoop::new(
        transmitter,
        &cli.universes,
        &cli.source_name,
        cli.transmit_priority(),
        Duration::from_millis(cli.output_period_ms),
        cli.output_passthrough,
    );
    if cli.output_paused {
        info!("Output paused; live input is still tracked");
    } else {
        output.start();
    }

    let notifier = ChangeNotifier::new(
        &store,
        Some(storage_tx),
        bus,
        Duration::from_millis(cli.debounce_ms),
    );

    let mut model = Model::new(
        store,
        LiveInputTracker::new(&cli.universes, &cli.source_name),
        output,
        notifier,
        events_rx,
    );

    model.run();

    // Closing the storage channel lets the writer flush what is queued
    drop(model);
    if storage_handle.join().is_err() {
        error!("Storage writer panicked");
    }

    info!("Exit");
    Ok(())
}
