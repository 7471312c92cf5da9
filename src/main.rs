//! Duplex voice engine host process.
//!
//! Communicates with its parent via JSON-line IPC on stdin/stdout. Commands
//! and relay traffic are both handled on the main task, so the engine never
//! needs a lock.

use std::sync::Arc;

use tracing::{info, warn};

use duplex_voice::audio::capture::list_input_devices;
use duplex_voice::audio::CpalMicrophone;
use duplex_voice::config::paths::get_log_dir;
use duplex_voice::config::read_engine_config;
use duplex_voice::ipc::bridge::{emit_error, emit_event, spawn_stdin_reader, IpcObserver};
use duplex_voice::ipc::{EngineCommand, EngineEvent};
use duplex_voice::playback::{list_output_devices, RodioBackend};
use duplex_voice::relay::{RelayIncoming, WebSocketConnector};
use duplex_voice::session::{EngineParts, SessionEngine};
use duplex_voice::EngineError;

enum Next {
    Command(Option<EngineCommand>),
    Inbound(RelayIncoming),
}

#[tokio::main]
async fn main() {
    if let Err(e) = duplex_voice::logger::init(&get_log_dir()) {
        eprintln!("File logging unavailable: {:#}", e);
    }

    // Emit starting event immediately so the host knows we're alive.
    emit_event(&EngineEvent::Starting {});

    let config = read_engine_config();
    info!(
        relay = %config.relay_origin,
        model = %config.model,
        sample_rate = config.sample_rate,
        "Configuration loaded"
    );

    let mut cmd_rx = spawn_stdin_reader();

    let parts = EngineParts {
        microphone: Box::new(CpalMicrophone::new(
            config.input_device.clone(),
            config.sample_rate,
        )),
        connector: Arc::new(WebSocketConnector),
        playback: Arc::new(RodioBackend::new(config.output_device.clone())),
        observer: Arc::new(IpcObserver {
            forward_audio: config.forward_audio_events,
        }),
    };
    let mut engine = SessionEngine::new(config, parts);

    emit_event(&EngineEvent::Ready {});
    info!("Engine ready");

    loop {
        let next = tokio::select! {
            cmd = cmd_rx.recv() => Next::Command(cmd),
            incoming = engine.next_inbound() => Next::Inbound(incoming),
        };
        match next {
            Next::Command(Some(command)) => {
                if !handle_command(&mut engine, command).await {
                    break;
                }
            }
            Next::Command(None) => {
                // stdin closed: parent process gone
                info!("stdin closed, shutting down");
                break;
            }
            Next::Inbound(incoming) => engine.handle_incoming(incoming),
        }
    }

    engine.disconnect();
    info!("Engine shutting down");
}

/// Handle a single command from the host.
/// Returns `false` if the main loop should exit.
async fn handle_command(engine: &mut SessionEngine, cmd: EngineCommand) -> bool {
    match cmd {
        EngineCommand::Ping {} => {
            emit_event(&EngineEvent::Pong {});
        }

        EngineCommand::Stop {} => {
            emit_event(&EngineEvent::Stopping {});
            return false;
        }

        EngineCommand::Connect { mode } => {
            let mode = mode.unwrap_or(engine.session().mode);
            report(engine.connect(mode).await);
        }

        EngineCommand::Disconnect {} => engine.disconnect(),

        EngineCommand::SetMode { mode } => report(engine.toggle_mode(mode)),

        EngineCommand::StartRecording {} => report(engine.start_recording()),

        EngineCommand::StopRecording {} => {
            // The recorded item reaches the host through the observer.
            report(engine.stop_recording().map(|_| ()));
        }

        EngineCommand::Interrupt {} => match engine.barge_in() {
            Ok(mark) => emit_event(&EngineEvent::Interrupted(mark)),
            Err(e) => emit_error(&e),
        },

        EngineCommand::SendText { text } => report(engine.send_text(&text)),

        EngineCommand::AttachSurface { item_id, surface } => {
            match engine.attach_surface(&item_id, surface) {
                Ok(track) => emit_event(&EngineEvent::TrackState {
                    item_id: track.item_id().to_string(),
                    state: track.state(),
                }),
                Err(e) => emit_error(&e),
            }
        }

        EngineCommand::TogglePlay { item_id } => match engine.toggle_play(&item_id) {
            Ok(_) => {
                if let Some(track) = engine.track(&item_id) {
                    emit_event(&EngineEvent::TrackState {
                        item_id: track.item_id().to_string(),
                        state: track.state(),
                    });
                }
            }
            Err(e) => emit_error(&e),
        },

        EngineCommand::Seek { item_id, offset } => report(engine.seek(&item_id, offset)),

        EngineCommand::Download { item_id } => match engine.download_artifact(&item_id) {
            Ok(path) => {
                info!(item_id = %item_id, path = %path.display(), "Artifact downloaded");
                emit_event(&EngineEvent::Downloaded {
                    item_id,
                    path: path.display().to_string(),
                });
            }
            Err(e) => emit_error(&e),
        },

        EngineCommand::DebugLog { filter, source } => {
            let events = engine.debug_events(filter.as_deref().unwrap_or(""), source);
            emit_event(&EngineEvent::DebugLog { events });
        }

        EngineCommand::ClearDebugLog {} => engine.clear_debug_events(),

        EngineCommand::ListAudioDevices {} => {
            emit_event(&EngineEvent::AudioDevices {
                input: list_input_devices(),
                output: list_output_devices(),
            });
        }
    }

    true
}

fn report(result: Result<(), EngineError>) {
    if let Err(e) = result {
        warn!(kind = e.kind(), error = %e, "Command failed");
        emit_error(&e);
    }
}
