//! framepipe: a length-prefixed command framing TCP server.
//!
//! Each accepted connection gets its own handler pipeline: a frame decoder
//! turning the raw byte stream into command frames, followed by a command
//! dispatcher answering them. The demo wiring below installs an `ECHO`
//! command that reflects each frame's content back to the sender.

use framepipe::codec::{encode_command, ByteToMessage, CommandDecoder};
use framepipe::config::Config;
use framepipe::dispatch::{Dispatcher, ServiceHandler};
use framepipe::pipeline::{HandlerRef, Pipeline};
use framepipe::runtime::{self, ConnInitializer};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Arc::new(Config::load()?);

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_frame_len = config.max_frame_len,
        "starting framepipe server"
    );
    debug!(
        session_tick_ms = config.session_tick_ms(),
        session_timeout_ms = config.session_timeout_ms(),
        "session timing loaded"
    );

    let init_config = Arc::clone(&config);
    let initializer: ConnInitializer = Arc::new(move |pipeline| {
        init_pipeline(pipeline, &init_config);
    });

    runtime::run(config, initializer)?;
    Ok(())
}

/// Install the frame decoder and the demo command dispatcher on a fresh
/// connection's pipeline.
fn init_pipeline(pipeline: &mut Pipeline, config: &Config) {
    let decoder = ByteToMessage::new(Box::new(CommandDecoder::new(config.max_frame_len)));
    if let Err(e) = pipeline.add_last("decoder", HandlerRef::inbound(decoder)) {
        warn!(error = %e, "failed to install frame decoder");
        return;
    }

    let mut dispatcher = Dispatcher::new();
    let registered = dispatcher.add_handler("ECHO", |request, response| {
        match encode_command("ECHO", request.request_id(), request.content()) {
            Ok(frame) => response.write(frame),
            Err(e) => warn!(error = %e, "failed to encode echo reply"),
        }
    });
    if let Err(e) = registered {
        warn!(error = %e, "command registration ignored");
    }

    if let Err(e) =
        pipeline.add_last("service", HandlerRef::inbound(ServiceHandler::new(dispatcher)))
    {
        warn!(error = %e, "failed to install command dispatcher");
    }
}
