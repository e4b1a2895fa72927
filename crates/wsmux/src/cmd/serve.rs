use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use wsmux::accept_physical_handshake;
use wsmux_engine::{EchoDispatcher, MuxConfig, MuxEngine, StandardValidator};
use wsmux_transport::UnixDomainSocket;

use crate::cmd::ServeArgs;
use crate::exit::{io_error, mux_error, transport_error, CliError, CliResult, INTERNAL, SUCCESS};

type ActiveEngine = Arc<Mutex<Option<Arc<MuxEngine>>>>;

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let config = load_config(&args)?;
    let listener =
        UnixDomainSocket::bind(&args.path).map_err(|err| transport_error("bind failed", err))?;
    tracing::info!(
        path = %listener.path().display(),
        initial_slots = config.initial_slots,
        "listening for multiplexed connections"
    );

    let running = Arc::new(AtomicBool::new(true));
    let active: ActiveEngine = Arc::default();
    install_ctrlc_handler(Arc::clone(&running), Arc::clone(&active))?;

    let validator = StandardValidator::new(config.handshake.clone());
    while running.load(Ordering::SeqCst) {
        let (mut receiver, mut sender) = listener
            .accept()
            .map_err(|err| transport_error("accept failed", err))?;

        let started = accept_physical_handshake(&mut receiver, &mut sender, &validator).and_then(
            |request| {
                MuxEngine::builder(EchoDispatcher)
                    .with_config(config.clone())
                    .start(receiver, sender, request)
            },
        );
        let engine = match started {
            Ok(engine) => Arc::new(engine),
            Err(err) if args.once => return Err(mux_error("connection setup failed", err)),
            Err(err) => {
                tracing::warn!(error = %err, "connection setup failed");
                continue;
            }
        };

        *lock(&active) = Some(Arc::clone(&engine));
        let finished = engine.join();
        lock(&active).take();
        match finished {
            Ok(()) => tracing::info!("connection finished"),
            Err(err) if args.once => return Err(mux_error("connection did not finish cleanly", err)),
            Err(err) => tracing::warn!(error = %err, "connection did not finish cleanly"),
        }

        if args.once {
            break;
        }
    }

    Ok(SUCCESS)
}

fn load_config(args: &ServeArgs) -> CliResult<MuxConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .map_err(|err| io_error(&format!("reading {}", path.display()), err))?;
            MuxConfig::from_json(&text).map_err(|err| mux_error("invalid config", err))?
        }
        None => MuxConfig::default(),
    };
    if let Some(slots) = args.slots {
        config.initial_slots = slots;
    }
    if let Some(quota) = args.slot_quota {
        config.initial_slot_quota = quota;
    }
    config
        .validate()
        .map_err(|err| mux_error("invalid config", err))?;
    Ok(config)
}

/// First Ctrl-C drains the active connection; with none active the process
/// exits right away, since `accept` cannot be interrupted.
fn install_ctrlc_handler(running: Arc<AtomicBool>, active: ActiveEngine) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        let engine = lock(&active).clone();
        match engine {
            Some(engine) => {
                if let Err(err) = engine.shutdown() {
                    tracing::warn!(error = %err, "shutdown did not complete cleanly");
                }
            }
            None => std::process::exit(SUCCESS),
        }
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
