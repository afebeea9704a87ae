use std::backtrace::Backtrace;
use std::fs;
use std::path::PathBuf;

use calloop::EventLoop;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cinder::config::Config;
use cinder::splash::Splash;
use cinder::state::{self, Cinder};
use cinder::{CinderError, Result, ipc, surface};

const PID_FILE: &str = "/run/cinder.pid";

const DEFAULT_LOG_FILTER: &str = "cinder=info";
const LOG_DIR: &str = "/var/log/cinder";

fn main() -> Result<()> {
    let mut config = Config::parse(std::env::args().skip(1))?;
    // Splash-only service units never get text VTs, whatever else is set.
    if config.splash_only {
        config.enable_vts = false;
    }

    init_logging();
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = Backtrace::force_capture();
        tracing::error!("panic: {panic_info}\n{backtrace}");
        eprintln!("panic: {panic_info}\n{backtrace}");
    }));

    if config.print_resolution {
        let (width, height) = probe_resolution();
        println!("{width} {height}");
        return Ok(());
    }

    if config.daemon {
        daemonize()?;
        write_pid_file();
    }

    // A leftover initramfs instance must vacate the display and the port.
    ipc::socket::displace_stale_instance(config.port);

    let mut event_loop: EventLoop<'static, Cinder> =
        EventLoop::try_new().map_err(|err| CinderError::EventLoop(err.to_string()))?;
    let mut state = Cinder::new(config.clone(), event_loop.handle(), event_loop.get_signal())?;
    state::init_sources(&mut event_loop, &mut state)?;

    let splash = Splash::from_config(&config, state.display_scaling());
    let had_splash = !splash.is_empty();
    if had_splash {
        if let Err(err) = splash.run(&mut state, &mut event_loop) {
            tracing::error!("splash: {err}");
        }
        state.finish_splash();
    }

    if config.enable_vts && !had_splash && !config.daemon {
        // Standalone console use: come up on the first text VT directly.
        state.request_switch(1);
    }

    // Apply anything queued before the first wait (the run callback only
    // fires after a dispatch).
    state.maintain();

    if !state.terminating() {
        event_loop
            .run(None, &mut state, |state| state.maintain())
            .map_err(|err| CinderError::EventLoop(err.to_string()))?;
    }

    if config.daemon {
        let _ = fs::remove_file(PID_FILE);
    }
    tracing::info!("exiting");
    Ok(())
}

fn probe_resolution() -> (u32, u32) {
    match cinder::drm::scan(cinder::input::lid_closed_probe()) {
        Some(card) => {
            let (width, height) = card.mode().size();
            (width as u32, height as u32)
        }
        None => (surface::HEADLESS_WIDTH, surface::HEADLESS_HEIGHT),
    }
}

fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    // The file layer is best-effort; early boot may have a read-only or
    // absent /var.
    let file_layer = fs::create_dir_all(LOG_DIR).ok().map(|_| {
        let appender = tracing_appender::rolling::never(PathBuf::from(LOG_DIR), "cinder.log");
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(appender)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::io::stderr),
        )
        .with(file_layer)
        .init();
}

/// Fork into the background and point stdio at the kernel log, so every
/// stderr line (and the tracing layer on it) lands in dmesg.
fn daemonize() -> Result<()> {
    match unsafe { nix::unistd::fork() }.map_err(|err| CinderError::Io(err.into()))? {
        nix::unistd::ForkResult::Parent { .. } => std::process::exit(0),
        nix::unistd::ForkResult::Child => {}
    }
    nix::unistd::setsid().map_err(|err| CinderError::Io(err.into()))?;

    unsafe {
        libc::close(0);
        libc::close(1);
        libc::close(2);
        let fd = libc::open(c"/dev/kmsg".as_ptr(), libc::O_RDWR);
        if fd == 0 {
            libc::dup(0);
            libc::dup(0);
        }
    }
    Ok(())
}

fn write_pid_file() {
    if let Err(err) = fs::write(PID_FILE, format!("{}\n", std::process::id())) {
        tracing::warn!("pid file {PID_FILE}: {err}");
    }
}
