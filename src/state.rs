//! Daemon state and event-loop wiring: the terminal set, the console
//! card/surface pair, input routing, IPC dispatch, and the maintenance
//! pass that runs after every dispatch cycle.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;
use std::rc::Rc;

use calloop::generic::Generic;
use calloop::signals::{Signal, Signals};
use calloop::{EventLoop, Interest, LoopHandle, LoopSignal, Mode, PostAction, RegistrationToken};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::drm::{self, Card, Rescan};
use crate::image;
use crate::input::{InputAction, InputManager};
use crate::ipc::CommandRequest;
use crate::ipc::bus::{Bus, BusEvent};
use crate::ipc::socket::CommandSocket;
use crate::surface::Surface;
use crate::term::Terminal;
use crate::{CinderError, Result};

pub const SPLASH_VT: usize = 0;

/// Borrow-only fd wrapper for event-loop registration. The owner of the
/// descriptor unregisters the source before closing it.
struct Watched(RawFd);

impl AsFd for Watched {
    fn as_fd(&self) -> BorrowedFd<'_> {
        unsafe { BorrowedFd::borrow_raw(self.0) }
    }
}

/// Where a command came from, for routing the reply.
enum CommandOrigin {
    Socket,
    Bus(dbus::Message),
}

pub struct Cinder {
    pub config: Config,
    pub loop_handle: LoopHandle<'static, Cinder>,
    pub loop_signal: LoopSignal,

    card: Option<Rc<Card>>,
    surface: Rc<RefCell<Surface>>,
    terminals: Vec<Option<Terminal>>,
    current_vt: usize,

    pub input: InputManager,
    socket: Option<CommandSocket>,
    bus: Option<Bus>,

    conn_token: Option<RegistrationToken>,
    device_tokens: HashMap<PathBuf, RegistrationToken>,
    terminal_tokens: HashMap<usize, RegistrationToken>,

    pending_vt: Option<usize>,
    pending_rescan: bool,
    // Input devices whose sources are unregistered but whose fds are not
    // yet closed; drained by the maintenance pass.
    pending_device_drops: Vec<PathBuf>,
    terminate: bool,
    splash_destroyed: bool,
}

impl Cinder {
    pub fn new(
        config: Config,
        loop_handle: LoopHandle<'static, Cinder>,
        loop_signal: LoopSignal,
    ) -> Result<Cinder> {
        let input = InputManager::new();

        let card = drm::scan(input.lid_closed());
        let surface = match &card {
            Some(card) => Surface::new(card.clone(), config.scale).unwrap_or_else(|err| {
                warn!("{err}; running headless");
                Surface::headless(config.scale)
            }),
            None => {
                warn!("no usable display, running headless");
                Surface::headless(config.scale)
            }
        };

        // The bus is the normal transport; the socket covers early boot
        // environments without a bus daemon.
        let (bus, socket) = match Bus::new() {
            Ok(bus) => (Some(bus), None),
            Err(err) => {
                info!("{err}; falling back to the socket transport");
                (None, Some(CommandSocket::new(config.port)?))
            }
        };

        let num_vts = config.num_vts;
        let mut state = Cinder {
            config,
            loop_handle,
            loop_signal,
            card,
            surface: Rc::new(RefCell::new(surface)),
            terminals: (0..=num_vts).map(|_| None).collect(),
            current_vt: SPLASH_VT,
            input,
            socket,
            bus,
            conn_token: None,
            device_tokens: HashMap::new(),
            terminal_tokens: HashMap::new(),
            pending_vt: None,
            pending_rescan: false,
            pending_device_drops: Vec::new(),
            terminate: false,
            splash_destroyed: false,
        };

        if state.config.pre_create_vts && state.config.enable_vts {
            for vt in 1..=state.config.num_vts {
                if let Err(err) = state.create_terminal(vt) {
                    warn!("pre-create vt {vt}: {err}");
                }
            }
        }

        Ok(state)
    }

    pub fn terminating(&self) -> bool {
        self.terminate
    }

    pub fn splash_destroyed(&self) -> bool {
        self.splash_destroyed
    }

    pub fn request_terminate(&mut self) {
        self.terminate = true;
    }

    pub fn display_resolution(&self) -> (u32, u32) {
        let surface = self.surface.borrow();
        (surface.width(), surface.height())
    }

    pub fn display_scaling(&self) -> u32 {
        self.surface.borrow().scaling()
    }

    // Terminal management.

    fn vt_valid(&self, vt: usize, allow_zero: bool) -> bool {
        vt <= self.config.num_vts && (allow_zero || vt != 0)
    }

    /// Create (or return) the terminal for `vt`. VT 0 is the splash
    /// terminal and never runs a shell; `--no-login` consoles do not
    /// either.
    pub fn ensure_terminal(&mut self, vt: usize) -> Result<&mut Terminal> {
        if !self.vt_valid(vt, true) {
            return Err(CinderError::BadVt(vt));
        }
        if self.terminals[vt].is_none() {
            self.create_terminal(vt)?;
        }
        Ok(self.terminals[vt].as_mut().unwrap())
    }

    fn create_terminal(&mut self, vt: usize) -> Result<()> {
        let spawn_shell = vt != SPLASH_VT && !self.config.no_login;
        let terminal = Terminal::new(
            vt,
            self.surface.clone(),
            spawn_shell,
            self.config.enable_gfx,
        )?;

        if let Some(raw) = terminal.master_fd().map(|fd| fd.as_raw_fd()) {
            let token = self
                .loop_handle
                .insert_source(
                    Generic::new(Watched(raw), Interest::READ, Mode::Level),
                    move |_, _, state: &mut Cinder| {
                        if let Some(terminal) = state.terminals[vt].as_mut() {
                            terminal.process_output();
                        }
                        Ok(PostAction::Continue)
                    },
                )
                .map_err(|err| CinderError::EventLoop(err.to_string()))?;
            self.terminal_tokens.insert(vt, token);
        }

        self.terminals[vt] = Some(terminal);
        Ok(())
    }

    fn drop_terminal(&mut self, vt: usize) {
        if let Some(token) = self.terminal_tokens.remove(&vt) {
            self.loop_handle.remove(token);
        }
        self.terminals[vt] = None;
    }

    pub fn terminal_mut(&mut self, vt: usize) -> Option<&mut Terminal> {
        self.terminals.get_mut(vt).and_then(|t| t.as_mut())
    }

    fn current_terminal(&mut self) -> Option<&mut Terminal> {
        if self.current_vt == SPLASH_VT {
            return None;
        }
        self.terminal_mut(self.current_vt)
    }

    // VT switching.

    pub fn request_switch(&mut self, vt: usize) {
        let vt = if vt == 0 && self.config.enable_vt1 { 1 } else { vt };
        if !self.vt_valid(vt, true) {
            warn!("switchvt: invalid terminal {vt}");
            return;
        }
        self.pending_vt = Some(vt);
    }

    /// Hand the display back to the graphical session.
    fn release_display(&mut self) {
        if let Some(terminal) = self.current_terminal() {
            terminal.set_active(false);
        }
        self.input.ungrab();
        if let Some(card) = &self.card {
            card.drop_master();
        }
        if let Some(bus) = &self.bus {
            bus.take_display_ownership();
        }
        self.current_vt = SPLASH_VT;
        info!("display handed to the graphical session");
    }

    /// Take the display and activate a text VT.
    fn activate_vt(&mut self, vt: usize) {
        if !self.config.enable_vts {
            debug!("text VTs disabled, ignoring switch to {vt}");
            return;
        }
        if let Err(err) = self.ensure_terminal(vt) {
            warn!("activate vt {vt}: {err}");
            return;
        }

        if let Some(previous) = self.current_terminal() {
            previous.set_active(false);
        }

        // Ask the session to let go of the device before taking master.
        if let Some(bus) = &self.bus {
            bus.release_display_ownership();
        }
        if let Some(card) = &self.card
            && let Err(err) = card.acquire_master()
        {
            warn!("acquire master: {err}");
        }
        if let Err(err) = self.surface.borrow().set_mode() {
            warn!("mode set: {err}");
        }
        self.input.grab();

        self.current_vt = vt;
        let terminal = self.terminals[vt].as_mut().unwrap();
        terminal.set_active(true);
        if let Err(err) = terminal.redraw_all() {
            warn!("redraw vt {vt}: {err}");
        }
        info!("switched to vt {vt}");
    }

    /// Mode-set for the splash path: the splash terminal becomes current
    /// and owns the display, input stays ungrabbed.
    pub fn splash_take_display(&mut self) {
        if let Some(card) = &self.card
            && let Err(err) = card.acquire_master()
        {
            warn!("acquire master: {err}");
        }
        if let Err(err) = self.surface.borrow().set_mode() {
            warn!("mode set: {err}");
        }
        if let Some(terminal) = self.terminal_mut(SPLASH_VT) {
            terminal.set_active(true);
        }
    }

    /// End of the splash sequence: release the display so the graphical
    /// session can light up, and open the master-relax gate that lets the
    /// lease bounce between us and the session afterwards.
    pub fn finish_splash(&mut self) {
        if let Some(terminal) = self.terminal_mut(SPLASH_VT) {
            terminal.set_active(false);
        }
        if let Some(card) = &self.card {
            card.drop_master();
        }
        if let Some(bus) = &self.bus {
            bus.take_display_ownership();
        }

        if self.config.enable_vts || self.config.dev_mode {
            const MASTER_RELAX: &str = "/sys/kernel/debug/dri/drm_master_relax";
            if let Err(err) = std::fs::write(MASTER_RELAX, "Y") {
                warn!("unable to set drm_master_relax: {err}");
            }
        }
    }

    /// The splash is over: drop its terminal; without text VTs the daemon
    /// is done entirely.
    pub fn destroy_splash(&mut self) {
        if self.splash_destroyed {
            return;
        }
        self.splash_destroyed = true;
        self.drop_terminal(SPLASH_VT);
        info!("splash terminal destroyed");
        if !self.config.enable_vts {
            self.request_terminate();
        }
    }

    // Command dispatch (both transports).

    fn dispatch_command(&mut self, request: CommandRequest, origin: CommandOrigin) {
        match request {
            CommandRequest::MakeVt(vt) => {
                if !self.vt_valid(vt, false) {
                    warn!("makevt: invalid terminal {vt}");
                    return;
                }
                let path = match self.ensure_terminal(vt) {
                    Ok(terminal) => terminal
                        .ptsname()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    Err(err) => {
                        warn!("makevt {vt}: {err}");
                        return;
                    }
                };
                self.reply(origin, Some(&path));
            }
            CommandRequest::SwitchVt(vt) => {
                if !self.vt_valid(vt, true) {
                    warn!("switchvt: invalid terminal {vt}");
                    return;
                }
                self.pending_vt = Some(vt);
                self.reply(origin, None);
            }
            CommandRequest::Terminate => {
                self.reply(origin, None);
                self.request_terminate();
            }
            CommandRequest::Image { path, placement } => {
                match image::load(std::path::Path::new(&path)) {
                    Ok(data) => {
                        let scale = {
                            let surface = self.surface.borrow();
                            surface.scaling()
                        };
                        match self.ensure_terminal(SPLASH_VT) {
                            Ok(terminal) => {
                                if let Err(err) = terminal.show_image(&data, placement, scale) {
                                    warn!("image: {err}");
                                }
                            }
                            Err(err) => warn!("image: {err}"),
                        }
                    }
                    Err(err) => warn!("{err}"),
                }
                self.reply(origin, None);
            }
        }
    }

    fn reply(&mut self, origin: CommandOrigin, payload: Option<&str>) {
        match origin {
            CommandOrigin::Socket => {
                if let (Some(socket), Some(payload)) = (self.socket.as_mut(), payload) {
                    socket.reply(payload);
                }
            }
            CommandOrigin::Bus(message) => {
                if let Some(bus) = &self.bus {
                    bus.reply(&message, payload);
                }
            }
        }
    }

    // Input actions.

    fn execute(&mut self, action: InputAction) {
        if let Some(bus) = &self.bus {
            bus.report_user_activity();
        }

        match action {
            InputAction::Key(keysym, mods) => {
                if let Some(terminal) = self.current_terminal() {
                    terminal.key_event(keysym, mods);
                }
            }
            InputAction::ScrollLineUp => {
                if let Some(t) = self.current_terminal() {
                    t.scroll_line_up();
                }
            }
            InputAction::ScrollLineDown => {
                if let Some(t) = self.current_terminal() {
                    t.scroll_line_down();
                }
            }
            InputAction::ScrollPageUp => {
                if let Some(t) = self.current_terminal() {
                    t.scroll_page_up();
                }
            }
            InputAction::ScrollPageDown => {
                if let Some(t) = self.current_terminal() {
                    t.scroll_page_down();
                }
            }
            InputAction::ZoomIn => self.zoom(1),
            InputAction::ZoomOut => self.zoom(-1),
            InputAction::BrightnessUp => {
                if let Some(bus) = &self.bus {
                    bus.set_brightness(true);
                }
            }
            InputAction::BrightnessDown => {
                if let Some(bus) = &self.bus {
                    bus.set_brightness(false);
                }
            }
            InputAction::SwitchVt(vt) => self.request_switch(vt),
            InputAction::LidChanged => self.pending_rescan = true,
        }
    }

    fn zoom(&mut self, delta: i32) {
        let new_scaling = {
            let surface = self.surface.borrow();
            (surface.scaling() as i32 + delta).clamp(1, 4) as u32
        };
        if new_scaling == self.surface.borrow().scaling() {
            return;
        }
        self.surface.borrow_mut().set_scaling(new_scaling);
        for terminal in self.terminals.iter_mut().flatten() {
            terminal.resize_to_surface();
        }
        if let Some(terminal) = self.current_terminal() {
            let _ = terminal.redraw_all();
        }
        info!("font scaling now {new_scaling}");
    }

    // Hotplug.

    fn handle_display_change(&mut self) {
        match drm::rescan(self.card.as_ref(), self.input.lid_closed()) {
            Rescan::Unchanged => debug!("display unchanged after rescan"),
            Rescan::Changed(card) => {
                info!("display changed, rebuilding surface");
                self.card = card;
                let surface = match &self.card {
                    Some(card) => {
                        Surface::new(card.clone(), self.config.scale).unwrap_or_else(|err| {
                            warn!("{err}; running headless");
                            Surface::headless(self.config.scale)
                        })
                    }
                    None => Surface::headless(self.config.scale),
                };
                self.surface = Rc::new(RefCell::new(surface));
                for terminal in self.terminals.iter_mut().flatten() {
                    terminal.set_surface(self.surface.clone());
                }

                if self.current_vt != SPLASH_VT {
                    if let Some(card) = &self.card
                        && let Err(err) = card.acquire_master()
                    {
                        warn!("acquire master: {err}");
                    }
                    if let Err(err) = self.surface.borrow().set_mode() {
                        warn!("mode set: {err}");
                    }
                    if let Some(terminal) = self.current_terminal() {
                        let _ = terminal.redraw_all();
                    }
                }
            }
        }
    }

    /// Post-dispatch pass, run once per wake-up: respawn dead shells,
    /// apply pending VT switches and rescans, honor termination.
    pub fn maintain(&mut self) {
        if self.terminate {
            self.loop_signal.stop();
            return;
        }

        // Deferred fd closes: the sources are unregistered by now.
        for path in std::mem::take(&mut self.pending_device_drops) {
            self.input.remove(&path);
        }
        if let Some(socket) = self.socket.as_mut()
            && socket.conn_dead()
        {
            socket.close_conn();
        }

        if self.pending_rescan {
            self.pending_rescan = false;
            self.handle_display_change();
        }

        // A dead shell means a fresh terminal on the same VT.
        for vt in 1..self.terminals.len() {
            let done = self.terminals[vt]
                .as_mut()
                .map(|t| t.child_done())
                .unwrap_or(false);
            if done {
                info!("respawning vt {vt}");
                let was_current = self.current_vt == vt;
                self.drop_terminal(vt);
                match self.create_terminal(vt) {
                    Ok(()) => {
                        if was_current {
                            self.activate_vt(vt);
                        }
                    }
                    Err(err) => warn!("respawn vt {vt}: {err}"),
                }
            }
        }

        if let Some(vt) = self.pending_vt.take() {
            if vt == self.current_vt {
                return;
            }
            if vt == SPLASH_VT {
                self.release_display();
            } else {
                self.activate_vt(vt);
            }
        }
    }
}

/// Register every event source: signals, IPC, hotplug monitor, input
/// devices. PTY sources register as terminals are created.
pub fn init_sources(event_loop: &mut EventLoop<'static, Cinder>, state: &mut Cinder) -> Result<()> {
    let handle = event_loop.handle();

    let signals = Signals::new(&[Signal::SIGTERM, Signal::SIGINT, Signal::SIGCHLD])
        .map_err(|err| CinderError::EventLoop(err.to_string()))?;
    handle
        .insert_source(signals, |event, _, state: &mut Cinder| {
            match event.signal() {
                Signal::SIGTERM | Signal::SIGINT => state.request_terminate(),
                // SIGCHLD only needs to wake the loop; the maintenance
                // pass reaps the child.
                _ => {}
            }
        })
        .map_err(|err| CinderError::EventLoop(err.to_string()))?;

    if let Some(socket) = &state.socket {
        let fd = socket.listener_fd();
        handle
            .insert_source(
                Generic::new(Watched(fd), Interest::READ, Mode::Level),
                |_, _, state: &mut Cinder| {
                    state.socket_accept();
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| CinderError::EventLoop(err.to_string()))?;
    }

    if let Some(bus) = &state.bus {
        let fd = bus.watch_fd();
        handle
            .insert_source(
                Generic::new(Watched(fd), Interest::READ, Mode::Level),
                |_, _, state: &mut Cinder| {
                    state.drain_bus();
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| CinderError::EventLoop(err.to_string()))?;
    }

    if let Some(fd) = state.input.monitor_fd() {
        handle
            .insert_source(
                Generic::new(Watched(fd), Interest::READ, Mode::Level),
                |_, _, state: &mut Cinder| {
                    state.process_hotplug();
                    Ok(PostAction::Continue)
                },
            )
            .map_err(|err| CinderError::EventLoop(err.to_string()))?;
    }

    for path in state.input.device_paths() {
        register_input_device(state, path);
    }

    Ok(())
}

impl Cinder {
    fn socket_accept(&mut self) {
        let Some(stream) = self.socket.as_mut().and_then(|s| s.accept_pending()) else {
            return;
        };
        // Unregister the previous connection before its fd closes.
        if let Some(token) = self.conn_token.take() {
            self.loop_handle.remove(token);
        }
        let socket = self.socket.as_mut().unwrap();
        socket.install_conn(stream);
        let Some(fd) = socket.conn_fd() else {
            return;
        };
        let token = self.loop_handle.insert_source(
            Generic::new(Watched(fd), Interest::READ, Mode::Level),
            |_, _, state: &mut Cinder| {
                let request = state.socket.as_mut().and_then(|s| s.read_command());
                if let Some(request) = request {
                    state.dispatch_command(request, CommandOrigin::Socket);
                }
                // A dead peer unregisters here; the fd itself is closed by
                // the maintenance pass once the source is gone.
                let dead = state
                    .socket
                    .as_ref()
                    .map(|s| s.conn_dead())
                    .unwrap_or(true);
                if dead {
                    state.conn_token = None;
                    Ok(PostAction::Remove)
                } else {
                    Ok(PostAction::Continue)
                }
            },
        );
        match token {
            Ok(token) => self.conn_token = Some(token),
            Err(err) => warn!("register connection: {err}"),
        }
    }

    fn drain_bus(&mut self) {
        let events = match &self.bus {
            Some(bus) => bus.drain(),
            None => return,
        };
        for event in events {
            match event {
                BusEvent::Command(request, message) => {
                    self.dispatch_command(request, CommandOrigin::Bus(message));
                }
                BusEvent::LoginPromptVisible => {
                    info!("login prompt visible");
                    self.destroy_splash();
                }
            }
        }
    }

    fn process_hotplug(&mut self) {
        let changes = self.input.process_monitor();
        for path in changes.removed {
            if let Some(token) = self.device_tokens.remove(&path) {
                self.loop_handle.remove(token);
            }
            self.pending_device_drops.push(path);
        }
        for path in changes.added {
            register_input_device(self, path);
        }
        if changes.display_changed {
            self.pending_rescan = true;
        }
    }
}

fn register_input_device(state: &mut Cinder, path: PathBuf) {
    let Some(fd) = state.input.device_fd(&path) else {
        return;
    };
    let callback_path = path.clone();
    let token = state.loop_handle.insert_source(
        Generic::new(Watched(fd), Interest::READ, Mode::Level),
        move |_, _, state: &mut Cinder| {
            let vts = state.config.enable_vts;
            match state.input.drain_device(&callback_path, vts) {
                Ok(actions) => {
                    for action in actions {
                        state.execute(action);
                    }
                    Ok(PostAction::Continue)
                }
                Err(()) => {
                    state.device_tokens.remove(&callback_path);
                    state.pending_device_drops.push(callback_path.clone());
                    Ok(PostAction::Remove)
                }
            }
        },
    );
    match token {
        Ok(token) => {
            state.device_tokens.insert(path, token);
        }
        Err(err) => warn!("register {}: {err}", path.display()),
    }
}
