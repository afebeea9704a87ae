//! Evdev input: device discovery and exclusive grabs, udev hotplug, the
//! modifier state machine, and hotkey dispatch.
//!
//! The manager owns the device fds; the event loop watches them and calls
//! back in here when one turns readable. Decisions come back as
//! [`InputAction`]s executed against the daemon state, keeping this module
//! free of display and terminal knowledge.

use std::fs::OpenOptions;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::{debug, info, warn};

use crate::keys::{self, ACTION_KEY_LAYOUT, Keysym, Modifiers};

const EV_KEY: u16 = 1;
const EV_SW: u16 = 5;

const KEY_RELEASE: i32 = 0;

// The property vivaldi keyboards use to advertise their top-row layout.
const TOP_ROW_LAYOUT_PROPERTY: &str = "CROS_KEYBOARD_TOP_ROW_LAYOUT";

nix::ioctl_write_int!(eviocgrab, b'E', 0x90);
nix::ioctl_read_buf!(eviocgsw, b'E', 0x1b, u8);

/// What a key event asks of the daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputAction {
    Key(Keysym, Modifiers),
    SwitchVt(usize),
    ScrollLineUp,
    ScrollLineDown,
    ScrollPageUp,
    ScrollPageDown,
    ZoomIn,
    ZoomOut,
    BrightnessUp,
    BrightnessDown,
    /// Lid switch toggled; the display choice may need revisiting.
    LidChanged,
}

pub struct InputDevice {
    fd: OwnedFd,
    path: PathBuf,
    layout: u32,
}

impl InputDevice {
    fn grab(&self, on: bool) -> nix::Result<()> {
        unsafe { eviocgrab(self.fd.as_raw_fd(), on as u64) }.map(|_| ())
    }

    fn lid_closed(&self) -> Option<bool> {
        let mut switches = [0u8; 8];
        let n = unsafe { eviocgsw(self.fd.as_raw_fd(), &mut switches) }.ok()?;
        if n <= 0 {
            return None;
        }
        Some(switches[0] & (1 << keys::SW_LID) != 0)
    }
}

pub struct InputManager {
    devices: Vec<InputDevice>,
    monitor: Option<udev::MonitorSocket>,
    modifiers: Modifiers,
    grabbed: bool,
}

/// Device set changes the event loop must mirror.
#[derive(Debug, Default)]
pub struct DeviceChanges {
    pub added: Vec<PathBuf>,
    pub removed: Vec<PathBuf>,
    pub display_changed: bool,
}

impl InputManager {
    /// Enumerate the existing event nodes and start the hotplug monitor.
    /// A missing udev is not fatal; the initial device set still works.
    pub fn new() -> InputManager {
        let mut manager = InputManager {
            devices: Vec::new(),
            monitor: None,
            modifiers: Modifiers::default(),
            grabbed: false,
        };

        match udev::Enumerator::new() {
            Ok(mut enumerator) => {
                let devices = enumerator
                    .match_subsystem("input")
                    .and_then(|_| enumerator.scan_devices());
                match devices {
                    Ok(devices) => {
                        for device in devices {
                            if let Some(node) = device.devnode() {
                                manager.add(node, Some(&device));
                            }
                        }
                    }
                    Err(err) => warn!("udev enumerate: {err}"),
                }
            }
            Err(err) => warn!("udev: {err}"),
        }

        manager.monitor = udev::MonitorBuilder::new()
            .and_then(|builder| builder.match_subsystem("input"))
            .and_then(|builder| builder.match_subsystem("drm"))
            .and_then(|builder| builder.listen())
            .map_err(|err| warn!("udev monitor: {err}"))
            .ok();

        info!("{} input devices", manager.devices.len());
        manager
    }

    pub fn monitor_fd(&self) -> Option<RawFd> {
        self.monitor.as_ref().map(|m| m.as_raw_fd())
    }

    pub fn device_paths(&self) -> Vec<PathBuf> {
        self.devices.iter().map(|d| d.path.clone()).collect()
    }

    pub fn device_fd(&self, path: &Path) -> Option<RawFd> {
        self.devices
            .iter()
            .find(|d| d.path == path)
            .map(|d| d.fd.as_raw_fd())
    }

    /// Open and keep one event node. A device already grabbed by another
    /// process is skipped; that is the graphical session's keyboard.
    fn add(&mut self, node: &Path, device: Option<&udev::Device>) -> bool {
        if !node
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with("event"))
            .unwrap_or(false)
        {
            return false;
        }
        if self.devices.iter().any(|d| d.path == node) {
            return false;
        }

        let file = match OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(node)
        {
            Ok(file) => file,
            Err(err) => {
                debug!("open {}: {err}", node.display());
                return false;
            }
        };

        let layout = device
            .and_then(|d| d.property_value(TOP_ROW_LAYOUT_PROPERTY))
            .and_then(|v| v.to_str())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let device = InputDevice {
            fd: file.into(),
            path: node.to_owned(),
            layout,
        };

        // Probe for an exclusive grab; busy means another process owns the
        // device and we must leave it alone.
        if device.grab(true).is_err() {
            info!("{} grabbed by another process, skipping", node.display());
            return false;
        }
        if !self.grabbed {
            let _ = device.grab(false);
        }

        debug!("input device {} (layout {layout})", node.display());
        self.devices.push(device);
        true
    }

    pub fn remove(&mut self, node: &Path) {
        self.devices.retain(|d| d.path != node);
    }

    /// Drain the udev monitor; returns the device-set delta.
    pub fn process_monitor(&mut self) -> DeviceChanges {
        let mut changes = DeviceChanges::default();
        let Some(monitor) = &mut self.monitor else {
            return changes;
        };

        let events: Vec<udev::Event> = monitor.iter().collect();
        for event in events {
            match event.subsystem().and_then(|s| s.to_str().map(String::from)) {
                Some(ref s) if s == "input" => {
                    let Some(node) = event.devnode().map(Path::to_owned) else {
                        continue;
                    };
                    match event.event_type() {
                        udev::EventType::Add => {
                            let device = event.device();
                            if self.add(&node, Some(&device)) {
                                changes.added.push(node);
                            }
                        }
                        udev::EventType::Remove => {
                            // Reported only; the event loop unregisters the
                            // fd before the device is dropped.
                            if self.devices.iter().any(|d| d.path == node) {
                                changes.removed.push(node);
                            }
                        }
                        _ => {}
                    }
                }
                Some(ref s) if s == "drm" => {
                    changes.display_changed = true;
                }
                _ => {}
            }
        }
        changes
    }

    /// Exclusive-grab every device (text VT active).
    pub fn grab(&mut self) {
        self.grabbed = true;
        for device in &self.devices {
            if let Err(err) = device.grab(true) {
                warn!("grab {}: {err}", device.path.display());
            }
        }
    }

    /// Release the grabs (graphical session active).
    pub fn ungrab(&mut self) {
        self.grabbed = false;
        for device in &self.devices {
            let _ = device.grab(false);
        }
    }

    /// Current lid state from whichever device exposes the switch.
    pub fn lid_closed(&self) -> bool {
        self.devices
            .iter()
            .find_map(|device| device.lid_closed())
            .unwrap_or(false)
    }

    /// Read everything pending on one device. `Ok(actions)` or `Err(())`
    /// when the device is gone and must be dropped from the loop.
    pub fn drain_device(
        &mut self,
        path: &Path,
        vts_enabled: bool,
    ) -> std::result::Result<Vec<InputAction>, ()> {
        let index = match self.devices.iter().position(|d| d.path == path) {
            Some(index) => index,
            None => return Err(()),
        };
        let layout = self.devices[index].layout;

        let mut actions = Vec::new();
        let mut event = mem::MaybeUninit::<libc::input_event>::uninit();
        loop {
            let n = unsafe {
                libc::read(
                    self.devices[index].fd.as_raw_fd(),
                    event.as_mut_ptr().cast(),
                    mem::size_of::<libc::input_event>(),
                )
            };
            if n < 0 {
                match Errno::last() {
                    Errno::EAGAIN => break,
                    Errno::EINTR => continue,
                    _ => {
                        // ENODEV and friends: report the device as gone,
                        // the caller drops it after unregistering the fd.
                        debug!("input device {} went away", path.display());
                        return Err(());
                    }
                }
            }
            if n as usize != mem::size_of::<libc::input_event>() {
                break;
            }

            let event = unsafe { event.assume_init() };
            match event.type_ {
                EV_KEY => {
                    if let Some(action) =
                        self.process_key(event.code, event.value, layout, vts_enabled)
                    {
                        actions.push(action);
                    }
                }
                EV_SW if event.code == keys::SW_LID => actions.push(InputAction::LidChanged),
                _ => {}
            }
        }
        Ok(actions)
    }

    /// Modifier bookkeeping plus hotkey decode for a single key event.
    fn process_key(
        &mut self,
        code: u16,
        value: i32,
        layout: u32,
        vts_enabled: bool,
    ) -> Option<InputAction> {
        let code = if layout == ACTION_KEY_LAYOUT {
            keys::remap_action_key(code)
        } else {
            code
        };

        let pressed = value != KEY_RELEASE;
        if self.modifiers.update(code, pressed) {
            return None;
        }
        if !pressed || keys::is_button(code) {
            return None;
        }

        let mods = self.modifiers;

        if vts_enabled {
            if mods.shift() && !mods.ctrl() && !mods.alt() {
                match code {
                    keys::KEY_PAGEUP => return Some(InputAction::ScrollPageUp),
                    keys::KEY_PAGEDOWN => return Some(InputAction::ScrollPageDown),
                    keys::KEY_UP => return Some(InputAction::ScrollLineUp),
                    keys::KEY_DOWN => return Some(InputAction::ScrollLineDown),
                    _ => {}
                }
            }
            if mods.meta() && !mods.ctrl() && !mods.alt() {
                match code {
                    keys::KEY_UP => return Some(InputAction::ScrollPageUp),
                    keys::KEY_DOWN => return Some(InputAction::ScrollPageDown),
                    _ => {}
                }
            }
            if mods.shift() && mods.ctrl() && !mods.alt() {
                match code {
                    keys::KEY_MINUS => return Some(InputAction::ZoomOut),
                    keys::KEY_EQUAL => return Some(InputAction::ZoomIn),
                    _ => {}
                }
            }
        }

        if mods.is_empty() {
            match code {
                keys::KEY_F6 => return Some(InputAction::BrightnessDown),
                keys::KEY_F7 => return Some(InputAction::BrightnessUp),
                _ => {}
            }
        }

        if mods.ctrl() && mods.alt() && !mods.meta() {
            if let Some(n) = keys::function_key(code) {
                // Shift+Ctrl+Alt+Fn is reserved for external tooling.
                if mods.shift() {
                    return None;
                }
                return Some(InputAction::SwitchVt((n - 1) as usize));
            }
        }

        keys::translate(code, mods).map(|keysym| InputAction::Key(keysym, mods))
    }
}

/// One-shot lid probe used before the input manager exists (the first DRM
/// scan needs it).
pub fn lid_closed_probe() -> bool {
    let Ok(mut enumerator) = udev::Enumerator::new() else {
        return false;
    };
    if enumerator.match_subsystem("input").is_err() {
        return false;
    }
    let Ok(devices) = enumerator.scan_devices() else {
        return false;
    };

    for device in devices {
        let Some(node) = device.devnode() else {
            continue;
        };
        let Ok(file) = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(node)
        else {
            continue;
        };
        let mut switches = [0u8; 8];
        if let Ok(n) = unsafe { eviocgsw(file.as_raw_fd(), &mut switches) }
            && n > 0
        {
            return switches[0] & (1 << keys::SW_LID) != 0;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::NamedKey;

    fn manager() -> InputManager {
        InputManager {
            devices: Vec::new(),
            monitor: None,
            modifiers: Modifiers::default(),
            grabbed: false,
        }
    }

    const PRESS: i32 = 1;
    const RELEASE: i32 = 0;

    #[test]
    fn plain_keys_become_key_actions() {
        let mut input = manager();
        assert_eq!(
            input.process_key(30, PRESS, 0, true),
            Some(InputAction::Key(Keysym::Char('a'), Modifiers::default()))
        );
    }

    #[test]
    fn releases_and_modifiers_are_silent() {
        let mut input = manager();
        assert_eq!(input.process_key(keys::KEY_LEFTSHIFT, PRESS, 0, true), None);
        assert_eq!(input.process_key(30, RELEASE, 0, true), None);
    }

    #[test]
    fn vt_switch_hotkey() {
        let mut input = manager();
        input.process_key(keys::KEY_LEFTCTRL, PRESS, 0, true);
        input.process_key(keys::KEY_LEFTALT, PRESS, 0, true);
        assert_eq!(
            input.process_key(keys::KEY_F1 + 1, PRESS, 0, true),
            Some(InputAction::SwitchVt(1))
        );
        assert_eq!(
            input.process_key(keys::KEY_F1, PRESS, 0, true),
            Some(InputAction::SwitchVt(0))
        );
        // With shift the chord is reserved and swallowed.
        input.process_key(keys::KEY_LEFTSHIFT, PRESS, 0, true);
        assert_eq!(input.process_key(keys::KEY_F1 + 1, PRESS, 0, true), None);
    }

    #[test]
    fn scrollback_hotkeys() {
        let mut input = manager();
        input.process_key(keys::KEY_LEFTSHIFT, PRESS, 0, true);
        assert_eq!(
            input.process_key(keys::KEY_PAGEUP, PRESS, 0, true),
            Some(InputAction::ScrollPageUp)
        );
        assert_eq!(
            input.process_key(keys::KEY_DOWN, PRESS, 0, true),
            Some(InputAction::ScrollLineDown)
        );
        input.process_key(keys::KEY_LEFTSHIFT, RELEASE, 0, true);
        input.process_key(keys::KEY_LEFTMETA, PRESS, 0, true);
        assert_eq!(
            input.process_key(keys::KEY_UP, PRESS, 0, true),
            Some(InputAction::ScrollPageUp)
        );
    }

    #[test]
    fn zoom_hotkeys() {
        let mut input = manager();
        input.process_key(keys::KEY_LEFTSHIFT, PRESS, 0, true);
        input.process_key(keys::KEY_LEFTCTRL, PRESS, 0, true);
        assert_eq!(
            input.process_key(keys::KEY_EQUAL, PRESS, 0, true),
            Some(InputAction::ZoomIn)
        );
        assert_eq!(
            input.process_key(keys::KEY_MINUS, PRESS, 0, true),
            Some(InputAction::ZoomOut)
        );
    }

    #[test]
    fn brightness_keys_without_modifiers() {
        let mut input = manager();
        assert_eq!(
            input.process_key(keys::KEY_F6, PRESS, 0, true),
            Some(InputAction::BrightnessDown)
        );
        assert_eq!(
            input.process_key(keys::KEY_F7, PRESS, 0, true),
            Some(InputAction::BrightnessUp)
        );
        // Meta+F6 is not the brightness hotkey.
        input.process_key(keys::KEY_LEFTMETA, PRESS, 0, true);
        assert_ne!(
            input.process_key(keys::KEY_F6, PRESS, 0, true),
            Some(InputAction::BrightnessDown)
        );
    }

    #[test]
    fn action_key_layout_remaps_top_row() {
        let mut input = manager();
        input.process_key(keys::KEY_LEFTCTRL, PRESS, 0, true);
        input.process_key(keys::KEY_LEFTALT, PRESS, 0, true);
        // KEY_FORWARD acts as F2 on layout 3 keyboards.
        assert_eq!(
            input.process_key(keys::KEY_FORWARD, PRESS, ACTION_KEY_LAYOUT, true),
            Some(InputAction::SwitchVt(1))
        );
        // Without the layout it translates to nothing special.
        assert_eq!(input.process_key(keys::KEY_FORWARD, PRESS, 0, true), None);
    }

    #[test]
    fn scrollback_hotkeys_require_vts() {
        let mut input = manager();
        input.process_key(keys::KEY_LEFTSHIFT, PRESS, 0, false);
        assert_ne!(
            input.process_key(keys::KEY_PAGEUP, PRESS, 0, false),
            Some(InputAction::ScrollPageUp)
        );
    }

    #[test]
    fn named_keys_reach_the_terminal() {
        let mut input = manager();
        assert_eq!(
            input.process_key(keys::KEY_ESC, PRESS, 0, true),
            Some(InputAction::Key(
                Keysym::Named(NamedKey::Escape),
                Modifiers::default()
            ))
        );
    }
}
