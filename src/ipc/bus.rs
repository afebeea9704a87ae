//! The system-bus command transport, plus the daemon's outgoing calls to
//! the session manager and power manager. All replies carry a 3 second
//! deadline; the daemon never blocks indefinitely on a peer.

use std::os::fd::RawFd;
use std::time::Duration;

use dbus::Message;
use dbus::blocking::Connection;
use dbus::message::MessageType;
use tracing::{debug, info, warn};

use crate::ipc::{
    COMMAND_IMAGE, COMMAND_MAKE_VT, COMMAND_SWITCH_VT, COMMAND_TERMINATE, CommandRequest,
    parse_image_options,
};
use crate::{CinderError, Result};

const REPLY_DEADLINE: Duration = Duration::from_secs(3);

const OWN_NAME: &str = "org.chromium.cinder";
const OWN_PATH: &str = "/org/chromium/cinder";

const SESSION_MANAGER_INTERFACE: &str = "org.chromium.SessionManagerInterface";
const LOGIN_PROMPT_VISIBLE: &str = "LoginPromptVisible";

const DISPLAY_SERVICE_NAME: &str = "org.chromium.LibCrosService";
const DISPLAY_SERVICE_PATH: &str = "/org/chromium/LibCrosService";
const DISPLAY_SERVICE_INTERFACE: &str = "org.chromium.LibCrosServiceInterface";
const TAKE_DISPLAY_OWNERSHIP: &str = "TakeDisplayOwnership";
const RELEASE_DISPLAY_OWNERSHIP: &str = "ReleaseDisplayOwnership";

const POWER_MANAGER_NAME: &str = "org.chromium.PowerManager";
const POWER_MANAGER_PATH: &str = "/org/chromium/PowerManager";
const POWER_MANAGER_INTERFACE: &str = "org.chromium.PowerManager";
const INCREASE_BRIGHTNESS: &str = "IncreaseScreenBrightness";
const DECREASE_BRIGHTNESS: &str = "DecreaseScreenBrightness";
const HANDLE_USER_ACTIVITY: &str = "HandleUserActivity";
const USER_ACTIVITY_OTHER: i32 = 0;

pub enum BusEvent {
    /// A command arrived; the message is kept for the reply.
    Command(CommandRequest, Message),
    /// The session manager says the login screen is up.
    LoginPromptVisible,
}

pub struct Bus {
    conn: Connection,
}

impl Bus {
    pub fn new() -> Result<Bus> {
        let conn = Connection::new_system()
            .map_err(|err| CinderError::Ipc(format!("system bus: {err}")))?;
        conn.request_name(OWN_NAME, false, true, false)
            .map_err(|err| CinderError::Ipc(format!("request name: {err}")))?;
        conn.add_match_no_cb(&format!(
            "type='signal',interface='{SESSION_MANAGER_INTERFACE}',member='{LOGIN_PROMPT_VISIBLE}'"
        ))
        .map_err(|err| CinderError::Ipc(format!("add match: {err}")))?;

        info!("command channel on the system bus as {OWN_NAME}");
        Ok(Bus { conn })
    }

    pub fn watch_fd(&self) -> RawFd {
        self.conn.channel().watch().fd
    }

    /// Pop everything queued on the connection.
    pub fn drain(&self) -> Vec<BusEvent> {
        let channel = self.conn.channel();
        if channel.read_write(Some(Duration::ZERO)).is_err() {
            warn!("bus read failed");
            return Vec::new();
        }

        let mut events = Vec::new();
        while let Some(message) = channel.pop_message() {
            if let Some(event) = classify(message) {
                events.push(event);
            }
        }
        events
    }

    pub fn reply(&self, request: &Message, payload: Option<&str>) {
        let reply = match payload {
            Some(payload) => request.method_return().append1(payload),
            None => request.method_return(),
        };
        if self.conn.channel().send(reply).is_err() {
            debug!("bus reply dropped");
        }
        self.conn.channel().flush();
    }

    // Outgoing collaborator calls.

    pub fn take_display_ownership(&self) {
        self.display_call(TAKE_DISPLAY_OWNERSHIP);
    }

    pub fn release_display_ownership(&self) {
        self.display_call(RELEASE_DISPLAY_OWNERSHIP);
    }

    fn display_call(&self, method: &str) {
        let proxy = self.conn.with_proxy(
            DISPLAY_SERVICE_NAME,
            DISPLAY_SERVICE_PATH,
            REPLY_DEADLINE,
        );
        let result: std::result::Result<(), dbus::Error> =
            proxy.method_call(DISPLAY_SERVICE_INTERFACE, method, ());
        if let Err(err) = result {
            warn!("{method}: {err}");
        }
    }

    pub fn set_brightness(&self, up: bool) {
        let method = if up {
            INCREASE_BRIGHTNESS
        } else {
            DECREASE_BRIGHTNESS
        };
        let proxy = self
            .conn
            .with_proxy(POWER_MANAGER_NAME, POWER_MANAGER_PATH, REPLY_DEADLINE);
        let result: std::result::Result<(), dbus::Error> =
            proxy.method_call(POWER_MANAGER_INTERFACE, method, ());
        if let Err(err) = result {
            debug!("{method}: {err}");
        }
    }

    /// Fire-and-forget; called on every key press, must never wait.
    pub fn report_user_activity(&self) {
        let Ok(message) = Message::new_method_call(
            POWER_MANAGER_NAME,
            POWER_MANAGER_PATH,
            POWER_MANAGER_INTERFACE,
            HANDLE_USER_ACTIVITY,
        ) else {
            return;
        };
        let mut message = message.append1(USER_ACTIVITY_OTHER);
        message.set_no_reply(true);
        let _ = self.conn.channel().send(message);
        self.conn.channel().flush();
    }
}

fn classify(message: Message) -> Option<BusEvent> {
    match message.msg_type() {
        MessageType::Signal => {
            let member = message.member()?;
            if &*member == LOGIN_PROMPT_VISIBLE {
                return Some(BusEvent::LoginPromptVisible);
            }
            None
        }
        MessageType::MethodCall => {
            if message.path().map(|p| p.to_string()) != Some(OWN_PATH.to_owned()) {
                return None;
            }
            let member = message.member()?.to_string();
            let request = match member.as_str() {
                COMMAND_MAKE_VT | COMMAND_SWITCH_VT => {
                    let vt: i32 = message.read1().ok()?;
                    if vt < 0 {
                        warn!("{member}: invalid terminal {vt}");
                        return None;
                    }
                    if member == COMMAND_MAKE_VT {
                        CommandRequest::MakeVt(vt as usize)
                    } else {
                        CommandRequest::SwitchVt(vt as usize)
                    }
                }
                COMMAND_TERMINATE => CommandRequest::Terminate,
                COMMAND_IMAGE => {
                    let options: String = message.read1().ok()?;
                    match parse_image_options(options.split_whitespace()) {
                        Ok(request) => request,
                        Err(err) => {
                            warn!("bad Image call: {err}");
                            return None;
                        }
                    }
                }
                other => {
                    warn!("unknown bus method {other}");
                    return None;
                }
            };
            Some(BusEvent::Command(request, message))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::Placement;

    fn method(member: &str) -> Message {
        Message::new_method_call(OWN_NAME, OWN_PATH, OWN_NAME, member).unwrap()
    }

    #[test]
    fn classifies_vt_methods() {
        let message = method(COMMAND_MAKE_VT).append1(2i32);
        match classify(message) {
            Some(BusEvent::Command(CommandRequest::MakeVt(2), _)) => {}
            _ => panic!("expected MakeVT"),
        }

        let message = method(COMMAND_SWITCH_VT).append1(0i32);
        match classify(message) {
            Some(BusEvent::Command(CommandRequest::SwitchVt(0), _)) => {}
            _ => panic!("expected SwitchVT"),
        }
    }

    #[test]
    fn rejects_negative_vt() {
        let message = method(COMMAND_SWITCH_VT).append1(-1i32);
        assert!(classify(message).is_none());
    }

    #[test]
    fn classifies_image_options_string() {
        let message = method(COMMAND_IMAGE).append1("image:/tmp/a.png offset:4,5");
        match classify(message) {
            Some(BusEvent::Command(CommandRequest::Image { path, placement }, _)) => {
                assert_eq!(path, "/tmp/a.png");
                assert_eq!(placement, Placement::Offset(4, 5));
            }
            _ => panic!("expected Image"),
        }
    }

    #[test]
    fn unknown_members_are_dropped() {
        assert!(classify(method("Reboot")).is_none());
    }
}
