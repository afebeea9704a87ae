//! Evdev key handling: modifier tracking, the code→keysym table, the
//! action-key remap for keyboards without a function row, and the encoding
//! of key presses into the byte stream a terminal expects.

use bitflags::bitflags;

// Evdev key codes (linux/input-event-codes.h), the subset the daemon acts on.
pub const KEY_ESC: u16 = 1;
pub const KEY_MINUS: u16 = 12;
pub const KEY_EQUAL: u16 = 13;
pub const KEY_BACKSPACE: u16 = 14;
pub const KEY_TAB: u16 = 15;
pub const KEY_ENTER: u16 = 28;
pub const KEY_LEFTCTRL: u16 = 29;
pub const KEY_LEFTSHIFT: u16 = 42;
pub const KEY_RIGHTSHIFT: u16 = 54;
pub const KEY_LEFTALT: u16 = 56;
pub const KEY_F1: u16 = 59;
pub const KEY_F10: u16 = 68;
pub const KEY_F11: u16 = 87;
pub const KEY_F12: u16 = 88;
pub const KEY_KPENTER: u16 = 96;
pub const KEY_RIGHTCTRL: u16 = 97;
pub const KEY_RIGHTALT: u16 = 100;
pub const KEY_HOME: u16 = 102;
pub const KEY_UP: u16 = 103;
pub const KEY_PAGEUP: u16 = 104;
pub const KEY_LEFT: u16 = 105;
pub const KEY_RIGHT: u16 = 106;
pub const KEY_END: u16 = 107;
pub const KEY_DOWN: u16 = 108;
pub const KEY_PAGEDOWN: u16 = 109;
pub const KEY_INSERT: u16 = 110;
pub const KEY_DELETE: u16 = 111;
pub const KEY_MUTE: u16 = 113;
pub const KEY_VOLUMEDOWN: u16 = 114;
pub const KEY_VOLUMEUP: u16 = 115;
pub const KEY_LEFTMETA: u16 = 125;
pub const KEY_RIGHTMETA: u16 = 126;
pub const KEY_BACK: u16 = 158;
pub const KEY_FORWARD: u16 = 159;
pub const KEY_REFRESH: u16 = 173;
pub const KEY_F6: u16 = 64;
pub const KEY_F7: u16 = 65;
pub const KEY_BRIGHTNESSDOWN: u16 = 224;
pub const KEY_BRIGHTNESSUP: u16 = 225;
pub const KEY_FULL_SCREEN: u16 = 372;
pub const KEY_SCALE: u16 = 120;

pub const SW_LID: u16 = 0;

/// Keyboards advertising this layout id emit action codes for the top row.
pub const ACTION_KEY_LAYOUT: u32 = 3;

const BTN_RANGE: std::ops::RangeInclusive<u16> = 0x100..=0x2FF;

bitflags! {
    /// Edge-tracked modifier state, one bit per physical key.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Modifiers: u8 {
        const SHIFT_L = 1 << 0;
        const SHIFT_R = 1 << 1;
        const CTRL_L = 1 << 2;
        const CTRL_R = 1 << 3;
        const ALT_L = 1 << 4;
        const ALT_R = 1 << 5;
        const META = 1 << 6;
    }
}

impl Modifiers {
    pub fn shift(self) -> bool {
        self.intersects(Modifiers::SHIFT_L | Modifiers::SHIFT_R)
    }

    pub fn ctrl(self) -> bool {
        self.intersects(Modifiers::CTRL_L | Modifiers::CTRL_R)
    }

    pub fn alt(self) -> bool {
        self.intersects(Modifiers::ALT_L | Modifiers::ALT_R)
    }

    pub fn meta(self) -> bool {
        self.contains(Modifiers::META)
    }

    /// Apply a key event. Returns true when the code was a modifier.
    pub fn update(&mut self, code: u16, pressed: bool) -> bool {
        let bit = match code {
            KEY_LEFTSHIFT => Modifiers::SHIFT_L,
            KEY_RIGHTSHIFT => Modifiers::SHIFT_R,
            KEY_LEFTCTRL => Modifiers::CTRL_L,
            KEY_RIGHTCTRL => Modifiers::CTRL_R,
            KEY_LEFTALT => Modifiers::ALT_L,
            KEY_RIGHTALT => Modifiers::ALT_R,
            KEY_LEFTMETA | KEY_RIGHTMETA => Modifiers::META,
            _ => return false,
        };
        self.set(bit, pressed);
        true
    }
}

/// A translated key press: either a character (with its unicode value) or a
/// named non-character key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Keysym {
    Char(char),
    Named(NamedKey),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NamedKey {
    Escape,
    Backspace,
    Up,
    Down,
    Left,
    Right,
    PageUp,
    PageDown,
    Home,
    End,
    Insert,
    Delete,
    Function(u8),
}

/// Pointer buttons and touch tool codes never reach the terminal.
pub fn is_button(code: u16) -> bool {
    BTN_RANGE.contains(&code)
}

/// Function key number (1-based) for a code, if the code is an F-key.
pub fn function_key(code: u16) -> Option<u8> {
    match code {
        KEY_F1..=KEY_F10 => Some((code - KEY_F1 + 1) as u8),
        KEY_F11 => Some(11),
        KEY_F12 => Some(12),
        _ => None,
    }
}

/// Top-row action codes remapped to F1..F10 for action-key keyboards, so
/// the VT-switch and brightness hotkeys work without a function modifier.
pub fn remap_action_key(code: u16) -> u16 {
    match code {
        KEY_BACK => KEY_F1,
        KEY_FORWARD => KEY_F1 + 1,
        KEY_REFRESH => KEY_F1 + 2,
        KEY_FULL_SCREEN => KEY_F1 + 3,
        KEY_SCALE => KEY_F1 + 4,
        KEY_BRIGHTNESSDOWN => KEY_F6,
        KEY_BRIGHTNESSUP => KEY_F7,
        KEY_MUTE => KEY_F1 + 7,
        KEY_VOLUMEDOWN => KEY_F1 + 8,
        KEY_VOLUMEUP => KEY_F1 + 9,
        other => other,
    }
}

// [plain, shifted] per code; 0 marks codes with no character. US layout.
#[rustfmt::skip]
static LAYOUT: [[u8; 2]; 128] = {
    let mut table = [[0u8; 2]; 128];
    table[2] = [b'1', b'!'];
    table[3] = [b'2', b'@'];
    table[4] = [b'3', b'#'];
    table[5] = [b'4', b'$'];
    table[6] = [b'5', b'%'];
    table[7] = [b'6', b'^'];
    table[8] = [b'7', b'&'];
    table[9] = [b'8', b'*'];
    table[10] = [b'9', b'('];
    table[11] = [b'0', b')'];
    table[12] = [b'-', b'_'];
    table[13] = [b'=', b'+'];
    table[15] = [b'\t', b'\t'];
    table[16] = [b'q', b'Q'];
    table[17] = [b'w', b'W'];
    table[18] = [b'e', b'E'];
    table[19] = [b'r', b'R'];
    table[20] = [b't', b'T'];
    table[21] = [b'y', b'Y'];
    table[22] = [b'u', b'U'];
    table[23] = [b'i', b'I'];
    table[24] = [b'o', b'O'];
    table[25] = [b'p', b'P'];
    table[26] = [b'[', b'{'];
    table[27] = [b']', b'}'];
    table[28] = [b'\r', b'\r'];
    table[30] = [b'a', b'A'];
    table[31] = [b's', b'S'];
    table[32] = [b'd', b'D'];
    table[33] = [b'f', b'F'];
    table[34] = [b'g', b'G'];
    table[35] = [b'h', b'H'];
    table[36] = [b'j', b'J'];
    table[37] = [b'k', b'K'];
    table[38] = [b'l', b'L'];
    table[39] = [b';', b':'];
    table[40] = [b'\'', b'"'];
    table[41] = [b'`', b'~'];
    table[43] = [b'\\', b'|'];
    table[44] = [b'z', b'Z'];
    table[45] = [b'x', b'X'];
    table[46] = [b'c', b'C'];
    table[47] = [b'v', b'V'];
    table[48] = [b'b', b'B'];
    table[49] = [b'n', b'N'];
    table[50] = [b'm', b'M'];
    table[51] = [b',', b'<'];
    table[52] = [b'.', b'>'];
    table[53] = [b'/', b'?'];
    table[55] = [b'*', b'*'];
    table[57] = [b' ', b' '];
    table[71] = [b'7', b'7'];
    table[72] = [b'8', b'8'];
    table[73] = [b'9', b'9'];
    table[74] = [b'-', b'-'];
    table[75] = [b'4', b'4'];
    table[76] = [b'5', b'5'];
    table[77] = [b'6', b'6'];
    table[78] = [b'+', b'+'];
    table[79] = [b'1', b'1'];
    table[80] = [b'2', b'2'];
    table[81] = [b'3', b'3'];
    table[82] = [b'0', b'0'];
    table[83] = [b'.', b'.'];
    table[96] = [b'\r', b'\r'];
    table[98] = [b'/', b'/'];
    table[117] = [b'=', b'='];
    table
};

/// Translate a non-modifier key code under the current modifier state.
/// Named keys take precedence over the character table; control folds
/// letters onto C0 bytes.
pub fn translate(code: u16, mods: Modifiers) -> Option<Keysym> {
    if is_button(code) {
        return None;
    }

    let named = match code {
        KEY_ESC => Some(NamedKey::Escape),
        KEY_BACKSPACE => Some(NamedKey::Backspace),
        KEY_UP => Some(NamedKey::Up),
        KEY_DOWN => Some(NamedKey::Down),
        KEY_LEFT => Some(NamedKey::Left),
        KEY_RIGHT => Some(NamedKey::Right),
        KEY_PAGEUP => Some(NamedKey::PageUp),
        KEY_PAGEDOWN => Some(NamedKey::PageDown),
        KEY_HOME => Some(NamedKey::Home),
        KEY_END => Some(NamedKey::End),
        KEY_INSERT => Some(NamedKey::Insert),
        KEY_DELETE => Some(NamedKey::Delete),
        _ => function_key(code).map(NamedKey::Function),
    };
    if let Some(named) = named {
        return Some(Keysym::Named(named));
    }

    let byte = *LAYOUT.get(code as usize)?.get(mods.shift() as usize)?;
    if byte == 0 {
        return None;
    }

    if mods.ctrl() && byte.is_ascii_alphabetic() {
        return Some(Keysym::Char((byte.to_ascii_lowercase() - b'a' + 1) as char));
    }

    Some(Keysym::Char(byte as char))
}

/// Encode a key press into the bytes written to the PTY master. Alt
/// prefixes character keys with ESC, the xterm convention.
pub fn encode(keysym: Keysym, mods: Modifiers, out: &mut Vec<u8>) {
    match keysym {
        Keysym::Char(c) => {
            if mods.alt() {
                out.push(0x1B);
            }
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
        Keysym::Named(named) => {
            match named {
                NamedKey::Escape => out.push(0x1B),
                NamedKey::Backspace => out.push(0x7F),
                NamedKey::Up => out.extend_from_slice(b"\x1b[A"),
                NamedKey::Down => out.extend_from_slice(b"\x1b[B"),
                NamedKey::Right => out.extend_from_slice(b"\x1b[C"),
                NamedKey::Left => out.extend_from_slice(b"\x1b[D"),
                NamedKey::Home => out.extend_from_slice(b"\x1b[H"),
                NamedKey::End => out.extend_from_slice(b"\x1b[F"),
                NamedKey::Insert => out.extend_from_slice(b"\x1b[2~"),
                NamedKey::Delete => out.extend_from_slice(b"\x1b[3~"),
                NamedKey::PageUp => out.extend_from_slice(b"\x1b[5~"),
                NamedKey::PageDown => out.extend_from_slice(b"\x1b[6~"),
                NamedKey::Function(n) => match n {
                    1 => out.extend_from_slice(b"\x1bOP"),
                    2 => out.extend_from_slice(b"\x1bOQ"),
                    3 => out.extend_from_slice(b"\x1bOR"),
                    4 => out.extend_from_slice(b"\x1bOS"),
                    5 => out.extend_from_slice(b"\x1b[15~"),
                    6 => out.extend_from_slice(b"\x1b[17~"),
                    7 => out.extend_from_slice(b"\x1b[18~"),
                    8 => out.extend_from_slice(b"\x1b[19~"),
                    9 => out.extend_from_slice(b"\x1b[20~"),
                    10 => out.extend_from_slice(b"\x1b[21~"),
                    11 => out.extend_from_slice(b"\x1b[23~"),
                    _ => out.extend_from_slice(b"\x1b[24~"),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_edges() {
        let mut mods = Modifiers::default();
        assert!(mods.update(KEY_LEFTSHIFT, true));
        assert!(mods.shift());
        assert!(mods.update(KEY_RIGHTSHIFT, true));
        assert!(mods.update(KEY_LEFTSHIFT, false));
        assert!(mods.shift(), "either side keeps shift held");
        assert!(mods.update(KEY_RIGHTSHIFT, false));
        assert!(!mods.shift());
        assert!(!mods.update(KEY_ENTER, true));
    }

    #[test]
    fn plain_and_shifted_table() {
        assert_eq!(translate(30, Modifiers::default()), Some(Keysym::Char('a')));
        assert_eq!(
            translate(30, Modifiers::SHIFT_L),
            Some(Keysym::Char('A'))
        );
        assert_eq!(translate(3, Modifiers::SHIFT_R), Some(Keysym::Char('@')));
    }

    #[test]
    fn control_folds_to_c0() {
        assert_eq!(
            translate(46, Modifiers::CTRL_L),
            Some(Keysym::Char('\u{3}'))
        );
        // Shift+Ctrl folds the same way (tolower first).
        assert_eq!(
            translate(46, Modifiers::CTRL_L | Modifiers::SHIFT_L),
            Some(Keysym::Char('\u{3}'))
        );
    }

    #[test]
    fn named_keys_win_over_table() {
        assert_eq!(
            translate(KEY_DELETE, Modifiers::SHIFT_L),
            Some(Keysym::Named(NamedKey::Delete))
        );
        assert_eq!(
            translate(KEY_F1, Modifiers::default()),
            Some(Keysym::Named(NamedKey::Function(1)))
        );
    }

    #[test]
    fn buttons_are_dropped() {
        assert_eq!(translate(0x110, Modifiers::default()), None);
        assert_eq!(translate(0x14A, Modifiers::default()), None);
    }

    #[test]
    fn action_key_remap() {
        assert_eq!(remap_action_key(KEY_BACK), KEY_F1);
        assert_eq!(remap_action_key(KEY_BRIGHTNESSUP), KEY_F7);
        assert_eq!(remap_action_key(KEY_VOLUMEUP), KEY_F1 + 9);
        assert_eq!(remap_action_key(30), 30);
    }

    #[test]
    fn encoder_sequences() {
        let mut out = Vec::new();
        encode(Keysym::Named(NamedKey::Up), Modifiers::default(), &mut out);
        assert_eq!(out, b"\x1b[A");

        out.clear();
        encode(Keysym::Named(NamedKey::Function(7)), Modifiers::default(), &mut out);
        assert_eq!(out, b"\x1b[18~");

        out.clear();
        encode(Keysym::Char('x'), Modifiers::ALT_L, &mut out);
        assert_eq!(out, b"\x1bx");

        out.clear();
        encode(Keysym::Char('é'), Modifiers::default(), &mut out);
        assert_eq!(out, "é".as_bytes());
    }
}
