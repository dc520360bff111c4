//! Device key codes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A key code as understood by the device input service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyCode(pub i32);

impl KeyCode {
    pub const HOME: KeyCode = KeyCode(1);
    pub const BACK: KeyCode = KeyCode(2);
    pub const SEARCH: KeyCode = KeyCode(9);
    pub const MEDIA_PLAY_PAUSE: KeyCode = KeyCode(10);
    pub const VOLUME_UP: KeyCode = KeyCode(16);
    pub const VOLUME_DOWN: KeyCode = KeyCode(17);
    pub const POWER: KeyCode = KeyCode(18);
    pub const CAMERA: KeyCode = KeyCode(19);
    pub const VOLUME_MUTE: KeyCode = KeyCode(22);

    pub const DIGIT_0: KeyCode = KeyCode(2000);
    pub const LETTER_A: KeyCode = KeyCode(2017);

    pub const DPAD_UP: KeyCode = KeyCode(2012);
    pub const DPAD_DOWN: KeyCode = KeyCode(2013);
    pub const DPAD_LEFT: KeyCode = KeyCode(2014);
    pub const DPAD_RIGHT: KeyCode = KeyCode(2015);
    pub const DPAD_CENTER: KeyCode = KeyCode(2016);

    pub const ALT_LEFT: KeyCode = KeyCode(2045);
    pub const ALT_RIGHT: KeyCode = KeyCode(2046);
    pub const SHIFT_LEFT: KeyCode = KeyCode(2047);
    pub const SHIFT_RIGHT: KeyCode = KeyCode(2048);
    pub const TAB: KeyCode = KeyCode(2049);
    pub const SPACE: KeyCode = KeyCode(2050);
    pub const ENTER: KeyCode = KeyCode(2054);
    pub const DEL: KeyCode = KeyCode(2055);
    pub const MENU: KeyCode = KeyCode(2067);
    pub const PAGE_UP: KeyCode = KeyCode(2068);
    pub const PAGE_DOWN: KeyCode = KeyCode(2069);
    pub const ESCAPE: KeyCode = KeyCode(2070);
    pub const FORWARD_DEL: KeyCode = KeyCode(2071);
    pub const CTRL_LEFT: KeyCode = KeyCode(2072);
    pub const CTRL_RIGHT: KeyCode = KeyCode(2073);
    pub const MOVE_HOME: KeyCode = KeyCode(2081);
    pub const MOVE_END: KeyCode = KeyCode(2082);

    const NAMED: &'static [(&'static str, KeyCode)] = &[
        ("home", Self::HOME),
        ("back", Self::BACK),
        ("search", Self::SEARCH),
        ("play_pause", Self::MEDIA_PLAY_PAUSE),
        ("volume_up", Self::VOLUME_UP),
        ("volume_down", Self::VOLUME_DOWN),
        ("power", Self::POWER),
        ("camera", Self::CAMERA),
        ("mute", Self::VOLUME_MUTE),
        ("up", Self::DPAD_UP),
        ("down", Self::DPAD_DOWN),
        ("left", Self::DPAD_LEFT),
        ("right", Self::DPAD_RIGHT),
        ("center", Self::DPAD_CENTER),
        ("alt", Self::ALT_LEFT),
        ("shift", Self::SHIFT_LEFT),
        ("tab", Self::TAB),
        ("space", Self::SPACE),
        ("enter", Self::ENTER),
        ("delete", Self::DEL),
        ("menu", Self::MENU),
        ("page_up", Self::PAGE_UP),
        ("page_down", Self::PAGE_DOWN),
        ("escape", Self::ESCAPE),
        ("forward_delete", Self::FORWARD_DEL),
        ("ctrl", Self::CTRL_LEFT),
        ("move_home", Self::MOVE_HOME),
        ("move_end", Self::MOVE_END),
    ];

    /// Key for an ASCII letter, case-insensitive.
    pub fn letter(c: char) -> Option<KeyCode> {
        c.is_ascii_alphabetic()
            .then(|| KeyCode(Self::LETTER_A.0 + (c.to_ascii_lowercase() as i32 - 'a' as i32)))
    }

    /// Key for an ASCII digit.
    pub fn digit(c: char) -> Option<KeyCode> {
        c.to_digit(10).map(|d| KeyCode(Self::DIGIT_0.0 + d as i32))
    }

    /// Look up a key by name (`home`, `volume_up`, `a`, `7`) or raw number.
    pub fn from_name(name: &str) -> Option<KeyCode> {
        let lower = name.trim().to_ascii_lowercase();
        if let Some((_, code)) = Self::NAMED.iter().find(|(n, _)| *n == lower) {
            return Some(*code);
        }
        let mut chars = lower.chars();
        if let (Some(c), None) = (chars.next(), chars.next()) {
            if let Some(code) = Self::letter(c).or_else(|| Self::digit(c)) {
                return Some(code);
            }
        }
        lower.parse::<i32>().ok().map(KeyCode)
    }
}

impl fmt::Display for KeyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_keys() {
        assert_eq!(KeyCode::from_name("home"), Some(KeyCode::HOME));
        assert_eq!(KeyCode::from_name("Volume_Up"), Some(KeyCode::VOLUME_UP));
        assert_eq!(KeyCode::from_name("nope"), None);
    }

    #[test]
    fn letters_and_digits() {
        assert_eq!(KeyCode::from_name("a"), Some(KeyCode(2017)));
        assert_eq!(KeyCode::from_name("Z"), Some(KeyCode(2042)));
        assert_eq!(KeyCode::from_name("7"), Some(KeyCode(2007)));
        assert_eq!(KeyCode::letter('!'), None);
    }

    #[test]
    fn raw_numbers() {
        assert_eq!(KeyCode::from_name("2054"), Some(KeyCode::ENTER));
    }
}
