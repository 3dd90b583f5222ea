//! Key bindings and the key-to-controller-state translation.

use super::{Key, KeyEvent};
use crate::transport::{Button, ControllerState, Hat};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HatDirection {
    Up,
    Down,
    Left,
    Right,
}

/// Key name → controller input. Key names are lowercase, see [`Key`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct KeyMap {
    pub buttons: BTreeMap<String, Button>,
    pub hat: BTreeMap<String, HatDirection>,
}

impl Default for KeyMap {
    fn default() -> Self {
        let buttons = [
            ("y", Button::Y),
            ("b", Button::B),
            ("a", Button::A),
            ("x", Button::X),
            ("l", Button::L),
            ("r", Button::R),
            ("k", Button::Zl),
            ("e", Button::Zr),
            ("m", Button::Minus),
            ("p", Button::Plus),
            ("q", Button::LClick),
            ("w", Button::RClick),
            ("h", Button::Home),
            ("c", Button::Capture),
        ];
        let hat = [
            ("up", HatDirection::Up),
            ("down", HatDirection::Down),
            ("left", HatDirection::Left),
            ("right", HatDirection::Right),
        ];

        Self {
            buttons: buttons
                .into_iter()
                .map(|(k, b)| (k.to_string(), b))
                .collect(),
            hat: hat.into_iter().map(|(k, d)| (k.to_string(), d)).collect(),
        }
    }
}

impl KeyMap {
    pub fn button(&self, key: &Key) -> Option<Button> {
        self.buttons.get(key.name()).copied()
    }

    pub fn hat_direction(&self, key: &Key) -> Option<HatDirection> {
        self.hat.get(key.name()).copied()
    }
}

/// Tracks held keys and produces the resulting controller state.
#[derive(Debug, Clone, Default)]
pub struct KeyState {
    state: ControllerState,
    directions: BTreeSet<HatDirection>,
}

impl KeyState {
    /// Applies one event. Returns the new state if anything changed.
    pub fn apply(&mut self, keymap: &KeyMap, event: &KeyEvent) -> Option<ControllerState> {
        let before = self.state;

        if let Some(button) = keymap.button(&event.key) {
            if event.pressed {
                self.state.press(button);
            } else {
                self.state.release(button);
            }
        } else if let Some(direction) = keymap.hat_direction(&event.key) {
            if event.pressed {
                self.directions.insert(direction);
            } else {
                self.directions.remove(&direction);
            }
            self.state.hat = hat_for(&self.directions);
        }

        (self.state != before).then_some(self.state)
    }
}

fn hat_for(directions: &BTreeSet<HatDirection>) -> Hat {
    use HatDirection::*;

    let up = directions.contains(&Up) && !directions.contains(&Down);
    let down = directions.contains(&Down) && !directions.contains(&Up);
    let left = directions.contains(&Left) && !directions.contains(&Right);
    let right = directions.contains(&Right) && !directions.contains(&Left);

    match (up, down, left, right) {
        (true, _, true, _) => Hat::TopLeft,
        (true, _, _, true) => Hat::TopRight,
        (_, true, true, _) => Hat::BottomLeft,
        (_, true, _, true) => Hat::BottomRight,
        (true, ..) => Hat::Top,
        (_, true, ..) => Hat::Bottom,
        (_, _, true, _) => Hat::Left,
        (_, _, _, true) => Hat::Right,
        _ => Hat::Center,
    }
}
