//! Menu state machine driven by key codes

use evdev::Key;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info};

/// What a menu entry does when invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    GraphicsTest,
    RotateDisplay,
    BlankDisplay,
    ShowKeys,
    Exit,
}

const MENU: [(&str, MenuAction); 5] = [
    ("Run graphics test", MenuAction::GraphicsTest),
    ("Rotate display", MenuAction::RotateDisplay),
    ("Blank display for a moment", MenuAction::BlankDisplay),
    ("Show held keys", MenuAction::ShowKeys),
    ("Exit", MenuAction::Exit),
];

/// Meaning of a key press while the menu is up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    None,
    HighlightUp,
    HighlightDown,
    Invoke,
    GoHome,
    GoBack,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppState {
    Menu,
    /// An action was picked and waits for the main loop to run it
    Pending(MenuAction),
    Exit,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppState::Menu => write!(f, "Menu"),
            AppState::Pending(action) => write!(f, "Pending({action:?})"),
            AppState::Exit => write!(f, "Exit"),
        }
    }
}

pub struct App {
    state: AppState,
    highlight: usize,
    /// Up, down and select are all available, so other keys do nothing
    three_buttons: bool,
    log_lines: VecDeque<String>,
    max_log_lines: usize,
}

impl App {
    pub fn new() -> Self {
        Self {
            state: AppState::Menu,
            highlight: 0,
            three_buttons: false,
            log_lines: VecDeque::new(),
            max_log_lines: 8,
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn should_exit(&self) -> bool {
        self.state == AppState::Exit
    }

    pub fn highlight(&self) -> usize {
        self.highlight
    }

    pub fn menu_items(&self) -> impl Iterator<Item = &'static str> {
        MENU.iter().map(|(label, _)| *label)
    }

    /// Record which keys the input devices can produce
    pub fn set_available_keys(&mut self, keys: &[u16]) {
        let has = |candidates: &[Key]| candidates.iter().any(|k| keys.contains(&k.code()));
        self.three_buttons = has(&[Key::KEY_UP, Key::KEY_VOLUMEUP])
            && has(&[Key::KEY_DOWN, Key::KEY_VOLUMEDOWN])
            && has(&[Key::KEY_ENTER, Key::KEY_POWER]);
        debug!("Three-button navigation: {}", self.three_buttons);
    }

    pub fn classify_key(&self, key: Key) -> KeyAction {
        match key {
            Key::KEY_RIGHTSHIFT | Key::KEY_DOWN | Key::KEY_VOLUMEDOWN | Key::KEY_MENU => {
                KeyAction::HighlightDown
            }
            Key::KEY_UP | Key::KEY_VOLUMEUP | Key::KEY_SEARCH => KeyAction::HighlightUp,
            Key::KEY_ENTER | Key::KEY_POWER | Key::BTN_LEFT | Key::KEY_SEND => KeyAction::Invoke,
            Key::KEY_HOME | Key::KEY_HOMEPAGE => KeyAction::GoHome,
            Key::KEY_BACKSPACE | Key::KEY_BACK => KeyAction::GoBack,
            _ if self.three_buttons => KeyAction::None,
            // Without a full set of navigation keys any key cycles.
            _ => KeyAction::HighlightDown,
        }
    }

    /// Handle a key event. `value` is 1 on press, 0 on release, 2 on repeat.
    pub fn handle_key(&mut self, key: Key, value: i32) {
        if value == 0 || self.state != AppState::Menu {
            return;
        }

        if key == Key::KEY_Q {
            info!("Exit requested from keyboard");
            self.transition_to(AppState::Exit);
            return;
        }

        match self.classify_key(key) {
            KeyAction::HighlightUp => {
                self.highlight = self.highlight.checked_sub(1).unwrap_or(MENU.len() - 1);
            }
            KeyAction::HighlightDown => {
                self.highlight = (self.highlight + 1) % MENU.len();
            }
            KeyAction::Invoke if value == 1 => {
                let (label, action) = MENU[self.highlight];
                info!("Menu item selected: {}", label);
                let next = match action {
                    MenuAction::Exit => AppState::Exit,
                    other => AppState::Pending(other),
                };
                self.transition_to(next);
            }
            KeyAction::GoHome | KeyAction::GoBack => self.highlight = 0,
            KeyAction::Invoke | KeyAction::None => {}
        }
    }

    /// Take the pending action, returning to the menu
    pub fn take_pending(&mut self) -> Option<MenuAction> {
        match self.state {
            AppState::Pending(action) => {
                self.transition_to(AppState::Menu);
                Some(action)
            }
            _ => None,
        }
    }

    fn transition_to(&mut self, new_state: AppState) {
        info!("State transition: {} -> {}", self.state, new_state);
        self.state = new_state;
    }

    /// Append one status line shown under the menu
    pub fn log_step(&mut self, line: impl Into<String>) {
        self.log_lines.push_back(line.into());
        while self.log_lines.len() > self.max_log_lines {
            self.log_lines.pop_front();
        }
    }

    pub fn status_lines(&self, width: usize) -> Vec<String> {
        self.log_lines
            .iter()
            .flat_map(|line| wrap_for_ui(line, width, "", "  "))
            .collect()
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

fn wrap_for_ui(text: &str, width: usize, first_prefix: &str, next_prefix: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut remaining = text.trim();

    let mut is_first = true;
    while !remaining.is_empty() {
        let prefix = if is_first { first_prefix } else { next_prefix };
        let avail = width.saturating_sub(prefix.len()).max(10);

        if remaining.len() <= avail {
            out.push(format!("{}{}", prefix, remaining));
            break;
        }

        // Prefer breaking on whitespace.
        let mut split_at = floor_char_boundary(remaining, avail);
        if let Some(idx) = remaining[..split_at].rfind(char::is_whitespace) {
            if idx > 0 {
                split_at = idx;
            }
        }

        let (head, tail) = remaining.split_at(split_at);
        out.push(format!("{}{}", prefix, head.trim_end()));
        remaining = tail.trim_start();
        is_first = false;
    }

    out
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn press(app: &mut App, key: Key) {
        app.handle_key(key, 1);
    }

    #[test]
    fn highlight_wraps_both_ways() {
        let mut app = App::new();
        press(&mut app, Key::KEY_UP);
        assert_eq!(app.highlight(), MENU.len() - 1);
        press(&mut app, Key::KEY_DOWN);
        assert_eq!(app.highlight(), 0);
        press(&mut app, Key::KEY_VOLUMEDOWN);
        assert_eq!(app.highlight(), 1);
        press(&mut app, Key::KEY_HOME);
        assert_eq!(app.highlight(), 0);
    }

    #[test]
    fn releases_are_ignored() {
        let mut app = App::new();
        app.handle_key(Key::KEY_DOWN, 0);
        assert_eq!(app.highlight(), 0);
    }

    #[test]
    fn invoke_queues_action_until_taken() {
        let mut app = App::new();
        press(&mut app, Key::KEY_DOWN);
        press(&mut app, Key::KEY_ENTER);
        assert_eq!(app.state(), &AppState::Pending(MenuAction::RotateDisplay));

        // Input is ignored while an action is pending.
        press(&mut app, Key::KEY_DOWN);
        assert_eq!(app.take_pending(), Some(MenuAction::RotateDisplay));
        assert_eq!(app.state(), &AppState::Menu);
        assert_eq!(app.take_pending(), None);
    }

    #[test]
    fn exit_entry_and_q_quit() {
        let mut app = App::new();
        press(&mut app, Key::KEY_UP);
        press(&mut app, Key::KEY_POWER);
        assert!(app.should_exit());

        let mut app = App::new();
        press(&mut app, Key::KEY_Q);
        assert!(app.should_exit());
    }

    #[test]
    fn unknown_keys_cycle_only_without_three_buttons() {
        let mut app = App::new();
        assert_eq!(app.classify_key(Key::KEY_A), KeyAction::HighlightDown);

        app.set_available_keys(&[
            Key::KEY_VOLUMEUP.code(),
            Key::KEY_VOLUMEDOWN.code(),
            Key::KEY_POWER.code(),
        ]);
        assert_eq!(app.classify_key(Key::KEY_A), KeyAction::None);
    }

    #[test]
    fn status_lines_wrap_and_scroll() {
        let mut app = App::new();
        for i in 0..20 {
            app.log_step(format!("step {i}"));
        }
        let lines = app.status_lines(40);
        assert_eq!(lines.len(), 8);
        assert_eq!(lines[0], "step 12");

        let wrapped = wrap_for_ui("alpha beta gamma delta epsilon", 12, "", "  ");
        assert_eq!(wrapped, vec!["alpha beta", "  gamma", "  delta", "  epsilon"]);
    }
}
