//! 按键控制
//!
//! 传输循环每个 period 轮询一次按键（超时 1 ms）：暂停键切换暂停状态，
//! 停止键结束流。终端按键通过 crossterm 在 raw mode 下读取。

use std::io;
use std::time::Duration;

use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};

/// 按键来源
pub trait KeySource: Send {
    /// 在 `timeout` 内等待一次按键，返回按键名
    fn poll_key(&mut self, timeout: Duration) -> Option<String>;
}

/// 按键动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    TogglePause,
    Stop,
}

/// 按键绑定（大小写不敏感）
#[derive(Debug, Clone, Default)]
pub struct KeyBindings {
    pub pause: Vec<String>,
    pub stop: Vec<String>,
}

impl KeyBindings {
    pub fn new(pause: Vec<String>, stop: Vec<String>) -> Self {
        Self { pause, stop }
    }

    pub fn is_empty(&self) -> bool {
        self.pause.is_empty() && self.stop.is_empty()
    }

    pub fn action(&self, key: &str) -> Option<KeyAction> {
        let matches = |list: &[String]| list.iter().any(|k| k.eq_ignore_ascii_case(key));
        if matches(&self.stop) {
            Some(KeyAction::Stop)
        } else if matches(&self.pause) {
            Some(KeyAction::TogglePause)
        } else {
            None
        }
    }
}

/// 一次按键记录
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPress {
    pub key: String,
    /// 主机时钟毫秒
    pub time_ms: f64,
}

/// 终端 raw mode RAII 守卫
pub struct RawModeGuard;

impl RawModeGuard {
    /// 进入 raw mode，离开作用域自动恢复
    pub fn enter() -> io::Result<Self> {
        crossterm::terminal::enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = crossterm::terminal::disable_raw_mode() {
            log::warn!("Failed to restore terminal mode: {}", e);
        }
    }
}

/// 从终端读取按键
pub struct TerminalKeys {
    _raw: RawModeGuard,
}

impl TerminalKeys {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            _raw: RawModeGuard::enter()?,
        })
    }
}

impl KeySource for TerminalKeys {
    fn poll_key(&mut self, timeout: Duration) -> Option<String> {
        match event::poll(timeout) {
            Ok(true) => match event::read() {
                Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => key_name(&key),
                _ => None,
            },
            _ => None,
        }
    }
}

/// 按键名：字符按原样，特殊键用小写名字，Ctrl 组合为 `ctrl+x`
pub fn key_name(key: &KeyEvent) -> Option<String> {
    let name = match key.code {
        KeyCode::Char(' ') => "space".to_string(),
        KeyCode::Char(c) if key.modifiers.contains(KeyModifiers::CONTROL) => {
            format!("ctrl+{}", c.to_ascii_lowercase())
        }
        KeyCode::Char(c) => c.to_string(),
        KeyCode::Enter => "return".to_string(),
        KeyCode::Esc => "escape".to_string(),
        KeyCode::Tab => "tab".to_string(),
        KeyCode::Backspace => "backspace".to_string(),
        KeyCode::Up => "up".to_string(),
        KeyCode::Down => "down".to_string(),
        KeyCode::Left => "left".to_string(),
        KeyCode::Right => "right".to_string(),
        KeyCode::F(n) => format!("f{}", n),
        _ => return None,
    };
    Some(name)
}

/// 按预定时间表产生按键
#[cfg(test)]
pub(crate) struct ScriptedKeys {
    start: std::time::Instant,
    events: std::collections::VecDeque<(Duration, String)>,
}

#[cfg(test)]
impl ScriptedKeys {
    /// `events`: (相对创建时刻的毫秒数, 按键名)
    pub(crate) fn new(events: &[(u64, &str)]) -> Self {
        Self {
            start: std::time::Instant::now(),
            events: events
                .iter()
                .map(|&(ms, key)| (Duration::from_millis(ms), key.to_string()))
                .collect(),
        }
    }
}

#[cfg(test)]
impl KeySource for ScriptedKeys {
    fn poll_key(&mut self, timeout: Duration) -> Option<String> {
        let (due, _) = self.events.front()?;
        let elapsed = self.start.elapsed();
        if *due <= elapsed {
            return self.events.pop_front().map(|(_, key)| key);
        }
        std::thread::sleep(timeout.min(*due - elapsed));
        None
    }
}
