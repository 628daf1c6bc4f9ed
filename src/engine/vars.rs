//! 宿主可见变量
//!
//! 引擎把 onset/offset 时间戳、文件时长、按键记录等写回宿主程序。
//! 播放和录音控制器可以共享同一个实例。

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum VarValue {
    Number(f64),
    Text(String),
}

impl std::fmt::Display for VarValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(v) => write!(f, "{}", v),
            Self::Text(s) => write!(f, "{}", s),
        }
    }
}

/// 共享变量表
#[derive(Debug, Clone, Default)]
pub struct HostVars {
    inner: Arc<Mutex<BTreeMap<String, VarValue>>>,
}

impl HostVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_number(&self, name: impl Into<String>, value: f64) {
        self.inner.lock().insert(name.into(), VarValue::Number(value));
    }

    pub fn set_text(&self, name: impl Into<String>, value: impl Into<String>) {
        self.inner
            .lock()
            .insert(name.into(), VarValue::Text(value.into()));
    }

    /// 在文本变量末尾追加 `item;`
    pub fn append_item(&self, name: &str, item: &str) {
        let mut vars = self.inner.lock();
        let entry = vars
            .entry(name.to_string())
            .or_insert_with(|| VarValue::Text(String::new()));
        match entry {
            VarValue::Text(text) => {
                text.push_str(item);
                text.push(';');
            }
            other => *other = VarValue::Text(format!("{};", item)),
        }
    }

    pub fn get(&self, name: &str) -> Option<VarValue> {
        self.inner.lock().get(name).cloned()
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.get(name) {
            Some(VarValue::Number(v)) => Some(v),
            _ => None,
        }
    }

    pub fn text(&self, name: &str) -> Option<String> {
        match self.get(name) {
            Some(VarValue::Text(s)) => Some(s),
            _ => None,
        }
    }

    /// 当前所有变量的副本
    pub fn snapshot(&self) -> BTreeMap<String, VarValue> {
        self.inner.lock().clone()
    }
}

/// onset 时间戳变量名
pub fn onset_var(name: &str) -> String {
    format!("time_stimulus_onset_{}", name)
}

/// offset 时间戳变量名
pub fn offset_var(name: &str) -> String {
    format!("time_stimulus_offset_{}", name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let vars = HostVars::new();
        vars.set_number(onset_var("beep"), 12.5);
        vars.set_text("file", "a.wav");

        assert_eq!(vars.number("time_stimulus_onset_beep"), Some(12.5));
        assert_eq!(vars.text("file").as_deref(), Some("a.wav"));
        assert_eq!(vars.number("file"), None);
    }

    #[test]
    fn test_append_item() {
        let vars = HostVars::new();
        vars.append_item("keys", "space");
        vars.append_item("keys", "q");
        assert_eq!(vars.text("keys").as_deref(), Some("space;q;"));

        vars.set_number("n", 1.0);
        vars.append_item("n", "x");
        assert_eq!(vars.text("n").as_deref(), Some("x;"));
    }

    #[test]
    fn test_shared_between_clones() {
        let vars = HostVars::new();
        let other = vars.clone();
        other.set_number("x", 3.0);
        assert_eq!(vars.snapshot().len(), 1);
        assert_eq!(vars.get("x"), Some(VarValue::Number(3.0)));
    }
}
