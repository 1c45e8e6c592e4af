//! デバッグ対象（ターゲット）

use crate::process::Process;
use std::fmt;

/// ターゲットの識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TargetId(pub u32);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target {}", self.0)
    }
}

/// ターゲットの状態
#[derive(Debug, Default)]
pub enum TargetState {
    /// プロセスなし
    #[default]
    None,
    /// 起動要求の応答待ち
    Starting,
    /// アタッチ要求の応答待ち
    Attaching,
    Running(Process),
}

#[derive(Debug)]
pub struct Target {
    id: TargetId,
    pub(crate) state: TargetState,
}

impl Target {
    pub(crate) fn new(id: TargetId) -> Self {
        Self { id, state: TargetState::None }
    }

    pub fn id(&self) -> TargetId {
        self.id
    }

    pub fn state(&self) -> &TargetState {
        &self.state
    }

    pub fn process(&self) -> Option<&Process> {
        match &self.state {
            TargetState::Running(process) => Some(process),
            _ => None,
        }
    }

    pub(crate) fn process_mut(&mut self) -> Option<&mut Process> {
        match &mut self.state {
            TargetState::Running(process) => Some(process),
            _ => None,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, TargetState::None)
    }
}
