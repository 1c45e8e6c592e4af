//! エージェントの設定

/// `AgentConfig::max_backtrace_frames` の既定値
pub const DEFAULT_MAX_BACKTRACE_FRAMES: usize = 256;

/// エージェントの設定
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Backtrace要求で返す最大フレーム数
    pub max_backtrace_frames: usize,
}

impl AgentConfig {
    pub fn new() -> Self {
        Self { max_backtrace_frames: DEFAULT_MAX_BACKTRACE_FRAMES }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self::new()
    }
}
