//! クライアントの設定

use kokia_wire::{Arch, PROTOCOL_VERSION};

/// セッションの設定
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hello で要求するプロトコルバージョン
    pub expected_version: u32,
    /// 接続を受け入れるエージェントのアーキテクチャ
    pub accepted_arches: Vec<Arch>,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self {
            expected_version: PROTOCOL_VERSION,
            accepted_arches: vec![Arch::X64, Arch::Arm64],
        }
    }

    pub fn accepts(&self, arch: Arch) -> bool {
        arch != Arch::Unknown && self.accepted_arches.contains(&arch)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}
