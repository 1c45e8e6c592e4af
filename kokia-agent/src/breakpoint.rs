//! エージェント側の論理ブレークポイント

use kokia_wire::{BreakpointSettings, BreakpointStats, ProcessBreakpointSettings, Stop};

/// クライアントが設定したブレークポイント
///
/// 実際の命令の書き換えは各プロセスの `ProcessBreakpoints` が担当し、
/// ここでは設定とヒット回数だけを保持します。
#[derive(Debug, Clone)]
pub struct Breakpoint {
    settings: BreakpointSettings,
    hit_count: u32,
}

impl Breakpoint {
    pub fn new(settings: BreakpointSettings) -> Self {
        Self { settings, hit_count: 0 }
    }

    pub fn id(&self) -> u32 {
        self.settings.breakpoint_id
    }

    pub fn stop(&self) -> Stop {
        self.settings.stop
    }

    pub fn settings(&self) -> &BreakpointSettings {
        &self.settings
    }

    pub fn locations(&self) -> &[ProcessBreakpointSettings] {
        &self.settings.locations
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    /// 設定を置き換える（ヒット回数は引き継ぐ）
    pub fn set_settings(&mut self, settings: BreakpointSettings) {
        self.settings = settings;
    }

    /// ヒットを記録して統計を返す
    pub fn on_hit(&mut self) -> BreakpointStats {
        self.hit_count += 1;
        BreakpointStats {
            breakpoint_id: self.id(),
            hit_count: self.hit_count,
            should_delete: self.settings.one_shot,
        }
    }
}

/// 複数のブレークポイントのうち最も広い停止範囲
pub fn strongest_stop(stops: impl IntoIterator<Item = Stop>) -> Option<Stop> {
    // All < Process < Thread の順に広い
    stops.into_iter().min()
}
