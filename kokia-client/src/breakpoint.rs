//! クライアント側のブレークポイント

use crate::error::{Error, Result};
use crate::message_loop::MessageLoop;
use crate::target::TargetId;
use kokia_wire::{LocationError, ProcessBreakpointSettings, Stop};
use tracing::debug;

/// スコープの種類（`set_scope` の引数）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    System,
    Target,
    Thread,
}

/// ブレークポイントが適用される範囲
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointScope {
    /// シンボルが一致するすべてのプロセス
    System,
    Target(TargetId),
    /// ターゲットの1スレッド（スレッドkoid）
    Thread(TargetId, u64),
}

impl BreakpointScope {
    pub fn target(&self) -> Option<TargetId> {
        match *self {
            BreakpointScope::System => None,
            BreakpointScope::Target(target) | BreakpointScope::Thread(target, _) => Some(target),
        }
    }

    pub fn thread_koid(&self) -> Option<u64> {
        match *self {
            BreakpointScope::Thread(_, thread) => Some(thread),
            _ => None,
        }
    }
}

/// ユーザーが指定した位置
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum InputLocation {
    #[default]
    None,
    Address(u64),
    /// 関数名（プロセスごとにシンボルから解決する）
    Symbol(String),
}

/// ブレークポイント
///
/// 作成直後は無効でロケーションもありません。設定を変えてから有効にすると
/// エージェントに送られます。
#[derive(Debug, Clone)]
pub struct Breakpoint {
    id: u32,
    scope: BreakpointScope,
    stop_mode: Stop,
    location: InputLocation,
    pub(crate) enabled: bool,
    one_shot: bool,
    is_internal: bool,
    pub(crate) hit_count: u32,
    /// エージェントに適用されているロケーション
    pub(crate) installed: Vec<ProcessBreakpointSettings>,
    /// 追加要求を送ってから削除要求を送っていない（応答待ちを含む）
    pub(crate) on_agent: bool,
    /// 直近の追加で適用できなかったロケーション
    pub(crate) location_errors: Vec<LocationError>,
}

impl Breakpoint {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            scope: BreakpointScope::System,
            stop_mode: Stop::All,
            location: InputLocation::None,
            enabled: false,
            one_shot: false,
            is_internal: false,
            hit_count: 0,
            installed: Vec::new(),
            on_agent: false,
            location_errors: Vec::new(),
        }
    }

    /// コントローラが置く内部ブレークポイント（指定スレッドのみ停止）
    pub(crate) fn new_internal(id: u32, target: TargetId, thread_koid: u64, address: u64) -> Self {
        Self {
            scope: BreakpointScope::Thread(target, thread_koid),
            stop_mode: Stop::Thread,
            location: InputLocation::Address(address),
            enabled: true,
            is_internal: true,
            ..Self::new(id)
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn scope(&self) -> BreakpointScope {
        self.scope
    }

    pub fn stop_mode(&self) -> Stop {
        self.stop_mode
    }

    pub fn location(&self) -> &InputLocation {
        &self.location
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_one_shot(&self) -> bool {
        self.one_shot
    }

    pub fn is_internal(&self) -> bool {
        self.is_internal
    }

    pub fn hit_count(&self) -> u32 {
        self.hit_count
    }

    pub fn installed_locations(&self) -> &[ProcessBreakpointSettings] {
        &self.installed
    }

    pub fn location_errors(&self) -> &[LocationError] {
        &self.location_errors
    }

    /// スコープを設定する
    ///
    /// System はターゲットもスレッドも取らず、Target はターゲットだけ、
    /// Thread は両方を必要とします。
    pub fn set_scope(
        &mut self,
        kind: ScopeKind,
        target: Option<TargetId>,
        thread: Option<u64>,
    ) -> Result<()> {
        let scope = match (kind, target, thread) {
            (ScopeKind::System, None, None) => {
                if matches!(self.location, InputLocation::Address(_)) {
                    return Err(Error::InvalidScope("system scope cannot use an address location"));
                }
                BreakpointScope::System
            }
            (ScopeKind::System, _, _) => {
                return Err(Error::InvalidScope("system scope takes no target or thread"))
            }
            (ScopeKind::Target, Some(target), None) => BreakpointScope::Target(target),
            (ScopeKind::Target, None, _) => {
                return Err(Error::InvalidScope("target scope requires a target"))
            }
            (ScopeKind::Target, Some(_), Some(_)) => {
                return Err(Error::InvalidScope("target scope takes no thread"))
            }
            (ScopeKind::Thread, Some(target), Some(thread)) => {
                BreakpointScope::Thread(target, thread)
            }
            (ScopeKind::Thread, _, _) => {
                return Err(Error::InvalidScope("thread scope requires a target and a thread"))
            }
        };
        debug!("Breakpoint {} scope -> {:?}", self.id, scope);
        self.scope = scope;
        Ok(())
    }

    /// 位置を設定する（アドレスはプロセスをまたいで意味を持たない）
    pub fn set_location(&mut self, location: InputLocation) -> Result<()> {
        if self.scope == BreakpointScope::System && matches!(location, InputLocation::Address(_)) {
            return Err(Error::InvalidLocation("address locations need a target or thread scope"));
        }
        self.location = location;
        Ok(())
    }

    pub fn set_stop_mode(&mut self, stop_mode: Stop) {
        self.stop_mode = stop_mode;
    }

    pub fn set_one_shot(&mut self, one_shot: bool) {
        self.one_shot = one_shot;
    }

    /// このプロセスのロケーションを外す（プロセス終了時）
    pub(crate) fn forget_process(&mut self, process_koid: u64) {
        self.installed.retain(|loc| loc.process_koid != process_koid);
    }
}

/// ブレークポイントが複数ヒットしたときに使う停止範囲
///
/// All が最も強く Thread が最も弱い。
pub fn strongest_stop(modes: impl IntoIterator<Item = Stop>) -> Option<Stop> {
    modes.into_iter().min()
}

/// コントローラが置いた内部ブレークポイントの所有権
///
/// 破棄されると削除がメッセージループに投入されます。
#[derive(Debug)]
pub struct InternalBreakpoint {
    id: u32,
    message_loop: MessageLoop,
}

impl InternalBreakpoint {
    pub(crate) fn new(id: u32, message_loop: MessageLoop) -> Self {
        Self { id, message_loop }
    }

    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for InternalBreakpoint {
    fn drop(&mut self) {
        let id = self.id;
        self.message_loop
            .post(move |session| session.remove_internal_breakpoint(id));
    }
}
